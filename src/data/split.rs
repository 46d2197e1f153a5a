//! 学習用/検証用データの分割

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::cifar::CifarDataset;

/// 学習用データの割合（残りが検証用）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatio {
    train: f32,
}

impl SplitRatio {
    /// 90% 学習 / 10% 検証
    pub const NINETY_TEN: Self = Self { train: 0.9 };

    /// 割合が (0, 1) の範囲外なら `None`
    pub fn try_new(train: f32) -> Option<Self> {
        if train > 0.0 && train < 1.0 {
            Some(Self { train })
        } else {
            None
        }
    }

    /// 検証用の割合から作成
    pub fn from_validation(validation: f32) -> Option<Self> {
        Self::try_new(1.0 - validation)
    }

    pub fn train_ratio(&self) -> f32 {
        self.train
    }

    pub fn val_ratio(&self) -> f32 {
        1.0 - self.train
    }

    /// 学習用の件数
    ///
    /// 2件以上あれば学習・検証ともに最低1件は確保する。
    pub fn split_point(&self, total: usize) -> usize {
        if total < 2 {
            return total;
        }
        let point = (total as f32 * self.train).round() as usize;
        point.clamp(1, total - 1)
    }
}

impl Default for SplitRatio {
    fn default() -> Self {
        Self::NINETY_TEN
    }
}

/// インデックスをシャッフルして (学習用, 検証用) に分割
pub fn split_indices(len: usize, ratio: SplitRatio, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let val = indices.split_off(ratio.split_point(len));
    (indices, val)
}

impl CifarDataset {
    /// データセットを学習用と検証用に分割（インデックスのみ）
    pub fn split(self, ratio: SplitRatio, seed: u64) -> (Self, Self) {
        let (train_pos, val_pos) = split_indices(self.indices().len(), ratio, seed);
        let train = train_pos.iter().map(|&i| self.indices()[i]).collect();
        let val = val_pos.iter().map(|&i| self.indices()[i]).collect();

        (self.with_indices(train), self.with_indices(val))
    }
}
