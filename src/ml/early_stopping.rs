//! 検証損失を監視する早期終了

use serde::{Deserialize, Serialize};

/// 1エポック分の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 最良値を更新した
    Improved,
    /// 改善なし（まだ待機中）
    Waiting,
    /// 改善なしが patience エポック続いたので停止
    Stop,
}

/// 早期終了の設定と状態
///
/// `patience = 0` のときは停止しない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    restore_best: bool,
    best_loss: Option<f32>,
    best_epoch: Option<usize>,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta: min_delta.max(0.0),
            restore_best: false,
            best_loss: None,
            best_epoch: None,
            epochs_without_improvement: 0,
        }
    }

    /// 停止時に最良エポックの重みへ戻す
    pub fn with_restore_best(mut self, restore_best: bool) -> Self {
        self.restore_best = restore_best;
        self
    }

    pub fn restore_best(&self) -> bool {
        self.restore_best
    }

    pub fn best_loss(&self) -> Option<f32> {
        self.best_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }

    /// エポック終了時の検証損失を記録
    ///
    /// NaN は改善とみなさない。
    pub fn record(&mut self, epoch: usize, val_loss: f32) -> Decision {
        let improved = match self.best_loss {
            None => !val_loss.is_nan(),
            Some(best) => val_loss < best - self.min_delta,
        };

        if improved {
            self.best_loss = Some(val_loss);
            self.best_epoch = Some(epoch);
            self.epochs_without_improvement = 0;
            return Decision::Improved;
        }

        self.epochs_without_improvement += 1;
        if self.patience > 0 && self.epochs_without_improvement >= self.patience {
            Decision::Stop
        } else {
            Decision::Waiting
        }
    }

    pub fn reset(&mut self) {
        self.best_loss = None;
        self.best_epoch = None;
        self.epochs_without_improvement = 0;
    }
}
