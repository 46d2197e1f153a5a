//! 事前学習済みVGG16の畳み込み部分（特徴抽出器）
//!
//! 全結合層 (classifier) を持たない `include_top = false` 相当の構成です。
//! torchvision の `vgg16` state dict (.pth) または本クレートで保存した
//! Burn レコード (.mpk) から重みを読み込めます。

use std::path::Path;

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{backend::Backend, Tensor},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::{debug, info};

/// ブロックごとの畳み込み層数
pub const VGG16_BLOCKS: [usize; 5] = [2, 2, 3, 3, 3];

/// ブロックごとのチャネル倍率（base_width に対する倍率）
const VGG16_WIDTH_MULTIPLIERS: [usize; 5] = [1, 2, 4, 8, 8];

/// 畳み込み層の総数
pub const VGG16_NUM_CONVS: usize = 13;

/// torchvision の `features` シーケンス内での畳み込み層の位置
///
/// ReLU と MaxPool もシーケンスに含まれるため番号が飛ぶ。
pub const TORCHVISION_CONV_INDICES: [usize; VGG16_NUM_CONVS] =
    [0, 2, 5, 7, 10, 12, 14, 17, 19, 21, 24, 26, 28];

/// torchvision のキー `features.{位置}.{weight|bias}` を `convs.{i}.{weight|bias}` へ写す規則
pub(crate) fn torchvision_key_remaps() -> Vec<(String, String)> {
    TORCHVISION_CONV_INDICES
        .iter()
        .enumerate()
        .map(|(i, torch_index)| {
            (
                format!(r"^features\.{torch_index}\.(weight|bias)$"),
                format!("convs.{i}.$1"),
            )
        })
        .collect()
}

/// 特徴抽出器の設定
#[derive(Config, Debug)]
pub struct Vgg16Config {
    /// 最初のブロックのチャネル数（事前学習済み重みを使う場合は64）
    #[config(default = 64)]
    pub base_width: usize,
    /// 入力画像サイズ（正方形、32の倍数）
    #[config(default = 32)]
    pub input_size: usize,
}

impl Vgg16Config {
    /// 最終ブロックの出力チャネル数
    pub fn output_channels(&self) -> usize {
        self.base_width * VGG16_WIDTH_MULTIPLIERS[VGG16_WIDTH_MULTIPLIERS.len() - 1]
    }

    /// 最終ブロック出力の空間サイズ（5回の2x2プーリング後）
    pub fn output_size(&self) -> usize {
        self.input_size / 32
    }

    /// Flatten後の特徴次元
    pub fn output_features(&self) -> usize {
        self.output_channels() * self.output_size() * self.output_size()
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_width == 0 {
            anyhow::bail!("base_width は1以上である必要があります");
        }
        if self.input_size < 32 || self.input_size % 32 != 0 {
            anyhow::bail!(
                "入力サイズは32の倍数である必要があります: {}",
                self.input_size
            );
        }
        Ok(())
    }

    /// 特徴抽出器を初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16Features<B> {
        let mut convs = Vec::with_capacity(VGG16_NUM_CONVS);
        let mut in_channels = 3;

        for (depth, multiplier) in VGG16_BLOCKS.iter().zip(VGG16_WIDTH_MULTIPLIERS) {
            let out_channels = self.base_width * multiplier;
            for _ in 0..*depth {
                convs.push(
                    Conv2dConfig::new([in_channels, out_channels], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                );
                in_channels = out_channels;
            }
        }

        Vgg16Features {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            activation: Relu::new(),
        }
    }
}

/// 凍結の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeSummary {
    pub frozen_convs: usize,
    pub frozen_params: usize,
    pub trainable_params: usize,
}

/// VGG16 の畳み込みベース
///
/// # アーキテクチャ
/// - {Conv 3x3 (padding 1) + ReLU} x (2, 2, 3, 3, 3) 層、各ブロックの後に 2x2 Max Pooling
/// - 32x32 入力で 512 x 1 x 1 の特徴マップを出力
#[derive(Module, Debug)]
pub struct Vgg16Features<B: Backend> {
    pub(crate) convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    activation: Relu,
}

impl<B: Backend> Vgg16Features<B> {
    /// 順伝播
    ///
    /// - `images`: [batch_size, 3, size, size]
    /// - 戻り値: [batch_size, channels, size / 32, size / 32]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        let mut start = 0;

        for depth in VGG16_BLOCKS {
            for conv in &self.convs[start..start + depth] {
                x = self.activation.forward(conv.forward(x));
            }
            x = self.pool.forward(x);
            start += depth;
        }

        x
    }

    /// 末尾 `trainable_tail` 層を除いた畳み込み層を凍結する
    ///
    /// 凍結した層のパラメータは勾配計算から外れ、オプティマイザで更新されない。
    pub fn freeze(self, trainable_tail: usize) -> (Self, FreezeSummary) {
        let total = self.convs.len();
        let frozen_convs = total.saturating_sub(trainable_tail);
        let mut frozen_params = 0;
        let mut trainable_params = 0;

        let convs = self
            .convs
            .into_iter()
            .enumerate()
            .map(|(i, conv)| {
                if i < frozen_convs {
                    frozen_params += conv.num_params();
                    conv.no_grad()
                } else {
                    trainable_params += conv.num_params();
                    conv
                }
            })
            .collect();

        debug!(
            "畳み込み層 {}/{} を凍結 (凍結パラメータ数: {})",
            frozen_convs, total, frozen_params
        );

        (
            Self {
                convs,
                pool: self.pool,
                activation: self.activation,
            },
            FreezeSummary {
                frozen_convs,
                frozen_params,
                trainable_params,
            },
        )
    }

    /// 事前学習済みの重みを読み込む
    ///
    /// - `.pth` / `.pt`: torchvision の vgg16 state dict（classifier は無視）
    /// - `.mpk`: [`Self::save_weights`] で保存したレコード
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let record: Vgg16FeaturesRecord<B> = match extension.as_deref() {
            Some("pth") | Some("pt") => {
                let args = torchvision_key_remaps()
                    .iter()
                    .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
                        args.with_key_remap(pattern, replacement)
                    });
                PyTorchFileRecorder::<FullPrecisionSettings>::default()
                    .load(args, device)
                    .map_err(|e| anyhow::anyhow!("PyTorch重みの読み込みエラー: {:?}", e))
                    .with_context(|| format!("Failed to load {}", path.display()))?
            }
            Some("mpk") => NamedMpkFileRecorder::<FullPrecisionSettings>::new()
                .load(path.to_path_buf(), device)
                .map_err(|e| anyhow::anyhow!("重みの読み込みエラー: {:?}", e))
                .with_context(|| format!("Failed to load {}", path.display()))?,
            _ => anyhow::bail!(
                "対応していない重みファイルです: {} (.pth / .pt / .mpk)",
                path.display()
            ),
        };

        info!("事前学習済み重みを読み込みました: {}", path.display());
        Ok(self.load_record(record))
    }

    /// 重みを Burn レコード (.mpk) として保存
    pub fn save_weights(self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
        self.save_file(
            path.to_path_buf(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        )
        .map_err(|e| anyhow::anyhow!("重みの保存エラー: {:?}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn narrow_config() -> Vgg16Config {
        Vgg16Config::new().with_base_width(4)
    }

    #[test]
    fn config_defaults_match_vgg16() {
        let config = Vgg16Config::new();
        assert_eq!(config.base_width, 64);
        assert_eq!(config.output_channels(), 512);
        assert_eq!(config.output_features(), 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_input_size() {
        assert!(Vgg16Config::new().with_input_size(48).validate().is_err());
        assert!(Vgg16Config::new().with_input_size(16).validate().is_err());
        assert_eq!(Vgg16Config::new().with_input_size(64).output_features(), 512 * 4);
    }

    #[test]
    fn forward_output_shape() {
        let device = Default::default();
        let backbone = narrow_config().init::<TestBackend>(&device);
        assert_eq!(backbone.convs.len(), VGG16_NUM_CONVS);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let features = backbone.forward(images);
        assert_eq!(features.dims(), [2, 32, 1, 1]);
    }

    #[test]
    fn freeze_summary_counts() {
        let device = Default::default();
        let backbone = narrow_config().init::<TestBackend>(&device);
        let total = backbone.num_params();

        let (_, summary) = backbone.freeze(0);
        assert_eq!(summary.frozen_convs, VGG16_NUM_CONVS);
        assert_eq!(summary.frozen_params, total);
        assert_eq!(summary.trainable_params, 0);

        let backbone = narrow_config().init::<TestBackend>(&device);
        let (_, summary) = backbone.freeze(3);
        assert_eq!(summary.frozen_convs, 10);
        assert_eq!(summary.frozen_params + summary.trainable_params, total);
        assert!(summary.trainable_params > 0);
    }

    #[test]
    fn weights_round_trip_through_mpk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone.mpk");
        let device = Default::default();

        let original = narrow_config().init::<TestBackend>(&device);
        let expected = original.convs[0].weight.val().into_data();
        original.save_weights(&path).unwrap();
        assert!(path.exists());

        let restored = narrow_config()
            .init::<TestBackend>(&device)
            .load_pretrained(&path, &device)
            .unwrap();
        restored.convs[0]
            .weight
            .val()
            .into_data()
            .assert_eq(&expected, true);
    }

    fn fixture_path() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/vgg16_features_w1.pth")
    }

    #[test]
    fn key_remaps_cover_every_conv() {
        let remaps = torchvision_key_remaps();
        assert_eq!(remaps.len(), VGG16_NUM_CONVS);
        assert_eq!(remaps[0].0, r"^features\.0\.(weight|bias)$");
        assert_eq!(remaps[0].1, "convs.0.$1");
        assert_eq!(remaps[12].0, r"^features\.28\.(weight|bias)$");
        assert_eq!(remaps[12].1, "convs.12.$1");
        // ReLU / MaxPool の位置は対象外
        assert!(!remaps.iter().any(|(pattern, _)| pattern.contains(r"features\.1\.")));
    }

    #[test]
    fn torchvision_state_dict_is_remapped() {
        let device = Default::default();
        let backbone = Vgg16Config::new()
            .with_base_width(1)
            .init::<TestBackend>(&device)
            .load_pretrained(&fixture_path(), &device)
            .unwrap();

        // features.0.weight -> convs.0.weight (i + j / 1024)
        let first: Vec<f32> = backbone.convs[0].weight.val().into_data().iter::<f32>().collect();
        assert_eq!(first.len(), 27);
        for (j, value) in first.iter().enumerate() {
            assert_eq!(*value, j as f32 / 1024.0);
        }

        // features.28.bias -> convs.12.bias (-(i + k / 8))
        let last_bias: Vec<f32> = backbone.convs[12]
            .bias
            .as_ref()
            .unwrap()
            .val()
            .into_data()
            .iter::<f32>()
            .collect();
        assert_eq!(last_bias.len(), 8);
        for (k, value) in last_bias.iter().enumerate() {
            assert_eq!(*value, -(12.0 + k as f32 / 8.0));
        }

        // features.19.weight -> convs.8.weight
        let middle: Vec<f32> = backbone.convs[8].weight.val().into_data().iter::<f32>().collect();
        assert_eq!(middle[0], 8.0);
        assert_eq!(middle[5], 8.0 + 5.0 / 1024.0);
    }

    #[test]
    fn torchvision_weights_survive_conversion_to_mpk() {
        let dir = tempfile::tempdir().unwrap();
        let converted = dir.path().join("vgg16_w1.mpk");
        let device = Default::default();
        let config = Vgg16Config::new().with_base_width(1);

        config
            .init::<TestBackend>(&device)
            .load_pretrained(&fixture_path(), &device)
            .unwrap()
            .save_weights(&converted)
            .unwrap();

        let restored = config
            .init::<TestBackend>(&device)
            .load_pretrained(&converted, &device)
            .unwrap();
        let bias: Vec<f32> = restored.convs[3]
            .bias
            .as_ref()
            .unwrap()
            .val()
            .into_data()
            .iter::<f32>()
            .collect();
        assert_eq!(bias, vec![-3.0, -3.125]);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let device = Default::default();
        let backbone = narrow_config().init::<TestBackend>(&device);
        assert!(backbone
            .load_pretrained(Path::new("weights.h5"), &device)
            .is_err());
    }
}
