//! 転移学習モデルの定義
//!
//! 凍結したVGG16の畳み込みベースに、学習対象の小さな分類ヘッドを接続します。

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use tracing::info;

use super::backbone::{FreezeSummary, Vgg16Config, Vgg16Features};
use super::loss::categorical_cross_entropy;
use crate::data::NUM_CLASSES;

/// モデル設定
#[derive(Config, Debug)]
pub struct TransferModelConfig {
    /// 分類クラス数
    #[config(default = 10)]
    pub num_classes: usize,
    /// 分類ヘッドの隠れ層ユニット数
    #[config(default = 256)]
    pub hidden: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// ラベルスムージング係数
    #[config(default = 0.0)]
    pub label_smoothing: f32,
    /// 特徴抽出器の設定
    pub backbone: Vgg16Config,
}

impl Default for TransferModelConfig {
    fn default() -> Self {
        Self::new(Vgg16Config::new())
    }
}

impl TransferModelConfig {
    /// CIFAR-10 用のデフォルト構成
    pub fn cifar10() -> Self {
        Self::default().with_num_classes(NUM_CLASSES)
    }

    /// モデルを初期化（すべての重みはランダム、凍結なし）
    pub fn init<B: Backend>(&self, device: &B::Device) -> TransferClassifier<B> {
        let features = self.backbone.output_features();

        info!(
            "[Model] 特徴次元 d: {} / FC1: {} -> {} / FC2: {} -> {}",
            features, features, self.hidden, self.hidden, self.num_classes
        );

        TransferClassifier {
            backbone: self.backbone.init(device),
            fc1: LinearConfig::new(features, self.hidden).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden, self.num_classes).init(device),
            activation: Relu::new(),
            label_smoothing: self.label_smoothing,
        }
    }
}

/// 転移学習用の分類モデル
///
/// # アーキテクチャ
/// - VGG16 畳み込みベース（凍結）
/// - Flatten
/// - FC: d -> hidden + ReLU + Dropout
/// - FC: hidden -> num_classes
#[derive(Module, Debug)]
pub struct TransferClassifier<B: Backend> {
    pub(crate) backbone: Vgg16Features<B>,
    pub(crate) fc1: Linear<B>,
    dropout: Dropout,
    pub(crate) fc2: Linear<B>,
    activation: Relu,
    label_smoothing: f32,
}

impl<B: Backend> TransferClassifier<B> {
    /// 順伝播
    ///
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.backbone.forward(images);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// 予測を実行
    ///
    /// 戻り値: (予測クラスID [batch_size], ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 1, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let [batch_size, _] = output.dims();
        let predictions = output.clone().argmax(1).reshape([batch_size]);
        (predictions, output)
    }

    /// 順伝播と損失計算（学習・検証用）
    ///
    /// 損失は one-hot ターゲットに対するカテゴリカル交差エントロピー。
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        one_hot: Tensor<B, 2>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = categorical_cross_entropy(output.clone(), one_hot, self.label_smoothing);

        ClassificationOutput::new(loss, output, targets)
    }

    /// 特徴抽出器を凍結し、分類ヘッドのみ学習対象にする
    ///
    /// `trainable_tail` を指定すると末尾の畳み込み層も学習対象に残す（ファインチューニング）。
    pub fn freeze_backbone(self, trainable_tail: usize) -> (Self, FreezeSummary) {
        let (backbone, mut summary) = self.backbone.freeze(trainable_tail);
        summary.trainable_params += self.fc1.num_params() + self.fc2.num_params();

        (
            Self {
                backbone,
                fc1: self.fc1,
                dropout: self.dropout,
                fc2: self.fc2,
                activation: self.activation,
                label_smoothing: self.label_smoothing,
            },
            summary,
        )
    }

    /// 事前学習済み重みを特徴抽出器に読み込む
    pub fn with_pretrained_backbone(
        self,
        path: &std::path::Path,
        device: &B::Device,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            backbone: self.backbone.load_pretrained(path, device)?,
            ..self
        })
    }
}
