//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと一緒に保存され、推論時にモデル構成と前処理を復元するために使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::config::ModelSettings;
use crate::data::{Normalization, CIFAR10_CLASSES, IMAGE_SIZE};
use crate::ml::backbone::Vgg16Config;
use crate::ml::evaluation::EvaluationReport;
use crate::ml::history::TrainingHistory;
use crate::ml::ml_model::TransferModelConfig;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（インデックス順）
    pub class_names: Vec<String>,

    pub num_classes: usize,

    /// 入力画像の一辺（ピクセル）
    pub image_size: usize,

    /// 学習時の正規化方法（推論時も同じものを使う）
    pub normalization: Normalization,

    /// VGG16 のベース幅
    pub base_width: usize,

    /// 分類ヘッドの隠れ層ユニット数
    pub hidden: usize,

    pub dropout: f64,

    /// 学習対象だった末尾の畳み込み層数
    pub trainable_tail: usize,

    #[serde(default)]
    pub label_smoothing: f32,

    /// 使用した事前学習済み重み
    pub pretrained_weights: Option<String>,

    /// 実際に学習したエポック数
    #[serde(default)]
    pub epochs_run: usize,

    #[serde(default)]
    pub best_epoch: Option<usize>,

    #[serde(default)]
    pub stopped_early: bool,

    #[serde(default)]
    pub test_loss: Option<f64>,

    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        model_config: &TransferModelConfig,
        normalization: Normalization,
        settings: &ModelSettings,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_names: CIFAR10_CLASSES.iter().map(|name| name.to_string()).collect(),
            num_classes: model_config.num_classes,
            image_size: model_config.backbone.input_size,
            normalization,
            base_width: model_config.backbone.base_width,
            hidden: model_config.hidden,
            dropout: model_config.dropout,
            trainable_tail: settings.trainable_tail,
            label_smoothing: model_config.label_smoothing,
            pretrained_weights: settings.pretrained_weights.clone(),
            epochs_run: 0,
            best_epoch: None,
            stopped_early: false,
            test_loss: None,
            test_accuracy: None,
            trained_at,
        }
    }

    /// 学習結果を記録
    pub fn with_results(mut self, history: &TrainingHistory, report: &EvaluationReport) -> Self {
        self.epochs_run = history.len();
        self.best_epoch = history.best_epoch;
        self.stopped_early = history.stopped_early;
        self.test_loss = Some(report.loss);
        self.test_accuracy = Some(report.accuracy);
        self
    }

    /// 保存時と同じモデル構成を復元
    pub fn model_config(&self) -> TransferModelConfig {
        TransferModelConfig::new(
            Vgg16Config::new()
                .with_base_width(self.base_width)
                .with_input_size(self.image_size),
        )
        .with_num_classes(self.num_classes)
        .with_hidden(self.hidden)
        .with_dropout(self.dropout)
        .with_label_smoothing(self.label_smoothing)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self::new(
            &TransferModelConfig::cifar10(),
            Normalization::default(),
            &ModelSettings::default(),
        )
    }
}

/// 画像サイズが CIFAR-10 と一致するか
pub(crate) fn expects_cifar_input(metadata: &ModelMetadata) -> bool {
    metadata.image_size == IMAGE_SIZE
}
