//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・データセット・モデル・学習のハイパーパラメータをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::data::{Normalization, NUM_CLASSES};
use crate::ml::backbone::Vgg16Config;
use crate::ml::ml_model::TransferModelConfig;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// CIFAR-10 を展開するディレクトリ
    pub data_dir: String,
    /// 見つからない場合にダウンロードするか
    pub download: bool,
    /// 画素値の正規化方法
    #[serde(default)]
    pub normalization: Normalization,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            download: true,
            normalization: Normalization::UnitRange,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 事前学習済みVGG16の重み (.pth / .mpk)
    pub pretrained_weights: Option<String>,
    /// VGG16の最初のブロックのチャネル数
    pub base_width: usize,
    /// 分類ヘッドの隠れ層ユニット数
    pub hidden: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 凍結せずに学習する末尾の畳み込み層数（0でベース全体を凍結）
    #[serde(default)]
    pub trainable_tail: usize,
    /// ラベルスムージング係数
    #[serde(default)]
    pub label_smoothing: f32,
    /// 学習済みモデルの保存先 (.tar.gz)
    pub output_path: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            pretrained_weights: None,
            base_width: 64,
            hidden: 256,
            dropout: 0.5,
            trainable_tail: 0,
            label_smoothing: 0.0,
            output_path: "models/cifar10_vgg16.tar.gz".to_string(),
        }
    }
}

impl ModelSettings {
    /// モデル構成に変換
    pub fn model_config(&self) -> TransferModelConfig {
        TransferModelConfig::new(Vgg16Config::new().with_base_width(self.base_width))
            .with_num_classes(NUM_CLASSES)
            .with_hidden(self.hidden)
            .with_dropout(self.dropout)
            .with_label_smoothing(self.label_smoothing)
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 最大エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率 (Adam)
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 検証データの割合
    pub validation_ratio: f32,
    /// 早期終了: 改善なしを許容するエポック数（0で無効）
    pub patience: usize,
    /// 早期終了: 改善とみなす最小の減少幅
    #[serde(default)]
    pub min_delta: f32,
    /// 終了時に最良エポックの重みへ戻す
    pub restore_best: bool,
    /// 学習履歴CSVの出力先
    #[serde(default)]
    pub history_csv: Option<String>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 64,
            num_workers: 1,
            learning_rate: 1e-4,
            seed: 42,
            validation_ratio: 0.1,
            patience: 3,
            min_delta: 0.0,
            restore_best: true,
            history_csv: Some("models/history.csv".to_string()),
        }
    }
}

impl TrainingSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_epochs == 0 {
            anyhow::bail!("num_epochs は1以上である必要があります");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size は1以上である必要があります");
        }
        if !(self.learning_rate > 0.0) {
            anyhow::bail!("learning_rate は正の値である必要があります: {}", self.learning_rate);
        }
        if !(self.validation_ratio > 0.0 && self.validation_ratio < 1.0) {
            anyhow::bail!(
                "validation_ratio は (0, 1) の範囲で指定してください: {}",
                self.validation_ratio
            );
        }
        Ok(())
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// データセット設定
    #[serde(default)]
    pub data: DataSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("データディレクトリ: {}", self.data.data_dir);
        println!("正規化: {}", self.data.normalization);
        println!("\n--- モデル設定 ---");
        match &self.model.pretrained_weights {
            Some(path) => println!("事前学習済み重み: {}", path),
            None => println!("事前学習済み重み: (なし)"),
        }
        println!("ベース幅: {}", self.model.base_width);
        println!("隠れ層: {}", self.model.hidden);
        println!("ドロップアウト率: {}", self.model.dropout);
        println!("学習対象の末尾畳み込み層: {}", self.model.trainable_tail);
        println!("出力先: {}", self.model.output_path);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("検証データ割合: {}", self.training.validation_ratio);
        println!("patience: {}", self.training.patience);
        println!("シード: {}", self.training.seed);
        println!("========================\n");
    }
}
