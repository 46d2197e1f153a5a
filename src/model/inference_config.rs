//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use anyhow::{Context, Result};
use std::path::Path;

use crate::data::Normalization;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// クラス名一覧（インデックス順）
    pub class_names: Vec<String>,

    /// モデル入力解像度
    pub image_size: usize,

    /// 学習時と同じ正規化
    pub normalization: Normalization,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_names: metadata.class_names.clone(),
            image_size: metadata.image_size,
            normalization: metadata.normalization,
        }
    }

    /// モデルファイルから推論設定を読み込む
    pub fn load_from_model(model_path: &Path) -> Result<Self> {
        let metadata =
            model_storage::load_metadata(model_path).context("Failed to load model metadata")?;
        Ok(Self::from_metadata(&metadata))
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスインデックスからクラス名を取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(String::as_str)
    }

    /// クラス名からクラスインデックスを取得
    pub fn label_to_class_index(&self, label: &str) -> Option<usize> {
        self.class_names.iter().position(|l| l == label)
    }

    /// 設定情報を表示
    pub fn print_info(&self) {
        println!("\n=== 推論設定 ===");
        println!("クラス数: {}", self.num_classes());
        println!("クラス: {}", self.class_names.join(", "));
        println!("モデル入力サイズ: {}x{}", self.image_size, self.image_size);
        println!("正規化: {}", self.normalization);
        println!("==================");
    }
}
