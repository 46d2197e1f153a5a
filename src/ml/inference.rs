//! モデル推論機能

use anyhow::Result;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use image::{imageops::FilterType, RgbImage};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use super::evaluation::EvaluationReport;
use super::ml_model::TransferClassifier;
use super::training::evaluate_dataset;
use crate::data::{normalize, CifarDataset, NUM_CHANNELS};
use crate::model::model_metadata::expects_cifar_input;
use crate::model::{load_model_with_metadata, InferenceConfig, ModelMetadata};

/// 1枚分の予測結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    /// 予測クラスのsoftmax確率
    pub confidence: f32,
    /// 全クラスのsoftmax確率
    pub probabilities: Vec<f32>,
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:.2}%)", self.label, self.confidence * 100.0)
    }
}

/// 画像を読み込んでモデル入力サイズに合わせ、(C, H, W) の画素列にする
pub fn load_image_chw(path: &Path, size: usize) -> Result<Vec<u8>> {
    let img = image::open(path)
        .map_err(|e| anyhow::anyhow!("画像の読み込みに失敗しました ({}): {}", path.display(), e))?
        .to_rgb8();
    Ok(image_to_chw(&img, size))
}

/// RGB画像をリサイズして (C, H, W) 順に並べる
pub fn image_to_chw(img: &RgbImage, size: usize) -> Vec<u8> {
    let resized;
    let img = if img.dimensions() == (size as u32, size as u32) {
        img
    } else {
        resized = image::imageops::resize(img, size as u32, size as u32, FilterType::Triangle);
        &resized
    };

    let mut data = Vec::with_capacity(NUM_CHANNELS * size * size);
    for channel in 0..NUM_CHANNELS {
        for y in 0..size as u32 {
            for x in 0..size as u32 {
                data.push(img.get_pixel(x, y)[channel]);
            }
        }
    }
    data
}

/// 確率が最大のクラスを選ぶ（NaN・無限大を含む行はエラー）
fn top_class(row: &[f32]) -> Result<(usize, f32)> {
    if let Some(i) = row.iter().position(|p| !p.is_finite()) {
        anyhow::bail!("クラス {} の確率が不正な値です: {}", i, row[i]);
    }
    row.iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
            Some((_, b)) if b >= p => best,
            _ => Some((i, p)),
        })
        .ok_or_else(|| anyhow::anyhow!("確率の行が空です"))
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: TransferClassifier<B>,
    config: InferenceConfig,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let config = InferenceConfig::from_metadata(&metadata);
        if !expects_cifar_input(&metadata) {
            warn!(
                "モデルの入力サイズ {} は CIFAR-10 と異なります。画像はリサイズされます",
                metadata.image_size
            );
        }

        let model_config = metadata.model_config();
        model_config.backbone.validate()?;
        let model = model_config.init::<B>(&device);

        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(model_binary, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        info!(
            "モデルを読み込みました: {} ({} クラス, 学習日時 {})",
            model_path.as_ref().display(),
            config.num_classes(),
            metadata.trained_at
        );

        Ok(Self {
            model,
            config,
            metadata,
            device,
        })
    }

    /// (C, H, W) 画素列のバッチを分類
    pub fn classify_pixels(&self, images: &[Vec<u8>]) -> Result<Vec<Prediction>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.config.image_size;
        let expected = NUM_CHANNELS * size * size;
        let mut data = Vec::with_capacity(images.len() * expected);
        for pixels in images {
            if pixels.len() != expected {
                anyhow::bail!("画素数が不正です: {} (期待: {})", pixels.len(), expected);
            }
            data.extend(normalize(pixels, self.config.normalization));
        }

        let tensor = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device)
            .reshape([images.len(), NUM_CHANNELS, size, size]);

        let logits = self.model.forward(tensor);
        let num_classes = logits.dims()[1];
        let probabilities: Vec<f32> = softmax(logits, 1).into_data().iter::<f32>().collect();

        probabilities
            .chunks(num_classes)
            .map(|row| self.to_prediction(row))
            .collect()
    }

    fn to_prediction(&self, row: &[f32]) -> Result<Prediction> {
        let (class_index, confidence) = top_class(row)?;

        let label = self
            .config
            .class_index_to_label(class_index)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_index))?
            .to_string();

        Ok(Prediction {
            class_index,
            label,
            confidence,
            probabilities: row.to_vec(),
        })
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let pixels = load_image_chw(image_path.as_ref(), self.config.image_size)?;
        self.classify_pixels(std::slice::from_ref(&pixels))?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))
    }

    /// 複数画像をバッチ分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        let images = image_paths
            .iter()
            .map(|path| load_image_chw(path.as_ref(), self.config.image_size))
            .collect::<Result<Vec<_>>>()?;
        self.classify_pixels(&images)
    }

    /// データセット全体で評価
    pub fn evaluate(&self, dataset: CifarDataset, batch_size: usize, num_workers: usize) -> EvaluationReport {
        evaluate_dataset(
            &self.model,
            dataset,
            batch_size,
            num_workers,
            self.config.normalization,
            &self.device,
        )
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// 読み込んだバンドルのメタデータ
    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}
