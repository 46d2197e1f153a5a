//! CIFAR-10 での転移学習
//!
//! 読み込み → 正規化 → one-hot → 90/10分割 → モデル構築 → ベース凍結 →
//! Adam でコンパイル → 早期終了付きで学習 → テストデータで評価 → 保存、の順に実行します。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataloader::DataLoaderBuilder},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use tracing::{debug, info, warn};

use super::backbone::FreezeSummary;
use super::early_stopping::{Decision, EarlyStopping};
use super::evaluation::{evaluate, EvaluationReport, MetricAccumulator};
use super::history::{EpochMetrics, TrainingHistory};
use super::ml_model::TransferClassifier;
use crate::data::{
    ensure_downloaded, normalize, CifarDataset, CifarImage, Normalization, SplitRatio,
    IMAGE_SIZE, NUM_CLASSES,
};
use crate::model::{save_model_with_metadata, AppConfig, ModelMetadata};

/// バッチャー
#[derive(Clone)]
pub struct CifarBatcher<B: Backend> {
    device: B::Device,
    normalization: Normalization,
    num_classes: usize,
}

impl<B: Backend> CifarBatcher<B> {
    pub fn new(device: B::Device, normalization: Normalization) -> Self {
        Self {
            device,
            normalization,
            num_classes: NUM_CLASSES,
        }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct CifarBatch<B: Backend> {
    /// [batch_size, 3, 32, 32]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// [batch_size, num_classes]
    pub one_hot: Tensor<B, 2>,
}

impl<B: Backend> Batcher<B, CifarImage, CifarBatch<B>> for CifarBatcher<B> {
    fn batch(&self, items: Vec<CifarImage>, _device: &B::Device) -> CifarBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * IMAGE_SIZE * IMAGE_SIZE);
        let mut targets = Vec::with_capacity(batch_size);
        let mut encoded = vec![0.0f32; batch_size * self.num_classes];

        for (row, item) in items.iter().enumerate() {
            all_pixels.extend(normalize(item.pixels(), self.normalization));
            // CifarImage のラベルは常に 0..NUM_CLASSES
            let label = item.label() as usize;
            targets.push(label as i64);
            encoded[row * self.num_classes + label] = 1.0;
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, IMAGE_SIZE, IMAGE_SIZE]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);
        let one_hot = Tensor::<B, 1>::from_floats(encoded.as_slice(), &self.device)
            .reshape([batch_size, self.num_classes]);

        CifarBatch {
            images,
            targets,
            one_hot,
        }
    }
}

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<CifarBatch<B>, ClassificationOutput<B>> for TransferClassifier<B> {
    fn step(&self, batch: CifarBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets, batch.one_hot);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<CifarBatch<B>, ClassificationOutput<B>> for TransferClassifier<B> {
    fn step(&self, batch: CifarBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets, batch.one_hot)
    }
}

/// 学習結果
#[derive(Debug)]
pub struct TrainingOutcome {
    pub history: TrainingHistory,
    pub test_report: EvaluationReport,
    pub freeze: FreezeSummary,
    pub bundle_path: PathBuf,
}

/// データセット全体をモデルで評価
pub fn evaluate_dataset<B: Backend>(
    model: &TransferClassifier<B>,
    dataset: CifarDataset,
    batch_size: usize,
    num_workers: usize,
    normalization: Normalization,
    device: &B::Device,
) -> EvaluationReport {
    let batcher = CifarBatcher::<B>::new(device.clone(), normalization);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .num_workers(num_workers)
        .build(dataset);

    evaluate(model, NUM_CLASSES, dataloader.iter())
}

/// モデル学習を実行
///
/// 設定に従って CIFAR-10 を読み込み、凍結したVGG16ベース + 分類ヘッドを学習して
/// テストデータで評価し、メタデータと共に tar.gz に保存する。
pub fn train_model<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<TrainingOutcome> {
    let training = &config.training;
    training.validate()?;

    let model_config = config.model.model_config();
    model_config.backbone.validate()?;

    // === データセット ===
    let batch_dir = ensure_downloaded(Path::new(&config.data.data_dir), config.data.download)?;
    let full_train = CifarDataset::load_train(&batch_dir).context("学習データの読み込みに失敗しました")?;
    let test = CifarDataset::load_test(&batch_dir).context("テストデータの読み込みに失敗しました")?;

    let ratio = SplitRatio::from_validation(training.validation_ratio).ok_or_else(|| {
        anyhow::anyhow!(
            "validation_ratio は (0, 1) の範囲で指定してください: {}",
            training.validation_ratio
        )
    })?;
    let (dataset_train, dataset_val) = full_train.split(ratio, training.seed);
    if dataset_train.indices().is_empty() || dataset_val.indices().is_empty() {
        anyhow::bail!(
            "学習データが少なすぎます: 学習 {} 枚 / 検証 {} 枚 (それぞれ1枚以上必要です)",
            dataset_train.indices().len(),
            dataset_val.indices().len()
        );
    }

    info!("学習データ: {} 枚", dataset_train.indices().len());
    info!("検証データ: {} 枚", dataset_val.indices().len());
    info!("テストデータ: {} 枚", test.indices().len());
    info!("正規化: {}", config.data.normalization);

    // === モデル ===
    let mut model = model_config.init::<B>(&device);
    match &config.model.pretrained_weights {
        Some(path) => {
            model = model.with_pretrained_backbone(Path::new(path), &device)?;
        }
        None => {
            warn!("事前学習済み重みが指定されていません。特徴抽出器はランダム初期化のまま凍結されます");
        }
    }

    let (mut model, freeze) = model.freeze_backbone(config.model.trainable_tail);
    info!(
        "凍結: 畳み込み層 {} 層 / 凍結パラメータ {} / 学習パラメータ {}",
        freeze.frozen_convs, freeze.frozen_params, freeze.trainable_params
    );

    // === データローダー ===
    let normalization = config.data.normalization;
    let batcher_train = CifarBatcher::<B>::new(device.clone(), normalization);
    let batcher_val = CifarBatcher::<B::InnerBackend>::new(device.clone(), normalization);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(training.batch_size)
        .shuffle(training.seed)
        .num_workers(training.num_workers)
        .build(dataset_train);

    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(training.batch_size)
        .num_workers(training.num_workers)
        .build(dataset_val);

    // === コンパイル ===
    let mut optim = AdamConfig::new().init();
    let learning_rate = training.learning_rate;
    let mut early_stopping = EarlyStopping::new(training.patience, training.min_delta)
        .with_restore_best(training.restore_best);
    let mut best_model: Option<TransferClassifier<B>> = None;
    let mut history = TrainingHistory::new();

    info!(
        "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}, patience {}",
        training.num_epochs, training.batch_size, learning_rate, training.patience
    );

    for epoch in 1..=training.num_epochs {
        let mut train_metrics = MetricAccumulator::new(NUM_CLASSES);
        for (iteration, batch) in dataloader_train.iter().enumerate() {
            let output = TrainStep::step(&model, batch);
            train_metrics.update(&output.item);
            model = optim.step(learning_rate, model, output.grads);

            if iteration % 100 == 0 {
                debug!(
                    "epoch {} iteration {}: running loss {:.4}",
                    epoch,
                    iteration,
                    train_metrics.loss()
                );
            }
        }

        if train_metrics.loss().is_nan() {
            anyhow::bail!("学習損失が NaN になりました (epoch {})", epoch);
        }

        let model_valid = model.valid();
        let mut val_metrics = MetricAccumulator::new(NUM_CLASSES);
        for batch in dataloader_val.iter() {
            let output = ValidStep::step(&model_valid, batch);
            val_metrics.update(&output);
        }

        let metrics = EpochMetrics {
            epoch,
            train_loss: train_metrics.loss(),
            train_accuracy: train_metrics.accuracy(),
            val_loss: val_metrics.loss(),
            val_accuracy: val_metrics.accuracy(),
            learning_rate,
        };
        info!("{}", metrics);
        history.push(metrics);

        match early_stopping.record(epoch, val_metrics.loss() as f32) {
            Decision::Improved => {
                if early_stopping.restore_best() {
                    best_model = Some(model.clone());
                }
            }
            Decision::Waiting => {}
            Decision::Stop => {
                info!(
                    "早期終了: {} エポック改善なし (最良 epoch {:?}, val_loss {:?})",
                    training.patience,
                    early_stopping.best_epoch(),
                    early_stopping.best_loss()
                );
                history.stopped_early = true;
                break;
            }
        }
    }

    history.best_epoch = early_stopping.best_epoch();
    if let Some(best) = best_model {
        info!("最良エポック {:?} の重みに戻します", history.best_epoch);
        model = best;
    }

    if let Some(csv_path) = &training.history_csv {
        history.write_csv(Path::new(csv_path))?;
        info!("学習履歴を保存しました: {}", csv_path);
    }

    // === 評価 ===
    let model_valid = model.valid();
    let test_report = evaluate_dataset(
        &model_valid,
        test,
        training.batch_size,
        training.num_workers,
        normalization,
        &device,
    );
    info!(
        "テスト: loss {:.4}, accuracy {:.2}%",
        test_report.loss,
        test_report.accuracy * 100.0
    );

    // === 保存 ===
    let model_binary = BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model_valid.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデルのシリアライズエラー: {:?}", e))?;
    info!(
        "モデルバイナリサイズ: {} バイト ({:.2} MB)",
        model_binary.len(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    let metadata = ModelMetadata::new(&model_config, normalization, &config.model)
        .with_results(&history, &test_report);
    let bundle_path = save_model_with_metadata(Path::new(&config.model.output_path), &metadata, &model_binary)?;
    info!("学習完了: {} に保存しました", bundle_path.display());

    Ok(TrainingOutcome {
        history,
        test_report,
        freeze,
        bundle_path,
    })
}
