//! 小さな合成 CIFAR-10 ディレクトリで学習から推論までを通す

use std::path::Path;

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};

use cifar_transfer_lib::data::cifar::{encode_batch, BATCH_DIR, PIXELS_PER_IMAGE, TEST_FILE, TRAIN_FILES};
use cifar_transfer_lib::data::{CifarDataset, CifarImage, SplitRatio};
use cifar_transfer_lib::ml::{train_model, InferenceEngine, TrainingHistory};
use cifar_transfer_lib::model::{load_metadata, AppConfig, DeviceType};

fn synthetic_images(count: usize, offset: usize) -> Vec<CifarImage> {
    (0..count)
        .map(|i| {
            let label = ((i + offset) % 10) as u8;
            let pixels = (0..PIXELS_PER_IMAGE)
                .map(|p| ((p + label as usize * 25) % 256) as u8)
                .collect();
            CifarImage::new(pixels, label).unwrap()
        })
        .collect()
}

fn write_dataset(data_dir: &Path) {
    let batch_dir = data_dir.join(BATCH_DIR);
    std::fs::create_dir_all(&batch_dir).unwrap();
    for (i, name) in TRAIN_FILES.iter().enumerate() {
        std::fs::write(batch_dir.join(name), encode_batch(&synthetic_images(4, i * 4))).unwrap();
    }
    std::fs::write(batch_dir.join(TEST_FILE), encode_batch(&synthetic_images(10, 3))).unwrap();
}

fn narrow_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.device_type = DeviceType::Cpu;
    config.data.data_dir = root.join("data").display().to_string();
    config.data.download = false;
    config.model.base_width = 4;
    config.model.hidden = 16;
    config.model.output_path = root.join("out/model").display().to_string();
    config.training.num_epochs = 1;
    config.training.batch_size = 8;
    config.training.num_workers = 1;
    config.training.history_csv = Some(root.join("out/history.csv").display().to_string());
    config
}

#[test]
fn train_evaluate_and_reload_bundle() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"));
    let config = narrow_config(dir.path());

    let outcome = train_model::<Autodiff<NdArray>>(&config, NdArrayDevice::Cpu).unwrap();

    assert_eq!(outcome.history.len(), 1);
    assert_eq!(outcome.history.best_epoch, Some(1));
    assert!(!outcome.history.stopped_early);
    assert_eq!(outcome.test_report.samples, 10);
    assert_eq!(outcome.freeze.frozen_convs, 13);
    assert!(outcome.bundle_path.ends_with("model.tar.gz"));

    let csv_rows = TrainingHistory::read_csv(&dir.path().join("out/history.csv")).unwrap();
    assert_eq!(csv_rows.len(), 1);
    assert_eq!(csv_rows[0].epoch, 1);

    let metadata = load_metadata(&outcome.bundle_path).unwrap();
    assert_eq!(metadata.base_width, 4);
    assert_eq!(metadata.epochs_run, 1);
    let saved_accuracy = metadata.test_accuracy.unwrap();
    assert!((saved_accuracy - outcome.test_report.accuracy).abs() < 1e-9);

    let engine = InferenceEngine::<NdArray>::load(&outcome.bundle_path, NdArrayDevice::Cpu).unwrap();
    let test = CifarDataset::load_test(&Path::new(&config.data.data_dir).join(BATCH_DIR)).unwrap();
    let report = engine.evaluate(test, config.training.batch_size, 1);
    assert_eq!(report.samples, 10);
    assert!((report.accuracy - outcome.test_report.accuracy).abs() < 1e-9);
    assert!((report.loss - outcome.test_report.loss).abs() < 1e-4);
}

#[test]
fn missing_dataset_without_download_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = narrow_config(dir.path());

    let result = train_model::<Autodiff<NdArray>>(&config, NdArrayDevice::Cpu);
    assert!(result.is_err());
}

#[test]
fn early_stop_restores_best_epoch_weights() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"));
    let mut config = narrow_config(dir.path());
    config.training.num_epochs = 5;
    config.training.learning_rate = 1e-2;
    config.training.patience = 1;
    // 最初のエポック以外は改善とみなされない
    config.training.min_delta = 1e9;
    config.training.restore_best = true;

    let outcome = train_model::<Autodiff<NdArray>>(&config, NdArrayDevice::Cpu).unwrap();
    let history = &outcome.history;
    assert!(history.stopped_early);
    assert_eq!(history.len(), 2);
    assert_eq!(history.best_epoch, Some(1));

    let metadata = load_metadata(&outcome.bundle_path).unwrap();
    assert!(metadata.stopped_early);
    assert_eq!(metadata.best_epoch, Some(1));
    assert_eq!(metadata.epochs_run, 2);

    // 保存された重みは epoch 1 の検証損失を再現する
    let batch_dir = Path::new(&config.data.data_dir).join(BATCH_DIR);
    let ratio = SplitRatio::from_validation(config.training.validation_ratio).unwrap();
    let (_, val) = CifarDataset::load_train(&batch_dir)
        .unwrap()
        .split(ratio, config.training.seed);
    let engine = InferenceEngine::<NdArray>::load(&outcome.bundle_path, NdArrayDevice::Cpu).unwrap();
    let val_report = engine.evaluate(val, config.training.batch_size, 1);
    assert!((val_report.loss - history.epochs[0].val_loss).abs() < 1e-4);

    let test = CifarDataset::load_test(&batch_dir).unwrap();
    let test_report = engine.evaluate(test, config.training.batch_size, 1);
    assert!((test_report.loss - metadata.test_loss.unwrap()).abs() < 1e-4);
}

#[test]
fn single_training_image_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let batch_dir = dir.path().join("data").join(BATCH_DIR);
    std::fs::create_dir_all(&batch_dir).unwrap();
    for (i, name) in TRAIN_FILES.iter().enumerate() {
        let count = if i == 0 { 1 } else { 0 };
        std::fs::write(batch_dir.join(name), encode_batch(&synthetic_images(count, 0))).unwrap();
    }
    std::fs::write(batch_dir.join(TEST_FILE), encode_batch(&synthetic_images(10, 3))).unwrap();
    let config = narrow_config(dir.path());

    let err = train_model::<Autodiff<NdArray>>(&config, NdArrayDevice::Cpu).unwrap_err();
    assert!(err.to_string().contains("検証 0 枚"));
    assert!(!dir.path().join("out/model.tar.gz").exists());
}
