//! cifar-transfer: CIFAR-10 転移学習CLI

// Autodiff<Wgpu> の型展開が既定の上限を超える
#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::{Autodiff, Wgpu};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use clap::{Parser, Subcommand};
use tracing::info;

use cifar_transfer_lib::data::{ensure_downloaded, CifarDataset};
use cifar_transfer_lib::ml::{train_model, InferenceEngine, Vgg16Config};
use cifar_transfer_lib::model::{
    load_metadata, print_metadata_info, AppConfig, DeviceType, InferenceConfig,
};

#[derive(Parser)]
#[command(name = "cifar-transfer")]
#[command(about = "Transfer learning on CIFAR-10 with a frozen VGG16 convolutional base")]
struct Cli {
    /// 設定ファイル (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 計算デバイスを上書き (wgpu | cpu)
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// CIFAR-10 をダウンロードして展開
    Fetch {
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// 転移学習を実行
    Train {
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
        /// 事前学習済みVGG16の重み (.pth / .mpk)
        #[arg(long)]
        weights: Option<String>,
        /// 末尾の畳み込み層をN層だけ学習対象にする
        #[arg(long)]
        trainable_tail: Option<usize>,
        #[arg(long)]
        patience: Option<usize>,
        #[arg(long)]
        data_dir: Option<String>,
        /// 出力先 (.tar.gz)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 学習済みモデルをテストデータで評価
    Evaluate {
        #[arg(short, long)]
        model: PathBuf,
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// 画像を分類
    Predict {
        #[arg(short, long)]
        model: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// 学習済みモデルのメタデータを表示
    Info {
        #[arg(short, long)]
        model: PathBuf,
    },
    /// torchvision の VGG16 重み (.pth) を Burn レコード (.mpk) に変換
    ConvertWeights {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// デフォルト設定ファイルを書き出す
    InitConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_device(name: &str) -> Result<DeviceType> {
    match name.to_ascii_lowercase().as_str() {
        "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
        "cpu" | "ndarray" => Ok(DeviceType::Cpu),
        other => anyhow::bail!("不明なデバイス: {} (wgpu | cpu)", other),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("設定ファイルの読み込みに失敗しました: {}", path.display()))?,
        None => AppConfig::load_or_default(&config_path),
    };
    if let Some(device) = &cli.device {
        config.device_type = parse_device(device)?;
    }

    match cli.command {
        Command::Fetch { data_dir } => {
            if let Some(dir) = data_dir {
                config.data.data_dir = dir;
            }
            let batch_dir = ensure_downloaded(Path::new(&config.data.data_dir), true)?;
            println!("CIFAR-10: {}", batch_dir.display());
        }
        Command::Train {
            epochs,
            batch_size,
            learning_rate,
            weights,
            trainable_tail,
            patience,
            data_dir,
            output,
        } => {
            if let Some(v) = epochs {
                config.training.num_epochs = v;
            }
            if let Some(v) = batch_size {
                config.training.batch_size = v;
            }
            if let Some(v) = learning_rate {
                config.training.learning_rate = v;
            }
            if let Some(v) = weights {
                config.model.pretrained_weights = Some(v);
            }
            if let Some(v) = trainable_tail {
                config.model.trainable_tail = v;
            }
            if let Some(v) = patience {
                config.training.patience = v;
            }
            if let Some(v) = data_dir {
                config.data.data_dir = v;
            }
            if let Some(v) = output {
                config.model.output_path = v;
            }

            config.display();
            match config.device_type {
                DeviceType::Wgpu => run_train::<Autodiff<Wgpu>>(&config, WgpuDevice::default())?,
                DeviceType::Cpu => run_train::<Autodiff<NdArray>>(&config, NdArrayDevice::Cpu)?,
            }
        }
        Command::Evaluate { model, data_dir } => {
            if let Some(dir) = data_dir {
                config.data.data_dir = dir;
            }
            match config.device_type {
                DeviceType::Wgpu => run_evaluate::<Wgpu>(&config, &model, WgpuDevice::default())?,
                DeviceType::Cpu => run_evaluate::<NdArray>(&config, &model, NdArrayDevice::Cpu)?,
            }
        }
        Command::Predict { model, images } => match config.device_type {
            DeviceType::Wgpu => run_predict::<Wgpu>(&model, &images, WgpuDevice::default())?,
            DeviceType::Cpu => run_predict::<NdArray>(&model, &images, NdArrayDevice::Cpu)?,
        },
        Command::Info { model } => {
            let metadata = load_metadata(&model)?;
            print_metadata_info(&metadata);
            InferenceConfig::load_from_model(&model)?.print_info();
        }
        Command::ConvertWeights { input, output } => {
            let backbone = Vgg16Config::new()
                .init::<NdArray>(&NdArrayDevice::Cpu)
                .load_pretrained(&input, &NdArrayDevice::Cpu)?;
            backbone.save_weights(&output)?;
            println!("変換しました: {} -> {}", input.display(), output.with_extension("mpk").display());
        }
        Command::InitConfig { output } => {
            let path = output.unwrap_or(config_path);
            AppConfig::default().save(&path)?;
            println!("設定ファイルを書き出しました: {}", path.display());
        }
    }

    Ok(())
}

fn run_train<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<()> {
    info!("使用デバイス: {} ({:?})", config.device_type, device);
    let outcome = train_model::<B>(config, device)?;

    if let Some(best) = outcome.history.best() {
        println!("最良エポック: {}", best);
    }
    if outcome.history.stopped_early {
        println!("早期終了しました ({} エポック)", outcome.history.len());
    }
    outcome.test_report.print();
    println!("保存先: {}", outcome.bundle_path.display());
    Ok(())
}

fn run_evaluate<B: Backend>(config: &AppConfig, model_path: &Path, device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;
    let metadata = engine.metadata();
    if let Some(accuracy) = metadata.test_accuracy {
        info!(
            "学習時のテスト正解率: {:.2}% ({})",
            accuracy * 100.0,
            metadata.trained_at
        );
    }
    let batch_dir = ensure_downloaded(Path::new(&config.data.data_dir), config.data.download)?;
    let test = CifarDataset::load_test(&batch_dir).context("テストデータの読み込みに失敗しました")?;

    let report = engine.evaluate(test, config.training.batch_size, config.training.num_workers);
    report.print();
    Ok(())
}

fn run_predict<B: Backend>(model_path: &Path, images: &[PathBuf], device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;
    let predictions = engine.classify_batch(images)?;

    for (path, prediction) in images.iter().zip(&predictions) {
        println!("{}: {}", path.display(), prediction);
    }
    Ok(())
}
