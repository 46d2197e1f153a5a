//! エポックごとの学習履歴

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 1エポック分の指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// エポック番号（1始まり）
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

impl std::fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "epoch {:>3}: loss={:.4} acc={:.2}% | val_loss={:.4} val_acc={:.2}%",
            self.epoch,
            self.train_loss,
            self.train_accuracy * 100.0,
            self.val_loss,
            self.val_accuracy * 100.0
        )
    }
}

/// 学習全体の履歴
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    /// 早期終了したかどうか
    pub stopped_early: bool,
    /// 最良の検証損失を記録したエポック
    pub best_epoch: Option<usize>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// 最良エポックの指標
    pub fn best(&self) -> Option<&EpochMetrics> {
        let best_epoch = self.best_epoch?;
        self.epochs.iter().find(|m| m.epoch == best_epoch)
    }

    /// CSVとして書き出す
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
        }

        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV: {}", path.display()))?;
        for metrics in &self.epochs {
            writer.serialize(metrics)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// CSVから読み込む
    pub fn read_csv(path: &Path) -> Result<Vec<EpochMetrics>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("Failed to open CSV: {}", path.display()))?;

        let mut epochs = Vec::new();
        for record in reader.deserialize() {
            epochs.push(record?);
        }
        Ok(epochs)
    }
}
