//! テストデータでの評価

use burn::{
    tensor::{backend::Backend, ElementConversion},
    train::ClassificationOutput,
};
use serde::{Deserialize, Serialize};

use super::ml_model::TransferClassifier;
use super::training::CifarBatch;
use crate::data::class_name;

/// 損失と正解数の集計
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    total: usize,
    confusion: Vec<Vec<usize>>,
}

impl MetricAccumulator {
    pub fn new(num_classes: usize) -> Self {
        Self {
            loss_sum: 0.0,
            correct: 0,
            total: 0,
            confusion: vec![vec![0; num_classes]; num_classes],
        }
    }

    /// 1バッチ分の出力を集計
    pub fn update<B: Backend>(&mut self, output: &ClassificationOutput<B>) {
        let [batch_size, _] = output.output.dims();
        let loss = output.loss.clone().into_scalar().elem::<f64>();

        let predictions: Vec<i64> = output
            .output
            .clone()
            .argmax(1)
            .reshape([batch_size])
            .into_data()
            .iter::<i64>()
            .collect();
        let targets: Vec<i64> = output.targets.clone().into_data().iter::<i64>().collect();

        self.record(loss, &predictions, &targets);
    }

    /// CPU上の予測とラベルを集計
    pub fn record(&mut self, batch_loss: f64, predictions: &[i64], targets: &[i64]) {
        let batch_size = targets.len();
        self.loss_sum += batch_loss * batch_size as f64;
        self.total += batch_size;

        for (&pred, &target) in predictions.iter().zip(targets) {
            if pred == target {
                self.correct += 1;
            }
            let (t, p) = (target as usize, pred as usize);
            if t < self.confusion.len() && p < self.confusion.len() {
                self.confusion[t][p] += 1;
            }
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// サンプル平均の損失
    pub fn loss(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.loss_sum / self.total as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn into_report(self) -> EvaluationReport {
        let per_class_accuracy = self
            .confusion
            .iter()
            .enumerate()
            .map(|(class, row)| {
                let count: usize = row.iter().sum();
                if count == 0 {
                    0.0
                } else {
                    row[class] as f64 / count as f64
                }
            })
            .collect();

        EvaluationReport {
            loss: self.loss(),
            accuracy: self.accuracy(),
            samples: self.total,
            per_class_accuracy,
            confusion: self.confusion,
        }
    }
}

/// 評価結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
    pub per_class_accuracy: Vec<f64>,
    /// confusion[正解][予測]
    pub confusion: Vec<Vec<usize>>,
}

impl EvaluationReport {
    /// 結果をコンソールに表示
    pub fn print(&self) {
        println!("\n=== テスト評価 ===");
        println!("サンプル数: {}", self.samples);
        println!("損失: {:.4}", self.loss);
        println!("正解率: {:.2}%", self.accuracy * 100.0);
        println!("--- クラス別正解率 ---");
        for (class, accuracy) in self.per_class_accuracy.iter().enumerate() {
            let name = class_name(class).unwrap_or("?");
            println!("  {:<10} {:>6.2}%", name, accuracy * 100.0);
        }
        println!("==================");
    }
}

/// バッチ列に対してモデルを評価
pub fn evaluate<B, I>(model: &TransferClassifier<B>, num_classes: usize, batches: I) -> EvaluationReport
where
    B: Backend,
    I: IntoIterator<Item = CifarBatch<B>>,
{
    let mut accumulator = MetricAccumulator::new(num_classes);
    for batch in batches {
        let output = model.forward_classification(batch.images, batch.targets, batch.one_hot);
        accumulator.update(&output);
    }
    accumulator.into_report()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_weights_loss_by_batch_size() {
        let mut acc = MetricAccumulator::new(3);
        acc.record(1.0, &[0, 1], &[0, 1]);
        acc.record(4.0, &[2], &[1]);

        assert_eq!(acc.total(), 3);
        assert!((acc.loss() - 2.0).abs() < 1e-9);
        assert!((acc.accuracy() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn report_builds_confusion_and_per_class_accuracy() {
        let mut acc = MetricAccumulator::new(3);
        acc.record(0.5, &[0, 0, 1, 2], &[0, 1, 1, 2]);
        let report = acc.into_report();

        assert_eq!(report.samples, 4);
        assert_eq!(report.confusion[1][0], 1);
        assert_eq!(report.confusion[1][1], 1);
        assert_eq!(report.per_class_accuracy, vec![1.0, 0.5, 1.0]);
    }

    #[test]
    fn empty_accumulator_is_zero() {
        let report = MetricAccumulator::new(10).into_report();
        assert_eq!(report.samples, 0);
        assert_eq!(report.loss, 0.0);
        assert_eq!(report.accuracy, 0.0);
    }
}
