pub mod backbone;
pub mod early_stopping;
pub mod evaluation;
pub mod history;
pub mod inference;
pub mod loss;
pub mod ml_model;
pub mod training;

pub use backbone::{FreezeSummary, Vgg16Config, Vgg16Features};
pub use early_stopping::{Decision, EarlyStopping};
pub use evaluation::{evaluate, EvaluationReport, MetricAccumulator};
pub use history::{EpochMetrics, TrainingHistory};
pub use inference::{InferenceEngine, Prediction};
pub use loss::categorical_cross_entropy;
pub use ml_model::{TransferClassifier, TransferModelConfig};
pub use training::{evaluate_dataset, train_model, CifarBatch, CifarBatcher, TrainingOutcome};
