//! Contrastive pretraining and hierarchical fine-tuning over fold sets
//! written by `labeled-data`.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod errors;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointHandle, CheckpointSelector, CheckpointStore, LoadedCheckpoint, TrainingSnapshot};
pub use config::{TrainingConfig, TrainingMode};
pub use data::{BlockingDataLoader, DataBatch, DataLoader, EvalBatchLoader, FoldBatchLoader};
pub use device::{DeviceGroup, DeviceSelector};
pub use errors::{ErrorKind, RunFailure, TrainingError};
pub use loss::{BatchLabels, ClassificationLoss, CompositeLoss, ContrastiveLoss, LossMetrics, LossOutput, Objective};
pub use metrics::{EvaluationSummary, LevelScores};
pub use optimizer::{OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use scheduler::{LRScheduler, LearningRateScheduler, ScheduleShape, SchedulerConfig};
pub use trainer::{ShutdownSignal, Trainer, TrainerPhase, TrainingOutcome};
