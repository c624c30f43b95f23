mod classification;
mod composite;
mod contrastive;

pub use classification::{balanced_class_weights, ClassificationLoss, ClassificationOutput};
pub use composite::CompositeLoss;
pub use contrastive::{depth_proportional_weights, ContrastiveLoss};

use candle_core::{DType, Tensor};
use model::HeadOutput;

use crate::{config::LossConfig, TrainingError};

/// Host-side labels of a batch, one row per hierarchy level (root first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLabels {
    levels: Vec<Vec<u32>>,
}

impl BatchLabels {
    pub fn new(levels: Vec<Vec<u32>>) -> Result<Self, TrainingError> {
        let Some(first) = levels.first() else {
            return Err(TrainingError::runtime("batch labels need at least one level"));
        };
        let len = first.len();
        if levels.iter().any(|level| level.len() != len) {
            return Err(TrainingError::runtime("batch label levels differ in length"));
        }
        Ok(Self { levels })
    }

    /// Transpose root-to-leaf label paths into per-level rows.
    pub fn from_paths<'a, I>(paths: I) -> Result<Self, TrainingError>
    where
        I: IntoIterator<Item = &'a [u32]>,
    {
        let mut levels: Vec<Vec<u32>> = Vec::new();
        for (row, path) in paths.into_iter().enumerate() {
            if row == 0 {
                levels = vec![Vec::new(); path.len()];
            }
            if path.len() != levels.len() {
                return Err(TrainingError::runtime(format!(
                    "example {row} has a label path of depth {} in a batch of depth {}",
                    path.len(),
                    levels.len()
                )));
            }
            for (level, label) in path.iter().enumerate() {
                levels[level].push(*label);
            }
        }
        Self::new(levels)
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn level(&self, level: usize) -> &[u32] {
        &self.levels[level]
    }

    pub fn leaf(&self) -> &[u32] {
        &self.levels[self.levels.len() - 1]
    }

    pub fn truncated(&self, depth: usize) -> Self {
        Self {
            levels: self.levels[..depth.clamp(1, self.levels.len())].to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelPredictions {
    pub level: usize,
    pub predicted: Vec<u32>,
    pub targets: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossMetrics {
    pub total: f32,
    pub contrastive: Option<f32>,
    pub classification: Option<f32>,
    pub examples: usize,
    /// Fine-tuning only: argmax predictions per emitted level.
    pub predictions: Vec<LevelPredictions>,
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

/// Training objective for one mode.
#[derive(Debug, Clone)]
pub enum Objective {
    /// Contrastive loss on the pretraining representation.
    Pretraining(ContrastiveLoss),
    FineTuning(CompositeLoss),
}

impl Objective {
    pub fn pretraining(config: &LossConfig, depth: usize) -> Result<Self, TrainingError> {
        Ok(Self::Pretraining(ContrastiveLoss::from_config(config, depth)?))
    }

    /// `class_weights` holds one optional weight vector per hierarchy level.
    pub fn fine_tuning(
        config: &LossConfig,
        depth: usize,
        class_weights: Vec<Option<Vec<f32>>>,
    ) -> Result<Self, TrainingError> {
        Ok(Self::FineTuning(CompositeLoss::new(config, depth, class_weights)?))
    }

    pub fn compute(&self, output: &HeadOutput, labels: &BatchLabels) -> Result<LossOutput, TrainingError> {
        match self {
            Objective::Pretraining(loss) => {
                let representation = output.representations.first().ok_or_else(|| {
                    TrainingError::runtime("pretraining head emitted no representation")
                })?;
                let value = loss.compute(representation, labels)?;
                let total = scalar(&value)?;
                Ok(LossOutput {
                    loss: value,
                    metrics: LossMetrics {
                        total,
                        contrastive: Some(total),
                        classification: None,
                        examples: labels.len(),
                        predictions: Vec::new(),
                    },
                })
            }
            Objective::FineTuning(loss) => loss.compute(output, labels),
        }
    }
}

pub(crate) fn scalar(tensor: &Tensor) -> Result<f32, TrainingError> {
    Ok(tensor.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}
