use candle_core::Tensor;
use model::HeadOutput;

use super::{scalar, BatchLabels, ClassificationLoss, ContrastiveLoss, LevelPredictions, LossMetrics, LossOutput};
use crate::{config::LossConfig, TrainingError};

/// Fine-tuning loss: cross entropy on every emitted level, plus an optional
/// weighted contrastive term on each level's representation.
#[derive(Debug, Clone)]
pub struct CompositeLoss {
    classification: Vec<ClassificationLoss>,
    contrastive: Option<(ContrastiveLoss, f32)>,
}

impl CompositeLoss {
    pub fn new(
        config: &LossConfig,
        depth: usize,
        class_weights: Vec<Option<Vec<f32>>>,
    ) -> Result<Self, TrainingError> {
        if class_weights.len() != depth {
            return Err(TrainingError::initialization(format!(
                "class weights given for {} levels, hierarchy has {}",
                class_weights.len(),
                depth
            )));
        }
        let contrastive = if config.representation_loss_weight > 0.0 {
            Some((
                ContrastiveLoss::from_config(config, depth)?,
                config.representation_loss_weight,
            ))
        } else {
            None
        };
        Ok(Self {
            classification: class_weights.into_iter().map(ClassificationLoss::new).collect(),
            contrastive,
        })
    }

    pub fn compute(&self, output: &HeadOutput, labels: &BatchLabels) -> Result<LossOutput, TrainingError> {
        if output.logits.len() != output.levels.len() || output.logits.is_empty() {
            return Err(TrainingError::runtime(
                "classifier head output does not line up with its levels",
            ));
        }

        let mut predictions = Vec::with_capacity(output.levels.len());
        let mut ce_total: Option<Tensor> = None;
        for (logits, level) in output.logits.iter().zip(&output.levels) {
            let loss = self.classification.get(*level).ok_or_else(|| {
                TrainingError::runtime(format!("no classification loss for level {level}"))
            })?;
            let targets = labels.level(*level);
            let out = loss.compute(logits, targets)?;
            predictions.push(LevelPredictions {
                level: *level,
                predicted: out.predictions,
                targets: targets.to_vec(),
            });
            ce_total = Some(match ce_total {
                Some(total) => (total + out.loss)?,
                None => out.loss,
            });
        }
        let ce_total = ce_total.ok_or_else(|| TrainingError::runtime("no levels emitted"))?;
        let classification = scalar(&ce_total)?;

        let mut loss = ce_total;
        let mut contrastive = None;
        if let Some((objective, weight)) = &self.contrastive {
            let mut term: Option<Tensor> = None;
            for (representation, level) in output.representations.iter().zip(&output.levels) {
                let depth = level + 1;
                let value = objective
                    .truncated(depth)
                    .compute(representation, &labels.truncated(depth))?;
                term = Some(match term {
                    Some(sum) => (sum + value)?,
                    None => value,
                });
            }
            if let Some(term) = term {
                contrastive = Some(scalar(&term)?);
                loss = (loss + term.affine(f64::from(*weight), 0.0)?)?;
            }
        }

        let total = scalar(&loss)?;
        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                total,
                contrastive,
                classification: Some(classification),
                examples: labels.len(),
                predictions,
            },
        })
    }
}
