use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::TrainingError;

/// Cross-entropy over one label level with optional per-class weights.
///
/// With weights the per-example terms are scaled by the weight of the target
/// class and the sum is divided by the batch size.
#[derive(Debug, Clone, Default)]
pub struct ClassificationLoss {
    class_weights: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct ClassificationOutput {
    pub loss: Tensor,
    pub predictions: Vec<u32>,
    pub correct: usize,
}

impl ClassificationLoss {
    pub fn new(class_weights: Option<Vec<f32>>) -> Self {
        Self { class_weights }
    }

    pub fn class_weights(&self) -> Option<&[f32]> {
        self.class_weights.as_deref()
    }

    pub fn compute(&self, logits: &Tensor, targets: &[u32]) -> Result<ClassificationOutput, TrainingError> {
        let (batch, classes) = logits.dims2()?;
        if batch != targets.len() {
            return Err(TrainingError::runtime(format!(
                "{} logit rows but {} targets",
                batch,
                targets.len()
            )));
        }
        if let Some(bad) = targets.iter().find(|t| **t as usize >= classes) {
            return Err(TrainingError::runtime(format!(
                "target {bad} outside {classes} classes"
            )));
        }

        let device = logits.device();
        let logits = logits.to_dtype(DType::F32)?;
        let log_probs = log_softmax(&logits, D::Minus1)?;
        let target = Tensor::from_slice(targets, (batch, 1), device)?;
        let nll = log_probs.gather(&target, 1)?.squeeze(1)?.neg()?;

        let weighted = match &self.class_weights {
            Some(weights) => {
                let per_example: Vec<f32> = targets
                    .iter()
                    .map(|t| weights.get(*t as usize).copied().unwrap_or(1.0))
                    .collect();
                nll.mul(&Tensor::from_vec(per_example, batch, device)?)?
            }
            None => nll,
        };
        let loss = weighted.sum_all()?.affine(1.0 / batch.max(1) as f64, 0.0)?;

        let predictions = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let correct = predictions
            .iter()
            .zip(targets)
            .filter(|(predicted, target)| predicted == target)
            .count();

        Ok(ClassificationOutput {
            loss,
            predictions,
            correct,
        })
    }
}

/// `n / (present_classes * count_c)` for every class seen in `targets`;
/// classes that never occur keep weight 1.
pub fn balanced_class_weights(targets: &[u32], classes: usize) -> Vec<f32> {
    let mut counts = vec![0usize; classes];
    for target in targets {
        if let Some(count) = counts.get_mut(*target as usize) {
            *count += 1;
        }
    }
    let present = counts.iter().filter(|c| **c > 0).count().max(1);
    let total = targets.len() as f32;
    counts
        .iter()
        .map(|count| {
            if *count == 0 {
                1.0
            } else {
                total / (present as f32 * *count as f32)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(values: Vec<f32>, rows: usize, cols: usize) -> Tensor {
        Tensor::from_vec(values, (rows, cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn uniform_logits_give_log_class_count() {
        let loss = ClassificationLoss::default();
        let out = loss.compute(&logits(vec![0.0; 8], 2, 4), &[0, 3]).unwrap();
        let value = out.loss.to_scalar::<f32>().unwrap();
        assert!((value - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn reports_predictions_and_accuracy() {
        let loss = ClassificationLoss::default();
        let out = loss
            .compute(&logits(vec![3.0, 0.0, 0.0, 2.0, 1.0, 0.0], 3, 2), &[0, 1, 1])
            .unwrap();
        assert_eq!(out.predictions, vec![0, 1, 0]);
        assert_eq!(out.correct, 2);
    }

    #[test]
    fn class_weights_scale_terms() {
        let values = vec![1.0, -1.0, 0.5, 0.5];
        let plain = ClassificationLoss::default()
            .compute(&logits(values.clone(), 2, 2), &[0, 1])
            .unwrap()
            .loss
            .to_scalar::<f32>()
            .unwrap();
        let doubled = ClassificationLoss::new(Some(vec![2.0, 2.0]))
            .compute(&logits(values, 2, 2), &[0, 1])
            .unwrap()
            .loss
            .to_scalar::<f32>()
            .unwrap();
        assert!((doubled - 2.0 * plain).abs() < 1e-5);
    }

    #[test]
    fn out_of_range_target_is_rejected() {
        let loss = ClassificationLoss::default();
        assert!(loss.compute(&logits(vec![0.0; 4], 2, 2), &[0, 2]).is_err());
    }

    #[test]
    fn balanced_weights_follow_inverse_frequency() {
        let weights = balanced_class_weights(&[0, 0, 0, 1, 2, 2], 4);
        assert_eq!(weights, vec![6.0 / 9.0, 2.0, 1.0, 1.0]);
    }
}
