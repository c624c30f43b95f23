use std::time::{Duration, Instant};

use crate::loss::LossMetrics;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    examples_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            examples_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, examples: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.examples_processed = self.examples_processed.saturating_add(examples);
        let step_examples_per_sec = if step_duration > Duration::ZERO {
            examples as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            examples,
            examples_per_sec: self.throughput_ema.update(step_examples_per_sec),
            grad_norm: self.grad_norm_ema.update(grad_norm),
            raw_grad_norm: grad_norm,
            total_examples: self.examples_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// EMA of the committed-step loss.
    pub loss: f64,
    pub step_loss: f64,
    pub examples: u64,
    pub examples_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub total_examples: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

/// Confusion counts for one label level.
#[derive(Debug, Clone)]
pub struct LevelConfusion {
    classes: usize,
    counts: Vec<u64>,
}

impl LevelConfusion {
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            counts: vec![0; classes * classes],
        }
    }

    pub fn record(&mut self, target: u32, predicted: u32) {
        let (t, p) = (target as usize, predicted as usize);
        if t < self.classes && p < self.classes {
            self.counts[t * self.classes + p] += 1;
        }
    }

    fn count(&self, target: usize, predicted: usize) -> u64 {
        self.counts[target * self.classes + predicted]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn scores(&self, level: usize) -> Option<LevelScores> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let mut true_positives = 0u64;
        let mut f1_sum = 0f64;
        let mut f1_classes = 0usize;
        for class in 0..self.classes {
            let tp = self.count(class, class);
            let actual: u64 = (0..self.classes).map(|p| self.count(class, p)).sum();
            let predicted: u64 = (0..self.classes).map(|t| self.count(t, class)).sum();
            true_positives += tp;
            // Classes absent from both targets and predictions do not count
            // toward the macro average.
            if actual + predicted == 0 {
                continue;
            }
            f1_sum += 2.0 * tp as f64 / (actual + predicted) as f64;
            f1_classes += 1;
        }
        let accuracy = true_positives as f64 / total as f64;
        Some(LevelScores {
            level,
            examples: total,
            accuracy,
            // Single-label multi-class: micro precision == micro recall == accuracy.
            micro_f1: accuracy,
            macro_f1: if f1_classes == 0 {
                0.0
            } else {
                f1_sum / f1_classes as f64
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelScores {
    pub level: usize,
    pub examples: u64,
    pub accuracy: f64,
    pub micro_f1: f64,
    pub macro_f1: f64,
}

#[derive(Debug)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    example_count: u64,
    levels: Vec<LevelConfusion>,
}

impl EvaluationMetrics {
    /// `level_sizes` is the class count per hierarchy level.
    pub fn new(level_sizes: &[usize]) -> Self {
        Self {
            loss_sum: 0.0,
            example_count: 0,
            levels: level_sizes.iter().map(|size| LevelConfusion::new(*size)).collect(),
        }
    }

    pub fn update(&mut self, metrics: &LossMetrics) {
        self.loss_sum += f64::from(metrics.total) * metrics.examples as f64;
        self.example_count += metrics.examples as u64;
        for level in &metrics.predictions {
            if let Some(confusion) = self.levels.get_mut(level.level) {
                for (target, predicted) in level.targets.iter().zip(&level.predicted) {
                    confusion.record(*target, *predicted);
                }
            }
        }
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.example_count == 0 {
            return None;
        }
        Some(EvaluationSummary {
            average_loss: self.loss_sum / self.example_count as f64,
            examples: self.example_count,
            levels: self
                .levels
                .iter()
                .enumerate()
                .filter_map(|(level, confusion)| confusion.scores(level))
                .collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub examples: u64,
    /// Empty for pretraining evaluation.
    pub levels: Vec<LevelScores>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::LevelPredictions;

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
        assert_eq!(ema.value(), Some(3.0));
    }

    #[test]
    fn f1_scores_from_confusion() {
        let mut confusion = LevelConfusion::new(3);
        // targets:   0 0 1 1 2
        // predicted: 0 1 1 1 1
        for (t, p) in [(0, 0), (0, 1), (1, 1), (1, 1), (2, 1)] {
            confusion.record(t, p);
        }
        let scores = confusion.scores(0).unwrap();
        assert!((scores.accuracy - 0.6).abs() < 1e-12);
        assert_eq!(scores.micro_f1, scores.accuracy);
        // f1: class0 = 2/3, class1 = 4/6, class2 = 0
        let expected = (2.0 / 3.0 + 4.0 / 6.0 + 0.0) / 3.0;
        assert!((scores.macro_f1 - expected).abs() < 1e-12);
    }

    #[test]
    fn evaluation_weights_loss_by_examples() {
        let mut eval = EvaluationMetrics::new(&[2]);
        eval.update(&LossMetrics {
            total: 1.0,
            examples: 2,
            predictions: vec![LevelPredictions {
                level: 0,
                predicted: vec![0, 1],
                targets: vec![0, 0],
            }],
            ..LossMetrics::default()
        });
        eval.update(&LossMetrics {
            total: 4.0,
            examples: 1,
            predictions: vec![LevelPredictions {
                level: 0,
                predicted: vec![1],
                targets: vec![1],
            }],
            ..LossMetrics::default()
        });
        let summary = eval.finalize().unwrap();
        assert!((summary.average_loss - 2.0).abs() < 1e-12);
        assert_eq!(summary.examples, 3);
        assert!((summary.levels[0].accuracy - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn empty_evaluation_has_no_summary() {
        assert!(EvaluationMetrics::new(&[3]).finalize().is_none());
    }
}
