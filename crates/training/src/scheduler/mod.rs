use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Rate for the next committed step, then advance.
    fn step(&mut self) -> f64;
    /// Rate returned by the most recent `step`.
    fn learning_rate(&self) -> f64;
    /// Rate for an arbitrary committed-step index.
    fn rate_at(&self, step: usize) -> f64;
    fn steps_taken(&self) -> usize;
    fn snapshot(&self) -> SchedulerState;
    fn restore(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

/// Persisted scheduler position, written next to each checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub step: usize,
    pub learning_rate: f64,
    pub total_steps: usize,
    pub warmup_steps: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleShape {
    Constant,
    CosineDecay,
    PolynomialDecay { power: f64 },
    LinearDecay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub peak_lr: f64,
    pub min_lr: f64,
    pub total_steps: usize,
    pub warmup_steps: usize,
    pub shape: ScheduleShape,
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        peak_lr: f64,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }

        if let Some(cfg_total) = cfg.total_steps {
            if cfg_total != total_steps {
                return Err(TrainingError::initialization(
                    "scheduler total_steps mismatch between runtime and config",
                ));
            }
        }

        let shape = match cfg.lr_schedule {
            config::LearningRateSchedule::Constant => ScheduleShape::Constant,
            config::LearningRateSchedule::CosineDecay => ScheduleShape::CosineDecay,
            config::LearningRateSchedule::LinearDecay => ScheduleShape::LinearDecay,
            config::LearningRateSchedule::PolynomialDecay => ScheduleShape::PolynomialDecay {
                power: f64::from(cfg.power),
            },
        };

        Ok(Self {
            peak_lr,
            min_lr: f64::from(cfg.min_learning_rate),
            total_steps,
            warmup_steps: compute_warmup_steps(total_steps, cfg.warmup_rate),
            shape,
        })
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        Ok(Box::new(LearningRateScheduler::new(self)?))
    }
}

/// Linear warmup from zero to the peak rate, then decay toward `min_lr` over
/// the remaining steps.
pub struct LearningRateScheduler {
    config: SchedulerConfig,
    step: usize,
    current_lr: f64,
}

impl LearningRateScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, TrainingError> {
        if config.peak_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires peak learning rate > 0",
            ));
        }
        if config.min_lr < 0.0 || config.min_lr > config.peak_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, peak_lr]",
            ));
        }
        if let ScheduleShape::PolynomialDecay { power } = config.shape {
            if power <= 0.0 {
                return Err(TrainingError::initialization("scheduler power must be > 0"));
            }
        }
        Ok(Self {
            config,
            step: 0,
            current_lr: 0.0,
        })
    }

    fn compute_lr(&self, step: usize) -> f64 {
        let SchedulerConfig {
            peak_lr,
            min_lr,
            total_steps,
            warmup_steps,
            shape,
        } = self.config;

        if step < warmup_steps {
            return peak_lr * step as f64 / warmup_steps as f64;
        }
        if total_steps <= warmup_steps {
            return peak_lr;
        }

        let effective = (step - warmup_steps) as f64;
        let denom = (total_steps - warmup_steps) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let factor = match shape {
            ScheduleShape::Constant => return peak_lr,
            ScheduleShape::CosineDecay => 0.5 * (1.0 + f64::cos(PI * progress)),
            ScheduleShape::PolynomialDecay { power } => (1.0 - progress).max(0.0).powf(power),
            ScheduleShape::LinearDecay => 1.0 - progress,
        };
        min_lr + (peak_lr - min_lr) * factor
    }
}

impl LRScheduler for LearningRateScheduler {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn rate_at(&self, step: usize) -> f64 {
        self.compute_lr(step)
    }

    fn steps_taken(&self) -> usize {
        self.step
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            step: self.step,
            learning_rate: self.current_lr,
            total_steps: self.config.total_steps,
            warmup_steps: self.config.warmup_steps,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.total_steps != self.config.total_steps
            || state.warmup_steps != self.config.warmup_steps
        {
            return Err(TrainingError::restore(format!(
                "scheduler state covers {} steps ({} warmup), run is configured for {} ({})",
                state.total_steps,
                state.warmup_steps,
                self.config.total_steps,
                self.config.warmup_steps
            )));
        }
        self.step = state.step;
        self.current_lr = state.learning_rate;
        Ok(())
    }
}

pub fn compute_warmup_steps(total_steps: usize, proportion: f64) -> usize {
    if total_steps == 0 {
        return 0;
    }
    let clamped = proportion.clamp(0.0, 1.0);
    let steps = (clamped * total_steps as f64).round() as usize;
    steps.min(total_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearningRateSchedule;

    fn scheduler(schedule: LearningRateSchedule, warmup_rate: f64, total: usize) -> Box<dyn LRScheduler> {
        let cfg = config::SchedulerConfig {
            lr_schedule: schedule,
            warmup_rate,
            total_steps: Some(total),
            epochs: None,
            min_learning_rate: 0.0,
            power: 2.0,
        };
        SchedulerConfig::from_training_config(&cfg, 1e-3, total)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn cosine_warms_up_then_decays_to_floor() {
        let sched = scheduler(LearningRateSchedule::CosineDecay, 0.06, 1000);
        assert_eq!(sched.rate_at(0), 0.0);
        for step in 1..=60 {
            assert!(sched.rate_at(step) > sched.rate_at(step - 1), "step {step}");
        }
        assert!((sched.rate_at(60) - 1e-3).abs() < 1e-12);
        for step in 61..=1000 {
            assert!(sched.rate_at(step) <= sched.rate_at(step - 1));
        }
        assert!(sched.rate_at(1000).abs() < 1e-12);
    }

    #[test]
    fn constant_holds_peak_after_warmup() {
        let sched = scheduler(LearningRateSchedule::Constant, 0.1, 100);
        assert!((sched.rate_at(5) - 5e-4).abs() < 1e-12);
        assert_eq!(sched.rate_at(10), 1e-3);
        assert_eq!(sched.rate_at(99), 1e-3);
    }

    #[test]
    fn linear_and_polynomial_shapes() {
        let linear = scheduler(LearningRateSchedule::LinearDecay, 0.0, 100);
        assert!((linear.rate_at(50) - 5e-4).abs() < 1e-12);
        let poly = scheduler(LearningRateSchedule::PolynomialDecay, 0.0, 100);
        assert!((poly.rate_at(50) - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn step_advances_and_snapshot_restores() {
        let mut sched = scheduler(LearningRateSchedule::LinearDecay, 0.1, 20);
        let first: Vec<f64> = (0..7).map(|_| sched.step()).collect();
        assert_eq!(first[0], 0.0);
        let state = sched.snapshot();
        assert_eq!(state.step, 7);

        let mut resumed = scheduler(LearningRateSchedule::LinearDecay, 0.1, 20);
        resumed.restore(&state).unwrap();
        assert_eq!(resumed.learning_rate(), first[6]);
        assert_eq!(resumed.step(), sched.step());

        let mut other = scheduler(LearningRateSchedule::LinearDecay, 0.1, 40);
        assert!(other.restore(&state).is_err());
    }

    #[test]
    fn warmup_steps_round() {
        assert_eq!(compute_warmup_steps(1000, 0.06), 60);
        assert_eq!(compute_warmup_steps(10, 0.25), 3);
        assert_eq!(compute_warmup_steps(0, 0.5), 0);
    }
}
