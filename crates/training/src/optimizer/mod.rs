use std::collections::HashMap;

use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

/// Gradients keyed by parameter name, already on the parameters' device.
pub type NamedGradients = HashMap<String, Tensor>;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: f64::from(value.learning_rate),
            beta1: f64::from(value.beta1),
            beta2: f64::from(value.beta2),
            epsilon: f64::from(value.epsilon),
            weight_decay: f64::from(value.weight_decay),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainerOptimizerOptions {
    pub clip_global_norm: Option<f64>,
    pub weight_decay_exclude: Vec<String>,
}

impl From<&config::OptimizerConfig> for TrainerOptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            clip_global_norm: value.max_grad_norm.map(f64::from),
            weight_decay_exclude: value.weight_decay_exclude.clone(),
        }
    }
}

/// What one committed update did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub clipped: bool,
    pub learning_rate: f64,
}

/// AdamW over a fixed, named parameter set.
///
/// An update is staged for every parameter first and only written back once
/// all of them succeeded, so a failing step leaves weights and moments as they
/// were.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

struct StagedUpdate {
    index: usize,
    value: Tensor,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    /// Parameters are tracked in name order.
    pub fn new(
        mut named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        named_parameters.sort_by(|a, b| a.0.cmp(&b.0));

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like()?;
            let second_moment = tensor.zeros_like()?;
            let apply_weight_decay =
                should_apply_weight_decay(&name, &options.weight_decay_exclude);

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    pub fn decays(&self, name: &str) -> Option<bool> {
        self.params
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.apply_weight_decay)
    }

    /// Apply one update. `global_step` is only used to label errors.
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &NamedGradients, global_step: usize) -> Result<StepReport, TrainingError> {
        let mut gathered = Vec::new();
        let mut total_norm_sq = 0f64;
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.get(&slot.name) else {
                continue;
            };
            if grad.dims() != slot.param.as_tensor().dims() {
                return Err(TrainingError::runtime(format!(
                    "gradient for '{}' has shape {:?}, parameter has {:?}",
                    slot.name,
                    grad.dims(),
                    slot.param.as_tensor().dims()
                )));
            }
            let grad = grad.to_dtype(DType::F32)?;
            let norm_sq = squared_norm(&grad)?;
            if !norm_sq.is_finite() {
                return Err(TrainingError::NumericInstability {
                    step: global_step,
                    what: "gradient",
                    value: norm_sq as f32,
                });
            }
            total_norm_sq += norm_sq;
            gathered.push((index, grad));
        }

        let grad_norm = total_norm_sq.sqrt();
        let mut clipped = false;
        if let Some(max_norm) = self.clip_global_norm {
            if grad_norm > max_norm {
                let scale = max_norm / (grad_norm + EPS);
                for (_, grad) in &mut gathered {
                    *grad = grad.affine(scale, 0.0)?;
                }
                clipped = true;
            }
        }

        let report = StepReport {
            grad_norm,
            clipped,
            learning_rate: self.config.learning_rate,
        };
        if gathered.is_empty() {
            return Ok(report);
        }

        let step = self.step + 1;
        let staged = self.stage_adamw(step, gathered)?;
        for update in staged {
            let slot = &mut self.params[update.index];
            slot.param.set(&update.value)?;
            slot.first_moment = update.first_moment;
            slot.second_moment = update.second_moment;
        }
        self.step = step;
        Ok(report)
    }

    fn stage_adamw(&self, step: usize, gathered: Vec<(usize, Tensor)>) -> Result<Vec<StagedUpdate>, TrainingError> {
        let cfg = self.config;
        let scale_m = 1.0 / (1.0 - cfg.beta1.powi(step as i32)).max(EPS);
        let scale_v = 1.0 / (1.0 - cfg.beta2.powi(step as i32)).max(EPS);

        let mut staged = Vec::with_capacity(gathered.len());
        for (index, grad) in gathered {
            let slot = &self.params[index];

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

            let base = slot.param.as_tensor().detach();
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };

            staged.push(StagedUpdate {
                index,
                value: decayed.sub(&update)?,
                first_moment: new_m,
                second_moment: new_v,
            });
        }
        Ok(staged)
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            parameters.push(ParameterState {
                name: slot.name.clone(),
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                shape,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters,
        })
    }

    /// Replace moments and step count. The state must cover exactly the
    /// tracked parameters with matching shapes; nothing changes otherwise.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::restore(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != state.shape.as_slice() {
                return Err(TrainingError::restore(format!(
                    "optimizer state shape mismatch for '{}': {:?} vs {:?}",
                    slot.name, state.shape, dims
                )));
            }
            let expected = numel(dims);
            if expected != state.first_moment.len() || expected != state.second_moment.len() {
                return Err(TrainingError::restore(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            restored.push((
                Tensor::from_vec(state.first_moment, dims, device)?,
                Tensor::from_vec(state.second_moment, dims, device)?,
            ));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::restore(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

fn squared_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor.sqr()?.sum_all()?.to_vec0::<f32>()?;
    Ok(f64::from(value))
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor.flatten_all()?.to_vec1::<f32>()?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}
