use model::{ClassifierHeadKind, EncoderConfig, HeadConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{checkpoint::CheckpointSelector, device::DeviceSelector, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    Pretraining,
    FineTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub mode: TrainingMode,
    pub model: EncoderConfig,
    #[serde(default)]
    pub head: HeadSettings,
    #[serde(default)]
    pub loss: LossConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.model_config_check() {
            errors.push(err);
        }

        if self.head.representation_size == 0 {
            errors.push("head.representation_size must be greater than 0".to_string());
        }

        if self.data.batch_size < 2 {
            errors.push("data.batch_size must be at least 2".to_string());
        }

        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }

        if let Some(k) = self.data.k_folds {
            if k < 2 {
                errors.push("data.k_folds must be at least 2".to_string());
            }
            if let Some(fold) = self.data.validation_fold {
                if fold >= k {
                    errors.push(format!(
                        "data.validation_fold ({fold}) must be below data.k_folds ({k})"
                    ));
                }
            }
        }

        if let Some(rate) = self.data.test_rate {
            if !(0.0..1.0).contains(&rate) {
                errors.push("data.test_rate must be in [0, 1)".to_string());
            }
        }

        if let Some(0) = self.data.evaluation_batch_size {
            errors.push("data.evaluation_batch_size must be greater than 0".to_string());
        }

        if self.loss.temperature <= 0.0 {
            errors.push("loss.temperature must be greater than 0".to_string());
        }

        if self.loss.margin <= 0.0 {
            errors.push("loss.margin must be greater than 0".to_string());
        }

        if let Some(weights) = &self.loss.level_weights {
            if weights.is_empty() {
                errors.push("loss.level_weights must not be empty".to_string());
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                errors.push("loss.level_weights must be finite and >= 0".to_string());
            }
            if weights.iter().sum::<f32>() <= 0.0 {
                errors.push("loss.level_weights must have a positive sum".to_string());
            }
        }

        if self.loss.representation_loss_weight < 0.0 {
            errors.push("loss.representation_loss_weight must be >= 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        match (self.scheduler.total_steps, self.scheduler.epochs) {
            (Some(_), Some(_)) => errors
                .push("scheduler.total_steps and scheduler.epochs are mutually exclusive".to_string()),
            (None, None) => {
                errors.push("one of scheduler.total_steps or scheduler.epochs is required".to_string())
            }
            (Some(0), None) => errors.push("scheduler.total_steps must be greater than 0".to_string()),
            (None, Some(0)) => errors.push("scheduler.epochs must be greater than 0".to_string()),
            _ => {}
        }

        if !(0.0..1.0).contains(&self.scheduler.warmup_rate) {
            errors.push("scheduler.warmup_rate must be in [0, 1)".to_string());
        }

        if self.scheduler.min_learning_rate < 0.0 {
            errors.push("scheduler.min_learning_rate must be >= 0".to_string());
        }

        if self.scheduler.min_learning_rate > self.optimizer.learning_rate {
            errors.push(
                "scheduler.min_learning_rate cannot exceed optimizer.learning_rate".to_string(),
            );
        }

        if self.scheduler.power <= 0.0 {
            errors.push("scheduler.power must be greater than 0".to_string());
        }

        if let Some(run_id) = &self.runtime.run_id {
            if run_id.is_empty()
                || !run_id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            {
                errors.push(format!(
                    "runtime.run_id '{run_id}' may only contain ASCII letters, digits, '-', '_' and '.'"
                ));
            }
        }

        if let Err(err) = self.runtime.device_selector.parse::<DeviceSelector>() {
            errors.push(format!("runtime.device_selector: {err}"));
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        if let Some(0) = self.runtime.checkpoint.every_n_steps {
            errors.push("runtime.checkpoint.every_n_steps must be greater than 0".to_string());
        }

        if let Some(0) = self.runtime.evaluation.every_n_steps {
            errors.push("runtime.evaluation.every_n_steps must be greater than 0".to_string());
        }

        if self.mode == TrainingMode::Pretraining && self.runtime.init_checkpoint.is_some() {
            errors.push("runtime.init_checkpoint only applies to fine_tuning runs".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn model_config_check(&self) -> Result<(), String> {
        if self.model.vocab_size == 0 {
            return Err("model.vocab_size must be greater than 0".into());
        }
        if self.model.hidden_size == 0 {
            return Err("model.hidden_size must be greater than 0".into());
        }
        if self.model.max_length == 0 {
            return Err("model.max_length must be greater than 0".into());
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err("model.dropout must be in [0, 1)".into());
        }
        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.folds_dir, base);
        self.runtime.apply_base_path(base);
    }

    /// SHA-256 of the canonical JSON form, recorded in checkpoint manifests.
    pub fn fingerprint(&self) -> Result<String, TrainingError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadSettings {
    #[serde(default = "default_representation_size")]
    pub representation_size: usize,
    #[serde(default)]
    pub classifier_head: ClassifierHeadKind,
    #[serde(default)]
    pub include_ancestor_representations: bool,
    #[serde(default)]
    pub pre_activation: bool,
    #[serde(default)]
    pub class_weighting: ClassWeighting,
}

impl Default for HeadSettings {
    fn default() -> Self {
        Self {
            representation_size: default_representation_size(),
            classifier_head: ClassifierHeadKind::default(),
            include_ancestor_representations: false,
            pre_activation: false,
            class_weighting: ClassWeighting::default(),
        }
    }
}

impl HeadSettings {
    pub fn head_config(&self) -> HeadConfig {
        HeadConfig {
            representation_size: self.representation_size,
            classifier_head: self.classifier_head,
            include_ancestor_representations: self.include_ancestor_representations,
            pre_activation: self.pre_activation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeighting {
    #[default]
    None,
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossStrategy {
    Margin,
    #[default]
    Supervised,
    Hierarchical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub loss_strategy: LossStrategy,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_margin")]
    pub margin: f32,
    /// Hierarchical level weights, root first. Normalized to sum to one.
    #[serde(default)]
    pub level_weights: Option<Vec<f32>>,
    /// Weight of the contrastive term added to cross entropy during
    /// fine-tuning. Zero disables it.
    #[serde(default)]
    pub representation_loss_weight: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss_strategy: LossStrategy::default(),
            temperature: default_temperature(),
            margin: default_margin(),
            level_weights: None,
            representation_loss_weight: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory written by `build-folds`.
    pub folds_dir: PathBuf,
    /// Fold held out for evaluation; every other fold is trained on.
    #[serde(default)]
    pub validation_fold: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub evaluation_batch_size: Option<usize>,
    /// Expected fold count; checked against the fold set when given.
    #[serde(default)]
    pub k_folds: Option<usize>,
    /// Expected held-out rate; checked against the fold set when given.
    #[serde(default)]
    pub test_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f32>,
    /// Parameter-name fragments excluded from weight decay.
    #[serde(default = "default_weight_decay_exclude")]
    pub weight_decay_exclude: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
            weight_decay_exclude: default_weight_decay_exclude(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    CosineDecay,
    PolynomialDecay,
    #[default]
    LinearDecay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub lr_schedule: LearningRateSchedule,
    /// Fraction of total steps spent warming up.
    #[serde(default = "default_warmup_rate")]
    pub warmup_rate: f64,
    #[serde(default)]
    pub total_steps: Option<usize>,
    #[serde(default)]
    pub epochs: Option<usize>,
    #[serde(default)]
    pub min_learning_rate: f32,
    /// Exponent of `polynomial_decay`.
    #[serde(default = "default_power")]
    pub power: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Generated from the clock and seed when absent.
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_device_selector")]
    pub device_selector: String,
    /// Resume this run from one of its own checkpoints.
    #[serde(default)]
    pub restore_checkpoint_selector: Option<CheckpointSelector>,
    /// Seed a fine-tuning run's encoder from another run's checkpoint.
    #[serde(default)]
    pub init_checkpoint: Option<InitCheckpointConfig>,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            seed: default_seed(),
            device_selector: default_device_selector(),
            restore_checkpoint_selector: None,
            init_checkpoint: None,
            log_every_n_steps: default_log_every_n_steps(),
            checkpoint: CheckpointConfig::default(),
            evaluation: EvaluationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint.directory, base);
        if let Some(init) = self.init_checkpoint.as_mut() {
            if let Some(directory) = init.directory.as_mut() {
                absolutize_in_place(directory, base);
            }
        }
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitCheckpointConfig {
    pub run_id: String,
    #[serde(default)]
    pub selector: CheckpointSelector,
    /// Store root of the source run; defaults to this run's store.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub every_n_steps: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_directory(),
            every_n_steps: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    #[serde(default)]
    pub before_training: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every_n")]
    pub flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            tensorboard_dir: None,
            flush_every_n: default_flush_every_n(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_representation_size() -> usize {
    128
}

fn default_temperature() -> f32 {
    0.1
}

fn default_margin() -> f32 {
    0.2
}

fn default_batch_size() -> usize {
    32
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_learning_rate() -> f32 {
    5e-5
}

fn default_weight_decay() -> f32 {
    0.01
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-6
}

fn default_max_grad_norm() -> Option<f32> {
    Some(1.0)
}

fn default_weight_decay_exclude() -> Vec<String> {
    vec!["bias".to_string(), "layer_norm".to_string()]
}

fn default_warmup_rate() -> f64 {
    0.06
}

fn default_power() -> f32 {
    1.0
}

fn default_seed() -> u64 {
    42
}

fn default_device_selector() -> String {
    "auto".to_string()
}

fn default_log_every_n_steps() -> usize {
    10
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_true() -> bool {
    true
}

fn default_flush_every_n() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
mode = "pretraining"

[model]
vocab_size = 64
hidden_size = 16
max_length = 8

[data]
folds_dir = "folds"
validation_fold = 0
batch_size = 4

[scheduler]
lr_schedule = "cosine_decay"
total_steps = 100
"#;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn toml_config_applies_defaults_and_base_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::from_path(write(dir.path(), "run.toml", MINIMAL)).unwrap();

        assert_eq!(config.mode, TrainingMode::Pretraining);
        assert_eq!(config.loss.loss_strategy, LossStrategy::Supervised);
        assert_eq!(config.scheduler.lr_schedule, LearningRateSchedule::CosineDecay);
        assert_eq!(config.scheduler.warmup_rate, 0.06);
        assert_eq!(config.head.representation_size, 128);
        assert_eq!(config.data.folds_dir, dir.path().join("folds"));
        assert_eq!(config.runtime.checkpoint.directory, dir.path().join("checkpoints"));
        assert_eq!(config.runtime.device_selector, "auto");
        assert_eq!(config.optimizer.max_grad_norm, Some(1.0));
    }

    #[test]
    fn json_config_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{
            "mode": "fine_tuning",
            "model": {"vocab_size": 64, "hidden_size": 16, "max_length": 8},
            "head": {"classifier_head": "recurrent", "include_ancestor_representations": true},
            "data": {"folds_dir": "/data/folds"},
            "scheduler": {"epochs": 3, "lr_schedule": "polynomial_decay", "power": 2.0},
            "runtime": {"restore_checkpoint_selector": "latest"}
        }"#;
        let config = TrainingConfig::from_path(write(dir.path(), "run.json", json)).unwrap();
        assert_eq!(config.mode, TrainingMode::FineTuning);
        assert_eq!(config.head.classifier_head, ClassifierHeadKind::Recurrent);
        assert_eq!(
            config.runtime.restore_checkpoint_selector,
            Some(CheckpointSelector::Latest)
        );
        assert_eq!(config.data.folds_dir, PathBuf::from("/data/folds"));
    }

    #[test]
    fn validation_collects_every_problem() {
        let dir = tempfile::tempdir().unwrap();
        let broken = MINIMAL
            .replace("batch_size = 4", "batch_size = 1")
            .replace("total_steps = 100", "total_steps = 100\nepochs = 2\nwarmup_rate = 1.5");
        let err = TrainingConfig::from_path(write(dir.path(), "bad.toml", &broken)).unwrap_err();
        match err {
            TrainingError::Validation(messages) => {
                assert_eq!(messages.len(), 3, "{messages:?}");
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = TrainingConfig::from_path(write(dir.path(), "run.yaml", MINIMAL)).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigFormat(_)));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::from_path(write(dir.path(), "run.toml", MINIMAL)).unwrap();
        let mut changed = config.clone();
        changed.optimizer.learning_rate = 1e-3;
        assert_eq!(config.fingerprint().unwrap(), config.fingerprint().unwrap());
        assert_ne!(config.fingerprint().unwrap(), changed.fingerprint().unwrap());
    }
}
