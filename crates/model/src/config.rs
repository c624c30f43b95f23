use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration of the reference embedding encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub max_length: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub dropout: f32,
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierHeadKind {
    #[default]
    Direct,
    Recurrent,
}

/// Which head is attached on top of the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Representation projection only; used with a contrastive loss.
    Pretraining,
    /// Per-level projections and classifiers.
    FineTuning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    pub representation_size: usize,
    #[serde(default)]
    pub classifier_head: ClassifierHeadKind,
    #[serde(default)]
    pub include_ancestor_representations: bool,
    /// Expose the projection before its activation as the representation.
    #[serde(default)]
    pub pre_activation: bool,
}

/// Encoder plus head, with the number of labels at each hierarchy level
/// (root first).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub encoder: EncoderConfig,
    pub head: HeadConfig,
    pub level_sizes: Vec<usize>,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        let encoder = &self.encoder;
        if encoder.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if encoder.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if encoder.max_length == 0 {
            return Err(Error::Msg("max_length must be greater than zero".into()));
        }
        if !(0.0..1.0).contains(&encoder.dropout) {
            return Err(Error::Msg("dropout must be in [0, 1)".into()));
        }
        if self.head.representation_size == 0 {
            return Err(Error::Msg(
                "representation_size must be greater than zero".into(),
            ));
        }
        if self.level_sizes.is_empty() {
            return Err(Error::Msg("label hierarchy must have at least one level".into()));
        }
        if let Some(level) = self.level_sizes.iter().position(|size| *size < 2) {
            return Err(Error::Msg(format!(
                "hierarchy level {level} needs at least two labels, got {}",
                self.level_sizes[level]
            )));
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.level_sizes.len()
    }
}
