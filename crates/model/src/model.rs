use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::{
    config::{ModelConfig, ModelKind},
    encoder::{EmbeddingEncoder, Encoder},
    head::{ClassifierHead, HeadOutput, RepresentationHead},
};

/// Variable-name prefix of every encoder parameter. Seeding a fine-tuning run
/// from a pretraining checkpoint copies exactly the tensors under it.
pub const ENCODER_PREFIX: &str = "encoder";
pub const HEAD_PREFIX: &str = "head";

pub enum Head {
    Representation(RepresentationHead),
    Classifier(ClassifierHead),
}

impl Head {
    pub fn forward(&self, hidden: &Tensor, mask: &Tensor) -> Result<HeadOutput> {
        match self {
            Head::Representation(head) => head.forward(hidden, mask),
            Head::Classifier(head) => head.forward(hidden, mask),
        }
    }
}

/// Encoder and head as separately owned components. Swapping the head never
/// touches encoder parameters.
pub struct ContrastiveModel {
    encoder: Box<dyn Encoder>,
    head: Head,
    kind: ModelKind,
}

impl ContrastiveModel {
    /// Build the reference encoder and the head for `kind`, registering
    /// parameters under `encoder.*` and `head.*` of `vb`.
    pub fn build(config: &ModelConfig, kind: ModelKind, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let encoder = EmbeddingEncoder::new(&config.encoder, vb.pp(ENCODER_PREFIX))?;
        Self::with_encoder(Box::new(encoder), config, kind, vb)
    }

    pub fn with_encoder(
        encoder: Box<dyn Encoder>,
        config: &ModelConfig,
        kind: ModelKind,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = encoder.hidden_size();
        let vb = vb.pp(HEAD_PREFIX);
        let head = match kind {
            ModelKind::Pretraining => Head::Representation(RepresentationHead::new(
                hidden,
                &config.head,
                config.depth(),
                vb,
            )?),
            ModelKind::FineTuning => Head::Classifier(ClassifierHead::new(
                hidden,
                &config.head,
                &config.level_sizes,
                vb,
            )?),
        };
        Ok(Self { encoder, head, kind })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn encoder(&self) -> &dyn Encoder {
        self.encoder.as_ref()
    }

    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<HeadOutput> {
        let hidden = self.encoder.encode(input_ids, attention_mask, train)?;
        self.head.forward(&hidden, attention_mask)
    }
}
