use candle_core::{Error, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};

use crate::config::EncoderConfig;

/// Backbone boundary: token ids and validity masks in, per-token hidden
/// states out.
///
/// `input_ids` is `u32 [batch, seq]`, `attention_mask` is `f32 [batch, seq]`
/// with ones on valid positions. The result is `[batch, seq, hidden_size]`.
pub trait Encoder: Send + Sync {
    fn hidden_size(&self) -> usize;

    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor>;
}

/// Small reference backbone: token and position embeddings followed by a
/// residual dense block. Stands in wherever a pretrained transformer would
/// be plugged.
pub struct EmbeddingEncoder {
    tokens: Embedding,
    positions: Embedding,
    embedding_norm: LayerNorm,
    dense: Linear,
    output_norm: LayerNorm,
    config: EncoderConfig,
}

impl EmbeddingEncoder {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            tokens: embedding(config.vocab_size, hidden, vb.pp("token_embeddings"))?,
            positions: embedding(config.max_length, hidden, vb.pp("position_embeddings"))?,
            embedding_norm: layer_norm(hidden, config.layer_norm_eps, vb.pp("embedding_layer_norm"))?,
            dense: linear(hidden, hidden, vb.pp("dense"))?,
            output_norm: layer_norm(hidden, config.layer_norm_eps, vb.pp("output_layer_norm"))?,
            config: config.clone(),
        })
    }
}

impl Encoder for EmbeddingEncoder {
    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch, seq) = input_ids.dims2()?;
        if seq > self.config.max_length {
            return Err(Error::Msg(format!(
                "sequence length {seq} exceeds max_length {}",
                self.config.max_length
            )));
        }

        let positions = Tensor::arange(0u32, seq as u32, input_ids.device())?;
        let embedded = self
            .tokens
            .forward(input_ids)?
            .broadcast_add(&self.positions.forward(&positions)?)?;
        let mut hidden = self.embedding_norm.forward(&embedded)?;
        if train && self.config.dropout > 0.0 {
            hidden = candle_nn::ops::dropout(&hidden, self.config.dropout)?;
        }

        let mixed = self.dense.forward(&hidden)?.tanh()?;
        let hidden = self.output_norm.forward(&(hidden + mixed)?)?;
        hidden.broadcast_mul(&attention_mask.unsqueeze(2)?)
    }
}
