use candle_core::{Error, Result, Tensor, D};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::{ClassifierHeadKind, HeadConfig};

/// Mean of the valid token states. `hidden` is `[batch, seq, h]`, `mask` is
/// `[batch, seq]`.
pub fn masked_mean_pool(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let summed = hidden.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
    let counts = mask.sum_keepdim(1)?.clamp(1.0, f64::MAX)?;
    summed.broadcast_div(&counts)
}

/// State of the last valid position in each row of `states` (`[batch, seq, h]`).
pub fn last_valid_state(states: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch, seq) = mask.dims2()?;
    let lengths = mask.sum(1)?.to_vec1::<f32>()?;
    let mut selector = vec![0f32; batch * seq];
    for (row, length) in lengths.iter().enumerate() {
        let last = (length.round() as usize).clamp(1, seq) - 1;
        selector[row * seq + last] = 1.0;
    }
    let selector = Tensor::from_vec(selector, (batch, seq, 1), states.device())?;
    states.broadcast_mul(&selector)?.sum(1)
}

#[derive(Debug, Clone)]
pub struct HeadOutput {
    /// One representation per emitted level, root first. A single entry
    /// when ancestor representations are disabled.
    pub representations: Vec<Tensor>,
    /// Logits aligned with `representations`; empty for the pretraining head.
    pub logits: Vec<Tensor>,
    /// Hierarchy level of each entry.
    pub levels: Vec<usize>,
}

fn project(projection: &Linear, pooled: &Tensor, pre_activation: bool) -> Result<(Tensor, Tensor)> {
    let pre = projection.forward(pooled)?;
    let activated = pre.tanh()?;
    let representation = if pre_activation { pre } else { activated.clone() };
    Ok((representation, activated))
}

/// Pretraining head: pooled encoder output projected to the representation
/// space.
pub struct RepresentationHead {
    projection: Linear,
    pre_activation: bool,
    leaf_level: usize,
}

impl RepresentationHead {
    pub fn new(hidden_size: usize, config: &HeadConfig, depth: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            projection: linear(hidden_size, config.representation_size, vb.pp("projection"))?,
            pre_activation: config.pre_activation,
            leaf_level: depth.saturating_sub(1),
        })
    }

    pub fn forward(&self, hidden: &Tensor, mask: &Tensor) -> Result<HeadOutput> {
        let pooled = masked_mean_pool(hidden, mask)?;
        let (representation, _) = project(&self.projection, &pooled, self.pre_activation)?;
        Ok(HeadOutput {
            representations: vec![representation],
            logits: Vec::new(),
            levels: vec![self.leaf_level],
        })
    }
}

struct LevelHead {
    level: usize,
    projection: Linear,
    classifier: Linear,
}

/// Fine-tuning head.
///
/// The pooled sentence vector comes from a masked mean (`direct`) or from the
/// final valid state of an LSTM over the token states (`recurrent`). Each
/// emitted level projects the pooled vector to its own representation; the
/// classifier for level `l` reads the activated representations of levels
/// `0..=l` concatenated, so a leaf prediction sees its ancestors.
pub struct ClassifierHead {
    recurrent: Option<LSTM>,
    levels: Vec<LevelHead>,
    pre_activation: bool,
}

impl ClassifierHead {
    pub fn new(
        hidden_size: usize,
        config: &HeadConfig,
        level_sizes: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let depth = level_sizes.len();
        if depth == 0 {
            return Err(Error::Msg("classifier head needs at least one label level".into()));
        }

        let recurrent = match config.classifier_head {
            ClassifierHeadKind::Direct => None,
            ClassifierHeadKind::Recurrent => Some(lstm(
                hidden_size,
                hidden_size,
                LSTMConfig::default(),
                vb.pp("recurrent"),
            )?),
        };

        let emitted: Vec<usize> = if config.include_ancestor_representations {
            (0..depth).collect()
        } else {
            vec![depth - 1]
        };

        let size = config.representation_size;
        let mut levels = Vec::with_capacity(emitted.len());
        for (position, level) in emitted.into_iter().enumerate() {
            let vb = vb.pp(format!("level_{level}"));
            levels.push(LevelHead {
                level,
                projection: linear(hidden_size, size, vb.pp("projection"))?,
                classifier: linear(size * (position + 1), level_sizes[level], vb.pp("classifier"))?,
            });
        }

        Ok(Self {
            recurrent,
            levels,
            pre_activation: config.pre_activation,
        })
    }

    pub fn forward(&self, hidden: &Tensor, mask: &Tensor) -> Result<HeadOutput> {
        let pooled = match &self.recurrent {
            Some(recurrent) => {
                let states = recurrent.seq(hidden)?;
                let states = recurrent.states_to_tensor(&states)?;
                last_valid_state(&states, mask)?
            }
            None => masked_mean_pool(hidden, mask)?,
        };

        let mut representations = Vec::with_capacity(self.levels.len());
        let mut logits = Vec::with_capacity(self.levels.len());
        let mut context: Vec<Tensor> = Vec::with_capacity(self.levels.len());
        for head in &self.levels {
            let (representation, activated) = project(&head.projection, &pooled, self.pre_activation)?;
            context.push(activated);
            let features = Tensor::cat(&context, D::Minus1)?;
            logits.push(head.classifier.forward(&features)?);
            representations.push(representation);
        }

        Ok(HeadOutput {
            representations,
            logits,
            levels: self.levels.iter().map(|head| head.level).collect(),
        })
    }
}
