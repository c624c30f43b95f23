use candle_core::{DType, Tensor, Var, D};

use super::BatchLabels;
use crate::{config::LossConfig, config::LossStrategy, TrainingError};

/// Pushes masked-out pairs out of every row maximum and log-sum-exp.
const MASK_PENALTY: f64 = 1e9;
const NORM_EPS: f64 = 1e-12;

/// Contrastive objective over a batch of representation vectors.
///
/// All strategies work on cosine similarity of L2-normalized vectors and
/// return a scalar that is zero whenever the batch holds fewer than two
/// distinct (leaf) labels.
#[derive(Debug, Clone, PartialEq)]
pub enum ContrastiveLoss {
    /// `mean_neg(max(0, sim - m)) + mean_pos(1 - sim)`.
    Margin { margin: f32 },
    /// Supervised-contrastive loss on the leaf labels.
    Supervised { temperature: f32 },
    /// Weighted sum of supervised terms, one per hierarchy level with that
    /// level's positive sets. Weights are root first and sum to one.
    Hierarchical { temperature: f32, level_weights: Vec<f32> },
}

impl ContrastiveLoss {
    pub fn from_config(config: &LossConfig, depth: usize) -> Result<Self, TrainingError> {
        match config.loss_strategy {
            LossStrategy::Margin => Ok(Self::Margin {
                margin: config.margin,
            }),
            LossStrategy::Supervised => Ok(Self::Supervised {
                temperature: config.temperature,
            }),
            LossStrategy::Hierarchical => {
                let level_weights = match &config.level_weights {
                    Some(weights) => normalize_weights(weights)?,
                    None => depth_proportional_weights(depth),
                };
                if level_weights.len() != depth {
                    return Err(TrainingError::initialization(format!(
                        "loss.level_weights has {} entries but the label hierarchy has depth {}",
                        level_weights.len(),
                        depth
                    )));
                }
                Ok(Self::Hierarchical {
                    temperature: config.temperature,
                    level_weights,
                })
            }
        }
    }

    /// The same loss applied to labels truncated to their first `depth`
    /// levels. Hierarchical weights are cut to those levels and renormalized.
    pub fn truncated(&self, depth: usize) -> Self {
        match self {
            Self::Hierarchical {
                temperature,
                level_weights,
            } if depth < level_weights.len() => {
                let kept = &level_weights[..depth.max(1)];
                let sum: f32 = kept.iter().sum();
                let level_weights = if sum > 0.0 {
                    kept.iter().map(|w| w / sum).collect()
                } else {
                    depth_proportional_weights(kept.len())
                };
                Self::Hierarchical {
                    temperature: *temperature,
                    level_weights,
                }
            }
            other => other.clone(),
        }
    }

    /// Scalar loss for `representations` (`[batch, dim]`).
    pub fn compute(&self, representations: &Tensor, labels: &BatchLabels) -> Result<Tensor, TrainingError> {
        let (batch, _) = representations.dims2()?;
        if batch != labels.len() {
            return Err(TrainingError::runtime(format!(
                "{} representations but {} labels",
                batch,
                labels.len()
            )));
        }
        if distinct(labels.leaf()) < 2 {
            return zero_like_graph(representations);
        }

        let similarity = cosine_similarity(representations)?;
        match self {
            Self::Margin { margin } => margin_loss(&similarity, labels.leaf(), *margin),
            Self::Supervised { temperature } => {
                supervised_loss(&similarity, labels.leaf(), *temperature)
            }
            Self::Hierarchical {
                temperature,
                level_weights,
            } => {
                if level_weights.len() != labels.depth() {
                    return Err(TrainingError::runtime(format!(
                        "hierarchical loss configured for depth {} but labels have depth {}",
                        level_weights.len(),
                        labels.depth()
                    )));
                }
                let mut total = zero_like_graph(representations)?;
                for (level, weight) in level_weights.iter().enumerate() {
                    if *weight == 0.0 {
                        continue;
                    }
                    let term = supervised_loss(&similarity, labels.level(level), *temperature)?;
                    total = (total + term.affine(f64::from(*weight), 0.0)?)?;
                }
                Ok(total)
            }
        }
    }

    /// Loss value together with its gradient with respect to each
    /// representation vector.
    pub fn value_and_gradient(
        &self,
        representations: &Tensor,
        labels: &BatchLabels,
    ) -> Result<(f32, Tensor), TrainingError> {
        let input = Var::from_tensor(&representations.detach())?;
        let loss = self.compute(input.as_tensor(), labels)?;
        let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        let grads = loss.backward()?;
        let gradient = match grads.get(input.as_tensor()) {
            Some(grad) => grad.clone(),
            None => input.as_tensor().zeros_like()?,
        };
        Ok((value, gradient))
    }
}

fn normalize_weights(weights: &[f32]) -> Result<Vec<f32>, TrainingError> {
    let sum: f32 = weights.iter().sum();
    if weights.is_empty() || sum <= 0.0 || weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(TrainingError::initialization(
            "hierarchical level weights must be non-negative with a positive sum",
        ));
    }
    Ok(weights.iter().map(|w| w / sum).collect())
}

/// `w_l ∝ l + 1`, so the leaf level carries the most weight.
pub fn depth_proportional_weights(depth: usize) -> Vec<f32> {
    let total = (depth * (depth + 1) / 2).max(1) as f32;
    (1..=depth).map(|level| level as f32 / total).collect()
}

fn distinct(labels: &[u32]) -> usize {
    let mut seen: Vec<u32> = labels.to_vec();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

/// Zero scalar that stays attached to the graph, so backward still yields a
/// (zero) gradient for every upstream parameter.
fn zero_like_graph(representations: &Tensor) -> Result<Tensor, TrainingError> {
    Ok(representations.sum_all()?.affine(0.0, 0.0)?)
}

pub(crate) fn l2_normalize(x: &Tensor) -> candle_core::Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.affine(1.0, NORM_EPS)?.sqrt()?;
    x.broadcast_div(&norm)
}

pub(crate) fn cosine_similarity(x: &Tensor) -> candle_core::Result<Tensor> {
    let z = l2_normalize(x)?;
    z.matmul(&z.t()?)
}

struct PairMasks {
    positive: Vec<f32>,
    negative: Vec<f32>,
    positives: usize,
    negatives: usize,
}

fn pair_masks(labels: &[u32]) -> PairMasks {
    let n = labels.len();
    let mut masks = PairMasks {
        positive: vec![0.0; n * n],
        negative: vec![0.0; n * n],
        positives: 0,
        negatives: 0,
    };
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if labels[i] == labels[j] {
                masks.positive[i * n + j] = 1.0;
                masks.positives += 1;
            } else {
                masks.negative[i * n + j] = 1.0;
                masks.negatives += 1;
            }
        }
    }
    masks
}

fn margin_loss(similarity: &Tensor, labels: &[u32], margin: f32) -> Result<Tensor, TrainingError> {
    let n = labels.len();
    let device = similarity.device();
    let masks = pair_masks(labels);

    let negative = Tensor::from_vec(masks.negative, (n, n), device)?;
    let negative_term = similarity
        .affine(1.0, -f64::from(margin))?
        .relu()?
        .mul(&negative)?
        .sum_all()?
        .affine(1.0 / masks.negatives.max(1) as f64, 0.0)?;

    if masks.positives == 0 {
        return Ok(negative_term);
    }
    let positive = Tensor::from_vec(masks.positive, (n, n), device)?;
    let positive_term = similarity
        .affine(-1.0, 1.0)?
        .mul(&positive)?
        .sum_all()?
        .affine(1.0 / masks.positives as f64, 0.0)?;
    Ok((negative_term + positive_term)?)
}

/// `loss_i = log Σ_{a≠i} exp(s_ia/T) - log Σ_{p∈P(i)} exp(s_ip/T)`, averaged
/// over anchors with at least one positive. Both sums are taken as
/// log-sum-exp, each shifted by its own (detached) row maximum.
fn supervised_loss(similarity: &Tensor, labels: &[u32], temperature: f32) -> Result<Tensor, TrainingError> {
    let n = labels.len();
    let device = similarity.device();
    let masks = pair_masks(labels);

    let has_positive: Vec<f32> = masks
        .positive
        .chunks(n)
        .map(|row| if row.iter().any(|v| *v > 0.0) { 1.0 } else { 0.0 })
        .collect();
    let anchors = has_positive.iter().filter(|v| **v > 0.0).count();
    if anchors == 0 {
        return zero_like_graph(similarity);
    }

    let mut diagonal = vec![0f32; n * n];
    for i in 0..n {
        diagonal[i * n + i] = 1.0;
    }
    let diagonal = Tensor::from_vec(diagonal, (n, n), device)?;
    let positive = Tensor::from_vec(masks.positive, (n, n), device)?;
    let has_positive = Tensor::from_vec(has_positive, n, device)?;

    let logits = similarity
        .affine(1.0 / f64::from(temperature), 0.0)?
        .sub(&diagonal.affine(MASK_PENALTY, 0.0)?)?;
    let log_denominator = row_log_sum_exp(&logits)?;
    // Non-positives sit MASK_PENALTY below their logit; positives are untouched.
    let positive_logits = logits.add(&positive.affine(MASK_PENALTY, -MASK_PENALTY)?)?;
    let log_numerator = row_log_sum_exp(&positive_logits)?;
    let per_anchor = (log_denominator - log_numerator)?.squeeze(1)?;

    Ok(per_anchor
        .mul(&has_positive)?
        .sum_all()?
        .affine(1.0 / anchors as f64, 0.0)?)
}

/// Row-wise `log Σ exp(x)` as `[n, 1]`, stable for any spread of values.
fn row_log_sum_exp(logits: &Tensor) -> candle_core::Result<Tensor> {
    let row_max = logits.max_keepdim(D::Minus1)?.detach();
    logits
        .broadcast_sub(&row_max)?
        .exp()?
        .sum_keepdim(D::Minus1)?
        .log()?
        .add(&row_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(rows: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 2), &Device::Cpu).unwrap()
    }

    fn leaf_labels(labels: &[u32]) -> BatchLabels {
        BatchLabels::new(vec![labels.to_vec()]).unwrap()
    }

    fn scalar(loss: &ContrastiveLoss, x: &Tensor, labels: &BatchLabels) -> f32 {
        loss.compute(x, labels).unwrap().to_scalar::<f32>().unwrap()
    }

    /// Supervised-contrastive reference on host vectors.
    fn reference_supervised(rows: &[[f32; 2]], labels: &[u32], t: f64) -> f64 {
        let unit: Vec<[f64; 2]> = rows
            .iter()
            .map(|r| {
                let norm = ((r[0] * r[0] + r[1] * r[1]) as f64).sqrt();
                [r[0] as f64 / norm, r[1] as f64 / norm]
            })
            .collect();
        let sim = |i: usize, j: usize| unit[i][0] * unit[j][0] + unit[i][1] * unit[j][1];
        let mut total = 0.0;
        let mut anchors = 0;
        for i in 0..rows.len() {
            let positives: Vec<usize> = (0..rows.len())
                .filter(|j| *j != i && labels[*j] == labels[i])
                .collect();
            if positives.is_empty() {
                continue;
            }
            let den: f64 = (0..rows.len()).filter(|a| *a != i).map(|a| (sim(i, a) / t).exp()).sum();
            let num: f64 = positives.iter().map(|p| (sim(i, *p) / t).exp()).sum();
            total += -(num / den).ln();
            anchors += 1;
        }
        total / anchors as f64
    }

    #[test]
    fn margin_is_zero_for_separated_orthogonal_pairs() {
        let x = tensor(&[[1.0, 0.0], [2.0, 0.0], [0.0, 1.0], [0.0, 3.0]]);
        let loss = ContrastiveLoss::Margin { margin: 0.2 };
        let value = scalar(&loss, &x, &leaf_labels(&[0, 0, 1, 1]));
        assert!(value.abs() < 1e-6, "margin loss {value}");
    }

    #[test]
    fn margin_is_non_negative() {
        let x = tensor(&[[0.3, -1.2], [0.9, 0.4], [-0.5, -0.5], [1.0, 1.0], [0.2, 0.1]]);
        let loss = ContrastiveLoss::Margin { margin: 0.1 };
        for labels in [[0, 1, 0, 1, 2], [0, 0, 0, 1, 1], [3, 1, 2, 1, 3]] {
            assert!(scalar(&loss, &x, &leaf_labels(&labels)) >= 0.0);
        }
    }

    #[test]
    fn supervised_matches_reference_and_skips_anchors_without_positives() {
        let rows = [[1.0, 0.2], [0.8, 0.5], [-0.3, 1.0], [0.1, -0.9]];
        // Anchors 2 and 3 have no positive and must not enter the mean.
        let labels = [0, 0, 1, 2];
        let x = tensor(&rows);
        let loss = ContrastiveLoss::Supervised { temperature: 0.5 };
        let value = scalar(&loss, &x, &leaf_labels(&labels)) as f64;
        let expected = reference_supervised(&rows, &labels, 0.5);
        assert!((value - expected).abs() < 1e-4, "{value} vs {expected}");
    }

    #[test]
    fn fewer_than_two_labels_gives_zero() {
        let x = tensor(&[[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]]);
        for loss in [
            ContrastiveLoss::Margin { margin: 0.2 },
            ContrastiveLoss::Supervised { temperature: 0.1 },
        ] {
            assert_eq!(scalar(&loss, &x, &leaf_labels(&[4, 4, 4])), 0.0);
        }
    }

    #[test]
    fn hierarchical_with_single_level_equals_supervised() {
        let x = tensor(&[[1.0, 0.1], [0.7, 0.7], [-0.2, 1.0], [0.4, -0.6], [0.9, 0.0]]);
        let labels = leaf_labels(&[0, 1, 1, 2, 0]);
        let supervised = ContrastiveLoss::Supervised { temperature: 0.2 };
        let hierarchical = ContrastiveLoss::Hierarchical {
            temperature: 0.2,
            level_weights: vec![1.0],
        };
        assert_eq!(scalar(&supervised, &x, &labels), scalar(&hierarchical, &x, &labels));
    }

    #[test]
    fn hierarchical_weights_levels() {
        let x = tensor(&[[1.0, 0.1], [0.7, 0.7], [-0.2, 1.0], [0.4, -0.6]]);
        let labels = BatchLabels::new(vec![vec![0, 0, 1, 1], vec![0, 1, 2, 3]]).unwrap();
        let loss = ContrastiveLoss::Hierarchical {
            temperature: 0.3,
            level_weights: depth_proportional_weights(2),
        };
        let root = ContrastiveLoss::Supervised { temperature: 0.3 };
        let root_value = scalar(&root, &x, &leaf_labels(&[0, 0, 1, 1]));
        // Every leaf is unique, so the leaf term has no anchors and only the
        // root term (weight 1/3) remains.
        let value = scalar(&loss, &x, &labels);
        assert!((value - root_value / 3.0).abs() < 1e-5);
    }

    #[test]
    fn default_weights_favor_deeper_levels() {
        let weights = depth_proportional_weights(3);
        assert!(weights[0] < weights[1] && weights[1] < weights[2]);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gradients_stay_finite_for_degenerate_batches() {
        let x = tensor(&[[1.0, 0.0], [1.0, 0.0], [-1.0, 0.0], [0.0, 1.0]]);
        let loss = ContrastiveLoss::Supervised { temperature: 0.01 };
        let (value, gradient) = loss
            .value_and_gradient(&x, &leaf_labels(&[0, 1, 2, 0]))
            .unwrap();
        assert!(value.is_finite());
        assert_eq!(gradient.dims(), &[4, 2]);
        let grads = gradient.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(grads.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn supervised_keeps_far_positives_at_low_temperature() {
        // Anchor 0's only positive is its opposite while its negative is
        // identical, so the positive logit sits 200 below the row maximum.
        let rows = [[1.0, 0.0], [-1.0, 0.0], [1.0, 0.0]];
        let labels = [0, 0, 1];
        let loss = ContrastiveLoss::Supervised { temperature: 0.01 };
        let value = scalar(&loss, &tensor(&rows), &leaf_labels(&labels)) as f64;
        let expected = reference_supervised(&rows, &labels, 0.01);
        assert!((expected - (200.0 + 2f64.ln()) / 2.0).abs() < 1e-6);
        assert!((value - expected).abs() < 0.1, "{value} vs {expected}");
    }

    #[test]
    fn supervised_gradient_flows_through_far_positives() {
        let rows = [[1.0, 0.0], [-1.0, 0.1], [1.0, 0.05]];
        let labels = [0, 0, 1];
        let t = 0.01;
        let loss = ContrastiveLoss::Supervised { temperature: t as f32 };
        let (_, gradient) = loss
            .value_and_gradient(&tensor(&rows), &leaf_labels(&labels))
            .unwrap();
        let analytic = gradient.to_vec2::<f32>().unwrap()[1][1] as f64;

        let eps = 1e-3f32;
        let mut plus = rows;
        plus[1][1] += eps;
        let mut minus = rows;
        minus[1][1] -= eps;
        let numeric = (reference_supervised(&plus, &labels, t) - reference_supervised(&minus, &labels, t))
            / (plus[1][1] as f64 - minus[1][1] as f64);
        assert!(numeric.abs() > 1.0, "{numeric}");
        assert!(
            (analytic - numeric).abs() < 0.05 * numeric.abs(),
            "{analytic} vs {numeric}"
        );
    }

    #[test]
    fn hierarchical_requires_matching_weight_count() {
        let config = LossConfig {
            loss_strategy: LossStrategy::Hierarchical,
            level_weights: Some(vec![1.0, 2.0, 3.0]),
            ..LossConfig::default()
        };
        assert!(ContrastiveLoss::from_config(&config, 2).is_err());
        let config = LossConfig {
            level_weights: Some(vec![1.0, 3.0]),
            ..config
        };
        match ContrastiveLoss::from_config(&config, 2).unwrap() {
            ContrastiveLoss::Hierarchical { level_weights, .. } => {
                assert_eq!(level_weights, vec![0.25, 0.75]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
