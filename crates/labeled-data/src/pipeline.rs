use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{DataError, Result};
use crate::folds::{assign_folds, FoldAssignment};
use crate::hierarchy::LabelHierarchy;
use crate::preprocessing::TokenEncoder;
use crate::records::ExampleRecord;
use crate::workers::tokenize_parallel;

/// Untokenized input: a sentence and the name of its leaf label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExample {
    pub text: String,
    pub label: String,
}

/// Tokenized example with its resolved label path. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    /// Position of the example in the raw input.
    pub id: u64,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Root-to-leaf label ids.
    pub labels: Vec<u32>,
}

impl Example {
    pub fn leaf(&self) -> u32 {
        self.labels.last().copied().unwrap_or(0)
    }

    pub fn to_record(&self) -> ExampleRecord {
        ExampleRecord {
            example_id: self.id,
            input_ids: self.input_ids.clone(),
            attention_mask: self.attention_mask.clone(),
            labels: self.labels.clone(),
        }
    }

    pub fn from_record(record: ExampleRecord) -> Result<Self> {
        if record.input_ids.len() != record.attention_mask.len() {
            return Err(DataError::Record(format!(
                "example {} has {} ids but {} mask entries",
                record.example_id,
                record.input_ids.len(),
                record.attention_mask.len()
            )));
        }
        if record.labels.is_empty() {
            return Err(DataError::Record(format!(
                "example {} has no labels",
                record.example_id
            )));
        }
        Ok(Self {
            id: record.example_id,
            input_ids: record.input_ids,
            attention_mask: record.attention_mask,
            labels: record.labels,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropSummary {
    pub tokenization: usize,
    pub unknown_label: usize,
    /// Raw input positions of every dropped example.
    pub positions: Vec<usize>,
}

impl DropSummary {
    pub fn total(&self) -> usize {
        self.tokenization + self.unknown_label
    }

    fn record(&mut self, err: &DataError) {
        match err {
            DataError::Tokenization { index, .. } => {
                self.tokenization += 1;
                self.positions.push(*index);
            }
            DataError::UnknownLabel { index, .. } => {
                self.unknown_label += 1;
                self.positions.push(*index);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct FoldBuild {
    pub folds: Vec<Vec<Example>>,
    pub test: Option<Vec<Example>>,
    pub dropped: DropSummary,
    pub seed: u64,
    pub test_rate: f64,
}

impl FoldBuild {
    pub fn example_count(&self) -> usize {
        self.folds.iter().map(Vec::len).sum::<usize>()
            + self.test.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Per-leaf example counts across all partitions.
    pub fn label_histogram(&self) -> BTreeMap<u32, usize> {
        let mut histogram = BTreeMap::new();
        let all = self.folds.iter().flatten().chain(self.test.iter().flatten());
        for example in all {
            *histogram.entry(example.leaf()).or_insert(0) += 1;
        }
        histogram
    }
}

/// Tokenizes raw examples and assigns them to stratified partitions.
pub struct FoldPipeline {
    encoder: Arc<dyn TokenEncoder>,
    hierarchy: Arc<LabelHierarchy>,
    max_length: usize,
    workers: usize,
}

impl FoldPipeline {
    pub fn new(
        encoder: Arc<dyn TokenEncoder>,
        hierarchy: Arc<LabelHierarchy>,
        max_length: usize,
        workers: usize,
    ) -> Self {
        Self {
            encoder,
            hierarchy,
            max_length,
            workers: workers.max(1),
        }
    }

    pub fn hierarchy(&self) -> &LabelHierarchy {
        &self.hierarchy
    }

    /// Build K stratified folds (and a test partition when `test_rate > 0`).
    ///
    /// Examples whose text cannot be tokenized or whose label is not in the
    /// hierarchy are dropped and counted in [`FoldBuild::dropped`]. The result
    /// depends only on the input, `k`, `test_rate` and `seed`.
    pub fn build(
        &self,
        raw: &[RawExample],
        k: usize,
        test_rate: f64,
        seed: u64,
    ) -> Result<FoldBuild> {
        let texts: Vec<String> = raw.iter().map(|example| example.text.clone()).collect();
        let tokenized = tokenize_parallel(self.encoder.as_ref(), &texts, self.max_length, self.workers)?;

        let mut dropped = DropSummary::default();
        let mut examples = Vec::with_capacity(raw.len());
        for (index, (example, tokens)) in raw.iter().zip(tokenized).enumerate() {
            let resolved = tokens.and_then(|tokens| {
                let leaf = self.hierarchy.leaf_id(&example.label).ok_or_else(|| {
                    DataError::UnknownLabel {
                        index,
                        label: example.label.clone(),
                    }
                })?;
                let labels = self
                    .hierarchy
                    .path(leaf)
                    .map(<[u32]>::to_vec)
                    .unwrap_or_else(|| vec![leaf]);
                Ok(Example {
                    id: index as u64,
                    input_ids: tokens.input_ids,
                    attention_mask: tokens.attention_mask,
                    labels,
                })
            });
            match resolved {
                Ok(example) => examples.push(example),
                Err(err) if err.is_recoverable() => {
                    tracing::debug!(error = %err, "dropping example");
                    dropped.record(&err);
                }
                Err(err) => return Err(err),
            }
        }

        if dropped.total() > 0 {
            tracing::warn!(
                tokenization = dropped.tokenization,
                unknown_label = dropped.unknown_label,
                "dropped examples during fold build"
            );
        }

        let leaves: Vec<u32> = examples.iter().map(Example::leaf).collect();
        let assignment = assign_folds(&leaves, k, test_rate, seed)?;
        let build = materialize(examples, &assignment, test_rate > 0.0, seed, test_rate);
        tracing::info!(
            examples = build.example_count(),
            folds = build.folds.len(),
            test = build.test.as_ref().map(Vec::len).unwrap_or(0),
            "fold build complete"
        );
        Ok(FoldBuild { dropped, ..build })
    }
}

fn materialize(
    examples: Vec<Example>,
    assignment: &FoldAssignment,
    with_test: bool,
    seed: u64,
    test_rate: f64,
) -> FoldBuild {
    let pick = |positions: &[usize]| -> Vec<Example> {
        positions.iter().map(|p| examples[*p].clone()).collect()
    };
    FoldBuild {
        folds: assignment.folds.iter().map(|fold| pick(fold)).collect(),
        test: with_test.then(|| pick(&assignment.test)),
        dropped: DropSummary::default(),
        seed,
        test_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::HashedWordEncoder;
    use std::collections::HashSet;

    fn pipeline() -> FoldPipeline {
        let hierarchy = LabelHierarchy::from_paths(vec![
            vec!["background", "objective"],
            vec!["background", "motivation"],
            vec!["method", "design"],
        ])
        .unwrap();
        FoldPipeline::new(
            Arc::new(HashedWordEncoder::new(256)),
            Arc::new(hierarchy),
            12,
            3,
        )
    }

    fn corpus() -> Vec<RawExample> {
        let labels = ["objective", "motivation", "design"];
        (0..30)
            .map(|i| RawExample {
                text: format!("sentence {i} about {}", labels[i % 3]),
                label: labels[i % 3].to_string(),
            })
            .collect()
    }

    #[test]
    fn empty_text_is_dropped_and_counted() {
        let mut raw = corpus();
        raw[4].text = "  \t  ".into();
        let build = pipeline().build(&raw, 3, 0.0, 1).unwrap();

        assert_eq!(build.dropped.tokenization, 1);
        assert_eq!(build.dropped.positions, vec![4]);
        assert_eq!(build.example_count(), raw.len() - 1);
        assert!(build.folds.iter().flatten().all(|example| example.id != 4));
    }

    #[test]
    fn unknown_labels_are_dropped() {
        let mut raw = corpus();
        raw[0].label = "results".into();
        let build = pipeline().build(&raw, 3, 0.0, 1).unwrap();
        assert_eq!(build.dropped.unknown_label, 1);
        assert_eq!(build.example_count(), raw.len() - 1);
    }

    #[test]
    fn examples_carry_ancestor_paths() {
        let build = pipeline().build(&corpus(), 3, 0.2, 5).unwrap();
        let test = build.test.as_ref().unwrap();
        assert_eq!(test.len(), 6);

        for example in build.folds.iter().flatten().chain(test.iter()) {
            assert_eq!(example.labels.len(), 2);
            assert_eq!(example.input_ids.len(), 12);
            let expected_root = if example.leaf() == 2 { 1 } else { 0 };
            assert_eq!(example.labels[0], expected_root);
        }

        let ids: HashSet<u64> = build
            .folds
            .iter()
            .flatten()
            .chain(test.iter())
            .map(|example| example.id)
            .collect();
        assert_eq!(ids.len(), 30);
    }

    #[test]
    fn build_is_deterministic() {
        let raw = corpus();
        let a = pipeline().build(&raw, 3, 0.1, 9).unwrap();
        let b = pipeline().build(&raw, 3, 0.1, 9).unwrap();
        assert_eq!(a.folds, b.folds);
        assert_eq!(a.test, b.test);
    }
}
