use std::collections::BTreeMap;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::errors::{integrity, DataError, Result};

/// Where an example ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionId {
    Fold(usize),
    Test,
}

/// Stratified assignment of example positions to K folds plus an optional
/// held-out test partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    pub folds: Vec<Vec<usize>>,
    pub test: Vec<usize>,
}

impl FoldAssignment {
    /// Check that every position in `0..total` appears in exactly one
    /// partition.
    pub fn verify(&self, total: usize) -> Result<()> {
        let mut seen = vec![None::<PartitionId>; total];
        let partitions = self
            .folds
            .iter()
            .enumerate()
            .map(|(fold, members)| (PartitionId::Fold(fold), members))
            .chain(std::iter::once((PartitionId::Test, &self.test)));

        for (partition, members) in partitions {
            for &position in members {
                let slot = seen.get_mut(position).ok_or_else(|| {
                    integrity(format!(
                        "{partition:?} references position {position} outside 0..{total}"
                    ))
                })?;
                if let Some(previous) = slot.replace(partition) {
                    return Err(integrity(format!(
                        "position {position} assigned to both {previous:?} and {partition:?}"
                    )));
                }
            }
        }

        if let Some(missing) = seen.iter().position(Option::is_none) {
            return Err(integrity(format!(
                "position {missing} was not assigned to any partition"
            )));
        }
        Ok(())
    }

    pub fn partition_of(&self, position: usize) -> Option<PartitionId> {
        if self.test.contains(&position) {
            return Some(PartitionId::Test);
        }
        self.folds
            .iter()
            .position(|members| members.contains(&position))
            .map(PartitionId::Fold)
    }
}

/// Stratified K-fold assignment by leaf label.
///
/// Positions are grouped by label and each group is shuffled with a generator
/// seeded from `seed`. When `test_rate > 0` the first `round(len * test_rate)`
/// members of each group go to the test partition. The rest are dealt
/// round-robin over the K folds, with the dealing offset carried across groups
/// so fold sizes differ by at most one.
pub fn assign_folds(
    leaf_labels: &[u32],
    k: usize,
    test_rate: f64,
    seed: u64,
) -> Result<FoldAssignment> {
    if k < 2 {
        return Err(DataError::InvalidConfig(format!(
            "k_folds must be at least 2, got {k}"
        )));
    }
    if !(0.0..1.0).contains(&test_rate) {
        return Err(DataError::InvalidConfig(format!(
            "test_rate must be in [0, 1), got {test_rate}"
        )));
    }

    let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (position, label) in leaf_labels.iter().enumerate() {
        groups.entry(*label).or_default().push(position);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k];
    let mut test = Vec::new();
    let mut cursor = 0usize;

    for (label, mut members) in groups {
        members.shuffle(&mut rng);
        let held_out = if test_rate > 0.0 {
            ((members.len() as f64) * test_rate).round() as usize
        } else {
            0
        };
        let (held, rest) = members.split_at(held_out.min(members.len()));
        test.extend_from_slice(held);
        for &position in rest {
            folds[cursor % k].push(position);
            cursor += 1;
        }
        if rest.len() < k {
            tracing::warn!(
                label,
                members = rest.len(),
                k,
                "label has fewer examples than folds"
            );
        }
    }

    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    test.sort_unstable();

    let assignment = FoldAssignment { folds, test };
    assignment.verify(leaf_labels.len())?;
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<u32> {
        (0..103).map(|i| (i % 4) as u32).collect()
    }

    #[test]
    fn partitions_are_disjoint_and_complete() {
        let labels = labels();
        let assignment = assign_folds(&labels, 5, 0.1, 42).unwrap();
        let total: usize =
            assignment.folds.iter().map(Vec::len).sum::<usize>() + assignment.test.len();
        assert_eq!(total, labels.len());
        assignment.verify(labels.len()).unwrap();
    }

    #[test]
    fn same_seed_reproduces_assignment() {
        let labels = labels();
        let a = assign_folds(&labels, 4, 0.2, 7).unwrap();
        let b = assign_folds(&labels, 4, 0.2, 7).unwrap();
        let c = assign_folds(&labels, 4, 0.2, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn folds_are_stratified_and_balanced() {
        let labels = labels();
        let assignment = assign_folds(&labels, 5, 0.0, 3).unwrap();
        assert!(assignment.test.is_empty());

        let sizes: Vec<usize> = assignment.folds.iter().map(Vec::len).collect();
        let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
        assert!(max - min <= 1, "fold sizes {sizes:?}");

        for fold in &assignment.folds {
            for label in 0..4u32 {
                let count = fold.iter().filter(|p| labels[**p] == label).count();
                assert!((4..=6).contains(&count), "label {label} count {count}");
            }
        }
    }

    #[test]
    fn test_slice_is_stratified() {
        let labels = labels();
        let assignment = assign_folds(&labels, 3, 0.2, 11).unwrap();
        for label in 0..4u32 {
            let held = assignment
                .test
                .iter()
                .filter(|p| labels[**p] == label)
                .count();
            assert_eq!(held, 5);
        }
        assert_eq!(
            assignment.partition_of(assignment.test[0]),
            Some(PartitionId::Test)
        );
    }

    #[test]
    fn verify_detects_duplicates_and_gaps() {
        let duplicated = FoldAssignment {
            folds: vec![vec![0, 1], vec![1, 2]],
            test: vec![],
        };
        assert!(matches!(
            duplicated.verify(3),
            Err(DataError::DataIntegrity(_))
        ));

        let missing = FoldAssignment {
            folds: vec![vec![0], vec![2]],
            test: vec![],
        };
        assert!(matches!(missing.verify(3), Err(DataError::DataIntegrity(_))));
    }

    #[test]
    fn rejects_single_fold() {
        assert!(matches!(
            assign_folds(&[0, 1], 1, 0.0, 0),
            Err(DataError::InvalidConfig(_))
        ));
    }
}
