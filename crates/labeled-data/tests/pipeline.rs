use std::collections::HashMap;
use std::sync::Arc;

use labeled_data::{
    write_fold_set, FoldManifest, FoldPipeline, HashedWordEncoder, LabelHierarchy, PartitionId,
    RawExample,
};

fn corpus() -> (Vec<RawExample>, LabelHierarchy) {
    let paths = vec![
        vec!["background", "objective"],
        vec!["background", "motivation"],
        vec!["method", "design"],
        vec!["method", "procedure"],
        vec!["result", "finding"],
    ];
    let hierarchy = LabelHierarchy::from_paths(paths.clone()).unwrap();
    let raw = (0..250)
        .map(|i| {
            let leaf = paths[(i * 7) % paths.len()][1];
            RawExample {
                text: if i % 50 == 13 {
                    String::from("\u{0}\u{1}   ")
                } else {
                    format!("{leaf} sentence {i} with some words")
                },
                label: leaf.to_string(),
            }
        })
        .collect();
    (raw, hierarchy)
}

#[test]
fn fold_set_assigns_each_surviving_example_exactly_once() {
    let (raw, hierarchy) = corpus();
    let pipeline = FoldPipeline::new(
        Arc::new(HashedWordEncoder::new(512)),
        Arc::new(hierarchy.clone()),
        16,
        4,
    );
    let build = pipeline.build(&raw, 5, 0.1, 1234).unwrap();
    assert_eq!(build.dropped.tokenization, 5);

    let dir = tempfile::tempdir().unwrap();
    write_fold_set(&build, &hierarchy, 16, dir.path()).unwrap();
    let manifest = FoldManifest::load(dir.path()).unwrap();

    let mut seen: HashMap<u64, PartitionId> = HashMap::new();
    let partitions = (0..manifest.k_folds)
        .map(PartitionId::Fold)
        .chain(std::iter::once(PartitionId::Test));
    for partition in partitions {
        for example in manifest.open(partition).unwrap() {
            let example = example.unwrap();
            assert!(
                seen.insert(example.id, partition).is_none(),
                "example {} appears twice",
                example.id
            );
        }
    }

    assert_eq!(seen.len(), raw.len() - 5);
    for position in build.dropped.positions {
        assert!(!seen.contains_key(&(position as u64)));
    }
}

#[test]
fn rebuilding_with_same_seed_is_identical() {
    let (raw, hierarchy) = corpus();
    let hierarchy = Arc::new(hierarchy);
    let build = |workers| {
        FoldPipeline::new(
            Arc::new(HashedWordEncoder::new(512)),
            hierarchy.clone(),
            16,
            workers,
        )
        .build(&raw, 5, 0.1, 99)
        .unwrap()
    };
    let a = build(1);
    let b = build(6);
    assert_eq!(a.folds, b.folds);
    assert_eq!(a.test, b.test);
    assert_eq!(a.dropped, b.dropped);
}
