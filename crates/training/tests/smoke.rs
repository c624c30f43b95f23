use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use candle_core::{Device, Tensor};
use labeled_data::{write_fold_set, FoldManifest, FoldPipeline, HashedWordEncoder, LabelHierarchy, PartitionId, RawExample};
use tempfile::tempdir;
use training::{
    data::load_partitions, BlockingDataLoader, CheckpointSelector, CheckpointStore, DataBatch, ErrorKind,
    EvalBatchLoader, ShutdownSignal, Trainer, TrainerPhase, TrainingConfig, TrainingError,
};

const MAX_LENGTH: usize = 12;

fn build_fold_set(dir: &Path) -> PathBuf {
    let paths = vec![
        vec!["background", "objective"],
        vec!["background", "motivation"],
        vec!["method", "design"],
        vec!["result", "finding"],
    ];
    let hierarchy = LabelHierarchy::from_paths(paths.clone()).unwrap();
    let raw: Vec<RawExample> = (0..120)
        .map(|i| {
            let leaf = paths[i % paths.len()][1];
            RawExample {
                text: format!("{leaf} {leaf} sentence number {i} about the {leaf}"),
                label: leaf.to_string(),
            }
        })
        .collect();
    let pipeline = FoldPipeline::new(
        Arc::new(HashedWordEncoder::new(256)),
        Arc::new(hierarchy.clone()),
        MAX_LENGTH,
        2,
    );
    let build = pipeline.build(&raw, 3, 0.0, 11).unwrap();
    let folds = dir.join("folds");
    write_fold_set(&build, &hierarchy, MAX_LENGTH, &folds).unwrap();
    folds
}

struct Run<'a> {
    mode: &'a str,
    run_id: &'a str,
    device: &'a str,
    schedule: &'a str,
    extra_runtime: &'a str,
    extra_loss: &'a str,
}

fn write_config(dir: &Path, folds: &Path, run: &Run<'_>) -> PathBuf {
    let contents = format!(
        r#"
mode = "{mode}"

[model]
vocab_size = 256
hidden_size = 16
max_length = {max_length}
dropout = 0.0

[head]
representation_size = 8
class_weighting = "balanced"

[loss]
loss_strategy = "supervised"
temperature = 0.5
{extra_loss}

[data]
folds_dir = "{folds}"
validation_fold = 0
batch_size = 8
gradient_accumulation_steps = 2
evaluation_batch_size = 16

[optimizer]
learning_rate = 0.01
weight_decay = 0.0

[scheduler]
lr_schedule = "linear_decay"
warmup_rate = 0.2
{schedule}

[runtime]
run_id = "{run_id}"
seed = 5
device_selector = "{device}"
log_every_n_steps = 1
{extra_runtime}

[runtime.checkpoint]
directory = "{checkpoints}"
every_n_steps = 3

[runtime.evaluation]
every_n_steps = 3

[runtime.logging]
stdout = false
"#,
        mode = run.mode,
        max_length = MAX_LENGTH,
        extra_loss = run.extra_loss,
        folds = folds.display(),
        schedule = run.schedule,
        run_id = run.run_id,
        device = run.device,
        extra_runtime = run.extra_runtime,
        checkpoints = dir.join("checkpoints").display(),
    );
    let path = dir.join(format!("{}.toml", run.run_id));
    fs::write(&path, contents).unwrap();
    path
}

fn pretraining(run_id: &str) -> Run<'_> {
    Run {
        mode: "pretraining",
        run_id,
        device: "cpu",
        schedule: "total_steps = 6",
        extra_runtime: "",
        extra_loss: "",
    }
}

fn reference_batch(folds: &Path) -> DataBatch {
    let manifest = FoldManifest::load(folds).unwrap();
    let examples = load_partitions(&manifest, &[PartitionId::Fold(0)], 2).unwrap();
    let mut loader = BlockingDataLoader::new(EvalBatchLoader::new(examples, Device::Cpu, 16).unwrap());
    loader.next_batch().unwrap().unwrap()
}

fn parameter_values(trainer: &Trainer) -> HashMap<String, Vec<f32>> {
    trainer
        .parameters()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()))
        .collect()
}

#[test]
fn pretraining_checkpoints_and_restores_exactly() {
    let tmp = tempdir().unwrap();
    let folds = build_fold_set(tmp.path());
    let config_path = write_config(tmp.path(), &folds, &pretraining("pre"));

    let mut trainer = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();
    let outcome = trainer.train().unwrap();
    assert_eq!(outcome.steps, 6);
    assert!(!outcome.cancelled);
    assert!(outcome.final_evaluation.is_some());
    assert!(outcome.best_evaluation_loss.is_some());

    let store = CheckpointStore::new(tmp.path().join("checkpoints"));
    assert_eq!(store.list("pre").unwrap(), vec![3, 6]);
    assert_eq!(store.resolve("pre", CheckpointSelector::Latest).unwrap().step, 6);
    assert!(store.resolve("pre", CheckpointSelector::Best).is_ok());

    let batch = reference_batch(&folds);
    let expected = trainer.reference_loss(&batch).unwrap();
    assert!(expected.is_finite());

    let mut config = TrainingConfig::load(&config_path).unwrap();
    config.runtime.restore_checkpoint_selector = Some(CheckpointSelector::Latest);
    let mut restored = Trainer::new(config).unwrap();
    assert_eq!(restored.step_count(), 6);
    let actual = restored.reference_loss(&batch).unwrap();
    assert!((actual - expected).abs() < 1e-6, "{actual} vs {expected}");

    // Nothing left to do: no new checkpoint, same step.
    let again = restored.train().unwrap();
    assert_eq!(again.steps, 6);
    assert_eq!(store.list("pre").unwrap(), vec![3, 6]);
}

#[test]
fn resumed_run_never_overwrites_a_saved_step() {
    let tmp = tempdir().unwrap();
    let folds = build_fold_set(tmp.path());
    let config_path = write_config(tmp.path(), &folds, &pretraining("mid"));

    let mut first = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();
    first.train().unwrap();

    let mut config = TrainingConfig::load(&config_path).unwrap();
    config.runtime.restore_checkpoint_selector = Some(CheckpointSelector::Step(3));
    let mut resumed = Trainer::new(config).unwrap();
    assert_eq!(resumed.step_count(), 3);

    let failure = resumed.train().unwrap_err();
    assert_eq!(failure.run_id, "mid");
    assert_eq!(failure.phase, TrainerPhase::Checkpoint);
    let last = failure.last_checkpoint.unwrap();
    assert!(last.ends_with("step_000000000003"), "{}", last.display());
}

#[test]
fn restore_without_checkpoint_is_a_restore_error() {
    let tmp = tempdir().unwrap();
    let folds = build_fold_set(tmp.path());
    let config_path = write_config(tmp.path(), &folds, &pretraining("empty"));
    let mut config = TrainingConfig::load(&config_path).unwrap();
    config.runtime.restore_checkpoint_selector = Some(CheckpointSelector::Latest);
    match Trainer::new(config) {
        Err(TrainingError::Restore(_)) => {}
        Err(other) => panic!("expected restore error, got {other}"),
        Ok(_) => panic!("restore unexpectedly succeeded"),
    }
}

#[test]
fn fine_tuning_seeds_encoder_from_pretraining() {
    let tmp = tempdir().unwrap();
    let folds = build_fold_set(tmp.path());
    let pre_path = write_config(tmp.path(), &folds, &pretraining("seed-source"));
    Trainer::new(TrainingConfig::load(&pre_path).unwrap())
        .unwrap()
        .train()
        .unwrap();

    let run = Run {
        mode: "fine_tuning",
        run_id: "finetune",
        device: "cpu",
        schedule: "epochs = 1",
        extra_runtime: "\n[runtime.init_checkpoint]\nrun_id = \"seed-source\"\nselector = \"latest\"\n",
        extra_loss: "representation_loss_weight = 0.5",
    };
    let config_path = write_config(tmp.path(), &folds, &run);
    let mut trainer = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();

    let store = CheckpointStore::new(tmp.path().join("checkpoints"));
    let source = store
        .load("seed-source", CheckpointSelector::Latest, &Device::Cpu)
        .unwrap();
    let seeded = parameter_values(&trainer);
    let mut encoder_tensors = 0;
    for (name, values) in &seeded {
        if name.starts_with("encoder.") {
            let expected: Vec<f32> = source.tensors[name].flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(values, &expected, "{name}");
            encoder_tensors += 1;
        } else {
            assert!(name.starts_with("head."), "{name}");
        }
    }
    assert!(encoder_tensors > 0);

    // 80 training examples / batch 8 / 2 micro-batches per step.
    assert_eq!(trainer.total_steps(), 5);
    let outcome = trainer.train().unwrap();
    assert_eq!(outcome.steps, 5);
    let evaluation = outcome.final_evaluation.unwrap();
    assert_eq!(evaluation.levels.len(), 2);
    for level in &evaluation.levels {
        assert!((0.0..=1.0).contains(&level.accuracy));
        assert!(level.macro_f1 <= 1.0);
    }
}

#[test]
fn data_parallel_matches_single_device() {
    let tmp = tempdir().unwrap();
    let folds = build_fold_set(tmp.path());
    let single_path = write_config(tmp.path(), &folds, &pretraining("single"));
    let mut pair = pretraining("pair");
    pair.device = "cpu:2";
    let pair_path = write_config(tmp.path(), &folds, &pair);

    let mut single = Trainer::new(TrainingConfig::load(&single_path).unwrap()).unwrap();
    let mut split = Trainer::new(TrainingConfig::load(&pair_path).unwrap()).unwrap();
    let initial: HashMap<String, Tensor> = single
        .parameters()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().copy().unwrap()))
        .collect();
    split.load_parameters(&initial).unwrap();

    single.train().unwrap();
    split.train().unwrap();

    let batch = reference_batch(&folds);
    let a = single.reference_loss(&batch).unwrap();
    let b = split.reference_loss(&batch).unwrap();
    assert!((a - b).abs() < 1e-3, "{a} vs {b}");

    let left = parameter_values(&single);
    let right = parameter_values(&split);
    for (name, values) in &left {
        for (x, y) in values.iter().zip(&right[name]) {
            assert!((x - y).abs() < 1e-3, "{name}: {x} vs {y}");
        }
    }
}

#[test]
fn shutdown_before_first_step_ends_cleanly() {
    let tmp = tempdir().unwrap();
    let folds = build_fold_set(tmp.path());
    let config_path = write_config(tmp.path(), &folds, &pretraining("stopped"));
    let mut trainer = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();
    let outcome = trainer.train_with_shutdown(&AtomicBool::new(true)).unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.steps, 0);
    assert!(outcome.last_checkpoint.is_none());
}

/// Requests shutdown from the `at`-th poll onwards.
struct StopAtPoll {
    polls: AtomicUsize,
    at: usize,
}

impl ShutdownSignal for StopAtPoll {
    fn is_requested(&self) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst) + 1 >= self.at
    }
}

#[test]
fn shutdown_inside_a_step_finishes_and_checkpoints_that_step() {
    let tmp = tempdir().unwrap();
    let folds = build_fold_set(tmp.path());
    let config_path = write_config(tmp.path(), &folds, &pretraining("halfway"));
    let mut trainer = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();

    // Two micro-batches per step: poll 4 comes before the second half of step 2.
    let signal = StopAtPoll {
        polls: AtomicUsize::new(0),
        at: 4,
    };
    let outcome = trainer.train_with_shutdown(&signal).unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.steps, 2);
    assert_eq!(trainer.phase(), TrainerPhase::Done);
    let last = outcome.last_checkpoint.unwrap();
    assert!(last.ends_with("step_000000000002"), "{}", last.display());

    let store = CheckpointStore::new(tmp.path().join("checkpoints"));
    assert_eq!(store.list("halfway").unwrap(), vec![2]);

    let mut config = TrainingConfig::load(&config_path).unwrap();
    config.runtime.restore_checkpoint_selector = Some(CheckpointSelector::Latest);
    let restored = Trainer::new(config).unwrap();
    assert_eq!(restored.step_count(), 2);
}

#[test]
fn non_finite_loss_halts_without_touching_state() {
    let tmp = tempdir().unwrap();
    let folds = build_fold_set(tmp.path());
    let config_path = write_config(tmp.path(), &folds, &pretraining("unstable"));
    Trainer::new(TrainingConfig::load(&config_path).unwrap())
        .unwrap()
        .train()
        .unwrap();

    let mut config = TrainingConfig::load(&config_path).unwrap();
    config.runtime.restore_checkpoint_selector = Some(CheckpointSelector::Step(3));
    let mut trainer = Trainer::new(config).unwrap();
    let poisoned: HashMap<String, Tensor> = trainer
        .parameters()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().ones_like().unwrap().affine(f64::NAN, 0.0).unwrap()))
        .collect();
    trainer.load_parameters(&poisoned).unwrap();
    let bits = |trainer: &Trainer| -> HashMap<String, Vec<u32>> {
        parameter_values(trainer)
            .into_iter()
            .map(|(name, values)| (name, values.iter().map(|v| v.to_bits()).collect()))
            .collect()
    };
    let before = bits(&trainer);

    let failure = trainer.train().unwrap_err();
    assert_eq!(failure.kind, ErrorKind::NumericInstability);
    assert!(matches!(failure.error, TrainingError::NumericInstability { step: 4, .. }));
    assert_eq!(failure.phase, TrainerPhase::Steady);
    let last = failure.last_checkpoint.unwrap();
    assert!(last.ends_with("step_000000000003"), "{}", last.display());

    assert_eq!(trainer.step_count(), 3);
    assert_eq!(trainer.phase(), TrainerPhase::Failed);
    assert_eq!(bits(&trainer), before);
    let store = CheckpointStore::new(tmp.path().join("checkpoints"));
    assert_eq!(store.list("unstable").unwrap(), vec![3, 6]);
}
