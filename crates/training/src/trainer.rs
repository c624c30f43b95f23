use std::{
    collections::HashMap,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Tensor, Var};
use labeled_data::{Example, FoldManifest, PartitionId};
use model::{ModelConfig, ModelKind};

use crate::{
    checkpoint::{
        restore_parameters, seed_encoder, ArchitectureFingerprint, CheckpointSelector, CheckpointStore,
        TrainingProgressSnapshot, TrainingSnapshot,
    },
    config::{ClassWeighting, InitCheckpointConfig, TrainingMode},
    data::{load_partitions, BlockingDataLoader, DataBatch, EvalBatchLoader, FoldBatchLoader},
    device::{DeviceGroup, DeviceSelector},
    errors::RunFailure,
    logging::{Logger, LoggingSettings},
    loss::{balanced_class_weights, LossOutput, Objective},
    metrics::{EvaluationMetrics, EvaluationSummary, TrainingMetrics},
    optimizer::{AdamWConfig, NamedGradients, TrainerOptimizer, TrainerOptimizerOptions},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Cooperative stop request. Polled once per micro-batch; the trainer only
/// acts on it between committed steps.
pub trait ShutdownSignal {
    fn is_requested(&self) -> bool;
}

impl ShutdownSignal for AtomicBool {
    fn is_requested(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

/// Lifecycle of a run.
///
/// ```text
/// INIT -> WARMUP -> STEADY -> EVAL -> CHECKPOINT -> (STEADY | DONE)
/// ```
///
/// `FAILED` is reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Init,
    Warmup,
    Steady,
    Eval,
    Checkpoint,
    Done,
    Failed,
}

impl TrainerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrainerPhase::Done | TrainerPhase::Failed)
    }

    pub fn can_transition_to(self, next: TrainerPhase) -> bool {
        use TrainerPhase::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        match self {
            Init => matches!(next, Warmup | Steady | Eval | Done),
            Warmup => matches!(next, Steady | Eval | Checkpoint | Done),
            Steady => matches!(next, Eval | Checkpoint | Done),
            Eval => matches!(next, Warmup | Steady | Checkpoint | Done),
            Checkpoint => matches!(next, Warmup | Steady | Done),
            Done | Failed => false,
        }
    }
}

/// Result of a run that reached `DONE`.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub run_id: String,
    pub steps: usize,
    pub total_steps: usize,
    /// Stopped early on request; the final committed step was checkpointed.
    pub cancelled: bool,
    pub last_checkpoint: Option<PathBuf>,
    pub final_evaluation: Option<EvaluationSummary>,
    pub best_evaluation_loss: Option<f64>,
}

pub struct Trainer {
    config: TrainingConfig,
    run_id: String,
    config_sha256: String,
    mode: TrainingMode,
    group: DeviceGroup,
    parameters: Vec<(String, Var)>,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    objective: Objective,
    train_loader: BlockingDataLoader<FoldBatchLoader>,
    eval_loader: Option<BlockingDataLoader<EvalBatchLoader>>,
    level_sizes: Vec<usize>,
    store: CheckpointStore,
    logger: Logger,
    metrics: TrainingMetrics,
    phase: TrainerPhase,
    total_steps: usize,
    warmup_steps: usize,
    committed_steps: usize,
    epoch: usize,
    last_checkpoint: Option<(usize, PathBuf)>,
    best_eval: Option<f64>,
    last_evaluation: Option<EvaluationSummary>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let mode = config.mode;
        let seed = config.runtime.seed;

        let manifest = FoldManifest::load(&config.data.folds_dir)?;
        check_fold_set(&config, &manifest)?;
        let hierarchy = manifest.hierarchy()?;
        let depth = hierarchy.depth();
        let level_sizes = hierarchy.level_sizes();

        let model_config = ModelConfig {
            encoder: config.model.clone(),
            head: config.head.head_config(),
            level_sizes: level_sizes.clone(),
        };
        let kind = match mode {
            TrainingMode::Pretraining => ModelKind::Pretraining,
            TrainingMode::FineTuning => ModelKind::FineTuning,
        };

        let selector: DeviceSelector = config.runtime.device_selector.parse()?;
        let devices = selector.resolve()?;
        for device in &devices {
            if let Err(err) = device.set_seed(seed) {
                tracing::debug!(?device, %err, "device RNG not seedable");
            }
        }
        let group = DeviceGroup::new(&model_config, kind, devices)?;
        if config.data.batch_size < group.len() {
            return Err(TrainingError::initialization(format!(
                "batch_size {} is smaller than the {} replicas of '{selector}'",
                config.data.batch_size,
                group.len()
            )));
        }
        let parameters = group.named_parameters()?;
        tracing::info!(
            device = %selector,
            replicas = group.len(),
            parameters = parameters.len(),
            ?mode,
            "model ready"
        );

        let validation_fold = config.data.validation_fold;
        let train_examples = load_partitions(&manifest, &manifest.training_partitions(validation_fold), depth)?;

        let objective = match mode {
            TrainingMode::Pretraining => Objective::pretraining(&config.loss, depth)?,
            TrainingMode::FineTuning => {
                let class_weights = match config.head.class_weighting {
                    ClassWeighting::None => vec![None; depth],
                    ClassWeighting::Balanced => level_class_weights(&train_examples, &level_sizes),
                };
                Objective::fine_tuning(&config.loss, depth, class_weights)?
            }
        };

        let primary = group.primary_device().clone();
        let train_loader = FoldBatchLoader::new(
            train_examples,
            primary.clone(),
            config.data.batch_size,
            config.data.gradient_accumulation_steps,
            seed,
        )?;
        let total_steps = match (config.scheduler.total_steps, config.scheduler.epochs) {
            (Some(steps), _) => steps,
            (None, Some(epochs)) => epochs * train_loader.steps_per_epoch(),
            (None, None) => {
                return Err(TrainingError::initialization(
                    "one of scheduler.total_steps or scheduler.epochs is required",
                ))
            }
        };
        tracing::info!(
            examples = train_loader.examples().len(),
            steps_per_epoch = train_loader.steps_per_epoch(),
            total_steps,
            "training folds loaded"
        );

        let eval_partition = match validation_fold {
            Some(fold) => Some(PartitionId::Fold(fold)),
            None => manifest.entry(PartitionId::Test).map(|_| PartitionId::Test),
        };
        let eval_loader = match eval_partition {
            Some(partition) => {
                let examples = load_partitions(&manifest, &[partition], depth)?;
                let batch_size = config.data.evaluation_batch_size.unwrap_or(config.data.batch_size);
                Some(BlockingDataLoader::new(EvalBatchLoader::new(examples, primary, batch_size)?))
            }
            None => None,
        };

        let optimizer = TrainerOptimizer::new(
            parameters.clone(),
            AdamWConfig::from(&config.optimizer),
            TrainerOptimizerOptions::from(&config.optimizer),
        )?;
        let scheduler_config = SchedulerConfig::from_training_config(
            &config.scheduler,
            f64::from(config.optimizer.learning_rate),
            total_steps,
        )?;
        let warmup_steps = scheduler_config.warmup_steps;
        let scheduler = scheduler_config.build()?;

        let run_id = config.runtime.run_id.clone().unwrap_or_else(|| generate_run_id(seed));
        let store = CheckpointStore::new(&config.runtime.checkpoint.directory);
        let logger = Logger::new(&run_id, LoggingSettings::from_config(&config.runtime.logging))?;
        let config_sha256 = config.fingerprint()?;

        let mut trainer = Self {
            run_id,
            config_sha256,
            mode,
            group,
            parameters,
            optimizer,
            scheduler,
            objective,
            train_loader: BlockingDataLoader::new(train_loader),
            eval_loader,
            level_sizes: match mode {
                TrainingMode::Pretraining => Vec::new(),
                TrainingMode::FineTuning => level_sizes,
            },
            store,
            logger,
            metrics: TrainingMetrics::new(),
            phase: TrainerPhase::Init,
            total_steps,
            warmup_steps,
            committed_steps: 0,
            epoch: 0,
            last_checkpoint: None,
            best_eval: None,
            last_evaluation: None,
            config,
        };

        if let Some(selector) = trainer.config.runtime.restore_checkpoint_selector {
            trainer.restore(selector)?;
        } else if let Some(init) = trainer.config.runtime.init_checkpoint.clone() {
            trainer.seed_from_pretraining(&init)?;
        }
        Ok(trainer)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// Committed optimizer steps so far.
    pub fn step_count(&self) -> usize {
        self.committed_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn parameters(&self) -> &[(String, Var)] {
        &self.parameters
    }

    pub fn last_checkpoint(&self) -> Option<&PathBuf> {
        self.last_checkpoint.as_ref().map(|(_, path)| path)
    }

    /// Overwrite every model parameter and bring all replicas in line.
    pub fn load_parameters(&mut self, tensors: &HashMap<String, Tensor>) -> Result<(), TrainingError> {
        restore_parameters(&self.parameters, tensors)?;
        self.group.broadcast_parameters()
    }

    /// Resume this run from one of its own checkpoints: parameters, optimizer
    /// moments, schedule position and data order.
    pub fn restore(&mut self, selector: CheckpointSelector) -> Result<(), TrainingError> {
        let loaded = self
            .store
            .load(&self.run_id, selector, self.group.primary_device())
            .map_err(not_found_is_restore)?;
        let manifest = &loaded.handle.manifest;

        let expected = ArchitectureFingerprint::of(self.mode, &self.parameters);
        if manifest.architecture != expected {
            return Err(TrainingError::restore(format!(
                "checkpoint {} was written for a different {:?} architecture",
                loaded.handle.directory.display(),
                manifest.architecture.mode
            )));
        }
        if manifest.config_sha256 != self.config_sha256 {
            tracing::warn!(
                run_id = %self.run_id,
                step = loaded.handle.step,
                "restoring a checkpoint written under a different configuration"
            );
        }
        let step = manifest.progress.optimizer_step;
        if step > self.total_steps {
            return Err(TrainingError::restore(format!(
                "checkpoint step {step} is beyond the configured {} steps",
                self.total_steps
            )));
        }

        self.scheduler.restore(&loaded.scheduler)?;
        self.optimizer.load_state(loaded.optimizer)?;
        self.optimizer.set_learning_rate(self.scheduler.learning_rate());
        self.load_parameters(&loaded.tensors)?;

        self.committed_steps = step;
        self.epoch = manifest.progress.epoch;
        self.train_loader.get_mut().seek_to_step(step);
        self.best_eval = self
            .store
            .resolve(&self.run_id, CheckpointSelector::Best)
            .ok()
            .and_then(|best| best.manifest.evaluation_loss);
        self.last_checkpoint = Some((step, loaded.handle.directory.clone()));

        tracing::info!(
            run_id = %self.run_id,
            step,
            directory = %loaded.handle.directory.display(),
            "restored checkpoint"
        );
        Ok(())
    }

    /// Copy the encoder of a pretraining checkpoint into this fine-tuning
    /// model. The source's representation head is dropped; the classifier
    /// head keeps its fresh initialization.
    fn seed_from_pretraining(&mut self, init: &InitCheckpointConfig) -> Result<(), TrainingError> {
        let store = match &init.directory {
            Some(directory) => CheckpointStore::new(directory),
            None => self.store.clone(),
        };
        let loaded = store
            .load(&init.run_id, init.selector, self.group.primary_device())
            .map_err(not_found_is_restore)?;
        if loaded.handle.manifest.architecture.mode != TrainingMode::Pretraining {
            return Err(TrainingError::restore(format!(
                "init checkpoint {} is not a pretraining checkpoint",
                loaded.handle.directory.display()
            )));
        }
        let seeded = seed_encoder(&self.parameters, &loaded.tensors)?;
        self.group.broadcast_parameters()?;
        tracing::info!(
            run_id = %self.run_id,
            source_run = %init.run_id,
            source_step = loaded.handle.step,
            tensors = seeded,
            "encoder seeded from pretraining checkpoint"
        );
        Ok(())
    }

    /// Objective value on `batch` with the current parameters, without
    /// dropout and without touching any training state.
    pub fn reference_loss(&self, batch: &DataBatch) -> Result<f32, TrainingError> {
        let output = self.group.forward(&batch.input_ids, &batch.attention_mask, false)?;
        let LossOutput { metrics, .. } = self.objective.compute(&output, &batch.labels)?;
        Ok(metrics.total)
    }

    /// One ordered pass over the evaluation partition. `None` when the fold
    /// set has no evaluation partition or it is empty.
    pub fn evaluate(&mut self) -> Result<Option<EvaluationSummary>, TrainingError> {
        let Some(loader) = self.eval_loader.as_mut() else {
            return Ok(None);
        };
        loader.get_mut().reset();
        let mut metrics = EvaluationMetrics::new(&self.level_sizes);
        while let Some(batch) = loader.next_batch()? {
            let output = self.group.forward(&batch.input_ids, &batch.attention_mask, false)?;
            let LossOutput { metrics: batch_metrics, .. } = self.objective.compute(&output, &batch.labels)?;
            metrics.update(&batch_metrics);
        }
        Ok(metrics.finalize())
    }

    pub fn train(&mut self) -> Result<TrainingOutcome, RunFailure> {
        self.train_with_shutdown(&AtomicBool::new(false))
    }

    /// Run to `DONE`. A shutdown request raised inside a step lets that step
    /// finish; the last committed step is then checkpointed and the run ends.
    pub fn train_with_shutdown(&mut self, shutdown: &dyn ShutdownSignal) -> Result<TrainingOutcome, RunFailure> {
        match self.run(shutdown) {
            Ok(outcome) => {
                self.logger.flush();
                Ok(outcome)
            }
            Err(error) => {
                let phase = self.phase;
                if phase.can_transition_to(TrainerPhase::Failed) {
                    self.transition(TrainerPhase::Failed);
                }
                self.logger.flush();
                let failure = RunFailure {
                    run_id: self.run_id.clone(),
                    phase,
                    kind: error.kind(),
                    error,
                    last_checkpoint: self.last_checkpoint.as_ref().map(|(_, path)| path.clone()),
                };
                tracing::error!(
                    run_id = %failure.run_id,
                    phase = ?failure.phase,
                    kind = ?failure.kind,
                    last_checkpoint = ?failure.last_checkpoint,
                    "run failed: {}",
                    failure.error
                );
                Err(failure)
            }
        }
    }

    fn run(&mut self, shutdown: &dyn ShutdownSignal) -> Result<TrainingOutcome, TrainingError> {
        if self.phase != TrainerPhase::Init {
            return Err(TrainingError::runtime(format!(
                "trainer already left INIT (now {:?})",
                self.phase
            )));
        }
        tracing::info!(
            run_id = %self.run_id,
            start_step = self.committed_steps,
            total_steps = self.total_steps,
            warmup_steps = self.warmup_steps,
            "starting training"
        );

        if self.committed_steps >= self.total_steps {
            self.transition(TrainerPhase::Done);
            return Ok(self.outcome(false));
        }

        if self.config.runtime.evaluation.before_training && self.committed_steps == 0 {
            self.transition(TrainerPhase::Eval);
            self.run_evaluation(0)?;
        }
        self.transition(self.training_phase());

        let mut accumulated: Option<NamedGradients> = None;
        let mut step_loss = 0f64;
        let mut step_examples = 0usize;
        let mut stop_requested = false;

        while self.committed_steps < self.total_steps {
            stop_requested |= shutdown.is_requested();
            if stop_requested && accumulated.is_none() {
                tracing::warn!(run_id = %self.run_id, step = self.committed_steps, "shutdown requested");
                if self.committed_steps > 0 {
                    self.transition(TrainerPhase::Checkpoint);
                    self.save_checkpoint(self.committed_steps, None)?;
                }
                self.transition(TrainerPhase::Done);
                return Ok(self.outcome(true));
            }

            let batch = self
                .train_loader
                .next_batch()?
                .ok_or_else(|| TrainingError::runtime("training loader ran dry"))?;
            let step = self.committed_steps + 1;

            let output = self.group.forward(&batch.input_ids, &batch.attention_mask, true)?;
            let LossOutput { loss, metrics } = self.objective.compute(&output, &batch.labels)?;
            if !metrics.total.is_finite() {
                return Err(TrainingError::NumericInstability {
                    step,
                    what: "loss",
                    value: metrics.total,
                });
            }

            let micro_batches = batch.micro_batches_per_step as f64;
            let grads = loss.affine(1.0 / micro_batches, 0.0)?.backward()?;
            let micro = self.group.gather_gradients(&grads, batch.len())?;
            accumulated = Some(match accumulated.take() {
                Some(sum) => add_gradients(sum, micro)?,
                None => micro,
            });
            step_loss += f64::from(metrics.total) / micro_batches;
            step_examples += batch.len();

            if !batch.closes_step() {
                continue;
            }
            let grads = accumulated
                .take()
                .ok_or_else(|| TrainingError::runtime("step closed without gradients"))?;
            self.commit_step(&grads, step, batch.epoch, step_loss, step_examples)?;
            step_loss = 0.0;
            step_examples = 0;
        }

        Ok(self.outcome(false))
    }

    fn commit_step(
        &mut self,
        grads: &NamedGradients,
        step: usize,
        epoch: usize,
        loss: f64,
        examples: usize,
    ) -> Result<(), TrainingError> {
        let lr = self.scheduler.rate_at(self.scheduler.steps_taken());
        self.optimizer.set_learning_rate(lr);
        let report = self.optimizer.step(grads, step)?;
        self.scheduler.step();
        self.group.broadcast_parameters()?;
        self.committed_steps = step;
        self.epoch = epoch;

        let snapshot = self.metrics.record_step(examples as u64, loss, report.grad_norm);
        let final_step = step == self.total_steps;
        if step == 1 || final_step || step % self.config.runtime.log_every_n_steps == 0 {
            self.logger.log_training_step(step, lr, &snapshot);
        }

        let phase = self.training_phase();
        if phase != self.phase {
            self.transition(phase);
        }

        let eval_due = self.eval_loader.is_some()
            && (final_step || self.config.runtime.evaluation.every_n_steps.is_some_and(|n| step % n == 0));
        let mut improved = false;
        let mut evaluation_loss = None;
        if eval_due {
            self.transition(TrainerPhase::Eval);
            evaluation_loss = self.run_evaluation(step)?;
            if let Some(value) = evaluation_loss {
                improved = self.best_eval.map_or(true, |best| value < best);
                if improved {
                    self.best_eval = Some(value);
                }
            }
        }

        let checkpoint_due = improved
            || final_step
            || self.config.runtime.checkpoint.every_n_steps.is_some_and(|n| step % n == 0);
        if checkpoint_due {
            self.transition(TrainerPhase::Checkpoint);
            self.save_checkpoint(step, evaluation_loss)?;
            if improved {
                self.store.mark_best(&self.run_id, step)?;
                tracing::info!(run_id = %self.run_id, step, loss = ?evaluation_loss, "new best checkpoint");
            }
        }

        if final_step {
            self.transition(TrainerPhase::Done);
        } else if self.phase != phase {
            self.transition(phase);
        }
        Ok(())
    }

    fn run_evaluation(&mut self, step: usize) -> Result<Option<f64>, TrainingError> {
        let Some(summary) = self.evaluate()? else {
            return Ok(None);
        };
        self.logger.log_evaluation(step, &summary);
        let loss = summary.average_loss;
        self.last_evaluation = Some(summary);
        Ok(Some(loss))
    }

    fn save_checkpoint(&mut self, step: usize, evaluation_loss: Option<f64>) -> Result<(), TrainingError> {
        if self.last_checkpoint.as_ref().is_some_and(|(saved, _)| *saved == step) {
            return Ok(());
        }
        let snapshot = TrainingSnapshot {
            tensors: TrainingSnapshot::copy_parameters(&self.parameters)?,
            optimizer: self.optimizer.state()?,
            scheduler: self.scheduler.snapshot(),
            progress: TrainingProgressSnapshot {
                optimizer_step: step,
                epoch: self.epoch,
                micro_batches_per_step: self.config.data.gradient_accumulation_steps,
            },
            architecture: ArchitectureFingerprint::of(self.mode, &self.parameters),
            config_sha256: self.config_sha256.clone(),
            seed: self.config.runtime.seed,
            evaluation_loss,
        };
        let handle = self.store.save(&self.run_id, step, &snapshot)?;
        self.last_checkpoint = Some((step, handle.directory));
        Ok(())
    }

    fn training_phase(&self) -> TrainerPhase {
        if self.committed_steps < self.warmup_steps {
            TrainerPhase::Warmup
        } else {
            TrainerPhase::Steady
        }
    }

    fn transition(&mut self, next: TrainerPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal transition {:?} -> {next:?}",
            self.phase
        );
        self.logger.log_phase(self.phase, next, self.committed_steps);
        self.phase = next;
    }

    fn outcome(&self, cancelled: bool) -> TrainingOutcome {
        TrainingOutcome {
            run_id: self.run_id.clone(),
            steps: self.committed_steps,
            total_steps: self.total_steps,
            cancelled,
            last_checkpoint: self.last_checkpoint.as_ref().map(|(_, path)| path.clone()),
            final_evaluation: self.last_evaluation.clone(),
            best_evaluation_loss: self.best_eval,
        }
    }
}

fn check_fold_set(config: &TrainingConfig, manifest: &FoldManifest) -> Result<(), TrainingError> {
    let mut problems = Vec::new();
    if let Some(k) = config.data.k_folds {
        if k != manifest.k_folds {
            problems.push(format!(
                "data.k_folds is {k} but {} holds {} folds",
                manifest.directory.display(),
                manifest.k_folds
            ));
        }
    }
    if let Some(rate) = config.data.test_rate {
        if (rate - manifest.test_rate).abs() > 1e-9 {
            problems.push(format!(
                "data.test_rate is {rate} but the fold set was built with {}",
                manifest.test_rate
            ));
        }
    }
    if let Some(fold) = config.data.validation_fold {
        if fold >= manifest.k_folds {
            problems.push(format!(
                "data.validation_fold {fold} is out of range for {} folds",
                manifest.k_folds
            ));
        }
    }
    if manifest.max_length != config.model.max_length {
        problems.push(format!(
            "model.max_length is {} but records are padded to {}",
            config.model.max_length, manifest.max_length
        ));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(TrainingError::validation(problems))
    }
}

fn level_class_weights(examples: &[Example], level_sizes: &[usize]) -> Vec<Option<Vec<f32>>> {
    level_sizes
        .iter()
        .enumerate()
        .map(|(level, classes)| {
            let targets: Vec<u32> = examples.iter().map(|example| example.labels[level]).collect();
            Some(balanced_class_weights(&targets, *classes))
        })
        .collect()
}

fn add_gradients(mut sum: NamedGradients, other: NamedGradients) -> Result<NamedGradients, TrainingError> {
    for (name, grad) in other {
        let merged = match sum.remove(&name) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        sum.insert(name, merged);
    }
    Ok(sum)
}

fn not_found_is_restore(err: TrainingError) -> TrainingError {
    match err {
        TrainingError::CheckpointNotFound(message) => TrainingError::restore(message),
        other => other,
    }
}

fn generate_run_id(seed: u64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("run-{now}-{seed:x}")
}
