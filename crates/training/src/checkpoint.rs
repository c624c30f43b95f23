use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use model::ENCODER_PREFIX;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{
    config::TrainingMode,
    optimizer::OptimizerState,
    scheduler::SchedulerState,
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const LATEST_POINTER: &str = "latest.json";
const BEST_POINTER: &str = "best.json";
const STEP_PREFIX: &str = "step_";
const TMP_PREFIX: &str = ".tmp-";

/// Which checkpoint of a run to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointSelector {
    #[default]
    Latest,
    Best,
    Step(usize),
}

impl FromStr for CheckpointSelector {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "best" => Ok(Self::Best),
            other => other
                .trim_start_matches(STEP_PREFIX)
                .parse::<usize>()
                .map(Self::Step)
                .map_err(|_| {
                    TrainingError::ConfigFormat(format!(
                        "invalid checkpoint selector '{s}', expected 'latest', 'best' or a step number"
                    ))
                }),
        }
    }
}

impl fmt::Display for CheckpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Best => write!(f, "best"),
            Self::Step(step) => write!(f, "{step}"),
        }
    }
}

impl Serialize for CheckpointSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Step(step) => serializer.serialize_u64(*step as u64),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for CheckpointSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Step(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Step(step) => Ok(Self::Step(step as usize)),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrainingProgressSnapshot {
    pub optimizer_step: usize,
    pub epoch: usize,
    pub micro_batches_per_step: usize,
}

/// Parameter names and shapes plus the head they were trained with. A restore
/// into a model with a different fingerprint is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureFingerprint {
    pub mode: TrainingMode,
    pub parameters: Vec<(String, Vec<usize>)>,
}

impl ArchitectureFingerprint {
    pub fn of(mode: TrainingMode, named: &[(String, Var)]) -> Self {
        let mut parameters: Vec<(String, Vec<usize>)> = named
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().dims().to_vec()))
            .collect();
        parameters.sort();
        Self { mode, parameters }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub run_id: String,
    pub step: usize,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub seed: u64,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub progress: TrainingProgressSnapshot,
    pub architecture: ArchitectureFingerprint,
    #[serde(default)]
    pub evaluation_loss: Option<f64>,
}

/// Self-contained copy of everything needed to resume a run. Parameter
/// tensors are deep copies, so later updates to the live model do not leak
/// into a snapshot that is still being written.
#[derive(Debug, Clone)]
pub struct TrainingSnapshot {
    pub tensors: Vec<(String, Tensor)>,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
    pub progress: TrainingProgressSnapshot,
    pub architecture: ArchitectureFingerprint,
    pub config_sha256: String,
    pub seed: u64,
    pub evaluation_loss: Option<f64>,
}

impl TrainingSnapshot {
    pub fn copy_parameters(named: &[(String, Var)]) -> Result<Vec<(String, Tensor)>, TrainingError> {
        named
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().detach().copy()?)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointHandle {
    pub run_id: String,
    pub step: usize,
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadedCheckpoint {
    pub handle: CheckpointHandle,
    pub tensors: HashMap<String, Tensor>,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pointer {
    step: usize,
    directory: String,
    updated_unix_timestamp: u64,
}

/// Directory-per-run checkpoint storage:
///
/// ```text
/// <root>/<run_id>/step_000000000120/{model.safetensors, optimizer.json, scheduler.json, manifest.json}
/// <root>/<run_id>/latest.json
/// <root>/<run_id>/best.json
/// ```
///
/// A step directory is assembled under a temporary name and renamed into
/// place, and pointers are replaced by rename, so readers only ever see
/// complete checkpoints. Nothing is deleted automatically.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn save(&self, run_id: &str, step: usize, snapshot: &TrainingSnapshot) -> Result<CheckpointHandle, TrainingError> {
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir)?;

        let dir_name = step_dir_name(step);
        let final_dir = run_dir.join(&dir_name);
        if final_dir.exists() {
            return Err(TrainingError::runtime(format!(
                "checkpoint {} already exists",
                final_dir.display()
            )));
        }
        let tmp_dir = run_dir.join(format!("{TMP_PREFIX}{dir_name}-{}", std::process::id()));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir(&tmp_dir)?;

        let manifest = match write_contents(&tmp_dir, run_id, step, snapshot) {
            Ok(manifest) => manifest,
            Err(err) => {
                let _ = fs::remove_dir_all(&tmp_dir);
                return Err(err);
            }
        };
        fs::rename(&tmp_dir, &final_dir)?;
        self.write_pointer(run_id, LATEST_POINTER, step)?;

        tracing::info!(run_id, step, directory = %final_dir.display(), "checkpoint saved");
        Ok(CheckpointHandle {
            run_id: run_id.to_string(),
            step,
            directory: final_dir,
            manifest,
        })
    }

    /// Point `best` at an existing step.
    pub fn mark_best(&self, run_id: &str, step: usize) -> Result<(), TrainingError> {
        if !self.run_dir(run_id).join(step_dir_name(step)).join(MANIFEST_FILENAME).is_file() {
            return Err(TrainingError::CheckpointNotFound(format!(
                "run '{run_id}' has no checkpoint at step {step}"
            )));
        }
        self.write_pointer(run_id, BEST_POINTER, step)
    }

    /// Completed checkpoint steps of a run, ascending.
    pub fn list(&self, run_id: &str) -> Result<Vec<usize>, TrainingError> {
        let run_dir = self.run_dir(run_id);
        if !run_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut steps = Vec::new();
        for entry in fs::read_dir(&run_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(step) = name
                .to_str()
                .and_then(|name| name.strip_prefix(STEP_PREFIX))
                .and_then(|digits| digits.parse::<usize>().ok())
            else {
                continue;
            };
            if entry.path().join(MANIFEST_FILENAME).is_file() {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    pub fn resolve(&self, run_id: &str, selector: CheckpointSelector) -> Result<CheckpointHandle, TrainingError> {
        let not_found = || {
            TrainingError::CheckpointNotFound(format!(
                "run '{run_id}' has no '{selector}' checkpoint under {}",
                self.root.display()
            ))
        };
        let step = match selector {
            CheckpointSelector::Step(step) => step,
            CheckpointSelector::Best => self.read_pointer(run_id, BEST_POINTER)?.ok_or_else(not_found)?,
            CheckpointSelector::Latest => match self.read_pointer(run_id, LATEST_POINTER)? {
                Some(step) => step,
                // A crash between the rename and the pointer write leaves a
                // complete directory without a pointer.
                None => *self.list(run_id)?.last().ok_or_else(not_found)?,
            },
        };

        let directory = self.run_dir(run_id).join(step_dir_name(step));
        if !directory.join(MANIFEST_FILENAME).is_file() {
            return Err(not_found());
        }
        let manifest: CheckpointManifest = read_json(&directory.join(MANIFEST_FILENAME))?;
        Ok(CheckpointHandle {
            run_id: run_id.to_string(),
            step,
            directory,
            manifest,
        })
    }

    /// Resolve and read a checkpoint, verifying every file against its
    /// recorded digest. Tensors are placed on `device`.
    pub fn load(&self, run_id: &str, selector: CheckpointSelector, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
        let handle = self.resolve(run_id, selector)?;
        let manifest = &handle.manifest;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(TrainingError::restore(format!(
                "unsupported checkpoint version {} (expected {})",
                manifest.version, CHECKPOINT_VERSION
            )));
        }

        let model_path = verified(&handle.directory, &manifest.model)?;
        let optimizer_path = verified(&handle.directory, &manifest.optimizer)?;
        let scheduler_path = verified(&handle.directory, &manifest.scheduler)?;

        let tensors = safetensors::load(&model_path, device)
            .map_err(|err| TrainingError::restore(format!("{}: {err}", model_path.display())))?;
        let optimizer = read_json(&optimizer_path)?;
        let scheduler = read_json(&scheduler_path)?;

        Ok(LoadedCheckpoint {
            handle,
            tensors,
            optimizer,
            scheduler,
        })
    }

    fn write_pointer(&self, run_id: &str, name: &str, step: usize) -> Result<(), TrainingError> {
        let run_dir = self.run_dir(run_id);
        let pointer = Pointer {
            step,
            directory: step_dir_name(step),
            updated_unix_timestamp: unix_timestamp(),
        };
        let tmp = run_dir.join(format!("{TMP_PREFIX}{name}"));
        write_json(&tmp, &pointer)?;
        fs::rename(&tmp, run_dir.join(name))?;
        Ok(())
    }

    fn read_pointer(&self, run_id: &str, name: &str) -> Result<Option<usize>, TrainingError> {
        let path = self.run_dir(run_id).join(name);
        if !path.is_file() {
            return Ok(None);
        }
        let pointer: Pointer = read_json(&path)?;
        Ok(Some(pointer.step))
    }
}

fn write_contents(
    directory: &Path,
    run_id: &str,
    step: usize,
    snapshot: &TrainingSnapshot,
) -> Result<CheckpointManifest, TrainingError> {
    if snapshot.tensors.is_empty() {
        return Err(TrainingError::runtime("snapshot contains no parameters"));
    }
    let model_path = directory.join(MODEL_FILENAME);
    let tensors: HashMap<String, Tensor> = snapshot.tensors.iter().cloned().collect();
    safetensors::save(&tensors, &model_path)?;

    let optimizer_path = directory.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &snapshot.optimizer)?;
    let scheduler_path = directory.join(SCHEDULER_FILENAME);
    write_json(&scheduler_path, &snapshot.scheduler)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        run_id: run_id.to_string(),
        step,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: snapshot.config_sha256.clone(),
        seed: snapshot.seed,
        model: file_record(&model_path)?,
        optimizer: file_record(&optimizer_path)?,
        scheduler: file_record(&scheduler_path)?,
        progress: snapshot.progress,
        architecture: snapshot.architecture.clone(),
        evaluation_loss: snapshot.evaluation_loss,
    };
    write_json(&directory.join(MANIFEST_FILENAME), &manifest)?;
    Ok(manifest)
}

/// Overwrite every parameter in `named` from `tensors`. Names and shapes must
/// match exactly in both directions.
pub fn restore_parameters(named: &[(String, Var)], tensors: &HashMap<String, Tensor>) -> Result<(), TrainingError> {
    let staged = stage(named, tensors, |_| true)?;
    if staged.len() != tensors.len() {
        let mut extra: Vec<&str> = tensors
            .keys()
            .filter(|name| !named.iter().any(|(own, _)| own == *name))
            .map(String::as_str)
            .collect();
        extra.sort_unstable();
        return Err(TrainingError::restore(format!(
            "checkpoint contains parameters the model does not have: {}",
            extra.join(", ")
        )));
    }
    commit(staged)
}

/// Copy only the encoder parameters from `tensors`; anything under the head
/// prefix of the source is ignored. Returns how many tensors were applied.
pub fn seed_encoder(named: &[(String, Var)], tensors: &HashMap<String, Tensor>) -> Result<usize, TrainingError> {
    let prefix = format!("{ENCODER_PREFIX}.");
    let staged = stage(named, tensors, |name| name.starts_with(&prefix))?;
    if staged.is_empty() {
        return Err(TrainingError::restore("model has no encoder parameters to seed"));
    }
    let count = staged.len();
    commit(staged)?;
    Ok(count)
}

fn stage<'a>(
    named: &'a [(String, Var)],
    tensors: &HashMap<String, Tensor>,
    include: impl Fn(&str) -> bool,
) -> Result<Vec<(&'a Var, Tensor)>, TrainingError> {
    let mut staged = Vec::new();
    for (name, var) in named.iter().filter(|(name, _)| include(name)) {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| TrainingError::restore(format!("checkpoint missing parameter '{name}'")))?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::restore(format!(
                "parameter '{name}' has shape {:?} in the checkpoint but {:?} in the model",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let tensor = tensor
            .to_dtype(var.as_tensor().dtype())?
            .to_device(var.as_tensor().device())?;
        staged.push((var, tensor));
    }
    Ok(staged)
}

fn commit(staged: Vec<(&Var, Tensor)>) -> Result<(), TrainingError> {
    for (var, tensor) in staged {
        var.set(&tensor)?;
    }
    Ok(())
}

fn step_dir_name(step: usize) -> String {
    format!("{STEP_PREFIX}{step:012}")
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: path.metadata()?.len(),
    })
}

fn verified(directory: &Path, record: &FileRecord) -> Result<PathBuf, TrainingError> {
    let path = directory.join(&record.filename);
    if !path.is_file() {
        return Err(TrainingError::restore(format!("missing {}", path.display())));
    }
    if sha256_file(&path)? != record.sha256 {
        return Err(TrainingError::restore(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(path)
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path)?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path)?;
    serde_json::from_reader(file)
        .map_err(|err| TrainingError::restore(format!("failed to parse {}: {err}", path.display())))
}
