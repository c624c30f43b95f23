use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{integrity, DataError, Result};
use crate::folds::PartitionId;
use crate::hierarchy::LabelHierarchy;
use crate::pipeline::{DropSummary, Example, FoldBuild};
use crate::records::{ExampleRecord, RecordReader, RecordWriter};

pub const MANIFEST_FILE: &str = "folds.json";
pub const HIERARCHY_FILE: &str = "hierarchy.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub partition: PartitionId,
    pub filename: String,
    pub examples: usize,
}

/// Index of a written fold set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldManifest {
    pub k_folds: usize,
    pub test_rate: f64,
    pub max_length: usize,
    pub seed: u64,
    pub partitions: Vec<PartitionEntry>,
    pub dropped: DropSummary,
    #[serde(skip)]
    pub directory: PathBuf,
}

impl FoldManifest {
    pub fn load(directory: &Path) -> Result<Self> {
        let bytes = fs::read(directory.join(MANIFEST_FILE))?;
        let mut manifest: Self = serde_json::from_slice(&bytes)?;
        manifest.directory = directory.to_path_buf();
        Ok(manifest)
    }

    pub fn hierarchy(&self) -> Result<LabelHierarchy> {
        LabelHierarchy::load(&self.directory.join(HIERARCHY_FILE))
    }

    pub fn entry(&self, partition: PartitionId) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|entry| entry.partition == partition)
    }

    pub fn partition_path(&self, partition: PartitionId) -> Result<PathBuf> {
        self.entry(partition)
            .map(|entry| self.directory.join(&entry.filename))
            .ok_or_else(|| {
                DataError::InvalidConfig(format!(
                    "fold set {} has no partition {partition:?}",
                    self.directory.display()
                ))
            })
    }

    pub fn open(&self, partition: PartitionId) -> Result<PartitionReader> {
        PartitionReader::open(&self.partition_path(partition)?)
    }

    /// All fold partitions except `validation_fold`, in fold order.
    pub fn training_partitions(&self, validation_fold: Option<usize>) -> Vec<PartitionId> {
        (0..self.k_folds)
            .filter(|fold| Some(*fold) != validation_fold)
            .map(PartitionId::Fold)
            .collect()
    }
}

/// Lazy decoder over one partition file.
pub struct PartitionReader {
    records: RecordReader<BufReader<File>>,
}

impl PartitionReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            records: RecordReader::open(path)?,
        })
    }
}

impl Iterator for PartitionReader {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.records.next_message::<ExampleRecord>() {
            Ok(Some(record)) => Some(Example::from_record(record)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

fn partition_filename(partition: PartitionId) -> String {
    match partition {
        PartitionId::Fold(index) => format!("fold-{index:05}.records"),
        PartitionId::Test => "test.records".to_string(),
    }
}

fn write_partition(path: &Path, examples: &[Example]) -> Result<usize> {
    let mut writer = RecordWriter::create(path)?;
    for example in examples {
        writer.write_message(&example.to_record())?;
    }
    writer.flush()?;
    Ok(writer.written())
}

/// Write one self-contained record file per partition plus the hierarchy and
/// manifest. Returns the manifest describing what was written.
pub fn write_fold_set(
    build: &FoldBuild,
    hierarchy: &LabelHierarchy,
    max_length: usize,
    destination: &Path,
) -> Result<FoldManifest> {
    fs::create_dir_all(destination)?;
    if destination.join(MANIFEST_FILE).exists() {
        return Err(integrity(format!(
            "fold set already exists at {}",
            destination.display()
        )));
    }

    let mut partitions = Vec::with_capacity(build.folds.len() + 1);
    let with_ids = build
        .folds
        .iter()
        .enumerate()
        .map(|(index, examples)| (PartitionId::Fold(index), examples))
        .chain(build.test.iter().map(|examples| (PartitionId::Test, examples)));

    for (partition, examples) in with_ids {
        let filename = partition_filename(partition);
        let written = write_partition(&destination.join(&filename), examples)?;
        tracing::info!(?partition, examples = written, file = %filename, "wrote partition");
        partitions.push(PartitionEntry {
            partition,
            filename,
            examples: written,
        });
    }

    hierarchy.save(&destination.join(HIERARCHY_FILE))?;

    let manifest = FoldManifest {
        k_folds: build.folds.len(),
        test_rate: build.test_rate,
        max_length,
        seed: build.seed,
        partitions,
        dropped: build.dropped.clone(),
        directory: destination.to_path_buf(),
    };
    fs::write(
        destination.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(&manifest)?,
    )?;
    Ok(manifest)
}
