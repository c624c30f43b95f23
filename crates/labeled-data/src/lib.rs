//! Labeled sentence data: hierarchy, tokenization, stratified folds and
//! per-partition record streams.

pub mod errors;
pub mod fold_set;
pub mod folds;
pub mod hierarchy;
pub mod pipeline;
pub mod preprocessing;
pub mod records;
pub mod workers;

pub use errors::{DataError, Result};
pub use fold_set::{write_fold_set, FoldManifest, PartitionReader};
pub use folds::{assign_folds, FoldAssignment, PartitionId};
pub use hierarchy::LabelHierarchy;
pub use pipeline::{DropSummary, Example, FoldBuild, FoldPipeline, RawExample};
pub use preprocessing::{normalize_text, HashedWordEncoder, TokenEncoder, TokenizedText};
pub use records::{ExampleRecord, RecordReader, RecordWriter};
