use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use labeled_data::{
    write_fold_set, DataError, FoldPipeline, HashedWordEncoder, LabelHierarchy, RawExample,
    TokenEncoder,
};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing_subscriber::EnvFilter;

/// One input line: `{"text": "...", "labels": ["section", "label"]}` with
/// labels ordered root to leaf.
#[derive(Debug, Deserialize)]
struct InputLine {
    text: String,
    labels: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Tokenize labeled sentences into stratified fold files")]
struct Args {
    /// JSON-lines corpus.
    #[arg(long)]
    input: PathBuf,

    /// Output directory for partition files and manifest.
    #[arg(long)]
    output: PathBuf,

    /// tokenizer.json; feature hashing is used when omitted.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    #[arg(long, default_value_t = 30_000)]
    hashed_vocab_size: u32,

    #[arg(long, default_value_t = 5)]
    k_folds: usize,

    #[arg(long, default_value_t = 0.0)]
    test_rate: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 128)]
    max_length: usize,

    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), DataError> {
    let args = Args::parse();

    let lines = read_corpus(&args.input)?;
    let hierarchy = LabelHierarchy::from_paths(lines.iter().map(|line| line.labels.clone()))?;
    tracing::info!(
        examples = lines.len(),
        depth = hierarchy.depth(),
        leaves = hierarchy.leaf_count(),
        "loaded corpus"
    );

    let raw: Vec<RawExample> = lines
        .into_iter()
        .map(|line| RawExample {
            text: line.text,
            label: line.labels.last().cloned().unwrap_or_default(),
        })
        .collect();

    let encoder: Arc<dyn TokenEncoder> = match &args.tokenizer {
        Some(path) => Arc::new(Tokenizer::from_file(path).map_err(|err| {
            DataError::InvalidConfig(format!("failed to load tokenizer {}: {err}", path.display()))
        })?),
        None => Arc::new(HashedWordEncoder::new(args.hashed_vocab_size)),
    };

    let hierarchy = Arc::new(hierarchy);
    let pipeline = FoldPipeline::new(encoder, hierarchy.clone(), args.max_length, args.workers);
    let build = pipeline.build(&raw, args.k_folds, args.test_rate, args.seed)?;
    let manifest = write_fold_set(&build, &hierarchy, args.max_length, &args.output)?;

    tracing::info!(
        partitions = manifest.partitions.len(),
        dropped = manifest.dropped.total(),
        output = %args.output.display(),
        "fold set written"
    );
    Ok(())
}

fn read_corpus(path: &PathBuf) -> Result<Vec<InputLine>, DataError> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines.push(serde_json::from_str(&line)?);
    }
    Ok(lines)
}
