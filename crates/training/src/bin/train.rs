use std::{
    path::PathBuf,
    process,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use serde_json::{Number, Value};
use tracing_subscriber::EnvFilter;
use training::{CheckpointSelector, Trainer, TrainingConfig, TrainingError};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => {}
        Err(CliError::Setup(err)) => {
            eprintln!("training failed to start: {err}");
            process::exit(1);
        }
        Err(CliError::Run(failure)) => {
            eprintln!("{failure}");
            match &failure.last_checkpoint {
                Some(path) => eprintln!("last valid checkpoint: {}", path.display()),
                None => eprintln!("no checkpoint was written"),
            }
            process::exit(2);
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Contrastive pretraining and hierarchical fine-tuning", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file (TOML or JSON)")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        long,
        value_name = "SELECTOR",
        num_args = 0..=1,
        default_missing_value = "latest",
        help = "Resume this run from a checkpoint: latest, best or a step number"
    )]
    resume: Option<CheckpointSelector>,

    #[arg(long, value_name = "FOLD", help = "Hold out this fold for evaluation")]
    fold: Option<usize>,
}

enum CliError {
    Setup(TrainingError),
    Run(training::RunFailure),
}

impl From<TrainingError> for CliError {
    fn from(value: TrainingError) -> Self {
        CliError::Setup(value)
    }
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), CliError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(fold) = args.fold {
        config.data.validation_fold = Some(fold);
    }
    if let Some(selector) = args.resume {
        config.runtime.restore_checkpoint_selector = Some(selector);
    }
    config.validate()?;

    let mut trainer = Trainer::new(config)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let outcome = trainer.train_with_shutdown(&*shutdown_flag).map_err(CliError::Run)?;
    tracing::info!(
        run_id = %outcome.run_id,
        steps = outcome.steps,
        total_steps = outcome.total_steps,
        cancelled = outcome.cancelled,
        best_evaluation_loss = ?outcome.best_evaluation_loss,
        checkpoint = ?outcome.last_checkpoint,
        "training finished"
    );
    Ok(())
}

fn apply_overrides(config: TrainingConfig, overrides: &[OverrideArg]) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config)?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("invalid configuration after overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{path}'"
        )));
    }

    let mut current = value;
    for (index, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::ConfigFormat(format!(
                "override path segment '{segment}' points into a non-object value"
            ))
        })?;
        if index + 1 == segments.len() {
            map.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(())
}
