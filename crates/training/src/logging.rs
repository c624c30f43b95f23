use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use labeled_data::RecordWriter;
use prost::Message;

use crate::{
    metrics::{EvaluationSummary, StepSnapshot},
    trainer::TrainerPhase,
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &crate::config::LoggingConfig) -> Self {
        Self {
            enable_stdout: config.stdout,
            tensorboard_dir: config.tensorboard_dir.clone(),
            tensorboard_flush_every_n: config.flush_every_n.max(1),
        }
    }
}

/// Structured progress reporting. Console output goes through `tracing`;
/// scalars are mirrored to a TensorBoard event file when a directory is set.
pub struct Logger {
    run_id: String,
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(run_id: &str, settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                &dir.join(run_id),
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            run_id: run_id.to_string(),
            settings,
            tensorboard,
        })
    }

    pub fn log_phase(&self, from: TrainerPhase, to: TrainerPhase, step: usize) {
        tracing::debug!(run_id = %self.run_id, ?from, ?to, step, "phase transition");
    }

    pub fn log_training_step(&mut self, step: usize, lr: f64, snapshot: &StepSnapshot) {
        if self.settings.enable_stdout {
            tracing::info!(
                run_id = %self.run_id,
                step,
                loss = format_args!("{:.4}", snapshot.step_loss),
                loss_ema = format_args!("{:.4}", snapshot.loss),
                examples = snapshot.examples,
                examples_per_sec = format_args!("{:.1}", snapshot.examples_per_sec),
                grad_norm = format_args!("{:.3}", snapshot.raw_grad_norm),
                lr = format_args!("{:.5e}", lr),
                "train"
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            writer.scalar("train/loss", step, snapshot.step_loss);
            writer.scalar("train/loss_ema", step, snapshot.loss);
            writer.scalar("train/examples_per_sec", step, snapshot.examples_per_sec);
            writer.scalar("train/grad_norm", step, snapshot.raw_grad_norm);
            writer.scalar("train/learning_rate", step, lr);
        }
    }

    pub fn log_evaluation(&mut self, step: usize, summary: &EvaluationSummary) {
        if self.settings.enable_stdout {
            tracing::info!(
                run_id = %self.run_id,
                step,
                loss = format_args!("{:.4}", summary.average_loss),
                examples = summary.examples,
                "eval"
            );
            for level in &summary.levels {
                tracing::info!(
                    run_id = %self.run_id,
                    step,
                    level = level.level,
                    accuracy = format_args!("{:.4}", level.accuracy),
                    micro_f1 = format_args!("{:.4}", level.micro_f1),
                    macro_f1 = format_args!("{:.4}", level.macro_f1),
                    "eval level"
                );
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            writer.scalar("eval/loss", step, summary.average_loss);
            for level in &summary.levels {
                writer.scalar(&format!("eval/level_{}/accuracy", level.level), step, level.accuracy);
                writer.scalar(&format!("eval/level_{}/micro_f1", level.level), step, level.micro_f1);
                writer.scalar(&format!("eval/level_{}/macro_f1", level.level), step, level.macro_f1);
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            writer.flush();
        }
    }
}

struct TensorBoardWriter {
    records: RecordWriter<BufWriter<File>>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_wall_time() as u64,
            hostname()
        );
        let records = RecordWriter::create(&dir.join(filename))?;
        Ok(Self {
            records,
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    /// Event-file failures are reported and otherwise ignored; losing a
    /// scalar never stops a run.
    fn scalar(&mut self, tag: &str, step: i64, value: f64) {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        if let Err(err) = self.records.write_message(&event) {
            tracing::warn!(%err, tag, "failed to write tensorboard event");
            return;
        }
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if let Err(err) = self.records.flush() {
            tracing::warn!(%err, "failed to flush tensorboard file");
        }
        self.pending = 0;
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
