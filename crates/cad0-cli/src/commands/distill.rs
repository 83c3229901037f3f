//! `cad0 distill`: train a student on the teacher's soft targets.
//!
//! ## Single worker
//! ```text
//! cad0 distill \
//!   --teacher    ./models/cad0-7b \
//!   --student    ./models/cad0-mini-init \
//!   --train-file data/train.jsonl
//! ```
//!
//! ## Multiple workers
//! Start one process per worker, each with `RANK`, `LOCAL_RANK`,
//! `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT` set.  Every worker needs two
//! accelerators: student on `2 * LOCAL_RANK`, teacher on `2 * LOCAL_RANK + 1`.
//!
//! ## Dataset format
//! Each line of `--train-file` must be:
//! ```json
//! {"text": "...", "ir": "..."}
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use cad0_distill::{DistillConfig, Distiller};

use crate::config::{expand_path, AppConfig};

/// Command-line overrides for the `[distill]` configuration section.
#[derive(Debug, Default, Args)]
pub struct DistillArgs {
    /// Teacher model directory in the Hugging Face layout (config.json,
    /// single or sharded safetensors, tokenizer.json).
    #[arg(long, value_name = "DIR")]
    pub teacher: Option<PathBuf>,

    /// Student model directory used as the starting point.
    #[arg(long, value_name = "DIR")]
    pub student: Option<PathBuf>,

    /// JSONL training file of {"text", "ir"} records.
    #[arg(long, value_name = "FILE")]
    pub train_file: Option<PathBuf>,

    /// Where checkpoints, the final student and metrics.jsonl are written
    /// (default checkpoints/cad0-mini).
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Number of training epochs (default 3).
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Per-worker batch size (default 16).
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Peak AdamW learning rate (default 5e-5).
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Distillation softmax temperature (default 2.0).
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Weight of the distillation term, 0 to 1 (default 0.5).
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Token length every example is truncated or padded to (default 256).
    #[arg(long)]
    pub max_seq_length: Option<usize>,

    /// Only use the first N records of the training file.
    #[arg(long)]
    pub max_samples: Option<usize>,

    /// Shuffle seed (default 42).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Disable metrics.jsonl output.
    #[arg(long)]
    pub no_metrics: bool,

    /// Train on the CPU even when accelerators are available.
    #[arg(long)]
    pub cpu: bool,
}

impl DistillArgs {
    /// Layer these flags over `base` and expand `~` in every path.
    pub fn apply(self, mut base: DistillConfig) -> DistillConfig {
        if let Some(v) = self.teacher {
            base.teacher_model_ref = v;
        }
        if let Some(v) = self.student {
            base.student_model_ref = v;
        }
        if let Some(v) = self.train_file {
            base.train_file = v;
        }
        if let Some(v) = self.output_dir {
            base.output_dir = Some(v);
        }
        if let Some(v) = self.epochs {
            base.num_epochs = v;
        }
        if let Some(v) = self.batch_size {
            base.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            base.learning_rate = v;
        }
        if let Some(v) = self.temperature {
            base.temperature = v;
        }
        if let Some(v) = self.alpha {
            base.alpha = v;
        }
        if let Some(v) = self.max_seq_length {
            base.max_seq_length = v;
        }
        if self.max_samples.is_some() {
            base.max_samples = self.max_samples;
        }
        if let Some(v) = self.seed {
            base.seed = v;
        }
        if self.no_metrics {
            base.use_metrics_sink = false;
        }
        if self.cpu {
            base.prefer_gpu = false;
        }

        base.teacher_model_ref = expand_path(&base.teacher_model_ref);
        base.student_model_ref = expand_path(&base.student_model_ref);
        base.train_file = expand_path(&base.train_file);
        base.output_dir = base.output_dir.as_deref().map(expand_path);
        base
    }
}

// ── Main entry point ──────────────────────────────────────────────────────────

pub async fn run(args: DistillArgs, config: &AppConfig) -> Result<()> {
    let distill_config = args.apply(config.distill.clone());
    distill_config
        .validate()
        .context("Invalid distillation configuration")?;

    let output_dir = distill_config.output_dir();
    info!(
        teacher = %distill_config.teacher_model_ref.display(),
        student = %distill_config.student_model_ref.display(),
        train_file = %distill_config.train_file.display(),
        output_dir = %output_dir.display(),
        "Starting distillation run"
    );

    let distiller = Distiller::new(distill_config);
    let cancel = distiller.cancel_flag();
    let mut worker = tokio::task::spawn_blocking(move || distiller.run());

    let joined = tokio::select! {
        res = &mut worker => res,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received; stopping after the current step");
            cancel.store(true, Ordering::Relaxed);
            worker.await
        }
    };
    let report = joined
        .context("Distillation worker panicked")?
        .context("Distillation failed")?;

    let best = report
        .checkpoints
        .iter()
        .map(|c| c.loss)
        .fold(f32::INFINITY, f32::min);
    let final_loss = report.epochs.last().map(|e| e.avg_loss).unwrap_or(f32::NAN);

    match &report.final_dir {
        Some(dir) => println!(
            "\nDistillation complete!\n\
             Output: {}\n\
             Epochs: {}  Steps: {}\n\
             Final epoch loss: {:.4}  Best: {:.4} ({} checkpoint(s))\n\
             Elapsed: {:.1} s",
            dir.display(),
            report.epochs.len(),
            report.total_steps,
            final_loss,
            best,
            report.checkpoints.len(),
            report.elapsed_secs,
        ),
        None => info!(
            steps = report.total_steps,
            elapsed = format!("{:.1}s", report.elapsed_secs),
            "Worker finished"
        ),
    }

    Ok(())
}
