//! Run configuration for a distillation job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DistillError, DistillResult};

/// Output directory used when none is configured.
pub const DEFAULT_OUTPUT_DIR: &str = "checkpoints/cad0-mini";

/// Hyper-parameters and paths for a distillation run.
///
/// Optional values stay `Option` here and are resolved once by the
/// orchestrator at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    /// Directory holding the teacher's `config.json`, `model.safetensors`
    /// and `tokenizer.json`.
    pub teacher_model_ref: PathBuf,
    /// Same layout for the student's starting point.
    pub student_model_ref: PathBuf,
    /// JSONL file of `{"text", "ir"}` records.
    pub train_file: PathBuf,
    pub output_dir: Option<PathBuf>,

    pub num_epochs: usize,
    /// Per-worker batch size.
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Softmax temperature applied to both models' logits in the
    /// distillation term.
    pub temperature: f64,
    /// Weight of the distillation term; `1 - alpha` weights the task loss.
    pub alpha: f64,
    pub max_seq_length: usize,
    /// Keep only the first N records after filtering.
    pub max_samples: Option<usize>,
    pub use_metrics_sink: bool,

    /// Base seed; epoch `e` shuffles with `seed + e`.
    pub seed: u64,
    pub max_grad_norm: f64,
    /// Fraction of total steps spent in linear warmup.
    pub warmup_ratio: f64,
    pub log_every: usize,
    pub heartbeat_every: usize,
    pub min_examples: usize,
    pub collective_timeout_secs: u64,
    pub prefer_gpu: bool,
    /// Override for the number of visible accelerators (auto-detected when
    /// `None`).
    pub accelerators: Option<usize>,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            teacher_model_ref: PathBuf::new(),
            student_model_ref: PathBuf::new(),
            train_file: PathBuf::from("data/train.jsonl"),
            output_dir: None,
            num_epochs: 3,
            batch_size: 16,
            learning_rate: 5e-5,
            weight_decay: 0.01,
            temperature: 2.0,
            alpha: 0.5,
            max_seq_length: 256,
            max_samples: None,
            use_metrics_sink: true,
            seed: 42,
            max_grad_norm: 1.0,
            warmup_ratio: 0.1,
            log_every: 50,
            heartbeat_every: 500,
            min_examples: 1,
            collective_timeout_secs: 1800,
            prefer_gpu: true,
            accelerators: None,
        }
    }
}

impl DistillConfig {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_secs(self.collective_timeout_secs)
    }

    /// Reject values the training loop cannot run with.
    pub fn validate(&self) -> DistillResult<()> {
        require_path("teacher_model_ref", &self.teacher_model_ref)?;
        require_path("student_model_ref", &self.student_model_ref)?;
        require_path("train_file", &self.train_file)?;

        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(DistillError::config("temperature", "must be a finite value > 0"));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(DistillError::config("alpha", "must be within [0, 1]"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(DistillError::config("learning_rate", "must be a finite value > 0"));
        }
        if !(self.weight_decay >= 0.0 && self.weight_decay.is_finite()) {
            return Err(DistillError::config("weight_decay", "must be >= 0"));
        }
        if !(self.max_grad_norm > 0.0 && self.max_grad_norm.is_finite()) {
            return Err(DistillError::config("max_grad_norm", "must be a finite value > 0"));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(DistillError::config("warmup_ratio", "must be within [0, 1]"));
        }
        for (field, value) in [
            ("num_epochs", self.num_epochs),
            ("batch_size", self.batch_size),
            ("log_every", self.log_every),
            ("heartbeat_every", self.heartbeat_every),
        ] {
            if value == 0 {
                return Err(DistillError::config(field, "must be > 0"));
            }
        }
        if self.max_seq_length < 2 {
            return Err(DistillError::config("max_seq_length", "must be >= 2"));
        }
        if self.max_samples == Some(0) {
            return Err(DistillError::config("max_samples", "must be > 0 when set"));
        }
        if self.collective_timeout_secs == 0 {
            return Err(DistillError::config("collective_timeout_secs", "must be > 0"));
        }
        Ok(())
    }
}

fn require_path(field: &str, path: &Path) -> DistillResult<()> {
    if path.as_os_str().is_empty() {
        return Err(DistillError::config(field, "must be set"));
    }
    Ok(())
}
