//! Best-loss checkpointing of the student.
//!
//! Layout of a saved directory:
//!
//! ```text
//! <dir>/model.safetensors
//! <dir>/config.json
//! <dir>/tokenizer.json
//! <dir>/checkpoint.json   {"epoch": N, "loss": L}
//! ```
//!
//! Per-epoch checkpoints go to `output_dir/epoch-<N>` (N is 1-based); the
//! final model is written straight into `output_dir`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use cad0_core::{CausalLm, Tokenizer};

use crate::error::DistillResult;

pub const CHECKPOINT_META_FILE: &str = "checkpoint.json";

/// A checkpoint that was written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub path: PathBuf,
    /// 0-based epoch index.
    pub epoch_index: usize,
    pub loss: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// 1-based epoch number.
    pub epoch: usize,
    pub loss: f32,
}

impl CheckpointMeta {
    pub fn read(dir: &Path) -> DistillResult<Self> {
        let text = std::fs::read_to_string(dir.join(CHECKPOINT_META_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Tracks the best epoch loss and saves only on strict improvement.
///
/// Every worker keeps the same `best_loss` (epoch losses are global), but
/// only the main worker touches the filesystem.
#[derive(Debug)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    is_main: bool,
    best_loss: f32,
    saved: Vec<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(output_dir: impl Into<PathBuf>, is_main: bool) -> Self {
        Self { output_dir: output_dir.into(), is_main, best_loss: f32::INFINITY, saved: Vec::new() }
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    /// Checkpoints written so far, in order; their losses strictly decrease.
    pub fn saved(&self) -> &[Checkpoint] {
        &self.saved
    }

    pub fn epoch_dir(&self, epoch_index: usize) -> PathBuf {
        self.output_dir.join(format!("epoch-{}", epoch_index + 1))
    }

    /// Save `model` if `loss` beats every earlier epoch.
    ///
    /// Returns the new checkpoint, or `None` when the loss did not improve
    /// or this worker is not the main one.
    pub fn consider(
        &mut self,
        epoch_index: usize,
        loss: f32,
        model: &dyn CausalLm,
        tokenizer: &Tokenizer,
    ) -> DistillResult<Option<Checkpoint>> {
        if !(loss < self.best_loss) {
            info!(epoch = epoch_index + 1, loss, best_loss = self.best_loss, "No improvement; checkpoint skipped");
            return Ok(None);
        }
        self.best_loss = loss;
        if !self.is_main {
            return Ok(None);
        }

        let path = self.epoch_dir(epoch_index);
        write_model_dir(&path, model, tokenizer, Some(CheckpointMeta { epoch: epoch_index + 1, loss }))?;
        info!(epoch = epoch_index + 1, loss, path = %path.display(), "Saved best checkpoint");

        let checkpoint = Checkpoint { path, epoch_index, loss };
        self.saved.push(checkpoint.clone());
        Ok(Some(checkpoint))
    }

    /// Write the final student into `output_dir` (main worker only).
    pub fn save_final(&self, model: &dyn CausalLm, tokenizer: &Tokenizer) -> DistillResult<Option<PathBuf>> {
        if !self.is_main {
            return Ok(None);
        }
        write_model_dir(&self.output_dir, model, tokenizer, None)?;
        info!(path = %self.output_dir.display(), "Saved final student model");
        Ok(Some(self.output_dir.clone()))
    }
}

fn write_model_dir(
    dir: &Path,
    model: &dyn CausalLm,
    tokenizer: &Tokenizer,
    meta: Option<CheckpointMeta>,
) -> DistillResult<()> {
    std::fs::create_dir_all(dir)?;
    model.save(dir)?;
    tokenizer.save(dir)?;
    if let Some(meta) = meta {
        std::fs::write(dir.join(CHECKPOINT_META_FILE), serde_json::to_string_pretty(&meta)?)?;
    }
    Ok(())
}
