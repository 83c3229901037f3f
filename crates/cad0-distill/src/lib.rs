//! # cad0-distill
//!
//! Knowledge distillation of a large CAD "Compact IR" teacher into a small
//! student.
//!
//! Every worker loads both models, reconciles their vocabularies, trains its
//! shard of the data with a blend of temperature-scaled KL divergence and
//! next-token cross-entropy, and averages gradients with its peers after
//! every backward pass.  The main worker keeps the best checkpoint per epoch
//! and writes the final student.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`config`] | [`DistillConfig`] and its validation |
//! | [`vocab`] | Embedding-size reconciliation and canonical tokenizer choice |
//! | [`models`] | Teacher/student handles loaded from Hugging Face model directories |
//! | [`dataset`] | JSONL loading, prompt rendering, label masking, batching |
//! | [`sampler`] | Seeded per-epoch shuffle and per-worker shards |
//! | [`dist`] | Worker identity, device placement and collectives over TCP |
//! | [`loss`] | Distillation, task and combined losses |
//! | [`schedule`] | Linear warmup + cosine learning-rate schedule |
//! | [`trainer`] | The per-step / per-epoch training loop |
//! | [`checkpoint`] | Best-loss checkpointing and the final save |
//! | [`metrics`] | Fire-and-forget metrics sinks |
//! | [`distiller`] | [`Distiller`], which runs all of the above |
//!
//! ## Usage
//!
//! ```text
//! cad0 distill \
//!   --teacher   ./models/cad0-7b \
//!   --student   ./models/cad0-mini-init \
//!   --train-file data/train.jsonl \
//!   --output-dir checkpoints/cad0-mini
//! ```
//!
//! Multi-worker runs start one process per worker with `RANK`,
//! `LOCAL_RANK`, `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT` set.

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod dist;
pub mod distiller;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod models;
pub mod sampler;
pub mod schedule;
pub mod trainer;
pub mod vocab;

#[cfg(test)]
mod testing;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::DistillConfig;
pub use dataset::{Dataset, TokenizedExample, TrainingExample};
pub use dist::{DistributedContext, DistributedError, WorkerIdentity};
pub use distiller::{Distiller, RunReport};
pub use error::{DistillError, DistillResult, ErrorClass};
pub use metrics::{JsonlSink, MetricsRecord, MetricsSink, NoopSink, RecordingSink};
pub use trainer::{EpochSummary, Phase};
pub use vocab::{TokenizerSource, VocabPlan};
