//! Run orchestration: from configuration to a saved student.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use cad0_core::accelerator_count;

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::DistillConfig;
use crate::dataset::Dataset;
use crate::dist::{DevicePlan, DistributedContext, WorkerIdentity};
use crate::error::{DistillError, DistillResult};
use crate::metrics::{JsonlSink, MetricsRecord, MetricsSink, NoopSink};
use crate::models::{ModelHandle, ModelPair};
use crate::sampler::ShardSampler;
use crate::trainer::{EpochSummary, Progress, Trainer};
use crate::vocab;

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub epochs: Vec<EpochSummary>,
    /// Checkpoints written by this worker (empty on non-main workers).
    pub checkpoints: Vec<Checkpoint>,
    pub total_steps: usize,
    pub elapsed_secs: f64,
    /// Where the final student was written; `None` on non-main workers.
    pub final_dir: Option<PathBuf>,
}

/// Where a run stood when it stopped.
struct RunState {
    stage: &'static str,
    progress: Progress,
    is_main: bool,
    sink: Arc<dyn MetricsSink>,
}

/// Drives one distillation run for this worker.
pub struct Distiller {
    config: DistillConfig,
    identity: Option<WorkerIdentity>,
    sink: Option<Arc<dyn MetricsSink>>,
    cancel: Arc<AtomicBool>,
}

impl Distiller {
    pub fn new(config: DistillConfig) -> Self {
        Self { config, identity: None, sink: None, cancel: Arc::new(AtomicBool::new(false)) }
    }

    /// Use this identity instead of reading `RANK`/`WORLD_SIZE`/… from the
    /// environment.
    pub fn with_identity(mut self, identity: WorkerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Replace the sink chosen from `use_metrics_sink`.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Setting this flag makes the training loop stop at the next step.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(&self) -> DistillResult<RunReport> {
        let mut state = RunState {
            stage: "setup",
            progress: Progress::default(),
            is_main: true,
            sink: Arc::new(NoopSink),
        };
        match self.execute(&mut state) {
            Ok(report) => Ok(report),
            Err(e) => {
                report_failure(&e, &state);
                Err(e)
            }
        }
    }

    fn execute(&self, state: &mut RunState) -> DistillResult<RunReport> {
        let started = Instant::now();
        let cfg = &self.config;
        cfg.validate()?;

        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => WorkerIdentity::from_env()?,
        };
        state.is_main = identity.is_main();
        let output_dir = cfg.output_dir();
        state.sink = self.resolve_sink(identity.is_main(), &output_dir);
        if identity.is_main() {
            report_run_config(cfg, identity.world_size, state.sink.as_ref());
        }

        state.stage = "init_devices";
        let accelerators = cfg.accelerators.unwrap_or_else(|| accelerator_count(cfg.prefer_gpu));
        let plan = DevicePlan::resolve(identity.world_size, identity.local_rank, accelerators)?;
        let mut ctx = DistributedContext::init(&identity, plan, cfg.collective_timeout())?;

        state.stage = "load_models";
        let mut teacher = ModelHandle::load(&cfg.teacher_model_ref, "teacher")?;
        let mut student = ModelHandle::load(&cfg.student_model_ref, "student")?;

        state.stage = "reconcile_vocab";
        let vocab_plan = vocab::reconcile(
            teacher.model.as_mut(),
            &teacher.tokenizer,
            student.model.as_mut(),
            &student.tokenizer,
        )?;
        let mut pair = ModelPair::new(teacher, student, vocab_plan.canonical);

        state.stage = "place_models";
        let worker = ctx.worker().clone();
        pair.place(&worker.student_device, &worker.teacher_device)?;
        ctx.broadcast_parameters(&pair.student.trainable_vars())?;

        state.stage = "load_data";
        let required = cfg.min_examples.max(ctx.world_size());
        let dataset = Dataset::load(&cfg.train_file, cfg.max_samples, required)?;
        let examples = dataset.tokenize(&pair.tokenizer, cfg.max_seq_length)?;
        let sampler = ShardSampler::new(examples.len(), ctx.rank(), ctx.world_size(), cfg.seed);
        info!(
            examples = examples.len(),
            skipped = dataset.skipped(),
            shard_len = sampler.shard_len(),
            max_seq_length = cfg.max_seq_length,
            "Training data tokenized"
        );

        state.stage = "train";
        let sink = Arc::clone(&state.sink);
        let mut checkpoints = CheckpointManager::new(&output_dir, ctx.is_main());
        let mut trainer = Trainer::new(cfg, sink.as_ref(), Arc::clone(&self.cancel));
        let fitted = trainer.fit(&mut ctx, &pair, &examples, &sampler, &mut checkpoints);
        state.progress = trainer.progress();
        state.stage = trainer.phase().as_str();
        let outcome = fitted?;

        state.stage = "save_final";
        let final_dir = checkpoints.save_final(pair.student.as_ref(), &pair.tokenizer)?;
        ctx.barrier()?;

        let elapsed_secs = started.elapsed().as_secs_f64();
        if ctx.is_main() {
            state.sink.emit(
                &MetricsRecord::new("run_complete")
                    .with("total_steps", outcome.total_steps as f64)
                    .with("epochs", outcome.epochs.len() as f64)
                    .with("best_loss", f64::from(checkpoints.best_loss()))
                    .with("elapsed_secs", elapsed_secs),
            );
        }
        info!(
            total_steps = outcome.total_steps,
            best_loss = checkpoints.best_loss(),
            checkpoints = outcome.checkpoints.len(),
            elapsed_secs,
            output_dir = %output_dir.display(),
            "Distillation complete"
        );
        state.stage = "done";

        Ok(RunReport {
            epochs: outcome.epochs,
            checkpoints: outcome.checkpoints,
            total_steps: outcome.total_steps,
            elapsed_secs,
            final_dir,
        })
    }

    fn resolve_sink(&self, is_main: bool, output_dir: &std::path::Path) -> Arc<dyn MetricsSink> {
        if let Some(sink) = &self.sink {
            return Arc::clone(sink);
        }
        if self.config.use_metrics_sink && is_main {
            Arc::new(JsonlSink::in_dir(output_dir))
        } else {
            Arc::new(NoopSink)
        }
    }
}

/// Log and emit the settings the run was started with.
fn report_run_config(cfg: &DistillConfig, world_size: usize, sink: &dyn MetricsSink) {
    let effective_batch_size = cfg.batch_size * world_size;
    info!(
        teacher = %cfg.teacher_model_ref.display(),
        student = %cfg.student_model_ref.display(),
        train_file = %cfg.train_file.display(),
        world_size,
        effective_batch_size,
        temperature = cfg.temperature,
        alpha = cfg.alpha,
        "Run configuration"
    );
    sink.emit(
        &MetricsRecord::new("run_config")
            .with_tag("teacher_model_ref", cfg.teacher_model_ref.display().to_string())
            .with_tag("student_model_ref", cfg.student_model_ref.display().to_string())
            .with_tag("train_file", cfg.train_file.display().to_string())
            .with("world_size", world_size as f64)
            .with("batch_size", cfg.batch_size as f64)
            .with("effective_batch_size", effective_batch_size as f64)
            .with("num_epochs", cfg.num_epochs as f64)
            .with("learning_rate", cfg.learning_rate)
            .with("temperature", cfg.temperature)
            .with("alpha", cfg.alpha)
            .with("max_seq_length", cfg.max_seq_length as f64),
    );
}

fn report_failure(err: &DistillError, state: &RunState) {
    let class = err.class();
    error!(
        class = %class,
        phase = state.stage,
        last_completed_epoch = ?state.progress.last_completed_epoch.map(|e| e + 1),
        global_step = state.progress.global_step,
        error = %err,
        "Distillation run failed"
    );
    if !state.is_main {
        return;
    }
    let mut record = MetricsRecord::new("run_failed")
        .with("error_class", class.code())
        .with("global_step", state.progress.global_step as f64);
    if let Some(epoch) = state.progress.last_completed_epoch {
        record = record.with("last_completed_epoch", (epoch + 1) as f64);
    }
    state.sink.emit(&record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::metrics::RecordingSink;
    use crate::testing::{word_level, write_model_dir, CAD_WORDS};
    use cad0_core::{CausalLm, HfCausalLm};
    use std::path::Path;

    fn fixture(root: &Path, lines: &[&str]) -> DistillConfig {
        let tok = word_level(CAD_WORDS);
        let vocab = tok.vocab_size();
        write_model_dir(&root.join("teacher"), vocab + 3, &tok);
        write_model_dir(&root.join("student"), vocab, &tok);
        std::fs::write(root.join("train.jsonl"), lines.join("\n")).unwrap();
        DistillConfig {
            teacher_model_ref: root.join("teacher"),
            student_model_ref: root.join("student"),
            train_file: root.join("train.jsonl"),
            output_dir: Some(root.join("out")),
            num_epochs: 1,
            batch_size: 2,
            max_seq_length: 24,
            learning_rate: 1e-3,
            log_every: 1,
            prefer_gpu: false,
            accelerators: Some(0),
            ..Default::default()
        }
    }

    const RECORDS: &[&str] = &[
        r#"{"text": "box 10x10x10", "ir": "C 10 10 10"}"#,
        r#"{"text": "cylinder r5 h20", "ir": "Y 5 20"}"#,
    ];

    #[test]
    fn run_produces_final_model_and_metrics_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = fixture(dir.path(), RECORDS);
        let report = Distiller::new(cfg).with_identity(WorkerIdentity::single()).run().unwrap();

        assert_eq!(report.epochs.len(), 1);
        assert_eq!(report.total_steps, 1);
        let out = dir.path().join("out");
        assert_eq!(report.final_dir.as_deref(), Some(out.as_path()));
        assert!(out.join("model.safetensors").exists());
        assert!(out.join("epoch-1").join("checkpoint.json").exists());

        let metrics = std::fs::read_to_string(out.join("metrics.jsonl")).unwrap();
        assert!(metrics.lines().any(|l| l.contains("\"event\":\"step\"")));
        assert!(metrics.lines().any(|l| l.contains("\"event\":\"run_complete\"")));
    }

    #[test]
    fn run_config_is_emitted_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = fixture(dir.path(), RECORDS);
        let sink = Arc::new(RecordingSink::default());
        Distiller::new(cfg.clone())
            .with_identity(WorkerIdentity::single())
            .with_sink(sink.clone())
            .run()
            .unwrap();

        let records = sink.records();
        assert_eq!(records[0].event, "run_config");
        let run = &records[0];
        let teacher = cfg.teacher_model_ref.display().to_string();
        assert_eq!(run.tag("teacher_model_ref"), Some(teacher.as_str()));
        assert_eq!(run.get("world_size"), Some(1.0));
        assert_eq!(run.get("effective_batch_size"), Some(2.0));
        assert_eq!(run.get("temperature"), Some(cfg.temperature));
        assert_eq!(run.get("alpha"), Some(cfg.alpha));
    }

    #[test]
    fn student_inherits_reconciled_vocab() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = fixture(dir.path(), RECORDS);
        let teacher_vocab = word_level(CAD_WORDS).vocab_size() + 3;
        Distiller::new(cfg).with_identity(WorkerIdentity::single()).run().unwrap();

        let saved = HfCausalLm::load(&dir.path().join("out"), &candle_core::Device::Cpu).unwrap();
        assert_eq!(saved.vocab_size(), teacher_vocab);
    }

    #[test]
    fn failure_is_classified_and_recorded() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = fixture(dir.path(), &["not json"]);
        let sink = Arc::new(RecordingSink::default());
        let err = Distiller::new(cfg)
            .with_identity(WorkerIdentity::single())
            .with_sink(sink.clone())
            .run()
            .unwrap_err();

        assert!(matches!(err, DistillError::DatasetTooSmall { found: 0, required: 1 }));
        let failed = sink.events("run_failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].get("error_class"), Some(ErrorClass::Data.code()));
        assert_eq!(failed[0].get("global_step"), Some(0.0));
    }

    #[test]
    fn invalid_config_fails_before_touching_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = fixture(dir.path(), RECORDS);
        cfg.alpha = 1.5;
        let err = Distiller::new(cfg).with_identity(WorkerIdentity::single()).run().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Config);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn cancelled_run_is_interrupted() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = fixture(dir.path(), RECORDS);
        let distiller = Distiller::new(cfg).with_identity(WorkerIdentity::single());
        distiller.cancel_flag().store(true, std::sync::atomic::Ordering::Relaxed);
        let err = distiller.run().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Interrupted);
        assert!(!dir.path().join("out").join("model.safetensors").exists());
    }
}
