//! Training loop.
//!
//! Each step runs the teacher (detached), the student, the loss combiner and
//! backward, then averages gradients across workers, clips the global norm,
//! applies AdamW and advances the warmup-cosine schedule.  Each epoch ends
//! with globally averaged losses, a best-loss checkpoint decision and a
//! barrier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::DistillConfig;
use crate::dataset::{Batch, TokenizedExample};
use crate::dist::DistributedContext;
use crate::error::{DistillError, DistillResult};
use crate::loss;
use crate::metrics::{MetricsRecord, MetricsSink};
use crate::models::ModelPair;
use crate::sampler::ShardSampler;
use crate::schedule::WarmupCosine;

// ── State ─────────────────────────────────────────────────────────────────────

/// Where the loop currently is; reported when a run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ForwardTeacher,
    ForwardStudent,
    ComputeLoss,
    Backward,
    GradSync,
    OptimizerStep,
    SchedulerStep,
    EpochBarrier,
    EpochCheckpoint,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::ForwardTeacher => "forward_teacher",
            Phase::ForwardStudent => "forward_student",
            Phase::ComputeLoss => "compute_loss",
            Phase::Backward => "backward",
            Phase::GradSync => "grad_sync",
            Phase::OptimizerStep => "optimizer_step",
            Phase::SchedulerStep => "scheduler_step",
            Phase::EpochBarrier => "epoch_barrier",
            Phase::EpochCheckpoint => "epoch_checkpoint",
            Phase::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// 0-based epoch currently running.
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub global_step: usize,
    pub last_completed_epoch: Option<usize>,
}

/// Losses of one epoch, averaged over all workers.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch_index: usize,
    pub avg_loss: f32,
    pub avg_distill_loss: f32,
    pub avg_task_loss: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub loss: f32,
    pub distill_loss: f32,
    pub task_loss: f32,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub learning_rate: f64,
    pub step_time_s: f64,
    pub tokens_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub epochs: Vec<EpochSummary>,
    pub checkpoints: Vec<Checkpoint>,
    pub total_steps: usize,
}

// ── Trainer ───────────────────────────────────────────────────────────────────

pub struct Trainer<'a> {
    config: &'a DistillConfig,
    sink: &'a dyn MetricsSink,
    cancel: Arc<AtomicBool>,
    phase: Phase,
    progress: Progress,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &'a DistillConfig, sink: &'a dyn MetricsSink, cancel: Arc<AtomicBool>) -> Self {
        Self { config, sink, cancel, phase: Phase::Idle, progress: Progress::default() }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Run every epoch over this worker's shard.
    pub fn fit(
        &mut self,
        ctx: &mut DistributedContext,
        models: &ModelPair,
        data: &[TokenizedExample],
        sampler: &ShardSampler,
        checkpoints: &mut CheckpointManager,
    ) -> DistillResult<TrainOutcome> {
        let cfg = self.config;
        let steps_per_epoch = sampler.batches_per_epoch(cfg.batch_size);
        let total_steps = steps_per_epoch * cfg.num_epochs;
        let schedule = WarmupCosine::from_ratio(cfg.learning_rate, cfg.warmup_ratio, total_steps);

        let vars = models.student.trainable_vars();
        let params = ParamsAdamW {
            lr: schedule.lr_at(0),
            weight_decay: cfg.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(vars.clone(), params)?;

        info!(
            epochs = cfg.num_epochs,
            steps_per_epoch,
            total_steps,
            warmup_steps = schedule.warmup_steps(),
            batch_size = cfg.batch_size,
            world_size = ctx.world_size(),
            lr = cfg.learning_rate,
            temperature = cfg.temperature,
            alpha = cfg.alpha,
            "Starting distillation"
        );

        let pb = if ctx.is_main() { progress_bar(total_steps as u64) } else { ProgressBar::hidden() };
        let mut epochs = Vec::with_capacity(cfg.num_epochs);

        for epoch in 0..cfg.num_epochs {
            self.progress.epoch = epoch;
            let indices = sampler.epoch_indices(epoch);
            let mut sums = [0f64; 3];
            let mut steps = 0usize;

            for chunk in indices.chunks(cfg.batch_size) {
                if self.cancel.load(Ordering::Relaxed) {
                    pb.abandon_with_message("interrupted");
                    return Err(DistillError::Interrupted);
                }

                let examples: Vec<&TokenizedExample> = chunk.iter().map(|&i| &data[i]).collect();
                let batch = Batch::collate(&examples)?;
                let stats = self.train_step(ctx, models, &mut optimizer, &vars, &batch, &schedule)?;

                sums[0] += f64::from(stats.loss);
                sums[1] += f64::from(stats.distill_loss);
                sums[2] += f64::from(stats.task_loss);
                steps += 1;
                self.progress.global_step += 1;
                self.report_step(ctx.is_main(), &stats);

                pb.set_message(format!(
                    "epoch {}/{} loss {:.4}",
                    epoch + 1,
                    cfg.num_epochs,
                    stats.loss
                ));
                pb.inc(1);
            }

            self.phase = Phase::EpochBarrier;
            let n = steps.max(1) as f64;
            let mut avgs = [
                (sums[0] / n) as f32,
                (sums[1] / n) as f32,
                (sums[2] / n) as f32,
            ];
            ctx.all_reduce_mean(&mut avgs)?;
            let summary = EpochSummary {
                epoch_index: epoch,
                avg_loss: avgs[0],
                avg_distill_loss: avgs[1],
                avg_task_loss: avgs[2],
            };
            info!(
                epoch = epoch + 1,
                avg_loss = summary.avg_loss,
                avg_distill_loss = summary.avg_distill_loss,
                avg_task_loss = summary.avg_task_loss,
                "Epoch complete"
            );
            if ctx.is_main() {
                self.sink.emit(
                    &MetricsRecord::new("epoch")
                        .with("epoch", (epoch + 1) as f64)
                        .with("avg_loss", f64::from(summary.avg_loss))
                        .with("avg_distill_loss", f64::from(summary.avg_distill_loss))
                        .with("avg_task_loss", f64::from(summary.avg_task_loss)),
                );
            }

            self.phase = Phase::EpochCheckpoint;
            checkpoints.consider(epoch, summary.avg_loss, models.student.as_ref(), &models.tokenizer)?;
            ctx.barrier()?;

            self.progress.last_completed_epoch = Some(epoch);
            self.phase = Phase::Idle;
            epochs.push(summary);
        }

        pb.finish_with_message("distillation complete");
        self.phase = Phase::Done;

        Ok(TrainOutcome {
            epochs,
            checkpoints: checkpoints.saved().to_vec(),
            total_steps: self.progress.global_step,
        })
    }

    fn train_step(
        &mut self,
        ctx: &mut DistributedContext,
        models: &ModelPair,
        optimizer: &mut AdamW,
        vars: &[Var],
        batch: &Batch,
        schedule: &WarmupCosine,
    ) -> DistillResult<StepStats> {
        let started = Instant::now();
        let student_device = models.student.device();

        self.phase = Phase::ForwardTeacher;
        let (ids, mask) = batch.to_device(models.teacher.device())?;
        let teacher_logits = models
            .teacher
            .forward(&ids, &mask)?
            .detach()
            .to_device(student_device)?;

        self.phase = Phase::ForwardStudent;
        let (ids, mask) = batch.to_device(student_device)?;
        let student_logits = models.student.forward(&ids, &mask)?;

        self.phase = Phase::ComputeLoss;
        let out = loss::compute(
            &student_logits,
            &teacher_logits,
            &batch.labels,
            self.config.temperature,
            self.config.alpha,
        )?;

        self.phase = Phase::Backward;
        let mut grads = out.combined.backward()?;

        self.phase = Phase::GradSync;
        ctx.average_gradients(vars, &mut grads)?;
        let grad_norm = clip_grad_norm(vars, &mut grads, self.config.max_grad_norm)?;

        self.phase = Phase::OptimizerStep;
        let learning_rate = optimizer.learning_rate();
        optimizer.step(&grads)?;

        self.phase = Phase::SchedulerStep;
        optimizer.set_learning_rate(schedule.lr_at(self.progress.global_step + 1));

        let step_time_s = started.elapsed().as_secs_f64();
        let tokens = (batch.numel() * ctx.world_size()) as f64;
        Ok(StepStats {
            loss: out.loss,
            distill_loss: out.distill_loss,
            task_loss: out.task_loss,
            grad_norm,
            learning_rate,
            step_time_s,
            tokens_per_sec: tokens / step_time_s.max(1e-9),
        })
    }

    fn report_step(&self, is_main: bool, stats: &StepStats) {
        let step = self.progress.global_step;
        debug!(step, loss = stats.loss, grad_norm = stats.grad_norm, "Step");
        if !is_main {
            return;
        }
        if step % self.config.log_every == 0 {
            self.sink.emit(
                &MetricsRecord::new("step")
                    .with("loss", f64::from(stats.loss))
                    .with("distill_loss", f64::from(stats.distill_loss))
                    .with("task_loss", f64::from(stats.task_loss))
                    .with("grad_norm", stats.grad_norm)
                    .with("learning_rate", stats.learning_rate)
                    .with("epoch", self.progress.epoch as f64)
                    .with("step", step as f64)
                    .with("step_time_s", stats.step_time_s)
                    .with("tokens_per_sec", stats.tokens_per_sec),
            );
        }
        if step % self.config.heartbeat_every == 0 {
            info!(
                step,
                epoch = self.progress.epoch + 1,
                loss = stats.loss,
                lr = stats.learning_rate,
                tokens_per_sec = stats.tokens_per_sec as u64,
                "Heartbeat"
            );
        }
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> DistillResult<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sum_sq += f64::from(g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
    }
    let norm = sum_sq.sqrt();
    if norm.is_finite() && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (g * scale)?);
            }
        }
    }
    Ok(norm)
}

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▓░");
    pb.set_style(style);
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{tokenize_example, TrainingExample};
    use crate::metrics::RecordingSink;
    use crate::testing::{tiny_pair, word_level, CAD_WORDS};
    use candle_core::{Device, Tensor};

    fn data(pair: &ModelPair, n: usize) -> Vec<TokenizedExample> {
        (0..n)
            .map(|i| {
                let ex = if i % 2 == 0 {
                    TrainingExample { text: "box 10x10x10".into(), ir: "C 10 10 10".into() }
                } else {
                    TrainingExample { text: "cylinder r5 h20".into(), ir: "Y 5 20".into() }
                };
                tokenize_example(&ex, &pair.tokenizer, 16).unwrap()
            })
            .collect()
    }

    fn config() -> DistillConfig {
        DistillConfig {
            teacher_model_ref: "t".into(),
            student_model_ref: "s".into(),
            num_epochs: 2,
            batch_size: 2,
            learning_rate: 1e-3,
            max_seq_length: 16,
            log_every: 1,
            heartbeat_every: 2,
            ..Default::default()
        }
    }

    #[test]
    fn fits_epochs_and_reports() {
        let dir = tempfile::TempDir::new().unwrap();
        let pair = tiny_pair(word_level(CAD_WORDS));
        let examples = data(&pair, 4);
        let cfg = config();
        let sink = RecordingSink::default();
        let mut ctx = crate::dist::DistributedContext::local();
        let sampler = ShardSampler::new(examples.len(), 0, 1, cfg.seed);
        let mut ckpt = CheckpointManager::new(dir.path(), true);

        let mut trainer = Trainer::new(&cfg, &sink, Arc::new(AtomicBool::new(false)));
        let outcome = trainer.fit(&mut ctx, &pair, &examples, &sampler, &mut ckpt).unwrap();

        assert_eq!(outcome.epochs.len(), 2);
        assert_eq!(outcome.total_steps, 4);
        assert!(outcome.epochs.iter().all(|e| e.avg_loss.is_finite()));
        assert!(!outcome.checkpoints.is_empty());
        assert_eq!(trainer.phase(), Phase::Done);
        assert_eq!(trainer.progress().last_completed_epoch, Some(1));

        assert_eq!(sink.events("step").len(), 4);
        assert_eq!(sink.events("epoch").len(), 2);
        let step = &sink.events("step")[0];
        for key in ["loss", "distill_loss", "task_loss", "learning_rate", "epoch", "step", "step_time_s", "tokens_per_sec"] {
            assert!(step.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn training_changes_student_not_teacher() {
        let dir = tempfile::TempDir::new().unwrap();
        let pair = tiny_pair(word_level(CAD_WORDS));
        let examples = data(&pair, 2);
        let cfg = DistillConfig { num_epochs: 1, ..config() };
        let sink = RecordingSink::default();
        let mut ctx = crate::dist::DistributedContext::local();
        let sampler = ShardSampler::new(examples.len(), 0, 1, 0);
        let mut ckpt = CheckpointManager::new(dir.path(), true);

        let snapshot = |m: &dyn cad0_core::CausalLm| -> Vec<f32> {
            m.named_vars()
                .iter()
                .find(|(n, _)| n == "lm_head.weight")
                .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .unwrap()
        };
        let student_before = snapshot(pair.student.as_ref());
        let teacher_before = snapshot(pair.teacher.as_ref());

        Trainer::new(&cfg, &sink, Arc::new(AtomicBool::new(false)))
            .fit(&mut ctx, &pair, &examples, &sampler, &mut ckpt)
            .unwrap();

        assert_ne!(snapshot(pair.student.as_ref()), student_before);
        assert_eq!(snapshot(pair.teacher.as_ref()), teacher_before);
    }

    #[test]
    fn cancellation_interrupts() {
        let dir = tempfile::TempDir::new().unwrap();
        let pair = tiny_pair(word_level(CAD_WORDS));
        let examples = data(&pair, 2);
        let cfg = config();
        let sink = RecordingSink::default();
        let mut ctx = crate::dist::DistributedContext::local();
        let sampler = ShardSampler::new(examples.len(), 0, 1, 0);
        let mut ckpt = CheckpointManager::new(dir.path(), true);

        let mut trainer = Trainer::new(&cfg, &sink, Arc::new(AtomicBool::new(true)));
        let err = trainer.fit(&mut ctx, &pair, &examples, &sampler, &mut ckpt).unwrap_err();
        assert!(matches!(err, DistillError::Interrupted));
        assert_eq!(trainer.progress().global_step, 0);
        assert!(ckpt.saved().is_empty());
    }

    #[test]
    fn two_workers_stay_in_lockstep() {
        use crate::dist::{Collective, TcpGroup};
        use std::net::TcpListener;
        use std::time::Duration;

        let timeout = Duration::from_secs(30);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Three examples over two workers: each shard is padded to two.
        let worker = move |rank: usize, listener: Option<TcpListener>| {
            let group: Box<dyn Collective> = match listener {
                Some(l) => Box::new(TcpGroup::leader(l, 2, timeout).unwrap()),
                None => Box::new(TcpGroup::follower(addr, rank, 2, timeout).unwrap()),
            };
            let mut ctx = crate::dist::DistributedContext::with_group(group, Device::Cpu);
            let pair = tiny_pair(word_level(CAD_WORDS));
            ctx.broadcast_parameters(&pair.student.trainable_vars()).unwrap();
            ctx.broadcast_parameters(&pair.teacher.trainable_vars()).unwrap();

            let examples = data(&pair, 3);
            let cfg = DistillConfig { batch_size: 1, ..config() };
            let sink = RecordingSink::default();
            let sampler = ShardSampler::new(examples.len(), rank, 2, cfg.seed);
            let dir = tempfile::TempDir::new().unwrap();
            let mut ckpt = CheckpointManager::new(dir.path(), rank == 0);

            let outcome = Trainer::new(&cfg, &sink, Arc::new(AtomicBool::new(false)))
                .fit(&mut ctx, &pair, &examples, &sampler, &mut ckpt)
                .unwrap();
            let weights: Vec<f32> = pair
                .student
                .trainable_vars()
                .iter()
                .flat_map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect();
            (outcome, weights, sink.events("epoch").len())
        };

        let leader = std::thread::spawn(move || worker(0, Some(listener)));
        let follower = std::thread::spawn(move || worker(1, None));
        let (out0, w0, epochs0) = leader.join().unwrap();
        let (out1, w1, epochs1) = follower.join().unwrap();

        assert_eq!(out0.total_steps, 4);
        assert_eq!(out1.total_steps, 4);
        assert_eq!(out0.epochs, out1.epochs);
        assert!(out0.epochs.iter().all(|e| e.avg_loss.is_finite()));
        assert_eq!(w0, w1);
        assert!(!out0.checkpoints.is_empty());
        assert!(out1.checkpoints.is_empty());
        assert_eq!((epochs0, epochs1), (2, 0));
    }

    #[test]
    fn clipping_bounds_global_norm() {
        let a = Var::new(&[1f32, 1.0], &Device::Cpu).unwrap();
        let b = Var::new(&[1f32], &Device::Cpu).unwrap();
        // d/dx of 3*sum(a) + 4*sum(b) -> grads (3, 3) and (4); norm sqrt(34).
        let loss = ((a.as_tensor() * 3.0).unwrap().sum_all().unwrap()
            + (b.as_tensor() * 4.0).unwrap().sum_all().unwrap())
        .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];

        let norm = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!((norm - 34f64.sqrt()).abs() < 1e-5);

        let mut sq = 0f32;
        for v in &vars {
            let g: Tensor = grads.get(v.as_tensor()).unwrap().clone();
            sq += g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        }
        assert!((sq.sqrt() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn small_gradients_untouched() {
        let a = Var::new(&[0.1f32], &Device::Cpu).unwrap();
        let loss = (a.as_tensor() * 0.5).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let norm = clip_grad_norm(std::slice::from_ref(&a), &mut grads, 1.0).unwrap();
        assert!((norm - 0.5).abs() < 1e-6);
        let g = grads.get(a.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((g[0] - 0.5).abs() < 1e-6);
    }
}
