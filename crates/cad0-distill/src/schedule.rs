//! Linear warmup followed by cosine decay to zero.

use std::f64::consts::PI;

#[derive(Debug, Clone, Copy)]
pub struct WarmupCosine {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl WarmupCosine {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self { base_lr, warmup_steps, total_steps }
    }

    /// Warmup covers `floor(total_steps * warmup_ratio)` steps.
    pub fn from_ratio(base_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        let warmup_steps = (total_steps as f64 * warmup_ratio).floor() as usize;
        Self::new(base_lr, warmup_steps, total_steps)
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Multiplier applied to the base rate after `step` optimizer steps.
    pub fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        self.base_lr * self.factor(step)
    }
}
