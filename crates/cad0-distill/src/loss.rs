//! Loss combiner: temperature-scaled distillation plus causal-LM task loss.
//!
//! All functions are pure.  Logits are cast to F32 before any softmax, and
//! the teacher's logits are expected to be detached so gradients only reach
//! the student.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::dataset::IGNORE_INDEX;
use crate::error::{DistillError, DistillResult};

/// The three loss values of one step.
pub struct LossOutput {
    /// `alpha * distill + (1 - alpha) * task`; call `backward` on this.
    pub combined: Tensor,
    pub loss: f32,
    pub distill_loss: f32,
    pub task_loss: f32,
}

fn to_f32(t: &Tensor) -> DistillResult<Tensor> {
    if t.dtype() == DType::F32 {
        Ok(t.clone())
    } else {
        Ok(t.to_dtype(DType::F32)?)
    }
}

fn zero(device: &Device) -> DistillResult<Tensor> {
    Ok(Tensor::zeros((), DType::F32, device)?)
}

fn index_tensor(rows: &[u32], device: &Device) -> DistillResult<Tensor> {
    Ok(Tensor::from_slice(rows, rows.len(), device)?)
}

/// Validate `[batch, seq, vocab]` logits against the flat label buffer.
fn check_shapes(logits: &Tensor, labels: &[i64]) -> DistillResult<(usize, usize, usize)> {
    let (b, s, v) = logits.dims3()?;
    if labels.len() != b * s {
        return Err(DistillError::Data(format!(
            "labels hold {} entries but logits cover {b}x{s} positions",
            labels.len()
        )));
    }
    Ok((b, s, v))
}

/// KL(teacher ‖ student) at temperature `T`, averaged over the positions
/// whose label is not [`IGNORE_INDEX`] and scaled by `T²`.
///
/// Returns a zero scalar when no position is selected.
pub fn distillation_loss(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    labels: &[i64],
    temperature: f64,
) -> DistillResult<Tensor> {
    let (b, s, v) = check_shapes(student_logits, labels)?;
    if teacher_logits.dims() != student_logits.dims() {
        return Err(DistillError::config(
            "vocab",
            format!(
                "teacher logits {:?} do not match student logits {:?}",
                teacher_logits.dims(),
                student_logits.dims()
            ),
        ));
    }
    let device = student_logits.device();

    let selected: Vec<u32> = labels
        .iter()
        .enumerate()
        .filter(|(_, l)| **l != IGNORE_INDEX)
        .map(|(i, _)| i as u32)
        .collect();
    if selected.is_empty() {
        return zero(device);
    }
    let n = selected.len();
    let idx = index_tensor(&selected, device)?;

    let student = to_f32(student_logits)?.reshape((b * s, v))?.index_select(&idx, 0)?;
    let teacher = to_f32(teacher_logits)?.reshape((b * s, v))?.index_select(&idx, 0)?;

    let inv_t = 1.0 / temperature;
    let log_q = log_softmax(&student.affine(inv_t, 0.0)?, D::Minus1)?;
    let log_p = log_softmax(&teacher.affine(inv_t, 0.0)?, D::Minus1)?;
    let p = log_p.exp()?;

    let kl = (p * (log_p - log_q)?)?.sum_all()?;
    Ok(kl.affine(temperature * temperature / n as f64, 0.0)?)
}

/// Next-token cross-entropy: logits at position `i` predict `labels[i + 1]`.
///
/// Averaged over non-ignored targets; a zero scalar when there are none.
pub fn task_loss(student_logits: &Tensor, labels: &[i64]) -> DistillResult<Tensor> {
    let (b, s, v) = check_shapes(student_logits, labels)?;
    let device = student_logits.device();

    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for bi in 0..b {
        for i in 0..s.saturating_sub(1) {
            let target = labels[bi * s + i + 1];
            if target == IGNORE_INDEX {
                continue;
            }
            if target < 0 || target as usize >= v {
                return Err(DistillError::Data(format!(
                    "label {target} outside vocabulary of {v}"
                )));
            }
            rows.push((bi * s + i) as u32);
            targets.push(target as u32);
        }
    }
    if rows.is_empty() {
        return zero(device);
    }

    let idx = index_tensor(&rows, device)?;
    let logits = to_f32(student_logits)?.reshape((b * s, v))?.index_select(&idx, 0)?;
    let targets = index_tensor(&targets, device)?;
    Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
}

/// `alpha * distill + (1 - alpha) * task`.
pub fn combine(distill: &Tensor, task: &Tensor, alpha: f64) -> DistillResult<Tensor> {
    Ok((distill.affine(alpha, 0.0)? + task.affine(1.0 - alpha, 0.0)?)?)
}

/// Compute both loss terms and their blend.
pub fn compute(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    labels: &[i64],
    temperature: f64,
    alpha: f64,
) -> DistillResult<LossOutput> {
    let distill = distillation_loss(student_logits, teacher_logits, labels, temperature)?;
    let task = task_loss(student_logits, labels)?;
    let combined = combine(&distill, &task, alpha)?;
    Ok(LossOutput {
        loss: combined.to_scalar::<f32>()?,
        distill_loss: distill.to_scalar::<f32>()?,
        task_loss: task.to_scalar::<f32>()?,
        combined,
    })
}
