//! Vocabulary reconciliation between teacher and student.
//!
//! The two models may come from different training runs with tokenizers and
//! embedding tables of different sizes.  Before anything is placed on a
//! device, both embedding tables are grown to the largest of the four sizes
//! so every token id the canonical tokenizer can emit is valid for both
//! models and the two logit tensors share a vocabulary dimension.

use tracing::info;

use cad0_core::{CausalLm, Tokenizer};

use crate::error::DistillResult;

/// Which side's tokenizer is used for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerSource {
    Teacher,
    Student,
}

impl TokenizerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenizerSource::Teacher => "teacher",
            TokenizerSource::Student => "student",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabPlan {
    pub teacher_tokenizer_size: usize,
    pub student_tokenizer_size: usize,
    pub teacher_model_vocab: usize,
    pub student_model_vocab: usize,
    pub target_vocab: usize,
    pub canonical: TokenizerSource,
}

impl VocabPlan {
    /// `target_vocab` is the maximum of all four sizes.  The tokenizer with
    /// the larger vocabulary is canonical; the teacher wins ties.
    pub fn compute(
        teacher_tokenizer_size: usize,
        student_tokenizer_size: usize,
        teacher_model_vocab: usize,
        student_model_vocab: usize,
    ) -> Self {
        let target_vocab = teacher_tokenizer_size
            .max(student_tokenizer_size)
            .max(teacher_model_vocab)
            .max(student_model_vocab);
        let canonical = if teacher_tokenizer_size >= student_tokenizer_size {
            TokenizerSource::Teacher
        } else {
            TokenizerSource::Student
        };
        Self {
            teacher_tokenizer_size,
            student_tokenizer_size,
            teacher_model_vocab,
            student_model_vocab,
            target_vocab,
            canonical,
        }
    }

    pub fn teacher_needs_resize(&self) -> bool {
        self.teacher_model_vocab < self.target_vocab
    }

    pub fn student_needs_resize(&self) -> bool {
        self.student_model_vocab < self.target_vocab
    }
}

/// Compute the plan and grow whichever embedding tables are too small.
///
/// Must run once, before device placement and before any collective touches
/// the student's parameters.
pub fn reconcile(
    teacher: &mut dyn CausalLm,
    teacher_tokenizer: &Tokenizer,
    student: &mut dyn CausalLm,
    student_tokenizer: &Tokenizer,
) -> DistillResult<VocabPlan> {
    let plan = VocabPlan::compute(
        teacher_tokenizer.vocab_size(),
        student_tokenizer.vocab_size(),
        teacher.vocab_size(),
        student.vocab_size(),
    );

    if plan.teacher_needs_resize() {
        teacher.resize_token_embeddings(plan.target_vocab)?;
    }
    if plan.student_needs_resize() {
        student.resize_token_embeddings(plan.target_vocab)?;
    }

    info!(
        teacher_tokenizer = plan.teacher_tokenizer_size,
        student_tokenizer = plan.student_tokenizer_size,
        teacher_model = plan.teacher_model_vocab,
        student_model = plan.student_model_vocab,
        target_vocab = plan.target_vocab,
        canonical = plan.canonical.as_str(),
        "Vocabulary reconciled"
    );
    Ok(plan)
}
