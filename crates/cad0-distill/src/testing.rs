//! Fixtures shared by the unit tests in this crate.

pub use cad0_core::testing::{tiny_model, word_level, write_model_dir};
use cad0_core::Tokenizer;

use crate::models::ModelPair;

/// Vocabulary covering the prompt template and a few IR statements.
pub const CAD_WORDS: &[&str] = &[
    "Design", ":", "Compact", "IR", "box", "cylinder", "10x10x10", "r5", "h20", "C", "Y", "10",
    "5", "20",
];

/// Teacher and student sharing `tokenizer`'s vocabulary.
pub fn tiny_pair(tokenizer: Tokenizer) -> ModelPair {
    let vocab = tokenizer.vocab_size();
    ModelPair {
        teacher: Box::new(tiny_model(vocab)),
        student: Box::new(tiny_model(vocab)),
        tokenizer,
    }
}
