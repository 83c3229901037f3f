//! Loading teacher and student handles.
//!
//! A model handle is a local Hugging Face model directory: `config.json`,
//! `model.safetensors` (or shards listed in `model.safetensors.index.json`)
//! and `tokenizer.json`.  Both models are loaded on the CPU; the orchestrator
//! places them on their accelerators only after the vocabularies have been
//! reconciled.

use std::path::Path;

use candle_core::Device;
use tracing::info;

use cad0_core::{CausalLm, HfCausalLm, Tokenizer};

use crate::error::DistillResult;
use crate::vocab::TokenizerSource;

/// A model together with the tokenizer it was trained with.
pub struct ModelHandle {
    pub model: Box<dyn CausalLm>,
    pub tokenizer: Tokenizer,
}

impl ModelHandle {
    pub fn load(dir: &Path, role: &str) -> DistillResult<Self> {
        let model = HfCausalLm::load(dir, &Device::Cpu)?;
        let tokenizer = Tokenizer::from_dir(dir)?;
        info!(
            role,
            dir = %dir.display(),
            model_vocab = model.vocab_size(),
            tokenizer_vocab = tokenizer.vocab_size(),
            params = model.param_count(),
            "Model handle loaded"
        );
        Ok(Self { model: Box::new(model), tokenizer })
    }
}

/// Teacher and student, plus the tokenizer chosen as canonical for the run.
pub struct ModelPair {
    pub teacher: Box<dyn CausalLm>,
    pub student: Box<dyn CausalLm>,
    pub tokenizer: Tokenizer,
}

impl ModelPair {
    /// Keep the canonical tokenizer and drop the other one.
    pub fn new(teacher: ModelHandle, student: ModelHandle, canonical: TokenizerSource) -> Self {
        let tokenizer = match canonical {
            TokenizerSource::Teacher => teacher.tokenizer,
            TokenizerSource::Student => student.tokenizer,
        };
        Self { teacher: teacher.model, student: student.model, tokenizer }
    }

    /// Move the teacher and student to their assigned devices.
    pub fn place(&mut self, student: &Device, teacher: &Device) -> DistillResult<()> {
        self.student.place(student)?;
        self.teacher.place(teacher)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{word_level, write_model_dir};

    #[test]
    fn loads_handle_from_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        write_model_dir(dir.path(), 12, &word_level(&["box", "C"]));

        let handle = ModelHandle::load(dir.path(), "teacher").unwrap();
        assert_eq!(handle.model.vocab_size(), 12);
        assert_eq!(handle.tokenizer.vocab_size(), 5);
    }

    #[test]
    fn loads_qwen2_checkpoint_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        write_model_dir(dir.path(), 12, &word_level(&["box", "C"]));
        let config = serde_json::json!({
            "architectures": ["Qwen2ForCausalLM"],
            "model_type": "qwen2",
            "hidden_act": "silu",
            "hidden_size": 32,
            "intermediate_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "max_position_embeddings": 32768,
            "rms_norm_eps": 1e-6,
            "rope_theta": 1000000.0,
            "sliding_window": 32768,
            "use_sliding_window": false,
            "tie_word_embeddings": false,
            "torch_dtype": "bfloat16",
            "vocab_size": 12
        });
        std::fs::write(dir.path().join("config.json"), config.to_string()).unwrap();

        let handle = ModelHandle::load(dir.path(), "teacher").unwrap();
        assert_eq!(handle.model.vocab_size(), 12);
        let names: Vec<String> = handle.model.named_vars().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"model.layers.0.self_attn.q_proj.bias".to_string()));
    }

    #[test]
    fn pair_keeps_canonical_tokenizer() {
        let t_dir = tempfile::TempDir::new().unwrap();
        let s_dir = tempfile::TempDir::new().unwrap();
        write_model_dir(t_dir.path(), 8, &word_level(&["box"]));
        write_model_dir(s_dir.path(), 8, &word_level(&["box", "cylinder"]));

        let pair = ModelPair::new(
            ModelHandle::load(t_dir.path(), "teacher").unwrap(),
            ModelHandle::load(s_dir.path(), "student").unwrap(),
            TokenizerSource::Student,
        );
        assert_eq!(pair.tokenizer.vocab_size(), 5);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = ModelHandle::load(&dir.path().join("nope"), "student").err().unwrap();
        assert_eq!(err.class(), crate::error::ErrorClass::Io);
    }
}
