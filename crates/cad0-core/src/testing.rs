//! Small in-memory fixtures for tests in this and downstream crates.

use std::path::Path;

use candle_core::Device;

use crate::hf::{HfCausalLm, HfConfig};
use crate::model::CausalLm;
use crate::tokenizer::Tokenizer;

/// Word-level tokenizer with whitespace pre-tokenization over `words`.
/// `[PAD]`, `[UNK]` and `[EOS]` occupy ids 0, 1 and 2.
pub fn word_level(words: &[&str]) -> Tokenizer {
    let mut vocab = serde_json::Map::new();
    for (i, w) in ["[PAD]", "[UNK]", "[EOS]"].iter().chain(words).enumerate() {
        vocab.insert((*w).to_string(), serde_json::Value::from(i as u32));
    }
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
}

/// A freshly initialised [`HfConfig::tiny`] model on the CPU.
pub fn tiny_model(vocab: usize) -> HfCausalLm {
    HfCausalLm::new(HfConfig::tiny(vocab), &Device::Cpu).unwrap()
}

/// Write a loadable model directory: `config.json`, `model.safetensors` and
/// `tokenizer.json`.
pub fn write_model_dir(dir: &Path, model_vocab: usize, tokenizer: &Tokenizer) {
    tiny_model(model_vocab).save(dir).unwrap();
    tokenizer.save(dir).unwrap();
}
