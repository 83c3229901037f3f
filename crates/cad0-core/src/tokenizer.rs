use std::path::Path;

use tokenizers::Tokenizer as HfTokenizer;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// File name used for tokenizers inside a model directory.
pub const TOKENIZER_FILE: &str = "tokenizer.json";

const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<eos>", "<|im_end|>", "[EOS]"];
const PAD_CANDIDATES: &[&str] = &["<pad>", "[PAD]", "<|pad|>"];

/// Thin wrapper around the Hugging Face `tokenizers` crate.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    inner: HfTokenizer,
    eos_token_id: Option<u32>,
    pad_token_id: u32,
}

impl Tokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(CoreError::MissingFile(path.display().to_string()));
        }
        let inner = HfTokenizer::from_file(path)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(Self::from_inner(inner))
    }

    /// Load `tokenizer.json` from a model directory.
    pub fn from_dir(dir: &Path) -> CoreResult<Self> {
        Self::from_file(&dir.join(TOKENIZER_FILE))
    }

    /// Parse a serialized `tokenizer.json` held in memory.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let inner = HfTokenizer::from_bytes(bytes)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(Self::from_inner(inner))
    }

    fn from_inner(inner: HfTokenizer) -> Self {
        let eos_token_id = Self::special_token_id(&inner, EOS_CANDIDATES);

        // Padding falls back to EOS when the tokenizer has no dedicated pad
        // token, the same convention causal-LM training scripts use.
        let pad_token_id = inner
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| Self::special_token_id(&inner, PAD_CANDIDATES))
            .or(eos_token_id)
            .unwrap_or_else(|| {
                warn!("Tokenizer has neither a pad nor an EOS token; padding with id 0");
                0
            });

        debug!(
            eos_token_id,
            pad_token_id,
            vocab_size = inner.get_vocab_size(true),
            "Tokenizer loaded"
        );

        Self { inner, eos_token_id, pad_token_id }
    }

    /// Encode a text string to a sequence of token ids.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> CoreResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// The end-of-sequence token id, if known.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// The id used to right-pad sequences.
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Vocabulary size including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Look up the token id for an exact token string.
    pub fn token_id(&self, text: &str) -> Option<u32> {
        self.inner.token_to_id(text)
    }

    /// Write `tokenizer.json` into `dir`.
    pub fn save(&self, dir: &Path) -> CoreResult<()> {
        std::fs::create_dir_all(dir)?;
        self.inner
            .save(dir.join(TOKENIZER_FILE), false)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))
    }

    fn special_token_id(tokenizer: &HfTokenizer, candidates: &[&str]) -> Option<u32> {
        candidates.iter().find_map(|c| tokenizer.token_to_id(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::word_level;

    #[test]
    fn encodes_known_and_unknown_words() {
        let tok = word_level(&["box", "10"]);
        let ids = tok.encode("box 10 sphere", false).unwrap();
        assert_eq!(ids, vec![3, 4, 1]);
    }

    #[test]
    fn special_tokens_resolved() {
        let tok = word_level(&["box"]);
        assert_eq!(tok.pad_token_id(), 0);
        assert_eq!(tok.eos_token_id(), Some(2));
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.token_id("box"), Some(3));
    }

    #[test]
    fn save_and_reload() {
        let tok = word_level(&["box", "cylinder"]);
        let dir = tempfile::TempDir::new().unwrap();
        tok.save(dir.path()).unwrap();
        let back = Tokenizer::from_dir(dir.path()).unwrap();
        assert_eq!(back.vocab_size(), tok.vocab_size());
        assert_eq!(back.encode("cylinder", false).unwrap(), vec![4]);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Tokenizer::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::MissingFile(_)));
    }
}
