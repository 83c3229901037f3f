//! Training data: loading, prompt rendering, tokenization and collation.
//!
//! The training file is newline-delimited JSON, one record per line:
//!
//! ```json
//! {"text": "box 10x10x10", "ir": "C 10 10 10"}
//! ```
//!
//! Every example is rendered as `"Design: {text}\n\nCompact IR:\n" + ir`,
//! tokenized to exactly `max_seq_length` tokens, and its prompt positions are
//! masked out of the labels.

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::Deserialize;
use tracing::{info, warn};

use cad0_core::Tokenizer;

use crate::error::{DistillError, DistillResult};

/// Label value excluded from both losses.
pub const IGNORE_INDEX: i64 = -100;

/// One labeled record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrainingExample {
    pub text: String,
    pub ir: String,
}

impl TrainingExample {
    pub fn prompt(&self) -> String {
        render_prompt(&self.text)
    }

    /// Prompt followed by the target IR.
    pub fn full_text(&self) -> String {
        format!("{}{}", self.prompt(), self.ir)
    }
}

pub fn render_prompt(text: &str) -> String {
    format!("Design: {text}\n\nCompact IR:\n")
}

/// A fixed-length tokenized example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Records read from a training file.
#[derive(Debug, Clone)]
pub struct Dataset {
    examples: Vec<TrainingExample>,
    skipped: usize,
}

impl Dataset {
    /// Read `path`, cap at `max_samples` and require at least `min_required`
    /// usable records.
    pub fn load(
        path: &Path,
        max_samples: Option<usize>,
        min_required: usize,
    ) -> DistillResult<Self> {
        let file = fs::File::open(path).map_err(|e| {
            DistillError::Data(format!("cannot open training file {}: {e}", path.display()))
        })?;
        let mut dataset = Self::from_reader(io::BufReader::new(file), &path.display().to_string())?;
        if let Some(cap) = max_samples {
            dataset.examples.truncate(cap);
        }

        info!(
            path = %path.display(),
            loaded = dataset.examples.len(),
            skipped = dataset.skipped,
            "Training data loaded"
        );

        if dataset.examples.len() < min_required {
            return Err(DistillError::DatasetTooSmall {
                found: dataset.examples.len(),
                required: min_required,
            });
        }
        Ok(dataset)
    }

    /// Parse JSONL records.  Blank lines are ignored; malformed lines,
    /// including ones that are not valid UTF-8, are counted and skipped.
    pub fn from_reader<R: BufRead>(reader: R, source: &str) -> DistillResult<Self> {
        let mut examples = Vec::new();
        let mut skipped = 0usize;
        for (line_no, bytes) in reader.split(b'\n').enumerate() {
            let bytes = bytes?;
            let line = match std::str::from_utf8(&bytes) {
                Ok(line) => line,
                Err(e) => {
                    skipped += 1;
                    warn!(source, line = line_no + 1, error = %e, "Skipping non-UTF-8 record");
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<TrainingExample>(trimmed) {
                Ok(example) => examples.push(example),
                Err(e) => {
                    skipped += 1;
                    warn!(source, line = line_no + 1, error = %e, "Skipping malformed record");
                }
            }
        }
        Ok(Self { examples, skipped })
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Number of malformed lines dropped while loading.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Tokenize every record with the canonical tokenizer.
    pub fn tokenize(
        &self,
        tokenizer: &Tokenizer,
        max_seq_length: usize,
    ) -> DistillResult<Vec<TokenizedExample>> {
        self.examples
            .iter()
            .map(|ex| tokenize_example(ex, tokenizer, max_seq_length))
            .collect()
    }
}

// ── Tokenization ──────────────────────────────────────────────────────────────

/// Encode `prompt + ir` to exactly `max_seq_length` tokens.
///
/// Longer sequences are truncated, shorter ones right-padded with the pad
/// id (attention 0).  Labels copy the input ids except for the positions the
/// prompt occupies, which are set to [`IGNORE_INDEX`].  Padding positions keep
/// the pad id as label, matching causal-LM scripts where pad is EOS.
pub fn tokenize_example(
    example: &TrainingExample,
    tokenizer: &Tokenizer,
    max_seq_length: usize,
) -> DistillResult<TokenizedExample> {
    let mut ids = tokenizer.encode(&example.full_text(), true)?;
    ids.truncate(max_seq_length);
    let real = ids.len();

    let prompt_len = tokenizer
        .encode(&example.prompt(), true)?
        .len()
        .min(max_seq_length);

    let pad_id = tokenizer.pad_token_id();
    ids.resize(max_seq_length, pad_id);

    let attention_mask = (0..max_seq_length)
        .map(|i| u32::from(i < real))
        .collect();
    let labels = ids
        .iter()
        .enumerate()
        .map(|(i, &id)| if i < prompt_len { IGNORE_INDEX } else { i64::from(id) })
        .collect();

    Ok(TokenizedExample { input_ids: ids, attention_mask, labels })
}

// ── Collation ─────────────────────────────────────────────────────────────────

/// A host-side batch of equal-length examples, stored row-major.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    pub fn collate(examples: &[&TokenizedExample]) -> DistillResult<Self> {
        let first = examples
            .first()
            .ok_or_else(|| DistillError::Data("cannot collate an empty batch".into()))?;
        let seq_len = first.input_ids.len();

        let mut batch = Self {
            input_ids: Vec::with_capacity(examples.len() * seq_len),
            attention_mask: Vec::with_capacity(examples.len() * seq_len),
            labels: Vec::with_capacity(examples.len() * seq_len),
            batch_size: examples.len(),
            seq_len,
        };
        for ex in examples {
            if ex.input_ids.len() != seq_len
                || ex.attention_mask.len() != seq_len
                || ex.labels.len() != seq_len
            {
                return Err(DistillError::Data(format!(
                    "ragged batch: expected sequences of length {seq_len}"
                )));
            }
            batch.input_ids.extend_from_slice(&ex.input_ids);
            batch.attention_mask.extend_from_slice(&ex.attention_mask);
            batch.labels.extend_from_slice(&ex.labels);
        }
        Ok(batch)
    }

    /// Number of token slots in the batch, padding included.
    pub fn numel(&self) -> usize {
        self.batch_size * self.seq_len
    }

    /// `input_ids` and `attention_mask` as `[batch, seq]` tensors on `device`.
    pub fn to_device(&self, device: &Device) -> DistillResult<(Tensor, Tensor)> {
        let shape = (self.batch_size, self.seq_len);
        let ids = Tensor::from_slice(&self.input_ids, shape, device)?;
        let mask = Tensor::from_slice(&self.attention_mask, shape, device)?;
        Ok((ids, mask))
    }
}
