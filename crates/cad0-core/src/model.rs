use std::path::Path;

use candle_core::{Device, Tensor, Var};

use crate::error::CoreResult;

/// File name of the weight file inside a model directory.
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// File name of the architecture description inside a model directory.
pub const CONFIG_FILE: &str = "config.json";

/// A causal language model that can take part in distillation, either as the
/// frozen teacher or as the trainable student.
///
/// Implementations own their parameters; the training loop only ever sees
/// them through [`CausalLm::named_vars`].
pub trait CausalLm: Send {
    /// Full-sequence logits.
    ///
    /// `input_ids` is `[batch, seq]` (`u32`), `attention_mask` is `[batch, seq]`
    /// with 1 for real tokens and 0 for padding.  Returns `[batch, seq, vocab]`.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> CoreResult<Tensor>;

    /// Rows in the input embedding table (and the LM head).
    fn vocab_size(&self) -> usize;

    /// Grow the embedding table and LM head to `new_size` rows.
    ///
    /// New rows are drawn from N(0, 0.02).  Never shrinks: a `new_size` at or
    /// below the current size is a no-op.
    fn resize_token_embeddings(&mut self, new_size: usize) -> CoreResult<()>;

    /// All parameters, sorted by name.
    ///
    /// The order is identical in every process holding the same architecture,
    /// which collective operations over flattened parameters rely on.
    fn named_vars(&self) -> Vec<(String, Var)>;

    /// The device the parameters currently live on.
    fn device(&self) -> &Device;

    /// Move every parameter to `device`, converting to that device's training
    /// dtype.
    fn place(&mut self, device: &Device) -> CoreResult<()>;

    /// Write `config.json` and `model.safetensors` into `dir`.
    fn save(&self, dir: &Path) -> CoreResult<()>;

    /// Parameters in [`CausalLm::named_vars`] order, without names.
    fn trainable_vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, v)| v).collect()
    }

    /// Total number of scalar parameters.
    fn param_count(&self) -> usize {
        self.named_vars().iter().map(|(_, v)| v.elem_count()).sum()
    }
}
