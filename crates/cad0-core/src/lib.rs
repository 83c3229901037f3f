//! # cad0-core
//!
//! Tokenizer, device and model primitives shared by the cad0 distillation
//! pipeline.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`tokenizer`] | Thin wrapper around the Hugging Face `tokenizers` crate |
//! | [`device`] | Accelerator discovery and device construction |
//! | [`model`] | The [`CausalLm`] trait both teacher and student implement |
//! | [`hf`] | [`HfCausalLm`], Llama/Qwen2 checkpoints in the Hugging Face layout |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `test-util` | Export the [`testing`] fixtures to other crates' tests |

pub mod device;
pub mod error;
pub mod hf;
pub mod model;
pub mod tokenizer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use device::{accelerator_count, training_dtype, Placement};
pub use error::{CoreError, CoreResult};
pub use hf::{collect_safetensor_paths, HfCausalLm, HfConfig};
pub use model::CausalLm;
pub use tokenizer::Tokenizer;
