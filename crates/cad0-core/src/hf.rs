//! Llama-family decoders in the Hugging Face checkpoint layout.
//!
//! [`HfCausalLm`] reads the `config.json` written by `transformers` for Llama,
//! Qwen2 and Mistral style models together with single-file or sharded
//! safetensors weights.  Parameter names are the checkpoint's own
//! (`model.layers.{i}.self_attn.q_proj.weight`, ...), so a saved student loads
//! back into any Hugging Face compatible runtime.
//!
//! The fused RMSNorm, rotary and last-dim softmax kernels in candle-nn are
//! forward-only, which would stop gradients at every block.  The layers below
//! use the differentiable equivalents (`rope_slow`, `ops::softmax`, an RMSNorm
//! from elementary ops) and candle-transformers' grouped-query `repeat_kv`.
//!
//! ## Directory layout
//!
//! ```text
//! <dir>/config.json                        HfConfig
//! <dir>/model.safetensors                  single-file weights, or
//! <dir>/model.safetensors.index.json       shard index (weight_map: name -> file)
//! <dir>/model-00001-of-0000N.safetensors
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::rotary_emb::rope_slow;
use candle_nn::{Activation, Embedding, Init, Linear, VarBuilder, VarMap};
use candle_transformers::utils::repeat_kv;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::training_dtype;
use crate::error::{CoreError, CoreResult};
use crate::model::{CausalLm, CONFIG_FILE, WEIGHTS_FILE};

/// Shard index written next to multi-file checkpoints.
pub const INDEX_FILE: &str = "model.safetensors.index.json";

const EMBED_WEIGHT: &str = "model.embed_tokens.weight";
const LM_HEAD_WEIGHT: &str = "lm_head.weight";
const INIT_STD: f64 = 0.02;
const MASK_PENALTY: f64 = 1e9;

// ── Config ────────────────────────────────────────────────────────────────────

/// The part of a `transformers` `config.json` the decoder reads.
///
/// Keys not modelled here are kept in `extra` and written back on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HfConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_key_value_heads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_dim: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: Activation,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Bias on the q/k/v projections.  Qwen2 always has one without saying so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention_bias: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_model_type() -> String {
    "llama".into()
}
fn default_max_position_embeddings() -> usize {
    4096
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_rope_theta() -> f64 {
    10_000.0
}
fn default_hidden_act() -> Activation {
    Activation::Silu
}

impl HfConfig {
    /// A very small Qwen2-shaped configuration (grouped-query attention,
    /// q/k/v bias, untied head), useful for smoke runs and tests.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            model_type: "qwen2".into(),
            vocab_size,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: None,
            max_position_embeddings: 128,
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            hidden_act: Activation::Silu,
            tie_word_embeddings: false,
            attention_bias: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim.unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn qkv_bias(&self) -> bool {
        self.attention_bias.unwrap_or(self.model_type == "qwen2")
    }

    pub fn validate(&self) -> CoreResult<()> {
        let bad = |field: &str, reason: &str| {
            Err(CoreError::Config { field: field.into(), reason: reason.into() })
        };
        if self.vocab_size == 0 {
            return bad("vocab_size", "must be > 0");
        }
        if self.num_hidden_layers == 0 {
            return bad("num_hidden_layers", "must be > 0");
        }
        if self.num_attention_heads == 0 {
            return bad("num_attention_heads", "must be > 0");
        }
        if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return bad("num_attention_heads", "must divide hidden_size");
        }
        let head_dim = self.head_dim();
        if head_dim == 0 || head_dim % 2 != 0 {
            return bad("head_dim", "rotary embeddings need an even, non-zero head size");
        }
        let kv = self.num_kv_heads();
        if kv == 0 || self.num_attention_heads % kv != 0 {
            return bad("num_key_value_heads", "must divide num_attention_heads");
        }
        if self.max_position_embeddings == 0 {
            return bad("max_position_embeddings", "must be > 0");
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(CoreError::MissingFile(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
}

// ── Weight files ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// The safetensors files holding a model's weights.
///
/// A `model.safetensors.index.json` wins over a single `model.safetensors`;
/// its shards are returned once each, in name order.
pub fn collect_safetensor_paths(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let index_path = dir.join(INDEX_FILE);
    if index_path.exists() {
        let index: ShardIndex = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
        let shards: BTreeSet<&String> = index.weight_map.values().collect();
        if shards.is_empty() {
            return Err(CoreError::Config {
                field: "weight_map".into(),
                reason: format!("{} lists no shards", index_path.display()),
            });
        }
        let paths: Vec<PathBuf> = shards.into_iter().map(|s| dir.join(s)).collect();
        if let Some(missing) = paths.iter().find(|p| !p.exists()) {
            return Err(CoreError::MissingFile(missing.display().to_string()));
        }
        return Ok(paths);
    }

    let single = dir.join(WEIGHTS_FILE);
    if single.exists() {
        return Ok(vec![single]);
    }
    Err(CoreError::MissingFile(single.display().to_string()))
}

// ── Layers ────────────────────────────────────────────────────────────────────

/// RMSNorm computed in F32.
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> CoreResult<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x.broadcast_div(&(mean_sq + self.eps)?.sqrt()?)?;
        Ok(normed.to_dtype(dtype)?.broadcast_mul(&self.weight)?)
    }
}

fn linear(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> CoreResult<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn { mean: 0.0, stdev: INIT_STD },
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

struct Rotary {
    cos: Tensor,
    sin: Tensor,
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &HfConfig, vb: VarBuilder) -> CoreResult<Self> {
        let (h, d, bias) = (cfg.hidden_size, cfg.head_dim(), cfg.qkv_bias());
        let (num_heads, num_kv_heads) = (cfg.num_attention_heads, cfg.num_kv_heads());
        Ok(Self {
            q_proj: linear(h, num_heads * d, bias, vb.pp("q_proj"))?,
            k_proj: linear(h, num_kv_heads * d, bias, vb.pp("k_proj"))?,
            v_proj: linear(h, num_kv_heads * d, bias, vb.pp("v_proj"))?,
            o_proj: linear(num_heads * d, h, false, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim: d,
        })
    }

    /// `bias` is `[batch, 1, seq, seq]`, 0 where attention is allowed and a
    /// large negative value elsewhere.
    fn forward(&self, x: &Tensor, rotary: &Rotary, bias: &Tensor) -> CoreResult<Tensor> {
        let (b, s, _) = x.dims3()?;
        let heads = |t: Tensor, n: usize| -> CoreResult<Tensor> {
            Ok(t.reshape((b, s, n, self.head_dim))?.transpose(1, 2)?.contiguous()?)
        };
        let q = heads(self.q_proj.forward(x)?, self.num_heads)?;
        let k = heads(self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = heads(self.v_proj.forward(x)?, self.num_kv_heads)?;

        let q = rope_slow(&q, &rotary.cos, &rotary.sin)?;
        let k = rope_slow(&k, &rotary.cos, &rotary.sin)?;
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?.broadcast_add(bias)?;
        let probs = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(v.dtype())?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl Mlp {
    fn new(cfg: &HfConfig, vb: VarBuilder) -> CoreResult<Self> {
        let (h, i) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: linear(h, i, false, vb.pp("gate_proj"))?,
            up_proj: linear(h, i, false, vb.pp("up_proj"))?,
            down_proj: linear(i, h, false, vb.pp("down_proj"))?,
            act: cfg.hidden_act,
        })
    }

    fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        let gate = self.act.forward(&self.gate_proj.forward(x)?)?;
        let hidden = (gate * self.up_proj.forward(x)?)?;
        Ok(self.down_proj.forward(&hidden)?)
    }
}

struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn new(cfg: &HfConfig, vb: VarBuilder) -> CoreResult<Self> {
        let eps = cfg.rms_norm_eps;
        Ok(Self {
            input_layernorm: RmsNorm::new(cfg.hidden_size, eps, vb.pp("input_layernorm"))?,
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            post_attention_layernorm: RmsNorm::new(
                cfg.hidden_size,
                eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &Rotary, bias: &Tensor) -> CoreResult<Tensor> {
        let attn = self.self_attn.forward(&self.input_layernorm.forward(x)?, rotary, bias)?;
        let x = (x + attn)?;
        let mlp = self.mlp.forward(&self.post_attention_layernorm.forward(&x)?)?;
        Ok((x + mlp)?)
    }
}

/// Modules built on top of the tensors held in the `VarMap`.
///
/// Rebuilt whenever the variables are replaced (resize, device move, tying).
struct Layers {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
}

impl Layers {
    fn build(cfg: &HfConfig, vb: VarBuilder) -> CoreResult<Self> {
        let vb_m = vb.pp("model");
        let embed_w = vb_m.pp("embed_tokens").get_with_hints(
            (cfg.vocab_size, cfg.hidden_size),
            "weight",
            Init::Randn { mean: 0.0, stdev: INIT_STD },
        )?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::new(cfg, vb_m.pp(format!("layers.{i}"))))
            .collect::<CoreResult<Vec<_>>>()?;
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_w.clone(), None)
        } else {
            linear(cfg.hidden_size, cfg.vocab_size, false, vb.pp("lm_head"))?
        };
        Ok(Self {
            embed_tokens: Embedding::new(embed_w, cfg.hidden_size),
            layers,
            norm,
            lm_head,
        })
    }
}

// ── HfCausalLm ────────────────────────────────────────────────────────────────

/// Trainable Llama-family decoder.
pub struct HfCausalLm {
    config: HfConfig,
    varmap: VarMap,
    layers: Layers,
    device: Device,
    dtype: DType,
}

impl HfCausalLm {
    /// Create a model with freshly initialised weights on `device`.
    pub fn new(config: HfConfig, device: &Device) -> CoreResult<Self> {
        config.validate()?;
        let dtype = training_dtype(device);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let layers = Layers::build(&config, vb)?;
        Ok(Self { config, varmap, layers, device: device.clone(), dtype })
    }

    /// Load a Hugging Face model directory.
    ///
    /// Shards are read one at a time.  A checkpoint without `lm_head.weight`
    /// is treated as having a tied head, whatever its config says.
    pub fn load(dir: &Path, device: &Device) -> CoreResult<Self> {
        let config = HfConfig::from_file(&dir.join(CONFIG_FILE))?;
        let shards = collect_safetensor_paths(dir)?;
        let mut model = Self::new(config, device)?;

        let vars: HashMap<String, Var> = model.named_vars().into_iter().collect();
        let mut loaded = HashSet::new();
        for shard in &shards {
            for (name, tensor) in candle_core::safetensors::load(shard, device)? {
                let Some(var) = vars.get(&name) else { continue };
                if tensor.dims() != var.dims() {
                    return Err(CoreError::Config {
                        field: name,
                        reason: format!(
                            "shape {:?} in {} does not match {:?} from config.json",
                            tensor.dims(),
                            shard.display(),
                            var.dims()
                        ),
                    });
                }
                var.set(&tensor.to_dtype(var.dtype())?)?;
                loaded.insert(name);
            }
        }

        let mut missing: Vec<&String> = vars.keys().filter(|n| !loaded.contains(*n)).collect();
        if missing.len() == 1 && missing[0] == LM_HEAD_WEIGHT {
            model.tie_lm_head()?;
            missing.clear();
        }
        if let Some(name) = missing.into_iter().min() {
            return Err(CoreError::Config {
                field: name.clone(),
                reason: format!("missing from the weights in {}", dir.display()),
            });
        }

        info!(
            dir = %dir.display(),
            model_type = %model.config.model_type,
            vocab_size = model.config.vocab_size,
            layers = model.config.num_hidden_layers,
            shards = shards.len(),
            params = model.param_count(),
            "Model loaded"
        );
        Ok(model)
    }

    pub fn config(&self) -> &HfConfig {
        &self.config
    }

    fn rebuild(&mut self) -> CoreResult<()> {
        let vb = VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device);
        self.layers = Layers::build(&self.config, vb)?;
        Ok(())
    }

    fn lock_vars(&self) -> CoreResult<std::sync::MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap.data().lock().map_err(|_| CoreError::Config {
            field: "varmap".into(),
            reason: "parameter store lock poisoned".into(),
        })
    }

    /// Drop the separate LM head and reuse the input embeddings.
    fn tie_lm_head(&mut self) -> CoreResult<()> {
        self.lock_vars()?.remove(LM_HEAD_WEIGHT);
        self.config.tie_word_embeddings = true;
        debug!("No lm_head.weight in checkpoint; tying it to the input embeddings");
        self.rebuild()
    }

    /// Rotary tables for `seq_len` positions: `[seq_len, head_dim / 2]` each.
    fn rotary(&self, seq_len: usize) -> CoreResult<Rotary> {
        let head_dim = self.config.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim / 2)
            .map(|i| 1.0 / self.config.rope_theta.powf((2 * i) as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, head_dim / 2), &self.device)?;
        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        Ok(Rotary {
            cos: freqs.cos()?.to_dtype(self.dtype)?,
            sin: freqs.sin()?.to_dtype(self.dtype)?,
        })
    }

    /// Additive attention bias combining the causal mask with the key padding
    /// mask: `[batch, 1, seq, seq]`.
    fn attention_bias(&self, attention_mask: &Tensor, b: usize, s: usize) -> CoreResult<Tensor> {
        let causal: Vec<f32> = (0..s)
            .flat_map(|i| (0..s).map(move |j| if j <= i { 1.0 } else { 0.0 }))
            .collect();
        let causal = Tensor::from_vec(causal, (1, 1, s, s), &self.device)?;
        let keys = attention_mask
            .to_device(&self.device)?
            .to_dtype(DType::F32)?
            .reshape((b, 1, 1, s))?;
        let allowed = causal.broadcast_mul(&keys)?;
        Ok(allowed.affine(MASK_PENALTY, -MASK_PENALTY)?.to_dtype(self.dtype)?)
    }
}

impl CausalLm for HfCausalLm {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> CoreResult<Tensor> {
        let (b, s) = input_ids.dims2()?;
        if s > self.config.max_position_embeddings {
            return Err(CoreError::Config {
                field: "max_position_embeddings".into(),
                reason: format!(
                    "sequence length {s} exceeds {}",
                    self.config.max_position_embeddings
                ),
            });
        }

        let rotary = self.rotary(s)?;
        let bias = self.attention_bias(attention_mask, b, s)?;
        let mut x = self.layers.embed_tokens.forward(input_ids)?;
        for layer in &self.layers.layers {
            x = layer.forward(&x, &rotary, &bias)?;
        }
        let x = self.layers.norm.forward(&x)?;
        Ok(self.layers.lm_head.forward(&x)?)
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn resize_token_embeddings(&mut self, new_size: usize) -> CoreResult<()> {
        let old_size = self.config.vocab_size;
        if new_size <= old_size {
            return Ok(());
        }
        let names: &[&str] = if self.config.tie_word_embeddings {
            &[EMBED_WEIGHT]
        } else {
            &[EMBED_WEIGHT, LM_HEAD_WEIGHT]
        };
        {
            let mut data = self.lock_vars()?;
            for &name in names {
                let var = data.get(name).ok_or_else(|| CoreError::Config {
                    field: name.into(),
                    reason: "parameter not found".into(),
                })?;
                let fresh = Tensor::randn(
                    0f32,
                    INIT_STD as f32,
                    (new_size - old_size, self.config.hidden_size),
                    &self.device,
                )?
                .to_dtype(self.dtype)?;
                let grown = Tensor::cat(&[var.as_tensor(), &fresh], 0)?;
                data.insert(name.to_string(), Var::from_tensor(&grown)?);
            }
        }
        self.config.vocab_size = new_size;
        self.rebuild()?;
        debug!(old_size, new_size, "Resized token embeddings");
        Ok(())
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn place(&mut self, device: &Device) -> CoreResult<()> {
        if device.same_device(&self.device) {
            return Ok(());
        }
        let dtype = training_dtype(device);
        {
            let mut data = self.lock_vars()?;
            for var in data.values_mut() {
                let moved = var.as_tensor().to_device(device)?.to_dtype(dtype)?;
                *var = Var::from_tensor(&moved)?;
            }
        }
        self.device = device.clone();
        self.dtype = dtype;
        self.rebuild()
    }

    /// Writes a single `model.safetensors` in F32; a stale shard index in
    /// `dir` is removed so the new file is the one that loads.
    fn save(&self, dir: &Path) -> CoreResult<()> {
        std::fs::create_dir_all(dir)?;
        let tensors = self
            .named_vars()
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().to_dtype(DType::F32)?)))
            .collect::<CoreResult<HashMap<String, Tensor>>>()?;
        candle_core::safetensors::save(&tensors, dir.join(WEIGHTS_FILE))?;

        let index = dir.join(INDEX_FILE);
        if index.exists() {
            std::fs::remove_file(&index)?;
        }
        let mut config = self.config.clone();
        config.extra.insert("torch_dtype".into(), "float32".into());
        std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&config)?)?;
        debug!(dir = %dir.display(), tensors = tensors.len(), "Model saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Trimmed `config.json` of a Qwen2.5 0.5B checkpoint.
    const QWEN2_CONFIG: &str = r#"{
        "architectures": ["Qwen2ForCausalLM"],
        "attention_dropout": 0.0,
        "bos_token_id": 151643,
        "eos_token_id": 151643,
        "hidden_act": "silu",
        "hidden_size": 32,
        "initializer_range": 0.02,
        "intermediate_size": 48,
        "max_position_embeddings": 32768,
        "max_window_layers": 24,
        "model_type": "qwen2",
        "num_attention_heads": 4,
        "num_hidden_layers": 2,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-06,
        "rope_theta": 1000000.0,
        "sliding_window": 32768,
        "tie_word_embeddings": true,
        "torch_dtype": "bfloat16",
        "transformers_version": "4.43.1",
        "use_cache": true,
        "use_sliding_window": false,
        "vocab_size": 24
    }"#;

    fn ids(rows: &[&[u32]]) -> Tensor {
        let s = rows[0].len();
        let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), s), &Device::Cpu).unwrap()
    }

    fn tiny(vocab: usize) -> HfCausalLm {
        HfCausalLm::new(HfConfig::tiny(vocab), &Device::Cpu).unwrap()
    }

    fn logits(model: &HfCausalLm) -> Vec<f32> {
        let input = ids(&[&[1, 2, 3]]);
        let mask = ids(&[&[1, 1, 1]]);
        model.forward(&input, &mask).unwrap().flatten_all().unwrap().to_vec1().unwrap()
    }

    fn names(model: &HfCausalLm) -> Vec<String> {
        model.named_vars().into_iter().map(|(n, _)| n).collect()
    }

    #[test]
    fn parses_qwen2_config() {
        let cfg: HfConfig = serde_json::from_str(QWEN2_CONFIG).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.model_type, "qwen2");
        assert_eq!(cfg.num_hidden_layers, 2);
        assert_eq!(cfg.num_kv_heads(), 2);
        assert_eq!(cfg.head_dim(), 8);
        assert!(cfg.qkv_bias());
        assert!(cfg.tie_word_embeddings);
        assert_eq!(cfg.hidden_act, Activation::Silu);
        assert_eq!(cfg.extra.get("sliding_window"), Some(&serde_json::json!(32768)));
    }

    #[test]
    fn llama_config_defaults() {
        let cfg: HfConfig = serde_json::from_str(
            r#"{"vocab_size": 16, "hidden_size": 32, "intermediate_size": 64,
                "num_hidden_layers": 1, "num_attention_heads": 4}"#,
        )
        .unwrap();
        assert_eq!(cfg.model_type, "llama");
        assert_eq!(cfg.num_kv_heads(), 4);
        assert!(!cfg.qkv_bias());
        assert!(!cfg.tie_word_embeddings);
    }

    #[test]
    fn qwen2_directory_loads() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg: HfConfig = serde_json::from_str(QWEN2_CONFIG).unwrap();
        HfCausalLm::new(cfg, &Device::Cpu).unwrap().save(dir.path()).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), QWEN2_CONFIG).unwrap();

        let model = HfCausalLm::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(model.vocab_size(), 24);
        assert!(names(&model).contains(&"model.layers.1.self_attn.k_proj.bias".to_string()));
        assert!(!names(&model).contains(&LM_HEAD_WEIGHT.to_string()));
    }

    #[test]
    fn forward_shape_with_grouped_query_attention() {
        let model = tiny(20);
        let out = model
            .forward(&ids(&[&[1, 2, 3, 0], &[4, 5, 0, 0]]), &ids(&[&[1, 1, 1, 0], &[1, 1, 0, 0]]))
            .unwrap();
        assert_eq!(out.dims(), &[2, 4, 20]);
    }

    #[test]
    fn causal_prefix_unaffected_by_later_tokens() {
        let model = tiny(20);
        let full = ids(&[&[1, 1, 1]]);
        let a = model.forward(&ids(&[&[3, 4, 5]]), &full).unwrap();
        let b = model.forward(&ids(&[&[3, 4, 9]]), &full).unwrap();
        let a1: Vec<f32> = a.get(0).unwrap().get(1).unwrap().to_vec1().unwrap();
        let b1: Vec<f32> = b.get(0).unwrap().get(1).unwrap().to_vec1().unwrap();
        for (x, y) in a1.iter().zip(&b1) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn parameter_names_follow_checkpoint_layout() {
        let qwen = names(&tiny(10));
        let mut sorted = qwen.clone();
        sorted.sort();
        assert_eq!(qwen, sorted);
        for name in [
            EMBED_WEIGHT,
            LM_HEAD_WEIGHT,
            "model.norm.weight",
            "model.layers.0.input_layernorm.weight",
            "model.layers.0.self_attn.q_proj.bias",
            "model.layers.0.mlp.gate_proj.weight",
        ] {
            assert!(qwen.contains(&name.to_string()), "missing {name}");
        }

        let llama = HfConfig { model_type: "llama".into(), ..HfConfig::tiny(10) };
        let llama = names(&HfCausalLm::new(llama, &Device::Cpu).unwrap());
        assert!(!llama.iter().any(|n| n.ends_with("q_proj.bias")));
    }

    #[test]
    fn resize_grows_and_keeps_old_rows() {
        let mut model = tiny(10);
        let before: Vec<Vec<f32>> = model.layers.embed_tokens.embeddings().to_vec2().unwrap();

        model.resize_token_embeddings(14).unwrap();
        assert_eq!(model.vocab_size(), 14);
        let after: Vec<Vec<f32>> = model.layers.embed_tokens.embeddings().to_vec2().unwrap();
        assert_eq!(after.len(), 14);
        assert_eq!(&after[..10], &before[..]);

        let out = model.forward(&ids(&[&[13, 2]]), &ids(&[&[1, 1]])).unwrap();
        assert_eq!(out.dims(), &[1, 2, 14]);
    }

    #[test]
    fn resize_tied_head_follows_embeddings() {
        let cfg = HfConfig { tie_word_embeddings: true, ..HfConfig::tiny(10) };
        let mut model = HfCausalLm::new(cfg, &Device::Cpu).unwrap();
        model.resize_token_embeddings(12).unwrap();
        let out = model.forward(&ids(&[&[11]]), &ids(&[&[1]])).unwrap();
        assert_eq!(out.dims(), &[1, 1, 12]);
        assert!(!names(&model).contains(&LM_HEAD_WEIGHT.to_string()));
    }

    #[test]
    fn resize_never_shrinks() {
        let mut model = tiny(10);
        model.resize_token_embeddings(4).unwrap();
        assert_eq!(model.vocab_size(), 10);
    }

    #[test]
    fn save_and_load_round_trip_logits() {
        let dir = tempfile::TempDir::new().unwrap();
        let model = tiny(12);
        model.save(dir.path()).unwrap();

        let loaded = HfCausalLm::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(loaded.config().num_hidden_layers, model.config().num_hidden_layers);
        assert_eq!(loaded.config().extra.get("torch_dtype"), Some(&serde_json::json!("float32")));
        assert_eq!(logits(&model), logits(&loaded));
    }

    #[test]
    fn sharded_checkpoint_loads() {
        let dir = tempfile::TempDir::new().unwrap();
        let model = tiny(12);
        model.save(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join(WEIGHTS_FILE)).unwrap();

        let mut shards: [HashMap<String, Tensor>; 2] = Default::default();
        let mut weight_map = serde_json::Map::new();
        for (i, (name, var)) in model.named_vars().into_iter().enumerate() {
            let file = format!("model-0000{}-of-00002.safetensors", i % 2 + 1);
            weight_map.insert(name.clone(), file.into());
            shards[i % 2].insert(name, var.as_tensor().clone());
        }
        for (i, shard) in shards.iter().enumerate() {
            let file = dir.path().join(format!("model-0000{}-of-00002.safetensors", i + 1));
            candle_core::safetensors::save(shard, file).unwrap();
        }
        let index = serde_json::json!({ "metadata": {}, "weight_map": weight_map });
        std::fs::write(dir.path().join(INDEX_FILE), index.to_string()).unwrap();

        assert_eq!(collect_safetensor_paths(dir.path()).unwrap().len(), 2);
        let loaded = HfCausalLm::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(logits(&model), logits(&loaded));
    }

    #[test]
    fn missing_lm_head_ties_to_embeddings() {
        let dir = tempfile::TempDir::new().unwrap();
        let model = tiny(12);
        let tensors: HashMap<String, Tensor> = model
            .named_vars()
            .into_iter()
            .filter(|(n, _)| n != LM_HEAD_WEIGHT)
            .map(|(n, v)| (n, v.as_tensor().clone()))
            .collect();
        model.save(dir.path()).unwrap();
        candle_core::safetensors::save(&tensors, dir.path().join(WEIGHTS_FILE)).unwrap();

        let loaded = HfCausalLm::load(dir.path(), &Device::Cpu).unwrap();
        assert!(loaded.config().tie_word_embeddings);
        assert_eq!(logits(&loaded).len(), 3 * 12);
    }

    #[test]
    fn missing_layer_weight_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let model = tiny(12);
        let tensors: HashMap<String, Tensor> = model
            .named_vars()
            .into_iter()
            .filter(|(n, _)| n != "model.norm.weight")
            .map(|(n, v)| (n, v.as_tensor().clone()))
            .collect();
        model.save(dir.path()).unwrap();
        candle_core::safetensors::save(&tensors, dir.path().join(WEIGHTS_FILE)).unwrap();

        let err = HfCausalLm::load(dir.path(), &Device::Cpu).err().unwrap();
        assert!(matches!(err, CoreError::Config { ref field, .. } if field == "model.norm.weight"));
    }

    #[test]
    fn no_weights_is_a_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = collect_safetensor_paths(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::MissingFile(_)));
    }

    #[test]
    fn gradients_reach_every_parameter() {
        let model = tiny(10);
        let out = model.forward(&ids(&[&[1, 2, 3]]), &ids(&[&[1, 1, 1]])).unwrap();
        let loss = out.sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();
        for (name, var) in model.named_vars() {
            assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
        }
    }

    #[test]
    fn rejects_overlong_sequences() {
        let cfg = HfConfig { max_position_embeddings: 2, ..HfConfig::tiny(10) };
        let model = HfCausalLm::new(cfg, &Device::Cpu).unwrap();
        let err = model.forward(&ids(&[&[1, 2, 3]]), &ids(&[&[1, 1, 1]])).unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn kv_heads_must_divide_heads() {
        let cfg = HfConfig { num_key_value_heads: Some(3), ..HfConfig::tiny(10) };
        assert!(HfCausalLm::new(cfg, &Device::Cpu).is_err());
    }
}
