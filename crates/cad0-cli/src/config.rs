use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use cad0_distill::DistillConfig;

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub distill: DistillConfig,
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `CAD0_`, sections separated by
///    `__` (e.g. `CAD0_DISTILL__NUM_EPOCHS=5`)
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let d = DistillConfig::default();
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("distill.train_file", d.train_file.to_string_lossy().into_owned())?
        .set_default("distill.num_epochs", d.num_epochs as i64)?
        .set_default("distill.batch_size", d.batch_size as i64)?
        .set_default("distill.learning_rate", d.learning_rate)?
        .set_default("distill.weight_decay", d.weight_decay)?
        .set_default("distill.temperature", d.temperature)?
        .set_default("distill.alpha", d.alpha)?
        .set_default("distill.max_seq_length", d.max_seq_length as i64)?
        .set_default("distill.use_metrics_sink", d.use_metrics_sink)?
        .set_default("distill.seed", d.seed as i64)?
        .set_default("distill.max_grad_norm", d.max_grad_norm)?
        .set_default("distill.warmup_ratio", d.warmup_ratio)?
        .set_default("distill.log_every", d.log_every as i64)?
        .set_default("distill.heartbeat_every", d.heartbeat_every as i64)?
        .set_default("distill.min_examples", d.min_examples as i64)?
        .set_default("distill.collective_timeout_secs", d.collective_timeout_secs as i64)?
        .set_default("distill.prefer_gpu", d.prefer_gpu)?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (CAD0_DISTILL__BATCH_SIZE, etc.)
    builder = builder.add_source(
        Environment::with_prefix("CAD0")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(raw: &Path) -> PathBuf {
    match raw.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => raw.to_path_buf(),
        },
        Err(_) => raw.to_path_buf(),
    }
}
