use thiserror::Error;

use cad0_core::CoreError;

use crate::dist::DistributedError;

#[derive(Debug, Error)]
pub enum DistillError {
    #[error("Invalid configuration: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Dataset too small: {found} usable examples, at least {required} required")]
    DatasetTooSmall { found: usize, required: usize },

    #[error("Data error: {0}")]
    Data(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("Run interrupted")]
    Interrupted,
}

/// Coarse failure class reported in logs and the `run_failed` metrics record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Config,
    Data,
    Device,
    Distributed,
    Io,
    Interrupted,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Config => "ConfigError",
            ErrorClass::Data => "DataError",
            ErrorClass::Device => "DeviceError",
            ErrorClass::Distributed => "DistributedError",
            ErrorClass::Io => "IoError",
            ErrorClass::Interrupted => "Interrupted",
        }
    }

    /// Stable numeric code, used where only scalars can be recorded.
    pub fn code(self) -> f64 {
        match self {
            ErrorClass::Config => 1.0,
            ErrorClass::Data => 2.0,
            ErrorClass::Device => 3.0,
            ErrorClass::Distributed => 4.0,
            ErrorClass::Io => 5.0,
            ErrorClass::Interrupted => 6.0,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DistillError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DistillError::Config { field: field.into(), reason: reason.into() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DistillError::Config { .. } => ErrorClass::Config,
            DistillError::DatasetTooSmall { .. } | DistillError::Data(_) => ErrorClass::Data,
            DistillError::Io(_) => ErrorClass::Io,
            DistillError::Json(_) => ErrorClass::Data,
            DistillError::Tensor(_) => ErrorClass::Device,
            DistillError::Core(e) => match e {
                CoreError::Candle(_) | CoreError::DeviceUnavailable(_) => ErrorClass::Device,
                CoreError::Io(_) | CoreError::MissingFile(_) => ErrorClass::Io,
                CoreError::Tokenizer(_) | CoreError::Json(_) | CoreError::Config { .. } => {
                    ErrorClass::Config
                }
            },
            DistillError::Distributed(e) => e.class(),
            DistillError::Interrupted => ErrorClass::Interrupted,
        }
    }
}

pub type DistillResult<T> = Result<T, DistillError>;
