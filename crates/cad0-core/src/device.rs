use candle_core::{DType, Device};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

/// Where a model should live, decided before any device is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Cpu,
    /// CUDA device ordinal.
    Cuda(usize),
}

impl Placement {
    /// Acquire the device described by this placement.
    ///
    /// Unlike inference, training never silently falls back to CPU: a missing
    /// accelerator is reported as [`CoreError::DeviceUnavailable`].
    pub fn materialize(self) -> CoreResult<Device> {
        match self {
            Placement::Cpu => Ok(Device::Cpu),
            Placement::Cuda(ordinal) => {
                let device = Device::new_cuda(ordinal).map_err(|e| {
                    CoreError::DeviceUnavailable(format!("cuda:{ordinal}: {e}"))
                })?;
                info!(cuda_device_id = ordinal, "Using CUDA device");
                Ok(device)
            }
        }
    }
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Placement::Cpu => write!(f, "cpu"),
            Placement::Cuda(i) => write!(f, "cuda:{i}"),
        }
    }
}

/// Number of CUDA devices visible to this process.
///
/// Returns 0 when the binary was built without CUDA support or `prefer_gpu`
/// is false.  Otherwise the count is taken from `nvidia-smi`; if that cannot
/// be queried a single device is assumed.
pub fn accelerator_count(prefer_gpu: bool) -> usize {
    if !prefer_gpu {
        info!("GPU not requested; using CPU");
        return 0;
    }
    if !candle_core::utils::cuda_is_available() {
        warn!(
            "GPU requested but this binary was not compiled with CUDA support; \
             rebuild with `--features cuda`"
        );
        return 0;
    }
    match query_gpu_count() {
        Some(n) => n,
        None => {
            info!("Cannot query GPU count; assuming a single device");
            1
        }
    }
}

/// Count GPUs via `nvidia-smi`, honouring `CUDA_VISIBLE_DEVICES` when set.
fn query_gpu_count() -> Option<usize> {
    if let Ok(visible) = std::env::var("CUDA_VISIBLE_DEVICES") {
        let n = visible.split(',').filter(|s| !s.trim().is_empty()).count();
        return Some(n);
    }

    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Some(text.lines().filter(|l| !l.trim().is_empty()).count())
}

/// Weight dtype used for training on `device`.
///
/// BF16 on CUDA halves weight memory; CPU stays in F32 because candle has no
/// BF16 kernels there.  Losses are always computed in F32.
pub fn training_dtype(device: &Device) -> DType {
    match device {
        Device::Cuda(_) => DType::BF16,
        _ => DType::F32,
    }
}
