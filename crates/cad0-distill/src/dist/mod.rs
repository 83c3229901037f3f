//! Distributed context: worker identity, device placement and collectives.
//!
//! One OS process runs per worker.  Identity comes from the launcher's
//! environment (`RANK`, `LOCAL_RANK`, `WORLD_SIZE`, `MASTER_ADDR`,
//! `MASTER_PORT`); a run without those variables is a single worker with a
//! no-op [`LocalGroup`].  Multi-worker runs talk over a [`TcpGroup`] with
//! rank 0 as the hub.
//!
//! Collectives operate on flat `f32` buffers.  Gradients and parameters are
//! flattened in [`cad0_core::CausalLm::named_vars`] order, which is identical
//! on every worker.

mod tcp;

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::time::Duration;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use thiserror::Error;
use tracing::{debug, info};

use cad0_core::Placement;

use crate::error::{DistillResult, ErrorClass};

pub use tcp::TcpGroup;

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DistributedError {
    #[error("Invalid distributed environment: {0}")]
    Env(String),

    #[error("Cannot place models: {0}")]
    Placement(String),

    #[error("Rendezvous with {addr} failed: {source}")]
    Rendezvous {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("Lost peer rank {rank}: {reason}")]
    PeerLost { rank: usize, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DistributedError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DistributedError::Env(_) => ErrorClass::Config,
            DistributedError::Placement(_) => ErrorClass::Device,
            _ => ErrorClass::Distributed,
        }
    }
}

pub type DistResult<T> = Result<T, DistributedError>;

// ── Collective group ──────────────────────────────────────────────────────────

/// A process group able to synchronize workers and combine flat buffers.
///
/// Every worker must call the same collectives in the same order with
/// buffers of the same length.
pub trait Collective: Send {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Block until every worker has reached the barrier.
    fn barrier(&mut self) -> DistResult<()>;
    /// Replace `buf` with the element-wise mean across workers.
    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> DistResult<()>;
    /// Replace `buf` with rank 0's contents.
    fn broadcast(&mut self, buf: &mut [f32]) -> DistResult<()>;
}

/// The trivial group of a single worker.
#[derive(Debug, Default)]
pub struct LocalGroup;

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&mut self) -> DistResult<()> {
        Ok(())
    }

    fn all_reduce_mean(&mut self, _buf: &mut [f32]) -> DistResult<()> {
        Ok(())
    }

    fn broadcast(&mut self, _buf: &mut [f32]) -> DistResult<()> {
        Ok(())
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl WorkerIdentity {
    pub fn single() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }

    pub fn from_env() -> DistResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse identity from a variable lookup.
    ///
    /// All of `RANK`, `WORLD_SIZE` absent means a single worker.  `LOCAL_RANK`
    /// defaults to `RANK`.
    pub fn from_lookup<F>(lookup: F) -> DistResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank = parse_var::<usize>(&lookup, "RANK")?;
        let world_size = parse_var::<usize>(&lookup, "WORLD_SIZE")?;
        let local_rank = parse_var::<usize>(&lookup, "LOCAL_RANK")?;
        let master_addr = lookup("MASTER_ADDR")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port = parse_var::<u16>(&lookup, "MASTER_PORT")?.unwrap_or(DEFAULT_MASTER_PORT);

        let (rank, world_size) = match (rank, world_size) {
            (None, None) => {
                if local_rank.is_some_and(|l| l != 0) {
                    return Err(DistributedError::Env(
                        "LOCAL_RANK set without RANK and WORLD_SIZE".into(),
                    ));
                }
                (0, 1)
            }
            (Some(r), Some(w)) => (r, w),
            (Some(_), None) => {
                return Err(DistributedError::Env("RANK set without WORLD_SIZE".into()))
            }
            (None, Some(_)) => {
                return Err(DistributedError::Env("WORLD_SIZE set without RANK".into()))
            }
        };
        let local_rank = local_rank.unwrap_or(rank);

        if world_size == 0 {
            return Err(DistributedError::Env("WORLD_SIZE must be >= 1".into()));
        }
        if rank >= world_size {
            return Err(DistributedError::Env(format!(
                "RANK {rank} out of range for WORLD_SIZE {world_size}"
            )));
        }
        if local_rank >= world_size {
            return Err(DistributedError::Env(format!(
                "LOCAL_RANK {local_rank} out of range for WORLD_SIZE {world_size}"
            )));
        }

        Ok(Self { rank, local_rank, world_size, master_addr, master_port })
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    fn rendezvous_addr(&self) -> DistResult<SocketAddr> {
        let spec = format!("{}:{}", self.master_addr, self.master_port);
        spec.to_socket_addrs()
            .map_err(|source| DistributedError::Rendezvous { addr: spec.clone(), source })?
            .next()
            .ok_or_else(|| DistributedError::Env(format!("{spec} did not resolve")))
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> DistResult<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| DistributedError::Env(format!("{key}={raw:?} is not a valid number"))),
    }
}

// ── Placement ─────────────────────────────────────────────────────────────────

/// Which device each model of a worker lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePlan {
    pub student: Placement,
    pub teacher: Placement,
}

impl DevicePlan {
    /// Assign devices given the number of visible accelerators.
    ///
    /// Multi-worker runs give each worker its own pair: student on
    /// `2 * local_rank`, teacher on `2 * local_rank + 1`.
    pub fn resolve(world_size: usize, local_rank: usize, accelerators: usize) -> DistResult<Self> {
        if world_size > 1 {
            let student = 2 * local_rank;
            let teacher = student + 1;
            if teacher >= accelerators {
                return Err(DistributedError::Placement(format!(
                    "worker with local rank {local_rank} needs accelerators {student} and \
                     {teacher}, but only {accelerators} are visible"
                )));
            }
            return Ok(Self { student: Placement::Cuda(student), teacher: Placement::Cuda(teacher) });
        }
        Ok(match accelerators {
            0 => Self { student: Placement::Cpu, teacher: Placement::Cpu },
            1 => Self { student: Placement::Cuda(0), teacher: Placement::Cuda(0) },
            _ => Self { student: Placement::Cuda(0), teacher: Placement::Cuda(1) },
        })
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Immutable per-worker facts, fixed at startup.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub student_device: Device,
    pub teacher_device: Device,
}

/// Worker identity, devices and the collective group.
///
/// Dropping the context tears the group down.
pub struct DistributedContext {
    worker: WorkerContext,
    group: Box<dyn Collective>,
}

impl DistributedContext {
    /// Materialize the planned devices and join the process group.
    pub fn init(
        identity: &WorkerIdentity,
        plan: DevicePlan,
        timeout: Duration,
    ) -> DistillResult<Self> {
        let student_device = plan.student.materialize()?;
        let teacher_device = plan.teacher.materialize()?;

        let group: Box<dyn Collective> = if identity.world_size == 1 {
            Box::new(LocalGroup)
        } else {
            let addr = identity.rendezvous_addr()?;
            if identity.is_main() {
                let listener = TcpListener::bind(addr).map_err(|source| {
                    DistributedError::Rendezvous { addr: addr.to_string(), source }
                })?;
                Box::new(TcpGroup::leader(listener, identity.world_size, timeout)?)
            } else {
                Box::new(TcpGroup::follower(addr, identity.rank, identity.world_size, timeout)?)
            }
        };

        info!(
            rank = identity.rank,
            local_rank = identity.local_rank,
            world_size = identity.world_size,
            student_device = %plan.student,
            teacher_device = %plan.teacher,
            "Distributed context initialised"
        );

        let worker = WorkerContext {
            rank: identity.rank,
            local_rank: identity.local_rank,
            world_size: identity.world_size,
            student_device,
            teacher_device,
        };
        Ok(Self { worker, group })
    }

    /// Wrap an existing group; both models live on `device`.
    pub fn with_group(group: Box<dyn Collective>, device: Device) -> Self {
        let worker = WorkerContext {
            rank: group.rank(),
            local_rank: group.rank(),
            world_size: group.world_size(),
            student_device: device.clone(),
            teacher_device: device,
        };
        Self { worker, group }
    }

    /// Single worker on the CPU.
    pub fn local() -> Self {
        Self::with_group(Box::new(LocalGroup), Device::Cpu)
    }

    pub fn worker(&self) -> &WorkerContext {
        &self.worker
    }

    pub fn rank(&self) -> usize {
        self.worker.rank
    }

    pub fn world_size(&self) -> usize {
        self.worker.world_size
    }

    /// Only the main worker writes checkpoints and emits metrics.
    pub fn is_main(&self) -> bool {
        self.worker.rank == 0
    }

    pub fn barrier(&mut self) -> DistResult<()> {
        self.group.barrier()
    }

    pub fn all_reduce_mean(&mut self, buf: &mut [f32]) -> DistResult<()> {
        self.group.all_reduce_mean(buf)
    }

    pub fn broadcast(&mut self, buf: &mut [f32]) -> DistResult<()> {
        self.group.broadcast(buf)
    }

    /// Replace every gradient in `grads` with its mean across workers.
    ///
    /// Parameters without a gradient contribute zeros so buffers line up.
    pub fn average_gradients(&mut self, vars: &[Var], grads: &mut GradStore) -> DistillResult<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        let mut flat = Vec::new();
        for var in vars {
            match grads.get(var.as_tensor()) {
                Some(g) => flat.extend(host_f32(g)?),
                None => flat.extend(std::iter::repeat(0f32).take(var.elem_count())),
            }
        }
        self.group.all_reduce_mean(&mut flat)?;

        let mut offset = 0;
        for var in vars {
            let n = var.elem_count();
            let g = from_host(&flat[offset..offset + n], var)?;
            grads.insert(var.as_tensor(), g);
            offset += n;
        }
        debug!(elements = flat.len(), "Gradients averaged");
        Ok(())
    }

    /// Overwrite every parameter with rank 0's value.
    pub fn broadcast_parameters(&mut self, vars: &[Var]) -> DistillResult<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        let mut flat = Vec::new();
        for var in vars {
            flat.extend(host_f32(var.as_tensor())?);
        }
        self.group.broadcast(&mut flat)?;

        if !self.is_main() {
            let mut offset = 0;
            for var in vars {
                let n = var.elem_count();
                var.set(&from_host(&flat[offset..offset + n], var)?)?;
                offset += n;
            }
        }
        info!(elements = flat.len(), "Student parameters synchronised from rank 0");
        Ok(())
    }
}

fn host_f32(t: &Tensor) -> candle_core::Result<Vec<f32>> {
    t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()
}

fn from_host(values: &[f32], like: &Var) -> candle_core::Result<Tensor> {
    Tensor::from_slice(values, like.shape(), like.device())?.to_dtype(like.dtype())
}
