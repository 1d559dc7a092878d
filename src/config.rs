//! Cluster-wide kernel configuration.
//!
//! Defaults are resolved once at construction; the environment can override
//! them for experiments without recompiling:
//!
//! | Variable | Values |
//! |----------|--------|
//! | `TRAIN_KERNELS_WORKERS` | positive integer |
//! | `TRAIN_KERNELS_ACCUM` | `storage`, `widened` |
//! | `TRAIN_KERNELS_MEMORY_PATH` | `direct`, `staged` |
//! | `TRAIN_KERNELS_LAYOUT` | `chw`, `hwc` |

use std::env;

use crate::error::{KernelError, KernelResult};
use crate::kernel_types::{Accumulation, Layout, MemoryPath};

pub const ENV_WORKERS: &str = "TRAIN_KERNELS_WORKERS";
pub const ENV_ACCUM: &str = "TRAIN_KERNELS_ACCUM";
pub const ENV_MEMORY_PATH: &str = "TRAIN_KERNELS_MEMORY_PATH";
pub const ENV_LAYOUT: &str = "TRAIN_KERNELS_LAYOUT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Number of cluster cores taking part in every fork.
    pub num_workers: usize,
    /// Precision of running sums in matmul and softmax.
    pub accumulation: Accumulation,
    /// Default im2col memory path.
    pub memory_path: MemoryPath,
    /// Default activation layout.
    pub layout: Layout,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let num_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            num_workers,
            accumulation: Accumulation::Storage,
            memory_path: MemoryPath::Direct,
            layout: Layout::Chw,
        }
    }
}

impl ClusterConfig {
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_accumulation(mut self, accumulation: Accumulation) -> Self {
        self.accumulation = accumulation;
        self
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> KernelResult<Self> {
        Self::default().apply_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the process environment in
    /// [`ClusterConfig::from_env`]).
    pub fn apply_overrides<F>(mut self, lookup: F) -> KernelResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_WORKERS) {
            let value = value.trim();
            self.num_workers = match value.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid(ENV_WORKERS, value)),
            };
        }
        if let Some(value) = lookup(ENV_ACCUM) {
            let value = value.trim();
            self.accumulation = if value.eq_ignore_ascii_case("storage") {
                Accumulation::Storage
            } else if value.eq_ignore_ascii_case("widened") {
                Accumulation::Widened
            } else {
                return Err(invalid(ENV_ACCUM, value));
            };
        }
        if let Some(value) = lookup(ENV_MEMORY_PATH) {
            let value = value.trim();
            self.memory_path = if value.eq_ignore_ascii_case("direct") {
                MemoryPath::Direct
            } else if value.eq_ignore_ascii_case("staged") {
                MemoryPath::Staged
            } else {
                return Err(invalid(ENV_MEMORY_PATH, value));
            };
        }
        if let Some(value) = lookup(ENV_LAYOUT) {
            let value = value.trim();
            self.layout = if value.eq_ignore_ascii_case("chw") {
                Layout::Chw
            } else if value.eq_ignore_ascii_case("hwc") {
                Layout::Hwc
            } else {
                return Err(invalid(ENV_LAYOUT, value));
            };
        }
        log::debug!("cluster config: {:?}", self);
        Ok(self)
    }
}

fn invalid(key: &str, value: &str) -> KernelError {
    log::error!("invalid value {:?} for {}", value, key);
    KernelError::InvalidConfig(format!("{key}={value}"))
}
