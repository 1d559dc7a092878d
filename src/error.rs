use thiserror::Error;

/// Spatial axis named in geometry diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Height,
    Width,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Height => f.write_str("H"),
            Axis::Width => f.write_str("W"),
        }
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(
        "invalid {axis} stride (non multiple {axis} sizes): have {axis}_in={input}, \
         {axis}_ker={kernel}, pad_lo={pad_lo}, pad_hi={pad_hi}, {axis}_stride={stride}, \
         remainder={remainder}"
    )]
    InvalidGeometry {
        axis: Axis,
        input: usize,
        kernel: usize,
        pad_lo: usize,
        pad_hi: usize,
        stride: usize,
        remainder: usize,
    },
    #[error("{name} len {actual} != expected {expected}")]
    ShapeMismatch {
        name: &'static str,
        actual: usize,
        expected: usize,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("dma transfer rejected: {0}")]
    Dma(String),
    #[error("worker {worker} failed: {source}")]
    Worker {
        worker: usize,
        #[source]
        source: Box<KernelError>,
    },
    #[error("scratchpad exhausted: {required} bytes required, {available} available")]
    ScratchExhausted { required: usize, available: usize },
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Wrap a failure observed inside a forked worker.
    pub(crate) fn in_worker(worker: usize, err: KernelError) -> Self {
        KernelError::Worker {
            worker,
            source: Box::new(err),
        }
    }
}
