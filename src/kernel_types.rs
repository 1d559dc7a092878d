//! Kernel-related types shared across ops.

/// Float type identifier for const-time kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatType {
    F32,
    F16,
}

impl FloatType {
    /// Storage size of one element in bytes.
    #[inline(always)]
    pub const fn size_bytes(self) -> usize {
        match self {
            FloatType::F32 => 4,
            FloatType::F16 => 2,
        }
    }
}

/// Where running sums are kept while a kernel reduces over an axis.
///
/// `Storage` accumulates in the tensor's own precision, so an f16 dot product
/// rounds after every multiply-add. `Widened` accumulates in f64 and rounds
/// once when the result is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accumulation {
    #[default]
    Storage,
    Widened,
}

/// Memory ordering of an activation volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// Channel-major: adjacent elements are spatial neighbours within a channel.
    #[default]
    Chw,
    /// Channel-minor: adjacent elements are the channels of one spatial position.
    Hwc,
}

/// How the im2col source reaches the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPath {
    /// Source and destination both live in the scratchpad.
    #[default]
    Direct,
    /// Source lives in bulk memory and is staged through 2-D DMA transfers.
    Staged,
}

/// Which operand the im2col transform unrolls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Im2ColMode {
    /// Forward and weight-gradient passes: read the input activations.
    #[default]
    Forward,
    /// Input-gradient pass: read the output gradient as a full correlation.
    InputGrad,
}

/// Training pass a matmul call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Forward,
    WeightGrad,
    InputGrad,
}

/// Matmul algorithm variant requested by a layer.
///
/// Advisory only: every variant must produce the same result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatmulAlgorithm {
    #[default]
    Naive,
    /// Reduction loop unrolled by four.
    Unroll4,
}

/// Hint handed to the matmul dispatcher together with the operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulHint {
    pub pass: PassKind,
    pub algorithm: MatmulAlgorithm,
}

impl MatmulHint {
    pub const fn new(pass: PassKind, algorithm: MatmulAlgorithm) -> Self {
        Self { pass, algorithm }
    }
}

/// Operand shapes for `C[N×M] = A[N×K] · B[K×M]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulArgs {
    /// Rows of A and C.
    pub n: usize,
    /// Columns of B and C.
    pub m: usize,
    /// Reduction depth.
    pub k: usize,
    /// B is stored transposed as `[M, K]`.
    pub transpose_b: bool,
}

impl Default for MatmulArgs {
    fn default() -> Self {
        Self {
            n: 1,
            m: 1,
            k: 1,
            transpose_b: false,
        }
    }
}

/// Independent pad counts on the four borders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Padding {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

impl Padding {
    pub const fn new(left: usize, right: usize, top: usize, bottom: usize) -> Self {
        Self { left, right, top, bottom }
    }

    pub const fn uniform(pad: usize) -> Self {
        Self::new(pad, pad, pad, pad)
    }
}

/// Vertical and horizontal stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stride {
    pub h: usize,
    pub w: usize,
}

impl Stride {
    pub const fn new(h: usize, w: usize) -> Self {
        Self { h, w }
    }
}

impl Default for Stride {
    fn default() -> Self {
        Self::new(1, 1)
    }
}
