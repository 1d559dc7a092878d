//! cluster-train-kernels: on-device training kernels for a multicore cluster
//! with a software-managed scratchpad and a 2-D DMA engine.
//!
//! This crate provides the building blocks of a convolution training step:
//! - **Static fork/join**: every kernel splits its work with one partition rule
//!   over a fixed worker pool ([`Cluster`])
//! - **Im2col**: CHW and HWC layouts, forward and input-gradient modes, a
//!   direct path and a DMA-staged path with bit-identical results
//! - **Pointwise convolution**: forward, weight-gradient and input-gradient
//!   passes sequenced over a pluggable [`MatmulDispatch`]
//! - **Activations**: sigmoid, ReLU and a parallel softmax, with backward passes
//! - **Dual precision**: every kernel is generic over `f32` and `half::f16`
//!
//! # Quick Start
//!
//! ```ignore
//! use cluster_train_kernels::*;
//!
//! let config = ClusterConfig::from_env()?;
//! let cluster = Cluster::from_config(&config)?;
//! let conv = PointwiseConv::from_config(&config, PwStrategy::default());
//! conv.run(&cluster, Pass::Forward, &mut args)?;
//! ```

pub mod blob;
pub mod config;
pub mod dma;
pub mod error;
pub mod footprint;
pub mod kernel_types;
pub mod ops;
pub mod parallel;
pub mod traits;
pub mod validation;

pub use blob::Blob;
pub use config::ClusterConfig;
pub use dma::{DmaDirection, DmaEngine, DmaHandle, SoftDma, Transfer2d};
pub use error::{Axis, KernelError, KernelResult};
pub use footprint::{ConvLayer, ScratchFootprint};
pub use kernel_types::{
    Accumulation, FloatType, Im2ColMode, Layout, MatmulAlgorithm, MatmulArgs, MatmulHint, MemoryPath, Padding,
    PassKind, Stride,
};
pub use parallel::{join_status, partition, Cluster, SharedSlice};
pub use traits::Element;

// Activation exports
pub use ops::activations::{
    relu_backward, relu_forward, sigmoid_backward, sigmoid_forward, sigmoid_scalar, softmax_backward,
    softmax_backward_reference, softmax_forward, SoftmaxConfig,
};

// Layout transforms
pub use ops::im2col::{im2col, im2col_len, Im2ColArgs};
pub use ops::transpose::{block_transpose, transpose};

// Matmul and pointwise convolution
pub use ops::conv_pw::{ConvPwArgs, OperandPrep, Pass, PassAlgorithms, PointwiseConv, PwStrategy, WeightPrep};
pub use ops::matmul::{ClusterMatmul, MatmulDispatch};
