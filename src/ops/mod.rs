//! Training kernels.

pub mod accumulator;
pub mod activations;
pub mod conv_pw;
pub mod im2col;
pub mod matmul;
pub mod transpose;
