#![allow(dead_code)]

use cluster_train_kernels::{Blob, Layout};
use rand::Rng;

/// GEMM FLOPs (multiply-add = 2 ops).
pub fn gemm_flops(m: usize, n: usize, k: usize) -> u64 {
    2 * m as u64 * n as u64 * k as u64
}

/// Bytes written by an im2col buffer of `elements` f32.
pub fn im2col_write_bytes(elements: usize) -> u64 {
    elements as u64 * 4
}

/// Random f32 vector in [-1.0, 1.0).
pub fn random_f32_vec(n: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Blob filled with random data and random gradients.
pub fn random_blob(c: usize, h: usize, w: usize, layout: Layout) -> Blob<f32> {
    let mut blob = Blob::from_data(c, h, w, layout, random_f32_vec(c * h * w)).expect("blob shape");
    blob.diff_mut().copy_from_slice(&random_f32_vec(c * h * w));
    blob
}

pub fn shape_label(c: usize, h: usize, w: usize) -> String {
    format!("{c}x{h}x{w}")
}
