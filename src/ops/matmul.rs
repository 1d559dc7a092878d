//! Matrix multiplication behind the convolution passes.
//!
//! The orchestrator never multiplies itself: it shapes operands and hands
//! them to a [`MatmulDispatch`] together with a [`MatmulHint`]. The hint is
//! advisory, every variant must produce the same result.

use crate::config::ClusterConfig;
use crate::error::KernelResult;
use crate::kernel_types::{Accumulation, MatmulAlgorithm, MatmulArgs, MatmulHint};
use crate::ops::accumulator::SumAccumulator;
use crate::parallel::Cluster;
use crate::traits::Element;
use crate::validation::validate_len;

/// `C[N×M] = A[N×K] · B[K×M]`, or `A · Bᵗ` with B stored `[M×K]` when
/// `args.transpose_b` is set.
pub trait MatmulDispatch: Send + Sync {
    fn multiply<T: Element>(
        &self,
        cluster: &Cluster,
        a: &[T],
        b: &[T],
        c: &mut [T],
        args: &MatmulArgs,
        hint: MatmulHint,
    ) -> KernelResult<()>;
}

/// Reference matmul: rows of C are split across the cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterMatmul {
    pub accumulation: Accumulation,
}

impl ClusterMatmul {
    pub fn new(accumulation: Accumulation) -> Self {
        Self { accumulation }
    }
}

impl From<&ClusterConfig> for ClusterMatmul {
    fn from(config: &ClusterConfig) -> Self {
        Self::new(config.accumulation)
    }
}

impl MatmulDispatch for ClusterMatmul {
    fn multiply<T: Element>(
        &self,
        cluster: &Cluster,
        a: &[T],
        b: &[T],
        c: &mut [T],
        args: &MatmulArgs,
        hint: MatmulHint,
    ) -> KernelResult<()> {
        let MatmulArgs { n, m, k, transpose_b } = *args;
        validate_len(a.len(), n * k, "matmul A")?;
        validate_len(b.len(), k * m, "matmul B")?;
        validate_len(c.len(), n * m, "matmul C")?;
        log::trace!(
            "matmul {:?} {:?} n={} m={} k={} transpose_b={}",
            hint.pass,
            hint.algorithm,
            n,
            m,
            k,
            transpose_b
        );

        let mode = self.accumulation;
        cluster.fork_join_chunks(c, n, m, |_, rows, chunk| {
            for (ii, i) in rows.enumerate() {
                let a_row = &a[i * k..(i + 1) * k];
                for j in 0..m {
                    let value = match hint.algorithm {
                        MatmulAlgorithm::Naive => dot_naive(a_row, b, j, m, k, transpose_b, mode),
                        MatmulAlgorithm::Unroll4 => dot_unroll4(a_row, b, j, m, k, transpose_b, mode),
                    };
                    chunk[ii * m + j] = value;
                }
            }
        })?;
        Ok(())
    }
}

/// Element `B[l, j]` for either storage order.
#[inline(always)]
fn b_at<T: Element>(b: &[T], l: usize, j: usize, m: usize, k: usize, transpose_b: bool) -> T {
    if transpose_b {
        b[j * k + l]
    } else {
        b[l * m + j]
    }
}

#[inline(always)]
fn dot_naive<T: Element>(
    a_row: &[T],
    b: &[T],
    j: usize,
    m: usize,
    k: usize,
    transpose_b: bool,
    mode: Accumulation,
) -> T {
    let mut acc = SumAccumulator::new(mode);
    for (l, &a) in a_row.iter().enumerate() {
        acc.add_product(a, b_at(b, l, j, m, k, transpose_b));
    }
    acc.value()
}

/// Same summation order as [`dot_naive`], four terms per iteration.
#[inline(always)]
fn dot_unroll4<T: Element>(
    a_row: &[T],
    b: &[T],
    j: usize,
    m: usize,
    k: usize,
    transpose_b: bool,
    mode: Accumulation,
) -> T {
    let mut acc = SumAccumulator::new(mode);
    let body = k - k % 4;
    let mut l = 0;
    while l < body {
        acc.add_product(a_row[l], b_at(b, l, j, m, k, transpose_b));
        acc.add_product(a_row[l + 1], b_at(b, l + 1, j, m, k, transpose_b));
        acc.add_product(a_row[l + 2], b_at(b, l + 2, j, m, k, transpose_b));
        acc.add_product(a_row[l + 3], b_at(b, l + 3, j, m, k, transpose_b));
        l += 4;
    }
    for l in body..k {
        acc.add_product(a_row[l], b_at(b, l, j, m, k, transpose_b));
    }
    acc.value()
}
