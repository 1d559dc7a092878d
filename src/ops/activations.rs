//! Activation functions for the training step: sigmoid, ReLU and softmax,
//! forward and backward.
//!
//! All kernels read and write [`Blob`] buffers: forward passes map
//! `input.data -> output.data`, backward passes map `output.diff` (and the
//! forward values they need) to `input.diff`. Work is split across the
//! cluster with the static [`partition`](crate::parallel::partition) rule.

use crate::blob::Blob;
use crate::config::ClusterConfig;
use crate::error::KernelResult;
use crate::kernel_types::Accumulation;
use crate::ops::accumulator::SumAccumulator;
use crate::parallel::Cluster;
use crate::traits::Element;
use crate::validation::validate_len;

/// Configuration for the softmax kernels.
#[derive(Clone, Debug, Default)]
pub struct SoftmaxConfig {
    /// Precision of the global sum and of the backward dot product.
    pub accumulation: Accumulation,
}

impl From<&ClusterConfig> for SoftmaxConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            accumulation: config.accumulation,
        }
    }
}

// ============================================================================
// Sigmoid: 1 / (1 + exp(-x))
// ============================================================================

/// Sigmoid for a single value, evaluated in the storage precision.
#[inline(always)]
pub fn sigmoid_scalar<T: Element>(x: T) -> T {
    T::ONE / (T::ONE + (-x).exp())
}

/// `output.data[i] = sigmoid(input.data[i])`.
pub fn sigmoid_forward<T: Element>(
    cluster: &Cluster,
    input: &Blob<T>,
    output: &mut Blob<T>,
) -> KernelResult<()> {
    validate_len(output.len(), input.len(), "sigmoid output")?;
    let inp = input.data();
    let dim = inp.len();
    cluster.fork_join_chunks(output.data_mut(), dim, 1, |_, range, out| {
        for (o, &x) in out.iter_mut().zip(&inp[range]) {
            *o = sigmoid_scalar(x);
        }
    })?;
    Ok(())
}

/// `input.diff[i] = output.diff[i] · s · (1 - s)` with `s = output.data[i]`.
///
/// Uses the stored forward output instead of re-evaluating the exponential,
/// so `output.data` must still hold the forward result.
pub fn sigmoid_backward<T: Element>(
    cluster: &Cluster,
    input: &mut Blob<T>,
    output: &Blob<T>,
) -> KernelResult<()> {
    validate_len(output.len(), input.len(), "sigmoid output")?;
    let out_data = output.data();
    let out_diff = output.diff();
    let dim = out_data.len();
    cluster.fork_join_chunks(input.diff_mut(), dim, 1, |_, range, in_diff| {
        let s = &out_data[range.clone()];
        let g = &out_diff[range];
        for ((d, &s), &g) in in_diff.iter_mut().zip(s).zip(g) {
            *d = g * (s * (T::ONE - s));
        }
    })?;
    Ok(())
}

// ============================================================================
// ReLU: max(0, x)
// ============================================================================

/// `output.data[i] = max(input.data[i], 0)`.
pub fn relu_forward<T: Element>(
    cluster: &Cluster,
    input: &Blob<T>,
    output: &mut Blob<T>,
) -> KernelResult<()> {
    validate_len(output.len(), input.len(), "relu output")?;
    let inp = input.data();
    let dim = inp.len();
    cluster.fork_join_chunks(output.data_mut(), dim, 1, |_, range, out| {
        for (o, &x) in out.iter_mut().zip(&inp[range]) {
            *o = if x > T::ZERO { x } else { T::ZERO };
        }
    })?;
    Ok(())
}

/// `input.diff[i] = input.data[i] > 0 ? output.diff[i] : 0`.
pub fn relu_backward<T: Element>(
    cluster: &Cluster,
    input: &mut Blob<T>,
    output: &Blob<T>,
) -> KernelResult<()> {
    validate_len(output.len(), input.len(), "relu output")?;
    let out_diff = output.diff();
    let (in_data, in_diff) = input.data_and_diff_mut();
    let dim = in_data.len();
    cluster.fork_join_chunks(in_diff, dim, 1, |_, range, d| {
        for ((d, &x), &g) in d.iter_mut().zip(&in_data[range.clone()]).zip(&out_diff[range]) {
            *d = if x > T::ZERO { g } else { T::ZERO };
        }
    })?;
    Ok(())
}

// ============================================================================
// Softmax over one row
// ============================================================================

/// Numerically stabilized softmax of the whole input row.
///
/// Runs as fork/reduce/fork/reduce/fork:
/// 1. each worker takes the max of its slice,
/// 2. the per-worker maxima are reduced sequentially after the join,
/// 3. each worker writes `exp(x - max)` and a partial sum of its slice,
/// 4. the partial sums are reduced sequentially in worker order,
/// 5. each worker divides its slice by the global sum.
pub fn softmax_forward<T: Element>(
    cluster: &Cluster,
    config: &SoftmaxConfig,
    input: &Blob<T>,
    output: &mut Blob<T>,
) -> KernelResult<()> {
    validate_len(output.len(), input.len(), "softmax output")?;
    let inp = input.data();
    let dim = inp.len();
    if dim == 0 {
        return Ok(());
    }

    let maxes: Vec<Option<T>> = cluster.fork_join(|k| {
        inp[cluster.partition(dim, k)]
            .iter()
            .copied()
            .reduce(|a, b| a.max(b))
    });
    let max = maxes
        .into_iter()
        .flatten()
        .reduce(|a, b| a.max(b))
        .unwrap_or(T::ZERO);

    let mode = config.accumulation;
    let partials = cluster.fork_join_chunks(output.data_mut(), dim, 1, |_, range, out| {
        let mut acc = SumAccumulator::new(mode);
        for (o, &x) in out.iter_mut().zip(&inp[range]) {
            let e = (x - max).exp();
            *o = e;
            acc.add(e);
        }
        acc
    })?;
    let mut total = SumAccumulator::new(mode);
    for partial in &partials {
        total.merge(partial);
    }
    let sum = total.value();

    cluster.fork_join_chunks(output.data_mut(), dim, 1, |_, _, out| {
        for o in out.iter_mut() {
            *o = *o / sum;
        }
    })?;

    if log::log_enabled!(log::Level::Trace) {
        log::trace!("softmax dim={} max={:?} sum={:?}", dim, max, sum);
    }
    Ok(())
}

/// Softmax Jacobian-vector product:
/// `input.diff[j] = s[j] · (g[j] - Σ_z g[z]·s[z])` with `s = output.data`,
/// `g = output.diff`.
///
/// The dot product `Σ g·s` is computed once, making this O(dim).
pub fn softmax_backward<T: Element>(
    cluster: &Cluster,
    config: &SoftmaxConfig,
    input: &mut Blob<T>,
    output: &Blob<T>,
) -> KernelResult<()> {
    validate_len(output.len(), input.len(), "softmax output")?;
    let s = output.data();
    let g = output.diff();
    let dim = s.len();

    let mut dot = SumAccumulator::new(config.accumulation);
    for (&gz, &sz) in g.iter().zip(s) {
        dot.add_product(gz, sz);
    }
    let dot = dot.value();

    cluster.fork_join_chunks(input.diff_mut(), dim, 1, |_, range, d| {
        for ((d, &sj), &gj) in d.iter_mut().zip(&s[range.clone()]).zip(&g[range]) {
            *d = -(sj * dot) + sj * gj;
        }
    })?;
    Ok(())
}

/// Quadratic form of [`softmax_backward`]: for every `j` sums
/// `g[z]·s[z]·(-s[j])` over the whole row, then adds `s[j]·g[j]`.
///
/// Single-worker; kept for cross-checking the linear version.
pub fn softmax_backward_reference<T: Element>(input: &mut Blob<T>, output: &Blob<T>) -> KernelResult<()> {
    validate_len(output.len(), input.len(), "softmax output")?;
    let s = output.data();
    let g = output.diff();
    let in_diff = input.diff_mut();

    for (j, d) in in_diff.iter_mut().enumerate() {
        let neg_s_j = -s[j];
        let mut sum = T::ZERO;
        for z in 0..s.len() {
            sum += g[z] * s[z] * neg_s_j;
        }
        *d = sum;
    }
    for (j, d) in in_diff.iter_mut().enumerate() {
        *d += s[j] * g[j];
    }
    Ok(())
}
