//! Layout transposes used to prepare matmul operands.

use crate::error::KernelResult;
use crate::parallel::{Cluster, SharedSlice};
use crate::traits::Element;
use crate::validation::validate_len;

/// Transpose a row-major `[rows, cols]` matrix into `[cols, rows]`:
/// `dst[j·rows + i] = src[i·cols + j]`.
///
/// Split over destination rows, so every worker writes one contiguous block.
pub fn transpose<T: Element>(
    cluster: &Cluster,
    src: &[T],
    rows: usize,
    cols: usize,
    dst: &mut [T],
) -> KernelResult<()> {
    validate_len(src.len(), rows * cols, "transpose src")?;
    validate_len(dst.len(), rows * cols, "transpose dst")?;
    cluster.fork_join_chunks(dst, cols, rows, |_, cols_range, chunk| {
        for (jj, j) in cols_range.enumerate() {
            let out = &mut chunk[jj * rows..(jj + 1) * rows];
            for (i, o) in out.iter_mut().enumerate() {
                *o = src[i * cols + j];
            }
        }
    })?;
    Ok(())
}

/// Reorder `[Cout, Cin, Hk, Wk]` weights into `[Cin, Cout, Hk·Wk]` while
/// reversing every kernel window:
/// `dst[i + k·HW + c·Cout·HW] = w[(HW−1−i) + c·HW + k·Cin·HW]`.
///
/// The result is the 180° rotated kernel the input-gradient correlation
/// needs. With a 1×1 window this is a plain `[Cout, Cin]` transpose.
/// Work is split over output channels `k`; each worker writes a strided set
/// of `Cin·HW` elements that no other worker touches.
pub fn block_transpose<T: Element>(
    cluster: &Cluster,
    weights: &[T],
    cin: usize,
    cout: usize,
    hk: usize,
    wk: usize,
    dst: &mut [T],
) -> KernelResult<()> {
    let hw = hk * wk;
    validate_len(weights.len(), cout * cin * hw, "block transpose weights")?;
    validate_len(dst.len(), cout * cin * hw, "block transpose dst")?;

    let out = SharedSlice::new(dst);
    cluster.fork_join(|worker| {
        for k in cluster.partition(cout, worker) {
            for c in 0..cin {
                for i in 0..hw {
                    let value = weights[(hw - 1 - i) + c * hw + k * cin * hw];
                    // SAFETY: the destination index carries `k`, and every `k`
                    // belongs to exactly one worker.
                    unsafe { out.write(i + k * hw + c * cout * hw, value) };
                }
            }
        }
    });
    Ok(())
}
