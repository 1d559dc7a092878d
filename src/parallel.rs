//! Static fork/join over a fixed set of cluster workers.
//!
//! Every kernel splits its iteration space with [`partition`]: worker `k` of
//! `P` owns `[k·ceil(N/P), min((k+1)·ceil(N/P), N))`. Partial results that are
//! later combined (softmax maxima and sums) rely on exactly this split.

use std::marker::PhantomData;
use std::ops::Range;

use crate::config::ClusterConfig;
use crate::error::{KernelError, KernelResult};
use crate::validation::{checked_volume, validate_capacity};

/// Contiguous block of `[0, n)` owned by `worker` out of `workers`.
///
/// Workers whose start falls at or past `n` get an empty range.
#[inline]
pub fn partition(n: usize, workers: usize, worker: usize) -> Range<usize> {
    let workers = workers.max(1);
    let block = n.div_ceil(workers);
    let start = worker.saturating_mul(block).min(n);
    let stop = start.saturating_add(block).min(n);
    start..stop
}

/// A fixed pool of `P` workers executing kernels in lock-step fork/join.
///
/// A fork blocks the caller until every worker has returned; there is no
/// task queue beyond the `P` bodies of the current fork.
pub struct Cluster {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("workers", &self.workers).finish()
    }
}

impl Cluster {
    /// Build a cluster with exactly `workers` threads.
    pub fn new(workers: usize) -> KernelResult<Self> {
        if workers == 0 {
            return Err(KernelError::InvalidConfig("cluster needs at least one worker".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("cluster-core{idx}"))
            .build()
            .map_err(|e| KernelError::InvalidConfig(format!("failed to build worker pool: {e}")))?;
        log::debug!("cluster started with {} workers", workers);
        Ok(Self { pool, workers })
    }

    pub fn from_config(config: &ClusterConfig) -> KernelResult<Self> {
        Self::new(config.num_workers)
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// This worker's share of `[0, n)`.
    #[inline]
    pub fn partition(&self, n: usize, worker: usize) -> Range<usize> {
        partition(n, self.workers, worker)
    }

    /// Run `f(worker)` once on every worker and join.
    ///
    /// Results come back in worker order.
    pub fn fork_join<R, F>(&self, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync,
    {
        self.pool.broadcast(|ctx| f(ctx.index()))
    }

    /// Fork over `units` work units whose outputs are `unit_len` consecutive
    /// elements of `dst`.
    ///
    /// Worker `k` receives its unit range and the matching disjoint chunk of
    /// `dst`. Fails before forking when `dst` is shorter than
    /// `units · unit_len`.
    pub fn fork_join_chunks<T, R, F>(&self, dst: &mut [T], units: usize, unit_len: usize, f: F) -> KernelResult<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, Range<usize>, &mut [T]) -> R + Sync,
    {
        let mut no_scratch: [T; 0] = [];
        self.fork_join_chunks_with_scratch(dst, units, unit_len, &mut no_scratch, 0, |k, range, chunk, _| {
            f(k, range, chunk)
        })
    }

    /// Like [`Cluster::fork_join_chunks`], additionally handing worker `k`
    /// the `k`-th `scratch_per_worker` slice of `scratch`.
    pub fn fork_join_chunks_with_scratch<T, S, R, F>(
        &self,
        dst: &mut [T],
        units: usize,
        unit_len: usize,
        scratch: &mut [S],
        scratch_per_worker: usize,
        f: F,
    ) -> KernelResult<Vec<R>>
    where
        T: Send,
        S: Send,
        R: Send,
        F: Fn(usize, Range<usize>, &mut [T], &mut [S]) -> R + Sync,
    {
        let extent = checked_volume(&[units, unit_len], "fork destination")?;
        validate_capacity(dst.len(), extent, "fork destination")?;
        let scratch_extent = checked_volume(&[scratch_per_worker, self.workers], "fork scratch")?;
        validate_capacity(scratch.len(), scratch_extent, "fork scratch")?;

        let mut rest: &mut [T] = &mut dst[..extent];
        let mut scratch_rest: &mut [S] = &mut scratch[..scratch_extent];
        let mut jobs = Vec::with_capacity(self.workers);
        for k in 0..self.workers {
            let range = self.partition(units, k);
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(range.len() * unit_len);
            rest = tail;
            let (stage, stage_tail) = std::mem::take(&mut scratch_rest).split_at_mut(scratch_per_worker);
            scratch_rest = stage_tail;
            jobs.push((k, range, head, stage));
        }

        let mut results: Vec<Option<R>> = (0..self.workers).map(|_| None).collect();
        self.pool.scope(|s| {
            for ((k, range, chunk, stage), slot) in jobs.into_iter().zip(results.iter_mut()) {
                let f = &f;
                s.spawn(move |_| {
                    *slot = Some(f(k, range, chunk, stage));
                });
            }
        });
        Ok(results.into_iter().flatten().collect())
    }
}

/// Fold per-worker statuses after a join; the lowest failing worker wins.
pub fn join_status(results: Vec<KernelResult<()>>) -> KernelResult<()> {
    for (worker, result) in results.into_iter().enumerate() {
        if let Err(err) = result {
            log::error!("worker {} failed: {}", worker, err);
            return Err(KernelError::in_worker(worker, err));
        }
    }
    Ok(())
}

/// Destination shared by workers that write disjoint, non-contiguous offsets.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: access goes through `write`, whose contract forbids two workers
// touching the same index during one fork.
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` at `idx`.
    ///
    /// # Safety
    /// No other worker may read or write `idx` during the same fork.
    #[inline]
    pub unsafe fn write(&self, idx: usize, value: T) {
        assert!(idx < self.len, "shared write {} out of bounds {}", idx, self.len);
        *self.ptr.add(idx) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_range() {
        let n = 10;
        let p = 4;
        let ranges: Vec<_> = (0..p).map(|k| partition(n, p, k)).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn partition_empty_tail_workers() {
        // ceil(3/8) = 1, so workers 3..8 get nothing.
        assert_eq!(partition(3, 8, 2), 2..3);
        assert!(partition(3, 8, 3).is_empty());
        assert!(partition(3, 8, 7).is_empty());
        assert!(partition(0, 4, 0).is_empty());
    }

    #[test]
    fn partition_is_not_balanced_remainder_split() {
        // 9 over 4: block 3, last worker idle.
        assert_eq!(partition(9, 4, 2), 6..9);
        assert!(partition(9, 4, 3).is_empty());
    }

    #[test]
    fn fork_join_returns_in_worker_order() {
        let cluster = Cluster::new(4).unwrap();
        let ids = cluster.fork_join(|k| k * 10);
        assert_eq!(ids, vec![0, 10, 20, 30]);
    }

    #[test]
    fn fork_join_chunks_writes_disjoint_ranges() {
        let cluster = Cluster::new(3).unwrap();
        let mut dst = vec![0usize; 7 * 2];
        let sizes = cluster.fork_join_chunks(&mut dst, 7, 2, |k, range, chunk| {
            for (i, v) in chunk.iter_mut().enumerate() {
                *v = k * 100 + range.start * 2 + i;
            }
            range.len()
        })
        .unwrap();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(dst[0], 0);
        assert_eq!(dst[6], 106);
        assert_eq!(dst[13], 213);
    }

    #[test]
    fn scratch_split_per_worker() {
        let cluster = Cluster::new(2).unwrap();
        let mut dst = vec![0u8; 4];
        let mut scratch = vec![0u32; 6];
        cluster.fork_join_chunks_with_scratch(&mut dst, 4, 1, &mut scratch, 3, |k, _r, _c, stage| {
            assert_eq!(stage.len(), 3);
            stage.fill(k as u32 + 1);
        })
        .unwrap();
        assert_eq!(scratch, vec![1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn join_status_reports_first_failure() {
        let statuses = vec![
            Ok(()),
            Err(KernelError::InvalidConfig("a".into())),
            Err(KernelError::InvalidConfig("b".into())),
        ];
        match join_status(statuses) {
            Err(KernelError::Worker { worker, .. }) => assert_eq!(worker, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_destination_or_scratch_is_an_error() {
        let cluster = Cluster::new(2).unwrap();
        let mut dst = vec![0u8; 5];
        let res = cluster.fork_join_chunks(&mut dst, 3, 2, |_, _, chunk| chunk.fill(1));
        assert!(matches!(res, Err(KernelError::ShapeMismatch { actual: 5, expected: 6, .. })));
        assert!(dst.iter().all(|&v| v == 0));

        let mut dst = vec![0u8; 4];
        let mut scratch = vec![0u32; 5];
        let res = cluster.fork_join_chunks_with_scratch(&mut dst, 4, 1, &mut scratch, 3, |_, _, _, _| ());
        assert!(matches!(res, Err(KernelError::ShapeMismatch { name: "fork scratch", .. })));
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(Cluster::new(0).is_err());
    }
}
