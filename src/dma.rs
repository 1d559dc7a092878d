//! 2-D block transfers between bulk memory and the scratchpad.
//!
//! A transfer moves `total` elements as rows of `row_len` contiguous elements.
//! On the external (bulk) side consecutive rows start `row_stride` elements
//! apart; on the local side rows are packed back to back. Issue is
//! asynchronous in the interface, completion is observed with
//! [`DmaEngine::wait`]. Callers in this crate never keep more than one transfer
//! in flight per worker.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::traits::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Bulk memory into the scratchpad.
    ExtToLoc,
    /// Scratchpad back to bulk memory.
    LocToExt,
}

/// Strided block descriptor, all quantities in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer2d {
    /// First element on the external side.
    pub ext_offset: usize,
    /// First element on the local side.
    pub loc_offset: usize,
    /// Contiguous elements per row.
    pub row_len: usize,
    /// Distance between row starts on the external side.
    pub row_stride: usize,
    /// Total elements moved; a multiple of `row_len`.
    pub total: usize,
}

impl Transfer2d {
    /// Number of rows moved.
    #[inline]
    pub fn rows(&self) -> usize {
        if self.row_len == 0 {
            0
        } else {
            self.total / self.row_len
        }
    }

    fn check(&self, ext_len: usize, loc_len: usize) -> KernelResult<()> {
        if self.total == 0 {
            return Ok(());
        }
        if self.row_len == 0 || self.total % self.row_len != 0 {
            return Err(KernelError::Dma(format!(
                "total {} is not a multiple of row length {}",
                self.total, self.row_len
            )));
        }
        let rows = self.rows();
        let ext_end = self.ext_offset + (rows - 1) * self.row_stride + self.row_len;
        if ext_end > ext_len {
            return Err(KernelError::Dma(format!(
                "external range ends at {} past buffer of {}",
                ext_end, ext_len
            )));
        }
        let loc_end = self.loc_offset + self.total;
        if loc_end > loc_len {
            return Err(KernelError::Dma(format!(
                "local range ends at {} past buffer of {}",
                loc_end, loc_len
            )));
        }
        Ok(())
    }
}

/// Completion token for one issued transfer.
#[derive(Debug)]
#[must_use = "a DMA transfer must be waited on before its buffer is read"]
pub struct DmaHandle {
    id: u64,
    direction: DmaDirection,
    elements: usize,
}

impl DmaHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    #[inline]
    pub fn elements(&self) -> usize {
        self.elements
    }
}

/// The cluster's DMA engine as seen by the kernels.
///
/// Descriptors are validated at issue time; a rejected transfer copies nothing.
pub trait DmaEngine: Sync {
    /// Start a bulk-to-scratchpad transfer.
    fn load_2d<T: Element>(&self, xfer: &Transfer2d, ext: &[T], loc: &mut [T]) -> KernelResult<DmaHandle>;

    /// Start a scratchpad-to-bulk transfer.
    fn store_2d<T: Element>(&self, xfer: &Transfer2d, loc: &[T], ext: &mut [T]) -> KernelResult<DmaHandle>;

    /// Block until the transfer behind `handle` has completed.
    fn wait(&self, handle: DmaHandle) -> KernelResult<()>;
}

/// In-process DMA engine: copies synchronously at issue and keeps statistics.
#[derive(Debug, Default)]
pub struct SoftDma {
    issued: AtomicU64,
    completed: AtomicU64,
    elements: AtomicUsize,
}

impl SoftDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers issued so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Transfers waited on so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Elements moved so far.
    pub fn elements_moved(&self) -> usize {
        self.elements.load(Ordering::Relaxed)
    }

    fn record(&self, direction: DmaDirection, elements: usize) -> DmaHandle {
        let id = self.issued.fetch_add(1, Ordering::Relaxed);
        self.elements.fetch_add(elements, Ordering::Relaxed);
        DmaHandle { id, direction, elements }
    }
}

impl DmaEngine for SoftDma {
    fn load_2d<T: Element>(&self, xfer: &Transfer2d, ext: &[T], loc: &mut [T]) -> KernelResult<DmaHandle> {
        xfer.check(ext.len(), loc.len())?;
        for row in 0..xfer.rows() {
            let src = xfer.ext_offset + row * xfer.row_stride;
            let dst = xfer.loc_offset + row * xfer.row_len;
            loc[dst..dst + xfer.row_len].copy_from_slice(&ext[src..src + xfer.row_len]);
        }
        log::trace!(
            "dma ext->loc ext_off={} rows={} row_len={} stride={}",
            xfer.ext_offset,
            xfer.rows(),
            xfer.row_len,
            xfer.row_stride
        );
        Ok(self.record(DmaDirection::ExtToLoc, xfer.total))
    }

    fn store_2d<T: Element>(&self, xfer: &Transfer2d, loc: &[T], ext: &mut [T]) -> KernelResult<DmaHandle> {
        xfer.check(ext.len(), loc.len())?;
        for row in 0..xfer.rows() {
            let src = xfer.loc_offset + row * xfer.row_len;
            let dst = xfer.ext_offset + row * xfer.row_stride;
            ext[dst..dst + xfer.row_len].copy_from_slice(&loc[src..src + xfer.row_len]);
        }
        log::trace!(
            "dma loc->ext ext_off={} rows={} row_len={} stride={}",
            xfer.ext_offset,
            xfer.rows(),
            xfer.row_len,
            xfer.row_stride
        );
        Ok(self.record(DmaDirection::LocToExt, xfer.total))
    }

    fn wait(&self, handle: DmaHandle) -> KernelResult<()> {
        if handle.id >= self.issued() {
            return Err(KernelError::Dma(format!("unknown transfer id {}", handle.id)));
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_strided_block() {
        // 4x4 source, pull the 2x3 block starting at (1, 1).
        let ext: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let mut loc = vec![0.0f32; 6];
        let dma = SoftDma::new();
        let xfer = Transfer2d {
            ext_offset: 5,
            loc_offset: 0,
            row_len: 3,
            row_stride: 4,
            total: 6,
        };
        let handle = dma.load_2d(&xfer, &ext, &mut loc).unwrap();
        assert_eq!(handle.direction(), DmaDirection::ExtToLoc);
        dma.wait(handle).unwrap();
        assert_eq!(loc, vec![5.0, 6.0, 7.0, 9.0, 10.0, 11.0]);
        assert_eq!(dma.issued(), 1);
        assert_eq!(dma.completed(), 1);
        assert_eq!(dma.elements_moved(), 6);
    }

    #[test]
    fn store_strided_block() {
        let loc = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut ext = vec![0.0f32; 9];
        let dma = SoftDma::new();
        let xfer = Transfer2d {
            ext_offset: 4,
            loc_offset: 0,
            row_len: 2,
            row_stride: 3,
            total: 4,
        };
        let handle = dma.store_2d(&xfer, &loc, &mut ext).unwrap();
        assert_eq!((handle.id(), handle.elements()), (0, 4));
        assert_eq!(handle.direction(), DmaDirection::LocToExt);
        dma.wait(handle).unwrap();
        assert_eq!(ext, vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn out_of_range_transfer_rejected_without_copy() {
        let ext = vec![1.0f32; 8];
        let mut loc = vec![0.0f32; 8];
        let dma = SoftDma::new();
        let xfer = Transfer2d {
            ext_offset: 4,
            loc_offset: 0,
            row_len: 2,
            row_stride: 4,
            total: 4,
        };
        assert!(dma.load_2d(&xfer, &ext, &mut loc).is_err());
        assert!(loc.iter().all(|&v| v == 0.0));
        assert_eq!(dma.issued(), 0);
    }

    #[test]
    fn ragged_total_rejected() {
        let xfer = Transfer2d {
            ext_offset: 0,
            loc_offset: 0,
            row_len: 3,
            row_stride: 3,
            total: 4,
        };
        assert!(xfer.check(16, 16).is_err());
    }
}
