//! Activation and parameter volumes with paired data/gradient buffers.
//!
//! A [`Blob`] is a thin owner of two equally sized `Vec<T>` buffers plus
//! shape metadata. Kernels borrow the buffers directly:
//!
//! ```ignore
//! let x = blob.data();        // forward values
//! let dx = blob.diff_mut();   // gradient written by the backward pass
//! ```

use crate::error::{KernelError, KernelResult};
use crate::kernel_types::Layout;
use crate::traits::Element;
use crate::validation::{checked_volume, validate_len};

/// A `C×H×W` volume with its gradient.
///
/// `data` and `diff` always have `c·h·w` elements. The contents of `diff`
/// are meaningful only after a backward pass has written them.
#[derive(Clone, Debug)]
pub struct Blob<T: Element> {
    c: usize,
    h: usize,
    w: usize,
    layout: Layout,
    data: Vec<T>,
    diff: Vec<T>,
}

impl<T: Element> Blob<T> {
    /// Zero-initialized blob.
    pub fn zeros(c: usize, h: usize, w: usize, layout: Layout) -> KernelResult<Self> {
        let len = checked_volume(&[c, h, w], "blob")?;
        Ok(Self {
            c,
            h,
            w,
            layout,
            data: vec![T::ZERO; len],
            diff: vec![T::ZERO; len],
        })
    }

    /// Blob over existing forward values; the gradient starts zeroed.
    pub fn from_data(c: usize, h: usize, w: usize, layout: Layout, data: Vec<T>) -> KernelResult<Self> {
        let len = checked_volume(&[c, h, w], "blob")?;
        validate_len(data.len(), len, "blob data")?;
        Ok(Self {
            c,
            h,
            w,
            layout,
            diff: vec![T::ZERO; len],
            data,
        })
    }

    /// Convolution weights `[Cout, Cin, Hk, Wk]`, stored as `Cout·Cin` channels
    /// of `Hk×Wk` windows.
    pub fn weights(cout: usize, cin: usize, hk: usize, wk: usize, data: Vec<T>) -> KernelResult<Self> {
        let channels = cout
            .checked_mul(cin)
            .ok_or_else(|| KernelError::InvalidConfig("weight channels overflow".into()))?;
        Self::from_data(channels, hk, wk, Layout::Chw, data)
    }

    #[inline(always)]
    pub fn channels(&self) -> usize {
        self.c
    }

    #[inline(always)]
    pub fn height(&self) -> usize {
        self.h
    }

    #[inline(always)]
    pub fn width(&self) -> usize {
        self.w
    }

    #[inline(always)]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Spatial size `h·w`.
    #[inline(always)]
    pub fn plane(&self) -> usize {
        self.h * self.w
    }

    /// Total element count.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat offset of `(c, h, w)` under this blob's layout.
    #[inline(always)]
    pub fn offset(&self, c: usize, h: usize, w: usize) -> usize {
        match self.layout {
            Layout::Chw => (c * self.h + h) * self.w + w,
            Layout::Hwc => (h * self.w + w) * self.c + c,
        }
    }

    #[inline(always)]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline(always)]
    pub fn diff(&self) -> &[T] {
        &self.diff
    }

    #[inline(always)]
    pub fn diff_mut(&mut self) -> &mut [T] {
        &mut self.diff
    }

    /// Forward values and gradient borrowed together.
    #[inline(always)]
    pub fn data_and_diff_mut(&mut self) -> (&[T], &mut [T]) {
        (&self.data, &mut self.diff)
    }

    /// Reset the gradient buffer to zero.
    pub fn zero_diff(&mut self) {
        self.diff.fill(T::ZERO);
    }
}
