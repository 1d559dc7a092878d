//! Column unrolling of convolution receptive fields.
//!
//! The destination holds one segment of `window` elements per position, with
//! the segment of position `p` starting at `p·window`:
//!
//! - **Forward** (forward and weight-gradient passes) reads `input.data`;
//!   positions are the `Htot×Wtot` output positions and the window spans
//!   `Hk·Wk·Cin` elements.
//! - **InputGrad** reads `output.diff` as a full correlation; positions are
//!   the `Hin×Win` input positions and the window spans `Hk·Wk·Cout`
//!   elements.
//!
//! Inside a segment, CHW orders the window `[c][hk][wk]` and HWC orders it
//! `[hk][wk][c]`. Every element whose source falls outside the tensor is
//! written as zero.
//!
//! The staged path moves the clipped source block of each window through a
//! per-worker load buffer with a 2-D DMA transfer, scatters it into a zeroed
//! pad buffer and copies that into the destination. Both paths produce
//! bit-identical buffers.

use std::ops::Range;

use crate::blob::Blob;
use crate::config::ClusterConfig;
use crate::dma::{DmaEngine, Transfer2d};
use crate::error::{Axis, KernelError, KernelResult};
use crate::kernel_types::{Im2ColMode, Layout, MemoryPath, Padding, Stride};
use crate::parallel::{join_status, Cluster};
use crate::traits::Element;
use crate::validation::{checked_volume, output_extent, validate_capacity, validate_len};

/// Geometry and flavour of one im2col call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Im2ColArgs {
    pub layout: Layout,
    pub mode: Im2ColMode,
    pub path: MemoryPath,
    pub padding: Padding,
    pub stride: Stride,
    pub kernel_h: usize,
    pub kernel_w: usize,
}

impl Im2ColArgs {
    /// Unpadded, unit-stride, direct CHW forward transform for a `kh×kw`
    /// kernel.
    pub fn new(kernel_h: usize, kernel_w: usize) -> Self {
        Self {
            layout: Layout::Chw,
            mode: Im2ColMode::Forward,
            path: MemoryPath::Direct,
            padding: Padding::default(),
            stride: Stride::default(),
            kernel_h,
            kernel_w,
        }
    }

    /// Like [`Im2ColArgs::new`], with layout and memory path taken from the
    /// cluster configuration.
    pub fn from_config(config: &ClusterConfig, kernel_h: usize, kernel_w: usize) -> Self {
        Self::new(kernel_h, kernel_w)
            .with_layout(config.layout)
            .with_path(config.memory_path)
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_mode(mut self, mode: Im2ColMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_path(mut self, path: MemoryPath) -> Self {
        self.path = path;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_stride(mut self, stride: Stride) -> Self {
        self.stride = stride;
        self
    }

    /// Forward output extent `(Htot, Wtot)` for an `h_in×w_in` input.
    pub fn output_extent(&self, h_in: usize, w_in: usize) -> KernelResult<(usize, usize)> {
        let p = &self.padding;
        let h = output_extent(Axis::Height, h_in, self.kernel_h, p.top, p.bottom, self.stride.h)?;
        let w = output_extent(Axis::Width, w_in, self.kernel_w, p.left, p.right, self.stride.w)?;
        Ok((h, w))
    }

    /// Elements of one destination segment when the source has `c_src`
    /// channels.
    #[inline]
    pub fn window_len(&self, c_src: usize) -> usize {
        self.kernel_h * self.kernel_w * c_src
    }

    /// Staging elements one worker needs on the staged path: a load buffer
    /// and a pad buffer, each one channel window (CHW) or one full window
    /// (HWC).
    #[inline]
    pub fn staging_per_worker(&self, c_src: usize) -> usize {
        let window = match self.layout {
            Layout::Chw => self.kernel_h * self.kernel_w,
            Layout::Hwc => self.window_len(c_src),
        };
        2 * window
    }

    /// Total staging scratch for a cluster of `workers`.
    #[inline]
    pub fn staging_len(&self, workers: usize, c_src: usize) -> usize {
        workers * self.staging_per_worker(c_src)
    }
}

/// Source coordinate rule along one spatial axis.
#[derive(Debug, Clone, Copy)]
struct AxisMap {
    mode: Im2ColMode,
    src_extent: usize,
    kernel: usize,
    pad_lo: usize,
    stride: usize,
}

/// Valid kernel offsets of one position along one axis: `count` offsets
/// `k_first + j·k_step` reading the contiguous sources `src_start + j`.
#[derive(Debug, Clone, Copy, Default)]
struct AxisSpan {
    src_start: usize,
    count: usize,
    k_first: usize,
    k_step: usize,
}

impl AxisMap {
    /// Source coordinate read by kernel offset `kk` at position `pos`, or
    /// `None` for a zero-filled element.
    #[inline(always)]
    fn source(&self, pos: usize, kk: usize) -> Option<usize> {
        let s = match self.mode {
            Im2ColMode::Forward => (pos * self.stride + kk).checked_sub(self.pad_lo)?,
            Im2ColMode::InputGrad => {
                // Dilated full correlation: only every `stride`-th offset lands
                // on an output position.
                let d = (pos + self.pad_lo + kk).checked_sub(self.kernel - 1)?;
                if d % self.stride != 0 {
                    return None;
                }
                d / self.stride
            }
        };
        (s < self.src_extent).then_some(s)
    }

    fn span(&self, pos: usize) -> AxisSpan {
        let mut span = AxisSpan {
            k_step: match self.mode {
                Im2ColMode::Forward => 1,
                Im2ColMode::InputGrad => self.stride,
            },
            ..AxisSpan::default()
        };
        for kk in 0..self.kernel {
            if let Some(s) = self.source(pos, kk) {
                if span.count == 0 {
                    span.src_start = s;
                    span.k_first = kk;
                }
                span.count += 1;
            }
        }
        span
    }
}

/// Everything a worker needs to fill its rows, resolved and validated.
#[derive(Debug, Clone, Copy)]
struct Plan {
    layout: Layout,
    channels: usize,
    src_h: usize,
    src_w: usize,
    kh: usize,
    kw: usize,
    rows: usize,
    cols: usize,
    window: usize,
    len: usize,
    h_map: AxisMap,
    w_map: AxisMap,
}

impl Plan {
    fn new<T: Element>(args: &Im2ColArgs, input: &Blob<T>, output: &Blob<T>) -> KernelResult<Self> {
        let (h_out, w_out) = args.output_extent(input.height(), input.width())?;
        if output.height() != h_out || output.width() != w_out {
            log::error!(
                "im2col output is {}x{} but geometry gives {}x{}",
                output.height(),
                output.width(),
                h_out,
                w_out
            );
            return Err(KernelError::ShapeMismatch {
                name: "im2col output plane",
                actual: output.plane(),
                expected: h_out * w_out,
            });
        }

        let (source, rows, cols) = match args.mode {
            Im2ColMode::Forward => (input, h_out, w_out),
            Im2ColMode::InputGrad => (output, input.height(), input.width()),
        };
        if source.layout() != args.layout {
            return Err(KernelError::InvalidConfig(format!(
                "im2col configured for {:?} but source blob is {:?}",
                args.layout,
                source.layout()
            )));
        }

        let window = checked_volume(&[args.kernel_h, args.kernel_w, source.channels()], "im2col window")?;
        let len = checked_volume(&[rows, cols, window], "im2col buffer")?;

        let map = |src_extent, kernel, pad_lo, stride| AxisMap {
            mode: args.mode,
            src_extent,
            kernel,
            pad_lo,
            stride,
        };
        Ok(Self {
            layout: args.layout,
            channels: source.channels(),
            src_h: source.height(),
            src_w: source.width(),
            kh: args.kernel_h,
            kw: args.kernel_w,
            rows,
            cols,
            window,
            len,
            h_map: map(source.height(), args.kernel_h, args.padding.top, args.stride.h),
            w_map: map(source.width(), args.kernel_w, args.padding.left, args.stride.w),
        })
    }

    #[inline(always)]
    fn buffer_len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    fn src_offset(&self, c: usize, h: usize, w: usize) -> usize {
        match self.layout {
            Layout::Chw => (c * self.src_h + h) * self.src_w + w,
            Layout::Hwc => (h * self.src_w + w) * self.channels + c,
        }
    }

    #[inline(always)]
    fn window_offset(&self, c: usize, hk: usize, wk: usize) -> usize {
        match self.layout {
            Layout::Chw => (c * self.kh + hk) * self.kw + wk,
            Layout::Hwc => (hk * self.kw + wk) * self.channels + c,
        }
    }

    fn fill_direct<T: Element>(&self, src: &[T], rows: Range<usize>, chunk: &mut [T]) {
        for (r_local, r) in rows.enumerate() {
            for col in 0..self.cols {
                let start = (r_local * self.cols + col) * self.window;
                let seg = &mut chunk[start..start + self.window];
                for hk in 0..self.kh {
                    let sh = self.h_map.source(r, hk);
                    for wk in 0..self.kw {
                        let sw = self.w_map.source(col, wk);
                        for c in 0..self.channels {
                            seg[self.window_offset(c, hk, wk)] = match (sh, sw) {
                                (Some(h), Some(w)) => src[self.src_offset(c, h, w)],
                                _ => T::ZERO,
                            };
                        }
                    }
                }
            }
        }
    }

    fn fill_staged<T: Element, D: DmaEngine>(
        &self,
        dma: &D,
        src: &[T],
        rows: Range<usize>,
        chunk: &mut [T],
        stage: &mut [T],
    ) -> KernelResult<()> {
        let (load, pad) = stage.split_at_mut(stage.len() / 2);
        for (r_local, r) in rows.enumerate() {
            let hs = self.h_map.span(r);
            for col in 0..self.cols {
                let ws = self.w_map.span(col);
                let start = (r_local * self.cols + col) * self.window;
                let seg = &mut chunk[start..start + self.window];
                match self.layout {
                    Layout::Chw => {
                        let plane = self.kh * self.kw;
                        for c in 0..self.channels {
                            self.stage_window(dma, src, c, hs, ws, load, pad)?;
                            seg[c * plane..(c + 1) * plane].copy_from_slice(pad);
                        }
                    }
                    Layout::Hwc => {
                        self.stage_window(dma, src, 0, hs, ws, load, pad)?;
                        seg.copy_from_slice(pad);
                    }
                }
            }
        }
        Ok(())
    }

    /// Load the clipped block behind one window and rebuild the full window,
    /// zeros included, in `pad`. `c` selects the channel plane for CHW.
    #[allow(clippy::too_many_arguments)]
    fn stage_window<T: Element, D: DmaEngine>(
        &self,
        dma: &D,
        src: &[T],
        c: usize,
        hs: AxisSpan,
        ws: AxisSpan,
        load: &mut [T],
        pad: &mut [T],
    ) -> KernelResult<()> {
        let (xfer, lane) = match self.layout {
            Layout::Chw => (
                Transfer2d {
                    ext_offset: self.src_offset(c, hs.src_start, ws.src_start),
                    loc_offset: 0,
                    row_len: ws.count,
                    row_stride: self.src_w,
                    total: hs.count * ws.count,
                },
                1,
            ),
            Layout::Hwc => (
                Transfer2d {
                    ext_offset: self.src_offset(0, hs.src_start, ws.src_start),
                    loc_offset: 0,
                    row_len: ws.count * self.channels,
                    row_stride: self.src_w * self.channels,
                    total: hs.count * ws.count * self.channels,
                },
                self.channels,
            ),
        };

        let handle = if xfer.total > 0 {
            Some(dma.load_2d(&xfer, src, load)?)
        } else {
            None
        };
        pad.fill(T::ZERO);
        if let Some(handle) = handle {
            dma.wait(handle)?;
        }

        for r in 0..hs.count {
            let hk = hs.k_first + r * hs.k_step;
            for q in 0..ws.count {
                let wk = ws.k_first + q * ws.k_step;
                let from = (r * ws.count + q) * lane;
                let to = (hk * self.kw + wk) * lane;
                pad[to..to + lane].copy_from_slice(&load[from..from + lane]);
            }
        }
        Ok(())
    }
}

/// Number of destination elements an im2col call writes.
pub fn im2col_len<T: Element>(args: &Im2ColArgs, input: &Blob<T>, output: &Blob<T>) -> KernelResult<usize> {
    Ok(Plan::new(args, input, output)?.buffer_len())
}

/// Unroll receptive fields into `dst`.
///
/// `input` and `output` describe the convolution the buffer belongs to; the
/// source is `input.data` in forward mode and `output.diff` in input-gradient
/// mode. `staging` is only read on the staged path and must hold
/// [`Im2ColArgs::staging_len`] elements. Work is split over destination rows
/// (`Htot` or `Hin`). All geometry and extent checks run before the first
/// write.
pub fn im2col<T: Element, D: DmaEngine>(
    cluster: &Cluster,
    dma: &D,
    args: &Im2ColArgs,
    input: &Blob<T>,
    output: &Blob<T>,
    dst: &mut [T],
    staging: &mut [T],
) -> KernelResult<()> {
    let plan = Plan::new(args, input, output)?;
    let len = plan.buffer_len();
    validate_capacity(dst.len(), len, "im2col buffer")?;

    let src = match args.mode {
        Im2ColMode::Forward => input.data(),
        Im2ColMode::InputGrad => output.diff(),
    };
    validate_len(src.len(), plan.channels * plan.src_h * plan.src_w, "im2col source")?;

    log::debug!(
        "im2col {:?} {:?} {:?}: {}x{} positions, window {}, kernel {}x{}",
        args.layout,
        args.mode,
        args.path,
        plan.rows,
        plan.cols,
        plan.window,
        plan.kh,
        plan.kw
    );

    let unit_len = plan.cols * plan.window;
    match args.path {
        MemoryPath::Direct => {
            cluster.fork_join_chunks(dst, plan.rows, unit_len, |_, rows, chunk| {
                plan.fill_direct(src, rows, chunk);
            })?;
        }
        MemoryPath::Staged => {
            let per_worker = args.staging_per_worker(plan.channels);
            validate_capacity(staging.len(), cluster.workers() * per_worker, "im2col staging")?;
            let statuses = cluster.fork_join_chunks_with_scratch(
                dst,
                plan.rows,
                unit_len,
                staging,
                per_worker,
                |_, rows, chunk, stage| plan.fill_staged(dma, src, rows, chunk, stage),
            )?;
            join_status(statuses)?;
        }
    }

    if log::log_enabled!(log::Level::Trace) {
        log::trace!("im2col buffer: {:?}", &dst[..len]);
    }
    Ok(())
}
