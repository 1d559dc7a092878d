//! Scratchpad budget of convolution layers.
//!
//! Sizes the buffers the kernels in this crate consume (im2col buffer,
//! transpose buffer, DMA staging) plus the layer tensors that must live in
//! the scratchpad on the direct memory path, and checks the total against
//! the available scratchpad bytes. Scratch buffers are shared between layers,
//! so a network takes the largest of each; tensors add up.

use crate::error::{KernelError, KernelResult};
use crate::kernel_types::{FloatType, Im2ColMode, Layout, MemoryPath, Padding, Stride};
use crate::ops::im2col::Im2ColArgs;
use crate::validation::checked_volume;

/// Shape of one convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvLayer {
    pub cin: usize,
    pub cout: usize,
    pub h_in: usize,
    pub w_in: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub padding: Padding,
    pub stride: Stride,
    pub layout: Layout,
}

impl ConvLayer {
    /// Unpadded, unit-stride pointwise layer.
    pub fn pointwise(cin: usize, cout: usize, h: usize, w: usize) -> Self {
        Self {
            cin,
            cout,
            h_in: h,
            w_in: w,
            kernel_h: 1,
            kernel_w: 1,
            padding: Padding::default(),
            stride: Stride::default(),
            layout: Layout::Chw,
        }
    }

    fn im2col_args(&self, mode: Im2ColMode, path: MemoryPath) -> Im2ColArgs {
        Im2ColArgs::new(self.kernel_h, self.kernel_w)
            .with_layout(self.layout)
            .with_mode(mode)
            .with_path(path)
            .with_padding(self.padding)
            .with_stride(self.stride)
    }
}

/// Element counts per buffer class; [`ScratchFootprint::total_bytes`]
/// converts them with the element size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchFootprint {
    pub dtype: FloatType,
    pub im2col: usize,
    pub transpose: usize,
    pub staging: usize,
    /// Layer tensors resident in the scratchpad (data and diff of input,
    /// output and weights). Zero on the staged path, where they stay in bulk
    /// memory.
    pub tensors: usize,
    /// Layer tensors held in bulk memory.
    pub bulk: usize,
}

impl ScratchFootprint {
    pub fn for_conv(layer: &ConvLayer, dtype: FloatType, workers: usize, path: MemoryPath) -> KernelResult<Self> {
        let fw = layer.im2col_args(Im2ColMode::Forward, path);
        let (h_out, w_out) = fw.output_extent(layer.h_in, layer.w_in)?;
        let hw_in = layer.h_in * layer.w_in;
        let hw_out = h_out * w_out;
        let window = layer.kernel_h * layer.kernel_w;

        let im2col_fw = checked_volume(&[hw_out, fw.window_len(layer.cin)], "im2col buffer")?;
        let im2col_ig = checked_volume(&[hw_in, window, layer.cout], "im2col buffer")?;

        let weights = checked_volume(&[layer.cout, layer.cin, window], "weights")?;
        // Block-transposed weights, or the pointwise operand pairs.
        let transpose = weights
            .max(hw_in * layer.cin)
            .max(layer.cin * layer.cout + hw_out * layer.cout);

        let staging = match path {
            MemoryPath::Direct => 0,
            MemoryPath::Staged => {
                let ig = layer.im2col_args(Im2ColMode::InputGrad, path);
                fw.staging_len(workers, layer.cin)
                    .max(ig.staging_len(workers, layer.cout))
            }
        };

        let tensors = 2 * (layer.cin * hw_in + layer.cout * hw_out + weights);
        let (tensors, bulk) = match path {
            MemoryPath::Direct => (tensors, 0),
            MemoryPath::Staged => (0, tensors),
        };

        Ok(Self {
            dtype,
            im2col: im2col_fw.max(im2col_ig),
            transpose,
            staging,
            tensors,
            bulk,
        })
    }

    /// Footprint of a layer sequence sharing one set of scratch buffers.
    pub fn for_network(layers: &[ConvLayer], dtype: FloatType, workers: usize, path: MemoryPath) -> KernelResult<Self> {
        let mut total = Self {
            dtype,
            im2col: 0,
            transpose: 0,
            staging: 0,
            tensors: 0,
            bulk: 0,
        };
        for (idx, layer) in layers.iter().enumerate() {
            let fp = Self::for_conv(layer, dtype, workers, path)?;
            log::debug!("layer {}: {:?}", idx, fp);
            total.im2col = total.im2col.max(fp.im2col);
            total.transpose = total.transpose.max(fp.transpose);
            total.staging = total.staging.max(fp.staging);
            total.tensors += fp.tensors;
            total.bulk += fp.bulk;
        }
        Ok(total)
    }

    /// Scratchpad elements across all classes.
    pub fn total_elements(&self) -> usize {
        self.im2col + self.transpose + self.staging + self.tensors
    }

    pub fn total_bytes(&self) -> usize {
        self.total_elements() * self.dtype.size_bytes()
    }

    pub fn bulk_bytes(&self) -> usize {
        self.bulk * self.dtype.size_bytes()
    }

    /// Fail with [`KernelError::ScratchExhausted`] when the scratchpad
    /// cannot hold the footprint.
    pub fn check(&self, available_bytes: usize) -> KernelResult<()> {
        let required = self.total_bytes();
        if required > available_bytes {
            log::error!(
                "scratchpad overflow: {} bytes required, {} available ({:.1}%)",
                required,
                available_bytes,
                required as f64 / available_bytes.max(1) as f64 * 100.0
            );
            return Err(KernelError::ScratchExhausted {
                required,
                available: available_bytes,
            });
        }
        log::debug!("scratchpad use {} of {} bytes", required, available_bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointwise_direct_footprint() {
        let layer = ConvLayer::pointwise(4, 8, 2, 2);
        let fp = ScratchFootprint::for_conv(&layer, FloatType::F16, 4, MemoryPath::Direct).unwrap();
        assert_eq!(fp.im2col, 4 * 8);
        assert_eq!(fp.transpose, 4 * 8 + 4 * 8);
        assert_eq!(fp.staging, 0);
        assert_eq!(fp.tensors, 2 * (16 + 32 + 32));
        assert_eq!(fp.total_bytes(), fp.total_elements() * 2);
    }

    #[test]
    fn staged_path_moves_tensors_to_bulk() {
        let layer = ConvLayer {
            kernel_h: 3,
            kernel_w: 3,
            padding: Padding::uniform(1),
            ..ConvLayer::pointwise(2, 3, 4, 4)
        };
        let fp = ScratchFootprint::for_conv(&layer, FloatType::F32, 2, MemoryPath::Staged).unwrap();
        assert_eq!(fp.tensors, 0);
        assert!(fp.bulk > 0);
        assert_eq!(fp.staging, 2 * 2 * 9);
        assert_eq!(fp.bulk_bytes(), fp.bulk * 4);
    }

    #[test]
    fn check_reports_overflow() {
        let layer = ConvLayer::pointwise(16, 16, 8, 8);
        let fp = ScratchFootprint::for_conv(&layer, FloatType::F32, 8, MemoryPath::Direct).unwrap();
        assert!(fp.check(fp.total_bytes()).is_ok());
        match fp.check(fp.total_bytes() - 1) {
            Err(KernelError::ScratchExhausted { required, .. }) => assert_eq!(required, fp.total_bytes()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn network_shares_scratch_and_sums_tensors() {
        let a = ConvLayer::pointwise(4, 8, 4, 4);
        let b = ConvLayer::pointwise(8, 2, 4, 4);
        let fa = ScratchFootprint::for_conv(&a, FloatType::F16, 1, MemoryPath::Direct).unwrap();
        let fb = ScratchFootprint::for_conv(&b, FloatType::F16, 1, MemoryPath::Direct).unwrap();
        let net = ScratchFootprint::for_network(&[a, b], FloatType::F16, 1, MemoryPath::Direct).unwrap();
        assert_eq!(net.im2col, fa.im2col.max(fb.im2col));
        assert_eq!(net.tensors, fa.tensors + fb.tensors);
    }

    #[test]
    fn invalid_geometry_propagates() {
        let layer = ConvLayer {
            kernel_h: 3,
            kernel_w: 3,
            stride: Stride::new(2, 2),
            ..ConvLayer::pointwise(1, 1, 4, 4)
        };
        assert!(ScratchFootprint::for_conv(&layer, FloatType::F32, 1, MemoryPath::Direct).is_err());
    }
}
