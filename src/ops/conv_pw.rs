//! Pointwise (1×1) convolution training step.
//!
//! [`PointwiseConv`] sequences the three passes of a pointwise layer and
//! shapes their operands; the products themselves go to a
//! [`MatmulDispatch`]. With `HW = H·W`, weights `[Cout, Cin]` and CHW blobs:
//!
//! | pass | product |
//! |------|---------|
//! | forward | `out[Cout×HW] = W · in[Cin×HW]` |
//! | weight gradient | `W.diff[Cout×Cin] = out.diff · in.dataᵗ` |
//! | input gradient | `in.diff[Cin×HW] = Wᵗ · out.diff` |
//!
//! Operand preparation (plain indexing, a transpose or a 1×1 im2col) only
//! changes the storage order handed to the matmul, never the result.

use crate::blob::Blob;
use crate::config::ClusterConfig;
use crate::dma::{DmaEngine, SoftDma};
use crate::error::{KernelError, KernelResult};
use crate::kernel_types::{Im2ColMode, Layout, MatmulAlgorithm, MatmulArgs, MatmulHint, MemoryPath, PassKind};
use crate::ops::im2col::{im2col, Im2ColArgs};
use crate::ops::matmul::{ClusterMatmul, MatmulDispatch};
use crate::ops::transpose::{block_transpose, transpose};
use crate::parallel::Cluster;
use crate::traits::Element;
use crate::validation::validate_capacity;

/// How an activation operand reaches the matmul.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperandPrep {
    /// Use the blob buffer as stored, channel-major.
    Direct,
    /// Transpose into the scratch buffer, position-major.
    #[default]
    Transpose,
    /// Position-major copy produced by a 1×1 im2col.
    Im2Col,
}

/// How the weights are rearranged for the input-gradient product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightPrep {
    #[default]
    Transpose,
    /// Window-reversing block transpose; equals a transpose for 1×1 kernels.
    Block,
}

/// Operand preparation per pass, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwStrategy {
    /// Input operand of the forward and weight-gradient products.
    pub input: OperandPrep,
    /// Output-gradient operand of the input-gradient product.
    pub output_grad: OperandPrep,
    pub weights: WeightPrep,
}

impl Default for PwStrategy {
    fn default() -> Self {
        Self {
            input: OperandPrep::Transpose,
            output_grad: OperandPrep::Direct,
            weights: WeightPrep::Transpose,
        }
    }
}

/// Matmul variant requested for each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassAlgorithms {
    pub forward: MatmulAlgorithm,
    pub weight_grad: MatmulAlgorithm,
    pub input_grad: MatmulAlgorithm,
}

/// A training pass selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Forward,
    /// Weight gradient, then input gradient unless skipped.
    Backward,
    WeightGrad,
    InputGrad,
}

/// Tensors and scratch of one pointwise layer.
#[derive(Debug)]
pub struct ConvPwArgs<'a, T: Element> {
    pub input: &'a mut Blob<T>,
    /// `[Cout, Cin, 1, 1]`, see [`Blob::weights`].
    pub weights: &'a mut Blob<T>,
    pub output: &'a mut Blob<T>,
    /// At least [`PointwiseConv::transpose_buffer_len`] elements.
    pub transp_buffer: &'a mut [T],
    /// At least [`PointwiseConv::staging_len`] elements; only read when an
    /// operand is prepared with a staged im2col.
    pub staging: &'a mut [T],
    pub algorithms: PassAlgorithms,
    /// Leave `input.diff` untouched: no upstream layer consumes it.
    pub skip_in_grad: bool,
}

#[derive(Debug, Clone, Copy)]
struct Dims {
    cin: usize,
    cout: usize,
    hw: usize,
}

/// Pass sequencer for a pointwise convolution layer.
#[derive(Debug)]
pub struct PointwiseConv<D: MatmulDispatch, E: DmaEngine = SoftDma> {
    dispatch: D,
    dma: E,
    strategy: PwStrategy,
    path: MemoryPath,
}

impl<D: MatmulDispatch> PointwiseConv<D, SoftDma> {
    pub fn new(dispatch: D, strategy: PwStrategy) -> Self {
        Self::with_dma(dispatch, SoftDma::new(), strategy, MemoryPath::Direct)
    }
}

impl PointwiseConv<ClusterMatmul, SoftDma> {
    /// Reference matmul and software DMA with the accumulation and im2col
    /// memory path of `config`.
    pub fn from_config(config: &ClusterConfig, strategy: PwStrategy) -> Self {
        if config.layout != Layout::Chw {
            log::warn!(
                "pointwise convolution runs on CHW blobs, configured layout {:?} applies to im2col only",
                config.layout
            );
        }
        Self::with_dma(ClusterMatmul::from(config), SoftDma::new(), strategy, config.memory_path)
    }
}

impl<D: MatmulDispatch, E: DmaEngine> PointwiseConv<D, E> {
    /// `path` selects the im2col memory path used by [`OperandPrep::Im2Col`].
    pub fn with_dma(dispatch: D, dma: E, strategy: PwStrategy, path: MemoryPath) -> Self {
        Self {
            dispatch,
            dma,
            strategy,
            path,
        }
    }

    pub fn strategy(&self) -> PwStrategy {
        self.strategy
    }

    pub fn dispatch(&self) -> &D {
        &self.dispatch
    }

    pub fn dma(&self) -> &E {
        &self.dma
    }

    /// Scratch elements the passes need in `transp_buffer`.
    pub fn transpose_buffer_len(&self, cin: usize, cout: usize, hw: usize) -> usize {
        let forward = match self.strategy.input {
            OperandPrep::Direct => 0,
            OperandPrep::Transpose | OperandPrep::Im2Col => hw * cin,
        };
        let input_grad = cin * cout
            + match self.strategy.output_grad {
                OperandPrep::Direct => 0,
                OperandPrep::Transpose | OperandPrep::Im2Col => hw * cout,
            };
        forward.max(input_grad)
    }

    /// Staging elements for a cluster of `workers`.
    pub fn staging_len(&self, workers: usize, cin: usize, cout: usize) -> usize {
        if self.path != MemoryPath::Staged {
            return 0;
        }
        let pointwise = Im2ColArgs::new(1, 1);
        let forward = match self.strategy.input {
            OperandPrep::Im2Col => pointwise.staging_len(workers, cin),
            _ => 0,
        };
        let input_grad = match self.strategy.output_grad {
            OperandPrep::Im2Col => pointwise.staging_len(workers, cout),
            _ => 0,
        };
        forward.max(input_grad)
    }

    fn check<T: Element>(&self, cluster: &Cluster, args: &ConvPwArgs<'_, T>) -> KernelResult<Dims> {
        for (name, blob) in [("input", &*args.input), ("output", &*args.output)] {
            if blob.layout() != Layout::Chw {
                return Err(KernelError::InvalidConfig(format!(
                    "pointwise conv needs CHW {name}, got {:?}",
                    blob.layout()
                )));
            }
        }
        let dims = Dims {
            cin: args.input.channels(),
            cout: args.output.channels(),
            hw: args.input.plane(),
        };
        if args.output.height() != args.input.height() || args.output.width() != args.input.width() {
            log::error!(
                "pointwise output {}x{} != input {}x{}",
                args.output.height(),
                args.output.width(),
                args.input.height(),
                args.input.width()
            );
            return Err(KernelError::ShapeMismatch {
                name: "pointwise output plane",
                actual: args.output.plane(),
                expected: dims.hw,
            });
        }
        if args.weights.plane() != 1 || args.weights.channels() != dims.cout * dims.cin {
            log::error!(
                "pointwise weights {}x{}x{} do not match Cout={} Cin={}",
                args.weights.channels(),
                args.weights.height(),
                args.weights.width(),
                dims.cout,
                dims.cin
            );
            return Err(KernelError::ShapeMismatch {
                name: "pointwise weights",
                actual: args.weights.len(),
                expected: dims.cout * dims.cin,
            });
        }
        validate_capacity(
            args.transp_buffer.len(),
            self.transpose_buffer_len(dims.cin, dims.cout, dims.hw),
            "transpose buffer",
        )?;
        validate_capacity(
            args.staging.len(),
            self.staging_len(cluster.workers(), dims.cin, dims.cout),
            "pointwise staging",
        )?;
        Ok(dims)
    }

    /// Position-major `[HW × Cin]` copy of `input.data` into `dst`.
    fn prepare_input<T: Element>(
        &self,
        cluster: &Cluster,
        input: &Blob<T>,
        output: &Blob<T>,
        dst: &mut [T],
        staging: &mut [T],
    ) -> KernelResult<()> {
        match self.strategy.input {
            OperandPrep::Direct => Ok(()),
            OperandPrep::Transpose => transpose(cluster, input.data(), input.channels(), input.plane(), dst),
            OperandPrep::Im2Col => {
                let args = Im2ColArgs::new(1, 1).with_path(self.path);
                im2col(cluster, &self.dma, &args, input, output, dst, staging)
            }
        }
    }

    /// `output.data = W · input.data`.
    pub fn forward<T: Element>(&self, cluster: &Cluster, args: &mut ConvPwArgs<'_, T>) -> KernelResult<()> {
        let Dims { cin, cout, hw } = self.check(cluster, args)?;
        log::debug!("pointwise forward: Cin={} Cout={} HW={} {:?}", cin, cout, hw, self.strategy.input);

        let hint = MatmulHint::new(PassKind::Forward, args.algorithms.forward);
        let mut mm = MatmulArgs {
            n: cout,
            m: hw,
            k: cin,
            transpose_b: false,
        };
        match self.strategy.input {
            OperandPrep::Direct => {
                self.dispatch.multiply(
                    cluster,
                    args.weights.data(),
                    args.input.data(),
                    args.output.data_mut(),
                    &mm,
                    hint,
                )?;
            }
            OperandPrep::Transpose | OperandPrep::Im2Col => {
                let prepared = &mut args.transp_buffer[..hw * cin];
                self.prepare_input(cluster, args.input, args.output, prepared, args.staging)?;
                mm.transpose_b = true;
                self.dispatch
                    .multiply(cluster, args.weights.data(), prepared, args.output.data_mut(), &mm, hint)?;
            }
        }

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("pointwise forward output: {:?}", args.output.data());
        }
        Ok(())
    }

    /// `weights.diff = output.diff · input.dataᵗ`.
    pub fn backward_weights<T: Element>(&self, cluster: &Cluster, args: &mut ConvPwArgs<'_, T>) -> KernelResult<()> {
        let Dims { cin, cout, hw } = self.check(cluster, args)?;
        log::debug!("pointwise weight grad: Cin={} Cout={} HW={}", cin, cout, hw);

        let hint = MatmulHint::new(PassKind::WeightGrad, args.algorithms.weight_grad);
        let mut mm = MatmulArgs {
            n: cout,
            m: cin,
            k: hw,
            transpose_b: true,
        };
        match self.strategy.input {
            OperandPrep::Direct => {
                // in.data is [Cin × HW], i.e. Bᵗ.
                self.dispatch.multiply(
                    cluster,
                    args.output.diff(),
                    args.input.data(),
                    args.weights.diff_mut(),
                    &mm,
                    hint,
                )?;
            }
            OperandPrep::Transpose | OperandPrep::Im2Col => {
                let prepared = &mut args.transp_buffer[..hw * cin];
                self.prepare_input(cluster, args.input, args.output, prepared, args.staging)?;
                mm.transpose_b = false;
                self.dispatch
                    .multiply(cluster, args.output.diff(), prepared, args.weights.diff_mut(), &mm, hint)?;
            }
        }

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("pointwise weight grad: {:?}", args.weights.diff());
        }
        Ok(())
    }

    /// `input.diff = Wᵗ · output.diff`; a no-op when `skip_in_grad` is set.
    pub fn backward_input<T: Element>(&self, cluster: &Cluster, args: &mut ConvPwArgs<'_, T>) -> KernelResult<()> {
        let Dims { cin, cout, hw } = self.check(cluster, args)?;
        if args.skip_in_grad {
            log::debug!("pointwise input grad skipped");
            return Ok(());
        }
        log::debug!(
            "pointwise input grad: Cin={} Cout={} HW={} {:?} {:?}",
            cin,
            cout,
            hw,
            self.strategy.weights,
            self.strategy.output_grad
        );

        let (wt, rest) = args.transp_buffer.split_at_mut(cin * cout);
        match self.strategy.weights {
            WeightPrep::Transpose => transpose(cluster, args.weights.data(), cout, cin, wt)?,
            WeightPrep::Block => block_transpose(cluster, args.weights.data(), cin, cout, 1, 1, wt)?,
        }

        let hint = MatmulHint::new(PassKind::InputGrad, args.algorithms.input_grad);
        let mut mm = MatmulArgs {
            n: cin,
            m: hw,
            k: cout,
            transpose_b: false,
        };
        match self.strategy.output_grad {
            OperandPrep::Direct => {
                self.dispatch
                    .multiply(cluster, wt, args.output.diff(), args.input.diff_mut(), &mm, hint)?;
            }
            OperandPrep::Transpose | OperandPrep::Im2Col => {
                let prepared = &mut rest[..hw * cout];
                if self.strategy.output_grad == OperandPrep::Transpose {
                    transpose(cluster, args.output.diff(), cout, hw, prepared)?;
                } else {
                    let i2c = Im2ColArgs::new(1, 1)
                        .with_mode(Im2ColMode::InputGrad)
                        .with_path(self.path);
                    im2col(cluster, &self.dma, &i2c, args.input, args.output, prepared, args.staging)?;
                }
                mm.transpose_b = true;
                self.dispatch
                    .multiply(cluster, wt, prepared, args.input.diff_mut(), &mm, hint)?;
            }
        }

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("pointwise input grad: {:?}", args.input.diff());
        }
        Ok(())
    }

    /// Weight gradient, then input gradient unless skipped.
    pub fn backward<T: Element>(&self, cluster: &Cluster, args: &mut ConvPwArgs<'_, T>) -> KernelResult<()> {
        self.backward_weights(cluster, args)?;
        self.backward_input(cluster, args)
    }

    pub fn run<T: Element>(&self, cluster: &Cluster, pass: Pass, args: &mut ConvPwArgs<'_, T>) -> KernelResult<()> {
        match pass {
            Pass::Forward => self.forward(cluster, args),
            Pass::Backward => self.backward(cluster, args),
            Pass::WeightGrad => self.backward_weights(cluster, args),
            Pass::InputGrad => self.backward_input(cluster, args),
        }
    }
}
