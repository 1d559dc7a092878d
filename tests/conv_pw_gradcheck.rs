//! End-to-end pointwise convolution: numerical gradient checks, the
//! input-gradient skip flag and the staged im2col operand path.

use approx::assert_abs_diff_eq;
use cluster_train_kernels::{
    Accumulation, Blob, Cluster, ClusterConfig, ClusterMatmul, ConvPwArgs, Layout, MatmulAlgorithm, MemoryPath,
    OperandPrep, Pass, PassAlgorithms, PointwiseConv, PwStrategy, SoftDma, WeightPrep,
};
use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CIN: usize = 3;
const COUT: usize = 4;
const H: usize = 3;
const W: usize = 2;
const EPS: f32 = 1e-2;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Layer {
    input: Blob<f32>,
    weights: Blob<f32>,
    output: Blob<f32>,
}

impl Layer {
    fn random(rng: &mut StdRng) -> Self {
        let input = Blob::from_data(
            CIN,
            H,
            W,
            Layout::Chw,
            (0..CIN * H * W).map(|_| rng.gen_range(-1.0..1.0)).collect(),
        )
        .unwrap();
        let weights = Blob::weights(COUT, CIN, 1, 1, (0..COUT * CIN).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .unwrap();
        let mut output = Blob::zeros(COUT, H, W, Layout::Chw).unwrap();
        for g in output.diff_mut() {
            *g = rng.gen_range(-1.0..1.0);
        }
        Self { input, weights, output }
    }

    fn run(&mut self, cluster: &Cluster, conv: &PointwiseConv<ClusterMatmul>, pass: Pass, skip_in_grad: bool) {
        let mut tb = vec![0.0f32; conv.transpose_buffer_len(CIN, COUT, H * W)];
        let mut args = ConvPwArgs {
            input: &mut self.input,
            weights: &mut self.weights,
            output: &mut self.output,
            transp_buffer: &mut tb,
            staging: &mut [],
            algorithms: PassAlgorithms::default(),
            skip_in_grad,
        };
        conv.run(cluster, pass, &mut args).unwrap();
    }

    /// `Σ out.diff · out.data` after a forward pass.
    fn loss(&mut self, cluster: &Cluster, conv: &PointwiseConv<ClusterMatmul>) -> f32 {
        self.run(cluster, conv, Pass::Forward, false);
        self.output
            .data()
            .iter()
            .zip(self.output.diff())
            .map(|(y, g)| y * g)
            .sum()
    }
}

fn strategies() -> Vec<PwStrategy> {
    vec![
        PwStrategy::default(),
        PwStrategy {
            input: OperandPrep::Direct,
            output_grad: OperandPrep::Transpose,
            weights: WeightPrep::Block,
        },
        PwStrategy {
            input: OperandPrep::Im2Col,
            output_grad: OperandPrep::Im2Col,
            weights: WeightPrep::Transpose,
        },
    ]
}

#[test]
fn test_weight_and_input_gradients_match_central_differences() {
    init_logger();
    let cluster = Cluster::new(3).unwrap();
    for strategy in strategies() {
        let conv = PointwiseConv::new(ClusterMatmul::default(), strategy);
        let mut rng = StdRng::seed_from_u64(1234);
        let mut layer = Layer::random(&mut rng);
        layer.run(&cluster, &conv, Pass::Forward, false);
        layer.run(&cluster, &conv, Pass::Backward, false);
        let w_grad = layer.weights.diff().to_vec();
        let x_grad = layer.input.diff().to_vec();

        for i in 0..COUT * CIN {
            let base = layer.weights.data()[i];
            layer.weights.data_mut()[i] = base + EPS;
            let plus = layer.loss(&cluster, &conv);
            layer.weights.data_mut()[i] = base - EPS;
            let minus = layer.loss(&cluster, &conv);
            layer.weights.data_mut()[i] = base;
            assert_abs_diff_eq!(w_grad[i], (plus - minus) / (2.0 * EPS), epsilon = 2e-3);
        }

        for i in 0..CIN * H * W {
            let base = layer.input.data()[i];
            layer.input.data_mut()[i] = base + EPS;
            let plus = layer.loss(&cluster, &conv);
            layer.input.data_mut()[i] = base - EPS;
            let minus = layer.loss(&cluster, &conv);
            layer.input.data_mut()[i] = base;
            assert_abs_diff_eq!(x_grad[i], (plus - minus) / (2.0 * EPS), epsilon = 2e-3);
        }
    }
}

#[test]
fn test_skip_in_grad_leaves_input_gradient_untouched() {
    let cluster = Cluster::new(2).unwrap();
    let conv = PointwiseConv::new(ClusterMatmul::default(), PwStrategy::default());
    let mut rng = StdRng::seed_from_u64(9);
    let mut layer = Layer::random(&mut rng);
    let sentinel: Vec<f32> = (0..CIN * H * W).map(|v| v as f32 * -0.25).collect();
    layer.input.diff_mut().copy_from_slice(&sentinel);

    layer.run(&cluster, &conv, Pass::Backward, true);
    assert_eq!(layer.input.diff(), sentinel.as_slice());

    layer.run(&cluster, &conv, Pass::InputGrad, true);
    assert_eq!(layer.input.diff(), sentinel.as_slice());

    layer.run(&cluster, &conv, Pass::InputGrad, false);
    assert_ne!(layer.input.diff(), sentinel.as_slice());
}

#[test]
fn test_staged_im2col_operands_match_direct() {
    let cluster = Cluster::new(4).unwrap();
    let strategy = PwStrategy {
        input: OperandPrep::Im2Col,
        output_grad: OperandPrep::Im2Col,
        weights: WeightPrep::Block,
    };
    let direct = PointwiseConv::new(ClusterMatmul::default(), strategy);
    let staged = PointwiseConv::with_dma(ClusterMatmul::default(), SoftDma::new(), strategy, MemoryPath::Staged);

    let mut rng = StdRng::seed_from_u64(77);
    let mut a = Layer::random(&mut rng);
    let mut b = Layer {
        input: a.input.clone(),
        weights: a.weights.clone(),
        output: a.output.clone(),
    };
    a.run(&cluster, &direct, Pass::Forward, false);
    a.run(&cluster, &direct, Pass::Backward, false);

    let hw = H * W;
    let mut tb = vec![0.0f32; staged.transpose_buffer_len(CIN, COUT, hw)];
    let mut staging = vec![0.0f32; staged.staging_len(cluster.workers(), CIN, COUT)];
    assert!(!staging.is_empty());
    let mut args = ConvPwArgs {
        input: &mut b.input,
        weights: &mut b.weights,
        output: &mut b.output,
        transp_buffer: &mut tb,
        staging: &mut staging,
        algorithms: PassAlgorithms {
            forward: MatmulAlgorithm::Unroll4,
            weight_grad: MatmulAlgorithm::Unroll4,
            input_grad: MatmulAlgorithm::Unroll4,
        },
        skip_in_grad: false,
    };
    staged.run(&cluster, Pass::Forward, &mut args).unwrap();
    staged.run(&cluster, Pass::Backward, &mut args).unwrap();
    assert!(staged.dma().issued() > 0);
    assert_eq!(staged.dma().issued(), staged.dma().completed());

    assert_eq!(a.output.data(), b.output.data());
    assert_eq!(a.weights.diff(), b.weights.diff());
    assert_eq!(a.input.diff(), b.input.diff());
}

#[test]
fn test_f16_layer_tracks_f32_layer() {
    let config = ClusterConfig::default()
        .with_workers(2)
        .with_accumulation(Accumulation::Widened);
    let cluster = Cluster::from_config(&config).unwrap();
    let conv = PointwiseConv::from_config(&config, PwStrategy::default());

    let mut rng = StdRng::seed_from_u64(5);
    let mut reference = Layer::random(&mut rng);
    reference.run(&cluster, &conv, Pass::Forward, false);

    let to_half = |b: &Blob<f32>| {
        Blob::from_data(
            b.channels(),
            b.height(),
            b.width(),
            b.layout(),
            b.data().iter().map(|&v| f16::from_f32(v)).collect(),
        )
        .unwrap()
    };
    let mut input = to_half(&reference.input);
    let mut weights = to_half(&reference.weights);
    let mut output = Blob::<f16>::zeros(COUT, H, W, Layout::Chw).unwrap();
    let mut tb = vec![f16::ZERO; conv.transpose_buffer_len(CIN, COUT, H * W)];
    let mut args = ConvPwArgs {
        input: &mut input,
        weights: &mut weights,
        output: &mut output,
        transp_buffer: &mut tb,
        staging: &mut [],
        algorithms: PassAlgorithms::default(),
        skip_in_grad: false,
    };
    conv.forward(&cluster, &mut args).unwrap();

    for (h, f) in output.data().iter().zip(reference.output.data()) {
        assert_abs_diff_eq!(h.to_f32(), *f, epsilon = 1e-2);
    }
}
