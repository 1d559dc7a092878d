//! Pointwise convolution passes per operand strategy, reported as GFLOPS.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

#[path = "utils.rs"]
mod utils;

use cluster_train_kernels::{
    Blob, Cluster, ClusterMatmul, ConvPwArgs, Layout, MatmulAlgorithm, OperandPrep, Pass, PassAlgorithms,
    PointwiseConv, PwStrategy, WeightPrep,
};

/// (Cin, Cout, H, W)
const LAYERS: &[(usize, usize, usize, usize)] = &[(16, 32, 16, 16), (32, 64, 8, 8), (64, 64, 8, 8)];
const WORKERS: usize = 8;

fn bench_pw_passes(c: &mut Criterion) {
    let cluster = Cluster::new(WORKERS).expect("cluster");
    let mut group = c.benchmark_group("conv_pw");
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));

    let strategies = [
        ("direct", PwStrategy {
            input: OperandPrep::Direct,
            output_grad: OperandPrep::Direct,
            weights: WeightPrep::Transpose,
        }),
        ("transpose", PwStrategy {
            input: OperandPrep::Transpose,
            output_grad: OperandPrep::Transpose,
            weights: WeightPrep::Transpose,
        }),
        ("im2col", PwStrategy {
            input: OperandPrep::Im2Col,
            output_grad: OperandPrep::Im2Col,
            weights: WeightPrep::Block,
        }),
    ];

    for &(cin, cout, h, w) in LAYERS {
        let hw = h * w;
        for (name, strategy) in strategies {
            let conv = PointwiseConv::new(ClusterMatmul::default(), strategy);
            let mut input = utils::random_blob(cin, h, w, Layout::Chw);
            let mut weights = Blob::weights(cout, cin, 1, 1, utils::random_f32_vec(cout * cin)).expect("weights");
            let mut output = utils::random_blob(cout, h, w, Layout::Chw);
            let mut tb = vec![0.0f32; conv.transpose_buffer_len(cin, cout, hw)];

            for pass in [Pass::Forward, Pass::WeightGrad, Pass::InputGrad] {
                group.throughput(Throughput::Elements(utils::gemm_flops(cout, hw, cin)));
                let mut args = ConvPwArgs {
                    input: &mut input,
                    weights: &mut weights,
                    output: &mut output,
                    transp_buffer: &mut tb,
                    staging: &mut [],
                    algorithms: PassAlgorithms {
                        forward: MatmulAlgorithm::Unroll4,
                        weight_grad: MatmulAlgorithm::Unroll4,
                        input_grad: MatmulAlgorithm::Unroll4,
                    },
                    skip_in_grad: false,
                };
                group.bench_with_input(
                    BenchmarkId::new(format!("{name}/{pass:?}"), format!("{cin}->{cout}@{h}x{w}")),
                    &pass,
                    |bench, &pass| {
                        bench.iter(|| {
                            conv.run(&cluster, black_box(pass), &mut args).expect("pass");
                        });
                    },
                );
            }
        }
    }
    group.finish();
}

criterion_group!(benches, bench_pw_passes);
criterion_main!(benches);
