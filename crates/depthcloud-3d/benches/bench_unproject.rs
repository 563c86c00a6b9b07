use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use depthcloud_3d::{
    parallel::ExecutionStrategy,
    unproject::{unproject_depth, PointOrder, UnprojectConfig},
};
use depthcloud_tensor::{CpuAllocator, Tensor2, Tensor3};

const IDENTITY: [[f64; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

fn bench_unproject(c: &mut Criterion) {
    let mut group = c.benchmark_group("Unproject");

    for (width, height) in [(320, 240), (640, 480), (1280, 720)].iter() {
        group.throughput(criterion::Throughput::Elements((*width * *height) as u64));

        let parameter_string = format!("{width}x{height}");
        let k = [
            [525.0, 0.0, *width as f64 / 2.0],
            [0.0, 525.0, *height as f64 / 2.0],
            [0.0, 0.0, 1.0],
        ];
        // a tilted plane with every 13th sample missing
        let depth = Tensor2::from_shape_fn([*height, *width], CpuAllocator, |[r, c]| {
            if (r * *width + c) % 13 == 0 {
                0
            } else {
                (800 + r + c / 2) as u16
            }
        })
        .unwrap();
        let colors = Tensor3::from_shape_fn([*height, *width, 3], CpuAllocator, |[r, c, ch]| {
            ((r + c + ch) % 255) as f32 / 255.0
        })
        .unwrap();

        for (name, strategy) in [
            ("serial", ExecutionStrategy::Serial),
            ("parallel_elements", ExecutionStrategy::ParallelElements),
            ("chunks_row", ExecutionStrategy::Chunks(*width)),
        ] {
            let config = UnprojectConfig::default().with_strategy(strategy);
            group.bench_with_input(
                BenchmarkId::new(name, &parameter_string),
                &(&depth, &colors),
                |b, (depth, colors)| {
                    b.iter(|| {
                        black_box(
                            unproject_depth(*depth, Some(*colors), &k, &IDENTITY, &config).unwrap(),
                        )
                    })
                },
            );
        }

        let config = UnprojectConfig::default().with_order(PointOrder::PixelIndex);
        group.bench_with_input(
            BenchmarkId::new("parallel_pixel_order", &parameter_string),
            &(&depth, &colors),
            |b, (depth, colors)| {
                b.iter(|| {
                    black_box(unproject_depth(*depth, Some(*colors), &k, &IDENTITY, &config).unwrap())
                })
            },
        );

        let config = UnprojectConfig::default().with_stride(4);
        group.bench_with_input(
            BenchmarkId::new("parallel_stride4", &parameter_string),
            &depth,
            |b, depth| b.iter(|| black_box(unproject_depth(depth, None, &k, &IDENTITY, &config).unwrap())),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_unproject);
criterion_main!(benches);
