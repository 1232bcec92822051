#![cfg_attr(not(feature = "backend_wgpu"), allow(dead_code))]

#[cfg(feature = "backend_wgpu")]
use burn::{backend::wgpu::Wgpu, prelude::*};
#[cfg(feature = "backend_wgpu")]
use burn_vit::model::vit::ViTConfig;
#[cfg(feature = "backend_wgpu")]
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

#[cfg(feature = "backend_wgpu")]
criterion_group! {
    name = vit_benchmarks;
    config = Criterion::default().sample_size(100);
    targets = inference_benchmark,
}
#[cfg(feature = "backend_wgpu")]
criterion_main!(vit_benchmarks);

#[cfg(feature = "backend_wgpu")]
fn inference_benchmark(c: &mut Criterion) {
    let configs = [
        (ViTConfig::tiny(None, None, 0), "tiny"),
        (ViTConfig::small(None, None, 0), "small"),
        (ViTConfig::base(None, None, 0), "base"),
        // (ViTConfig::large(None, None, 0), "large"),
    ];

    let mut group = c.benchmark_group("burn_vit_inference");
    for (config, name) in configs.iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("vit", name), &config, |b, &config| {
            let device = Default::default();
            let model = config
                .init::<Wgpu>(&device)
                .expect("preset configurations are valid");
            let input: Tensor<Wgpu, 4> = Tensor::zeros(
                [
                    1,
                    config.channels,
                    config.image_size[0],
                    config.image_size[1],
                ],
                &device,
            );

            b.iter(|| {
                model
                    .forward(input.clone())
                    .expect("input matches configuration")
                    .to_data()
            });
        });
    }
}

#[cfg(not(feature = "backend_wgpu"))]
fn main() {
    eprintln!(
        "vit benchmark requires `--features backend_wgpu`. \
         Re-run with `cargo bench --features backend_wgpu`."
    );
}
