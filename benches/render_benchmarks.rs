use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::Mat4;

use render_core::app::default_scene;
use render_core::math::Lcg;
use render_core::ocean::{butterfly_lookup, inverse_grid_sizes, CpuFft, SpectrumParams, WaveSpectrum, PASSES};
use render_core::particles::{Emitter, FloatRange, ParticleInfo};
use render_core::{AntiAliasing, RenderContext, Renderer, RendererConfig};

fn params() -> SpectrumParams {
    SpectrumParams {
        wind: 5.0,
        omega: 0.84,
        amplitude: 1.0,
    }
}

// ---------------------------------------------------------------------------
// Ocean precompute
// ---------------------------------------------------------------------------

fn bench_spectrum_generate(c: &mut Criterion) {
    let params = params();
    c.bench_function("ocean_spectrum_64", |b| {
        b.iter(|| black_box(WaveSpectrum::generate_sized(&params, 64)));
    });
}

fn bench_butterfly_lookup(c: &mut Criterion) {
    c.bench_function("ocean_butterfly_lookup", |b| {
        b.iter(|| black_box(butterfly_lookup(black_box(PASSES))));
    });
}

fn bench_cpu_fft(c: &mut Criterion) {
    let spectrum = WaveSpectrum::generate_sized(&params(), 64);
    let fft = CpuFft::new(&spectrum, &butterfly_lookup(6), inverse_grid_sizes(64, 1.0));
    c.bench_function("ocean_cpu_fft_64", |b| {
        b.iter(|| black_box(fft.simulate(black_box(1.5))));
    });
}

// ---------------------------------------------------------------------------
// Particles
// ---------------------------------------------------------------------------

fn bench_particle_update(c: &mut Criterion) {
    let info = ParticleInfo {
        spawn_count: 100,
        spawn_term: 0.05,
        spawn_end_time: -1.0,
        life_time: FloatRange::new(1.0, 2.0),
        enable_gpu_particle: false,
        ..Default::default()
    };
    c.bench_function("particle_cpu_update_60_frames", |b| {
        b.iter_with_setup(
            || {
                let mut rng = Lcg::new(1);
                let mut emitter = Emitter::new(info.clone());
                emitter.play(Mat4::IDENTITY, &mut rng, false);
                (emitter, rng)
            },
            |(mut emitter, mut rng)| {
                for _ in 0..60 {
                    emitter.update(1.0 / 60.0, Mat4::IDENTITY, &mut rng);
                }
                black_box(emitter.alive_count())
            },
        );
    });
}

// ---------------------------------------------------------------------------
// Frame submission on the dummy backend
// ---------------------------------------------------------------------------

fn bench_dummy_frame(c: &mut Criterion) {
    let config = RendererConfig {
        width: 320,
        height: 240,
        anti_aliasing: AntiAliasing::Taa,
        ..Default::default()
    };
    let mut ctx = RenderContext::headless(config.width, config.height).unwrap();
    let mut renderer = Renderer::new(&mut ctx, &config).unwrap();
    let mut scene = default_scene(&ctx, &config).unwrap();
    if let Some(dummy) = ctx.dummy_mut() {
        dummy.set_recording(false);
    }
    c.bench_function("dummy_render_frame", |b| {
        b.iter(|| {
            renderer.update_scene(&ctx, &mut scene, 1.0 / 60.0);
            black_box(renderer.render_frame(&mut ctx, &mut scene).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_spectrum_generate,
    bench_butterfly_lookup,
    bench_cpu_fft,
    bench_particle_update,
    bench_dummy_frame,
);
criterion_main!(benches);
