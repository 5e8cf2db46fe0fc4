use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use paratemp::autocorr::{integrated_time_fft, integrated_time_serial};
use paratemp::gaussian::GaussianSettings;
use paratemp::{sample, Model, Position, ProposalKind, ProposalSpec, SamplerSettings};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

struct StdNormal {
    dim: usize,
}

impl Model for StdNormal {
    fn log_prior(&self, _position: &Position) -> f64 {
        0.0
    }

    fn log_likelihood(&self, position: &Position) -> f64 {
        position.params().iter().map(|x| -0.5 * x * x).sum()
    }

    fn max_dim(&self) -> usize {
        self.dim
    }
}

fn ar1(n: usize, phi: f64) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let mut x = 0f64;
    (0..n)
        .map(|_| {
            x = phi * x + rng.sample::<f64, _>(StandardNormal);
            x
        })
        .collect()
}

fn bench_autocorr(c: &mut Criterion) {
    let mut group = c.benchmark_group("autocorr");
    for n in [1024usize, 8192] {
        let series = ar1(n, 0.9);
        group.bench_with_input(BenchmarkId::new("serial", n), &series, |b, s| {
            b.iter(|| integrated_time_serial(s))
        });
        group.bench_with_input(BenchmarkId::new("fft", n), &series, |b, s| {
            b.iter(|| integrated_time_fft(s))
        });
    }
    group.finish();
}

fn bench_sample(c: &mut Criterion) {
    c.bench_function("sample_10d_normal", |b| {
        b.iter(|| {
            let settings = SamplerSettings {
                n_chains: 4,
                generations: 10,
                steps_per_generation: 50,
                sample_threads: 4,
                seed: 3,
                proposals: vec![ProposalSpec::new(
                    ProposalKind::Gaussian(GaussianSettings::default()),
                    1.0,
                )],
                ..SamplerSettings::default()
            };
            sample(StdNormal { dim: 10 }, settings).unwrap()
        })
    });
}

criterion_group!(benches, bench_autocorr, bench_sample);
criterion_main!(benches);
