use multiversion::multiversion;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::store::ChainHistory;

/// Window constant from the emcee heuristic: the integration window is the
/// first lag `w` with `w > WINDOW_FACTOR * tau(w)`.
const WINDOW_FACTOR: f64 = 5.0;

/// Integrated autocorrelation time by direct summation.
///
/// This is the reference semantics: the normalized autocovariance is summed
/// term by term and cut off with the self-consistent window. The spectral
/// variant computes the identical quantity and must agree within numerical
/// tolerance; this form is O(n^2) and exists for correctness checks and
/// short histories.
pub fn integrated_time_serial(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return 1.0;
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let mut acov = vec![0f64; n];
    autocovariance_direct(series, mean, &mut acov);
    if acov[0] <= 0.0 {
        // Constant series: every sample is the same draw.
        return 1.0;
    }
    integrate_with_window(&acov)
}

/// Integrated autocorrelation time via the padded FFT of the series.
///
/// Same computation as [`integrated_time_serial`] through the
/// Wiener-Khinchin theorem: forward transform of the centered, zero-padded
/// series, squared modulus, inverse transform. Padding to twice the next
/// power of two keeps the circular convolution from wrapping, so the
/// autocovariances match the direct sums exactly.
pub fn integrated_time_fft(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return 1.0;
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let padded = 2 * n.next_power_of_two();

    let mut buffer: Vec<Complex<f64>> = series
        .iter()
        .map(|x| Complex::new(x - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(padded)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(padded).process(&mut buffer);
    for value in &mut buffer {
        *value = Complex::new(value.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(padded).process(&mut buffer);

    // The inverse transform is unnormalized; the scale cancels against the
    // lag-0 term.
    let acov: Vec<f64> = buffer[..n].iter().map(|c| c.re).collect();
    if acov[0] <= 0.0 {
        return 1.0;
    }
    integrate_with_window(&acov)
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn autocovariance_direct(series: &[f64], mean: f64, acov: &mut [f64]) {
    let n = series.len();
    for (lag, slot) in acov.iter_mut().enumerate() {
        let mut sum = 0f64;
        for t in 0..n - lag {
            sum += (series[t] - mean) * (series[t + lag] - mean);
        }
        *slot = sum;
    }
}

/// Cumulative `tau(w) = 2 * sum_{k<=w} rho_k - 1` with the self-consistent
/// cutoff.
fn integrate_with_window(acov: &[f64]) -> f64 {
    let norm = acov[0];
    let mut taus = Vec::with_capacity(acov.len());
    let mut sum = 0f64;
    for value in acov {
        sum += value / norm;
        taus.push(2.0 * sum - 1.0);
    }
    let window = taus
        .iter()
        .enumerate()
        .position(|(lag, tau)| (lag as f64) > WINDOW_FACTOR * *tau)
        .unwrap_or(taus.len() - 1);
    taus[window]
}

/// Effective number of independent samples in a series of length `n` with
/// integrated autocorrelation time `tau`.
pub fn effective_sample_size(n: usize, tau: f64) -> f64 {
    if tau <= 0.0 {
        return n as f64;
    }
    n as f64 / tau
}

/// Integrated autocorrelation time for every parameter of a chain history,
/// computed in parallel. Steps where a parameter was inactive are skipped,
/// so trans-dimensional histories measure only the visited values.
pub fn history_autocorr_times(history: &ChainHistory, max_dim: usize) -> Vec<f64> {
    (0..max_dim)
        .into_par_iter()
        .map(|index| {
            let series: Vec<f64> = history
                .parameter_series(index)
                .into_iter()
                .filter(|v| v.is_finite())
                .collect();
            integrated_time_fft(&series)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::StandardNormal;

    fn white_noise(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n).map(|_| rng.sample(StandardNormal)).collect()
    }

    fn ar1(n: usize, phi: f64, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut series = Vec::with_capacity(n);
        let mut x = 0f64;
        for _ in 0..n {
            x = phi * x + rng.sample::<f64, _>(StandardNormal);
            series.push(x);
        }
        series
    }

    fn assert_close(a: f64, b: f64, rel: f64) {
        assert!(
            (a - b).abs() <= rel * a.abs().max(b.abs()),
            "{a} and {b} differ by more than rel {rel}"
        );
    }

    #[test]
    fn serial_and_fft_agree_on_white_noise() {
        let series = white_noise(2048, 1);
        let serial = integrated_time_serial(&series);
        let fft = integrated_time_fft(&series);
        assert_close(serial, fft, 1e-6);
        assert_abs_diff_eq!(serial, 1.0, epsilon = 0.2);
    }

    #[test]
    fn serial_and_fft_agree_on_ar1() {
        let series = ar1(3000, 0.9, 2);
        let serial = integrated_time_serial(&series);
        let fft = integrated_time_fft(&series);
        assert_close(serial, fft, 1e-6);
    }

    #[test]
    fn serial_and_fft_agree_on_non_power_of_two_lengths() {
        for n in [513, 1000, 1535] {
            let series = ar1(n, 0.5, n as u64);
            assert_close(
                integrated_time_serial(&series),
                integrated_time_fft(&series),
                1e-6,
            );
        }
    }

    #[test]
    fn ar1_matches_the_closed_form() {
        // For AR(1), tau = (1 + phi) / (1 - phi).
        let phi = 0.9f64;
        let expected = (1.0 + phi) / (1.0 - phi);
        let series = ar1(400_000, phi, 3);
        let tau = integrated_time_fft(&series);
        assert!(
            (tau - expected).abs() / expected < 0.15,
            "tau {tau} vs expected {expected}"
        );
    }

    #[test]
    fn constant_series_reports_unit_time() {
        let series = vec![4.2; 100];
        assert_eq!(integrated_time_serial(&series), 1.0);
        assert_eq!(integrated_time_fft(&series), 1.0);
    }

    #[test]
    fn ess_scales_inversely_with_tau() {
        assert_eq!(effective_sample_size(1000, 10.0), 100.0);
        assert_eq!(effective_sample_size(1000, 0.0), 1000.0);
    }
}
