//! Autofocus: peak fitting and the scan against simulated optics.

use cvd_rig::focus::{fit_gaussian, focus_search, FitBounds, FocusScan};
use cvd_rig::hardware::capabilities::FocusDrive;
use cvd_rig::hardware::mock::SimulatedOptics;

fn gaussian(a: f64, mu: f64, sigma: f64, b: f64, x: f64) -> f64 {
    a * (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp() + b
}

/// Deterministic noise in `[-amplitude, amplitude]`.
fn jitter(i: usize, amplitude: f64) -> f64 {
    let phase = (i as f64 * 12.9898).sin() * 43_758.545_3;
    (phase - phase.floor() - 0.5) * 2.0 * amplitude
}

#[test]
fn test_fit_recovers_peak_inside_scan() {
    let xs: Vec<f64> = (-10..=10).map(|i| f64::from(i) * 2.0).collect();
    let ys: Vec<f64> = xs
        .iter()
        .enumerate()
        .map(|(i, &x)| gaussian(80.0, 3.5, 6.0, 10.0, x) + jitter(i, 0.2))
        .collect();

    let fit = fit_gaussian(&xs, &ys, &FitBounds::sampled(&xs)).unwrap();
    assert!((fit.center - 3.5).abs() < 0.3, "center {}", fit.center);
    assert!((fit.sigma - 6.0).abs() < 0.5, "sigma {}", fit.sigma);
    assert!((fit.amplitude - 80.0).abs() < 2.0, "amplitude {}", fit.amplitude);
    assert!((fit.baseline - 10.0).abs() < 2.0, "baseline {}", fit.baseline);
}

#[test]
fn test_fit_extrapolates_peak_outside_scan() {
    // Only the rising flank is sampled; the peak sits 10 units past the end.
    let xs: Vec<f64> = (-5..=5).map(|i| f64::from(i) * 4.0).collect();
    let ys: Vec<f64> = xs
        .iter()
        .enumerate()
        .map(|(i, &x)| gaussian(100.0, 30.0, 8.0, 5.0, x) + jitter(i, 0.05))
        .collect();

    let fit = fit_gaussian(&xs, &ys, &FitBounds::extended(&xs, 20.0)).unwrap();
    assert!((fit.center - 30.0).abs() <= 2.0, "center {}", fit.center);

    // Bounded to the sampled range, the best it can do is the edge.
    let clamped = fit_gaussian(&xs, &ys, &FitBounds::sampled(&xs)).unwrap();
    assert!(clamped.center <= 20.0);
}

#[test]
fn test_fit_rejects_mismatched_samples() {
    let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
    assert!(fit_gaussian(&xs, &[1.0, 2.0], &FitBounds::sampled(&xs)).is_err());
    assert!(fit_gaussian(&xs, &[1.0, 2.0, f64::NAN, 2.0, 1.0], &FitBounds::sampled(&xs)).is_err());
}

#[tokio::test]
async fn test_focus_search_moves_to_best_focus() {
    let optics = SimulatedOptics::new(6.0, 10.0);
    let scan = FocusScan {
        search_num: 5,
        step: 3.0,
        margin: 0.0,
    };

    let result = focus_search(&optics, &optics, scan).await.unwrap();
    assert_eq!(result.offsets.len(), 11);
    assert_eq!(result.scores.len(), 11);
    assert!((result.best_offset() - 6.0).abs() < 0.5, "best {}", result.best_offset());

    let position = optics.position().await.unwrap();
    assert!((position - result.best_offset()).abs() < 1e-9);
}
