//! Autofocus: image sharpness scoring and a Gaussian peak fit.
//!
//! The scan steps the focus drive through `2·n + 1` positions centred on the
//! start position, scores a frame at each, fits
//!
//! ```text
//! score(x) = A·exp(−(x−μ)² / (2σ²)) + B
//! ```
//!
//! and moves to the fitted peak `μ`.

use anyhow::Context;
use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::FocusConfig;
use crate::error::{AppResult, RigError};
use crate::hardware::capabilities::{FocusDrive, FrameSource};

const MAX_ITERATIONS: usize = 200;
const MIN_SIGMA: f64 = 1e-6;

/// Gradient energy of a grayscale image: the mean of `gx² + gy²` over all
/// pixels, with 3×3 Sobel kernels and reflect-101 borders.
pub fn sharpness(image: &Array2<f64>) -> f64 {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return 0.0;
    }
    let at = |r: isize, c: isize| image[[reflect101(r, rows), reflect101(c, cols)]];

    let mut energy = 0.0;
    for r in 0..rows as isize {
        for c in 0..cols as isize {
            let gx = (at(r - 1, c + 1) + 2.0 * at(r, c + 1) + at(r + 1, c + 1))
                - (at(r - 1, c - 1) + 2.0 * at(r, c - 1) + at(r + 1, c - 1));
            let gy = (at(r + 1, c - 1) + 2.0 * at(r + 1, c) + at(r + 1, c + 1))
                - (at(r - 1, c - 1) + 2.0 * at(r - 1, c) + at(r - 1, c + 1));
            energy += gx * gx + gy * gy;
        }
    }
    energy / (rows * cols) as f64
}

/// `-1 → 1`, `n → n-2`: mirror without repeating the edge pixel.
fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// Fitted peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GaussianFit {
    /// Peak height above baseline
    pub amplitude: f64,
    /// Peak position
    pub center: f64,
    /// Width
    pub sigma: f64,
    /// Baseline
    pub baseline: f64,
    /// Sum of squared residuals
    pub residual: f64,
}

impl GaussianFit {
    /// Model value at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        model([self.amplitude, self.center, self.sigma, self.baseline], x)
    }
}

/// Box constraints on the fit parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitBounds {
    /// Allowed peak positions
    pub center: (f64, f64),
    /// Allowed widths
    pub sigma: (f64, f64),
}

impl FitBounds {
    /// Peak within the sampled range, width up to the sample span.
    pub fn sampled(xs: &[f64]) -> Self {
        Self::extended(xs, 0.0)
    }

    /// Like [`FitBounds::sampled`], with the peak allowed `margin` beyond
    /// either end of the sampled range.
    pub fn extended(xs: &[f64], margin: f64) -> Self {
        let lo = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let span = (hi - lo).max(MIN_SIGMA);
        Self {
            center: (lo - margin, hi + margin),
            sigma: (MIN_SIGMA, span),
        }
    }

    fn clamp(&self, p: [f64; 4]) -> [f64; 4] {
        [
            p[0].max(0.0),
            p[1].clamp(self.center.0, self.center.1),
            p[2].clamp(self.sigma.0, self.sigma.1),
            p[3],
        ]
    }
}

fn model(p: [f64; 4], x: f64) -> f64 {
    let d = x - p[1];
    p[0] * (-d * d / (2.0 * p[2] * p[2])).exp() + p[3]
}

fn cost(p: [f64; 4], xs: &[f64], ys: &[f64]) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = y - model(p, x);
            r * r
        })
        .sum()
}

/// Solve a 4×4 system by Gaussian elimination with partial pivoting.
fn solve4(mut m: [[f64; 4]; 4], mut b: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < 1e-300 {
            return None;
        }
        m.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..4 {
            let f = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= f * m[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = [0.0; 4];
    for row in (0..4).rev() {
        let tail: f64 = (row + 1..4).map(|k| m[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / m[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Levenberg–Marquardt from one start, projected onto `bounds` after each step.
fn refine(xs: &[f64], ys: &[f64], start: [f64; 4], bounds: &FitBounds) -> ([f64; 4], f64) {
    let mut p = bounds.clamp(start);
    let mut current = cost(p, xs, ys);
    let mut lambda = 1e-3;

    for _ in 0..MAX_ITERATIONS {
        let mut jtj = [[0.0; 4]; 4];
        let mut jtr = [0.0; 4];
        for (&x, &y) in xs.iter().zip(ys) {
            let d = x - p[1];
            let s2 = p[2] * p[2];
            let e = (-d * d / (2.0 * s2)).exp();
            let j = [e, p[0] * e * d / s2, p[0] * e * d * d / (s2 * p[2]), 1.0];
            let r = y - (p[0] * e + p[3]);
            for a in 0..4 {
                jtr[a] += j[a] * r;
                for b in 0..4 {
                    jtj[a][b] += j[a] * j[b];
                }
            }
        }

        let mut improved = false;
        for _ in 0..16 {
            let mut damped = jtj;
            for (k, row) in damped.iter_mut().enumerate() {
                row[k] += lambda * jtj[k][k].max(1e-12);
            }
            let Some(delta) = solve4(damped, jtr) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = bounds.clamp([
                p[0] + delta[0],
                p[1] + delta[1],
                p[2] + delta[2],
                p[3] + delta[3],
            ]);
            let trial = cost(candidate, xs, ys);
            if trial.is_finite() && trial < current {
                let gain = current - trial;
                p = candidate;
                current = trial;
                lambda = (lambda / 10.0).max(1e-12);
                improved = gain > 1e-14 * current.max(1e-300);
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }
    (p, current)
}

/// Fit the Gaussian peak model to `(xs, ys)` within `bounds`.
///
/// Starts from `A₀ = max y`, `μ₀ = x at max y`, `σ₀ = span / 2`,
/// `B₀ = min y`, plus a few alternative peak positions and widths across the
/// allowed range; the lowest residual wins.
pub fn fit_gaussian(xs: &[f64], ys: &[f64], bounds: &FitBounds) -> AppResult<GaussianFit> {
    if xs.len() != ys.len() {
        return Err(RigError::Fit(format!(
            "{} positions but {} scores",
            xs.len(),
            ys.len()
        )));
    }
    if xs.len() < 4 {
        return Err(RigError::Fit(format!(
            "need at least 4 samples, got {}",
            xs.len()
        )));
    }
    if xs.iter().chain(ys).any(|v| !v.is_finite()) {
        return Err(RigError::Fit("non-finite sample".into()));
    }

    let (peak, y_max) = xs
        .iter()
        .zip(ys)
        .map(|(&x, &y)| (x, y))
        .fold((xs[0], f64::NEG_INFINITY), |best, (x, y)| if y > best.1 { (x, y) } else { best });
    let y_min = ys.iter().copied().fold(f64::INFINITY, f64::min);
    let span = bounds.sigma.1;

    let (lo, hi) = bounds.center;
    let centers = [peak, lo, (lo + hi) / 2.0, hi, (peak + hi) / 2.0, (peak + lo) / 2.0];
    let sigmas = [span / 2.0, span / 4.0, span / 8.0, span];

    let mut best: Option<([f64; 4], f64)> = None;
    for &center in &centers {
        for &sigma in &sigmas {
            let (p, residual) = refine(xs, ys, [y_max, center, sigma, y_min], bounds);
            if best.map_or(true, |(_, r)| residual < r) {
                best = Some((p, residual));
            }
        }
    }
    let (p, residual) = best.ok_or_else(|| RigError::Fit("no start converged".into()))?;
    debug!(
        amplitude = p[0],
        center = p[1],
        sigma = p[2],
        baseline = p[3],
        residual,
        "gaussian fit"
    );
    Ok(GaussianFit {
        amplitude: p[0],
        center: p[1],
        sigma: p[2],
        baseline: p[3],
        residual,
    })
}

/// Scan geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusScan {
    /// Positions on each side of the start
    pub search_num: u32,
    /// Distance between positions
    pub step: f64,
    /// How far beyond the scanned range the peak may be placed
    pub margin: f64,
}

impl From<&FocusConfig> for FocusScan {
    fn from(config: &FocusConfig) -> Self {
        Self {
            search_num: config.search_num,
            step: config.step,
            margin: 0.0,
        }
    }
}

impl FocusScan {
    /// Offsets sampled relative to the start position.
    pub fn offsets(&self) -> Vec<f64> {
        let n = self.search_num as i64;
        (-n..=n).map(|i| i as f64 * self.step).collect()
    }
}

/// Outcome of a focus scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocusResult {
    /// Sampled offsets from the start position
    pub offsets: Vec<f64>,
    /// Sharpness at each offset
    pub scores: Vec<f64>,
    /// Fitted peak
    pub fit: GaussianFit,
}

impl FocusResult {
    /// Best-focus offset from the start position.
    pub fn best_offset(&self) -> f64 {
        self.fit.center
    }
}

/// Scan, fit and move to the best focus.
///
/// Moves to `−n·step`, then steps `+step` up to `+n·step`, grabbing and scoring
/// a frame at each position. The final move is `μ − n·step` since the drive
/// already sits at `+n·step`.
pub async fn focus_search(
    drive: &dyn FocusDrive,
    frames: &dyn FrameSource,
    scan: FocusScan,
) -> anyhow::Result<FocusResult> {
    let offsets = scan.offsets();
    let first = offsets.first().copied().unwrap_or_default();
    drive.move_rel(first).await.context("moving to scan start")?;

    let mut scores = Vec::with_capacity(offsets.len());
    for i in 0..offsets.len() {
        if i > 0 {
            drive.move_rel(scan.step).await.context("stepping focus")?;
        }
        let frame = frames.grab_frame().await.context("grabbing focus frame")?;
        let score = sharpness(&frame);
        debug!(offset = offsets[i], score, "focus sample");
        scores.push(score);
    }

    let fit = fit_gaussian(&offsets, &scores, &FitBounds::extended(&offsets, scan.margin))?;
    let last = offsets.last().copied().unwrap_or_default();
    drive
        .move_rel(fit.center - last)
        .await
        .context("moving to best focus")?;
    info!(offset = fit.center, sigma = fit.sigma, "Focus found");
    Ok(FocusResult {
        offsets,
        scores,
        fit,
    })
}
