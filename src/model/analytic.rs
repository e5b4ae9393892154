/// Analytic PSF profiles (Gaussian, Moffat) with Levenberg-Marquardt fitting
///
/// Both profiles are elliptical, written in terms of a size and a reduced
/// shear (g1, g2) so that the shape parameters vary smoothly across the focal
/// plane. Full parameter vector: [flux, background, du, dv, size, g1, g2].

use nalgebra::{DMatrix, DVector};

pub const N_FULL_PARAMS: usize = 7;
pub const FLUX: usize = 0;
pub const BACKGROUND: usize = 1;
pub const DU: usize = 2;
pub const DV: usize = 3;
pub const SIZE: usize = 4;
pub const G1: usize = 5;
pub const G2: usize = 6;

/// Largest allowed shear component during fitting; keeps |g| below one
const MAX_SHEAR: f64 = 0.7;

/// Trait for analytic PSF models
pub trait PSFFunction: Send + Sync {
    /// Pixel value at local position (x, y) in arcsec for the full parameter vector
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64;

    /// Derivatives of `value` with respect to each parameter
    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]);

    /// Convert the size parameter to FWHM
    fn sigma_to_fwhm(&self, sigma: f64) -> f64;
}

/// Squared elliptical radius in units of `size` and its derivatives with
/// respect to [du, dv, size, g1, g2].
fn sheared_radius(x: f64, y: f64, params: &[f64]) -> (f64, [f64; 5]) {
    let dx = x - params[DU];
    let dy = y - params[DV];
    let s = params[SIZE];
    let g1 = params[G1];
    let g2 = params[G2];
    let gsq = g1 * g1 + g2 * g2;
    let d = 1.0 - gsq;
    let s2 = s * s;

    let a = 1.0 - 2.0 * g1 + gsq;
    let b = 1.0 + 2.0 * g1 + gsq;
    let c = -4.0 * g2;
    let n = a * dx * dx + c * dx * dy + b * dy * dy;
    let q = n / (d * s2);

    let ds2 = d * s2;
    let dq_du = -(2.0 * a * dx + c * dy) / ds2;
    let dq_dv = -(c * dx + 2.0 * b * dy) / ds2;
    let dq_ds = -2.0 * q / s;
    let dn_dg1 = (2.0 * g1 - 2.0) * dx * dx + (2.0 * g1 + 2.0) * dy * dy;
    let dn_dg2 = 2.0 * g2 * dx * dx - 4.0 * dx * dy + 2.0 * g2 * dy * dy;
    let dq_dg1 = (dn_dg1 + 2.0 * g1 * n / d) / ds2;
    let dq_dg2 = (dn_dg2 + 2.0 * g2 * n / d) / ds2;

    (q, [dq_du, dq_dv, dq_ds, dq_dg1, dq_dg2])
}

/// Shared value/gradient for profiles of the form `norm(size) * P(q)` with
/// `norm` proportional to `1 / size^2`.
fn radial_value(x: f64, y: f64, params: &[f64], pixel_area: f64, norm: f64, p: impl Fn(f64) -> f64) -> f64 {
    let (q, _) = sheared_radius(x, y, params);
    params[BACKGROUND] + params[FLUX] * pixel_area * norm * p(q)
}

fn radial_gradient(
    x: f64,
    y: f64,
    params: &[f64],
    pixel_area: f64,
    norm: f64,
    p: impl Fn(f64) -> (f64, f64),
    grad: &mut [f64],
) {
    let (q, dq) = sheared_radius(x, y, params);
    let (pq, dpq) = p(q);
    let flux = params[FLUX];
    let scale = flux * pixel_area * norm;

    grad[FLUX] = pixel_area * norm * pq;
    grad[BACKGROUND] = 1.0;
    grad[DU] = scale * dpq * dq[0];
    grad[DV] = scale * dpq * dq[1];
    // norm ~ size^-2 contributes -2/size
    grad[SIZE] = scale * (dpq * dq[2] - 2.0 * pq / params[SIZE]);
    grad[G1] = scale * dpq * dq[3];
    grad[G2] = scale * dpq * dq[4];
}

/// Gaussian PSF model; size is sigma
pub struct GaussianPSF {
    pub pixel_area: f64,
}

impl GaussianPSF {
    fn norm(size: f64) -> f64 {
        1.0 / (2.0 * std::f64::consts::PI * size * size)
    }
}

impl PSFFunction for GaussianPSF {
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        radial_value(x, y, params, self.pixel_area, Self::norm(params[SIZE]), |q| {
            (-0.5 * q).exp()
        })
    }

    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        radial_gradient(
            x,
            y,
            params,
            self.pixel_area,
            Self::norm(params[SIZE]),
            |q| {
                let e = (-0.5 * q).exp();
                (e, -0.5 * e)
            },
            grad,
        )
    }

    fn sigma_to_fwhm(&self, sigma: f64) -> f64 {
        sigma * 2.0 * (2.0 * 2.0_f64.ln()).sqrt()
    }
}

/// Moffat PSF model; size is the core radius alpha
pub struct MoffatPSF {
    pub beta: f64,
    pub pixel_area: f64,
}

impl MoffatPSF {
    fn norm(&self, size: f64) -> f64 {
        (self.beta - 1.0) / (std::f64::consts::PI * size * size)
    }

    /// Core radius giving the same FWHM as a Gaussian of the given sigma
    pub fn alpha_for_sigma(&self, sigma: f64) -> f64 {
        let fwhm = GaussianPSF { pixel_area: 1.0 }.sigma_to_fwhm(sigma);
        fwhm / self.sigma_to_fwhm(1.0)
    }
}

impl PSFFunction for MoffatPSF {
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let beta = self.beta;
        radial_value(x, y, params, self.pixel_area, self.norm(params[SIZE]), |q| {
            (1.0 + q).powf(-beta)
        })
    }

    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let beta = self.beta;
        radial_gradient(
            x,
            y,
            params,
            self.pixel_area,
            self.norm(params[SIZE]),
            |q| {
                let base = (1.0 + q).powf(-beta - 1.0);
                ((1.0 + q) * base, -beta * base)
            },
            grad,
        )
    }

    fn sigma_to_fwhm(&self, sigma: f64) -> f64 {
        sigma * 2.0 * (2.0_f64.powf(1.0 / self.beta) - 1.0).sqrt()
    }
}

/// Why a fit stopped without converging
#[derive(Debug, Clone, PartialEq)]
pub enum FitFailure {
    TooFewPoints { points: usize, params: usize },
    MaxIterations(usize),
    NonFinite,
}

impl std::fmt::Display for FitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitFailure::TooFewPoints { points, params } => {
                write!(f, "{} usable pixels for {} parameters", points, params)
            }
            FitFailure::MaxIterations(n) => write!(f, "no convergence after {} iterations", n),
            FitFailure::NonFinite => write!(f, "non-finite chi-squared"),
        }
    }
}

/// Result of a converged optimization
#[derive(Debug, Clone)]
pub struct LmSolution {
    pub params: Vec<f64>,
    pub chisq: f64,
    pub iterations: usize,
}

/// Weighted, bounded Levenberg-Marquardt optimizer
pub struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-8,
            lambda: 1e-3,
            lambda_factor: 10.0,
        }
    }
}

impl LevenbergMarquardt {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
            ..Default::default()
        }
    }

    fn chisq(psf: &dyn PSFFunction, positions: &[(f64, f64)], values: &[f64], weights: &[f64], params: &[f64]) -> f64 {
        positions
            .iter()
            .zip(values)
            .zip(weights)
            .map(|((&(x, y), &obs), &w)| {
                let r = obs - psf.value(x, y, params);
                w * r * r
            })
            .sum()
    }

    /// Minimize `sum w (obs - model)^2`. Only points with positive weight
    /// should be passed.
    pub fn fit(
        &mut self,
        psf: &dyn PSFFunction,
        positions: &[(f64, f64)],
        values: &[f64],
        weights: &[f64],
        initial_params: &[f64],
        lower_bounds: &[f64],
        upper_bounds: &[f64],
    ) -> Result<LmSolution, FitFailure> {
        let n_params = initial_params.len();
        let n_points = positions.len();

        if n_points <= n_params {
            return Err(FitFailure::TooFewPoints {
                points: n_points,
                params: n_params,
            });
        }

        let mut params: Vec<f64> = initial_params
            .iter()
            .enumerate()
            .map(|(i, p)| p.max(lower_bounds[i]).min(upper_bounds[i]))
            .collect();
        let mut current = Self::chisq(psf, positions, values, weights, &params);
        if !current.is_finite() {
            return Err(FitFailure::NonFinite);
        }

        let mut jacobian = DMatrix::<f64>::zeros(n_points, n_params);
        let mut residuals = DVector::<f64>::zeros(n_points);
        let mut gradient = vec![0.0; n_params];

        for iter in 0..self.max_iterations {
            for (i, ((&(x, y), &obs), &w)) in positions.iter().zip(values).zip(weights).enumerate() {
                let sw = w.sqrt();
                residuals[i] = sw * (obs - psf.value(x, y, &params));
                psf.gradient(x, y, &params, &mut gradient);
                for (j, &g) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = sw * g;
                }
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            loop {
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += self.lambda * jtj[(i, i)].max(1e-12);
                }

                let step = h.lu().solve(&jtr);
                let Some(delta) = step else {
                    self.lambda *= self.lambda_factor;
                    if self.lambda > 1e10 {
                        return Ok(LmSolution { params, chisq: current, iterations: iter });
                    }
                    continue;
                };

                let new_params: Vec<f64> = (0..n_params)
                    .map(|i| (params[i] + delta[i]).max(lower_bounds[i]).min(upper_bounds[i]))
                    .collect();
                let new_chisq = Self::chisq(psf, positions, values, weights, &new_params);

                if new_chisq.is_finite() && new_chisq <= current {
                    let improvement = current - new_chisq;
                    let step_small = new_params
                        .iter()
                        .zip(&params)
                        .all(|(new, old)| (new - old).abs() <= self.tolerance * (old.abs() + self.tolerance));
                    params = new_params;
                    current = new_chisq;
                    self.lambda = (self.lambda / self.lambda_factor).max(1e-12);
                    if step_small || improvement <= self.tolerance * current.max(1e-300) {
                        return Ok(LmSolution { params, chisq: current, iterations: iter + 1 });
                    }
                    break;
                }

                // Reject update, increase lambda
                self.lambda *= self.lambda_factor;
                if self.lambda > 1e10 {
                    // No downhill step left: we are at the bounded minimum.
                    return Ok(LmSolution { params, chisq: current, iterations: iter + 1 });
                }
            }
        }

        Err(FitFailure::MaxIterations(self.max_iterations))
    }
}

/// Lower/upper bounds for the full parameter vector, given the stamp extent
/// in arcsec and the starting flux.
pub fn parameter_bounds(extent: f64, flux: f64) -> (Vec<f64>, Vec<f64>) {
    let half = extent / 2.0;
    let flux_scale = flux.abs().max(1e-10);
    let lower = vec![
        0.0,
        f64::NEG_INFINITY,
        -half,
        -half,
        1e-3 * extent,
        -MAX_SHEAR,
        -MAX_SHEAR,
    ];
    let upper = vec![
        100.0 * flux_scale,
        f64::INFINITY,
        half,
        half,
        extent,
        MAX_SHEAR,
        MAX_SHEAR,
    ];
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_gradient(psf: &dyn PSFFunction, x: f64, y: f64, params: &[f64]) -> Vec<f64> {
        (0..params.len())
            .map(|j| {
                let h = 1e-6 * params[j].abs().max(1e-3);
                let mut hi = params.to_vec();
                let mut lo = params.to_vec();
                hi[j] += h;
                lo[j] -= h;
                (psf.value(x, y, &hi) - psf.value(x, y, &lo)) / (2.0 * h)
            })
            .collect()
    }

    fn check_gradient(psf: &dyn PSFFunction) {
        let params = [1500.0, 3.0, 0.2, -0.1, 1.3, 0.08, -0.05];
        let mut grad = vec![0.0; N_FULL_PARAMS];
        for &(x, y) in &[(0.0, 0.0), (0.7, -1.2), (-2.0, 1.5), (1.1, 0.4)] {
            psf.gradient(x, y, &params, &mut grad);
            let expected = numeric_gradient(psf, x, y, &params);
            for j in 0..N_FULL_PARAMS {
                let tol = 1e-5 * expected[j].abs().max(1.0);
                assert!(
                    (grad[j] - expected[j]).abs() < tol,
                    "param {} at ({}, {}): analytic {} numeric {}",
                    j,
                    x,
                    y,
                    grad[j],
                    expected[j]
                );
            }
        }
    }

    #[test]
    fn test_gaussian_gradient_matches_numeric() {
        check_gradient(&GaussianPSF { pixel_area: 0.25 });
    }

    #[test]
    fn test_moffat_gradient_matches_numeric() {
        check_gradient(&MoffatPSF { beta: 3.5, pixel_area: 0.25 });
    }

    #[test]
    fn test_gaussian_unit_flux() {
        let psf = GaussianPSF { pixel_area: 0.04 };
        let params = [1.0, 0.0, 0.0, 0.0, 0.8, 0.1, 0.05];
        let mut total = 0.0;
        for i in -100..=100 {
            for j in -100..=100 {
                total += psf.value(i as f64 * 0.2, j as f64 * 0.2, &params);
            }
        }
        assert!((total - 1.0).abs() < 1e-6, "total flux {}", total);
    }

    #[test]
    fn test_moffat_fwhm() {
        let psf = MoffatPSF { beta: 3.5, pixel_area: 1.0 };
        let alpha = psf.alpha_for_sigma(1.0);
        let gaussian_fwhm = GaussianPSF { pixel_area: 1.0 }.sigma_to_fwhm(1.0);
        assert!((psf.sigma_to_fwhm(alpha) - gaussian_fwhm).abs() < 1e-12);
    }

    #[test]
    fn test_lm_recovers_noiseless_gaussian() {
        let psf = GaussianPSF { pixel_area: 1.0 };
        let truth = [2000.0, 1.5, 0.3, -0.2, 1.8, 0.05, -0.03];
        let mut positions = Vec::new();
        let mut values = Vec::new();
        for j in -10..=10 {
            for i in -10..=10 {
                let (x, y) = (i as f64, j as f64);
                positions.push((x, y));
                values.push(psf.value(x, y, &truth));
            }
        }
        let weights = vec![1.0; values.len()];
        let start = [1500.0, 0.0, 0.0, 0.0, 2.5, 0.0, 0.0];
        let (lower, upper) = parameter_bounds(21.0, 1500.0);

        let mut lm = LevenbergMarquardt::new(200, 1e-12);
        let solution = lm
            .fit(&psf, &positions, &values, &weights, &start, &lower, &upper)
            .unwrap();
        for (fitted, expected) in solution.params.iter().zip(truth.iter()) {
            assert!((fitted - expected).abs() < 1e-4, "{} vs {}", fitted, expected);
        }
        assert!(solution.chisq < 1e-6);
        assert!(solution.iterations > 0 && solution.iterations < 200);
    }

    #[test]
    fn test_lm_too_few_points() {
        let psf = GaussianPSF { pixel_area: 1.0 };
        let positions = vec![(0.0, 0.0); 5];
        let values = vec![1.0; 5];
        let weights = vec![1.0; 5];
        let (lower, upper) = parameter_bounds(10.0, 1.0);
        let err = LevenbergMarquardt::default()
            .fit(&psf, &positions, &values, &weights, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0], &lower, &upper)
            .unwrap_err();
        assert_eq!(err, FitFailure::TooFewPoints { points: 5, params: 7 });
    }

    #[test]
    fn test_lm_reports_iteration_cap() {
        let psf = GaussianPSF { pixel_area: 1.0 };
        let truth = [2000.0, 0.0, 0.3, -0.2, 1.8, 0.2, -0.1];
        let mut positions = Vec::new();
        let mut values = Vec::new();
        for j in -8..=8 {
            for i in -8..=8 {
                positions.push((i as f64, j as f64));
                values.push(psf.value(i as f64, j as f64, &truth));
            }
        }
        let weights = vec![1.0; values.len()];
        let (lower, upper) = parameter_bounds(17.0, 100.0);
        let err = LevenbergMarquardt::new(1, 0.0)
            .fit(&psf, &positions, &values, &weights, &[100.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0], &lower, &upper)
            .unwrap_err();
        assert_eq!(err, FitFailure::MaxIterations(1));
    }
}
