//! PSF represented as a square grid of values, interpolated between grid
//! points with a separable kernel.
//!
//! Grid point `(i, j)` sits at `((i - origin) * scale, (j - origin) * scale)`
//! arcsec from the star centre, with `origin = size / 2`. Parameters are
//! stored row-major in `j` and sum to one, so the profile has unit flux.

use nalgebra::{DMatrix, DVector};

use crate::config::PixelGridInit;
use crate::interpolant::Interpolant;
use crate::stamp::StarStamp;

#[derive(Debug, Clone, PartialEq)]
pub struct PixelGrid {
    pub scale: f64,
    pub size: usize,
    pub interp: Interpolant,
    pub centered: bool,
    pub init: PixelGridInit,
}

/// Relative singular value cutoff for the least-squares solve
const SVD_EPS: f64 = 1e-6;

/// Scale applied to the moments Gaussian by `PixelGridInit::Zero`. The
/// start cannot be exactly zero or it would carry no shape at all.
const ZERO_INIT_SCALE: f64 = 1e-10;

impl PixelGrid {
    pub fn new(scale: f64, size: usize, interp: Interpolant, centered: bool) -> Self {
        Self {
            scale,
            size,
            interp,
            centered,
            init: PixelGridInit::default(),
        }
    }

    pub fn with_init(mut self, init: PixelGridInit) -> Self {
        self.init = init;
        self
    }

    pub fn nparams(&self) -> usize {
        self.size * self.size
    }

    fn origin(&self) -> i64 {
        (self.size / 2) as i64
    }

    /// Pixels further than this from the centre (in each axis) get no support.
    fn max_uv(&self) -> f64 {
        (self.size as f64 + 1.0) / 2.0 * self.scale
    }

    /// Gaussian starting grid with unit sum.
    pub fn gaussian_params(&self, sigma: f64) -> Vec<f64> {
        let origin = self.origin();
        let sigma = sigma.max(1e-3 * self.scale);
        let mut params = Vec::with_capacity(self.nparams());
        for j in 0..self.size as i64 {
            for i in 0..self.size as i64 {
                let u = (i - origin) as f64 * self.scale;
                let v = (j - origin) as f64 * self.scale;
                params.push((-(u * u + v * v) / (2.0 * sigma * sigma)).exp());
            }
        }
        let total: f64 = params.iter().sum();
        params.iter_mut().for_each(|p| *p /= total);
        params
    }

    /// First-fit starting grid for a star whose moments give size `sigma`.
    pub fn initial_params(&self, sigma: f64) -> Vec<f64> {
        match self.init {
            PixelGridInit::Hsm => self.gaussian_params(sigma),
            PixelGridInit::Zero => self
                .gaussian_params(sigma)
                .into_iter()
                .map(|p| p * ZERO_INIT_SCALE)
                .collect(),
            PixelGridInit::Delta => {
                let mut params = vec![0.0; self.nparams()];
                let centre = self.origin() as usize * (self.size + 1);
                params[centre] = 1.0;
                params
            }
        }
    }

    /// Kernel weights for one pixel: (column index, coefficient) pairs such
    /// that the unit-flux density there is `sum coef * params[col]`.
    fn basis_row(&self, du: f64, dv: f64) -> Vec<(usize, f64)> {
        let x = du / self.scale;
        let y = dv / self.scale;
        let xr = self.interp.xrange().ceil() as i64;
        let origin = self.origin();
        let size = self.size as i64;
        let norm = 1.0 / (self.scale * self.scale);

        let xi = x.floor() as i64;
        let yi = y.floor() as i64;
        let mut row = Vec::new();
        for jj in (yi - xr + 1)..=(yi + xr) {
            let j = jj + origin;
            if j < 0 || j >= size {
                continue;
            }
            let wy = self.interp.xval(y - jj as f64);
            if wy == 0.0 {
                continue;
            }
            for ii in (xi - xr + 1)..=(xi + xr) {
                let i = ii + origin;
                if i < 0 || i >= size {
                    continue;
                }
                let wx = self.interp.xval(x - ii as f64);
                if wx == 0.0 {
                    continue;
                }
                row.push(((j * size + i) as usize, wx * wy * norm));
            }
        }
        row
    }

    /// Unit-flux model image of the stamp for the given grid and centre.
    pub fn draw_unit(&self, stamp: &StarStamp, params: &[f64], center: (f64, f64)) -> Vec<f64> {
        let area = stamp.pixel_area();
        (0..stamp.npix())
            .map(|k| {
                let (u, v) = stamp.local_coord(k);
                self.basis_row(u - center.0, v - center.1)
                    .into_iter()
                    .map(|(col, coef)| coef * params[col])
                    .sum::<f64>()
                    * area
            })
            .collect()
    }

    /// Weighted linear least-squares fit of the grid values with flux and
    /// centre held fixed. The solve is for the change from `start`, so grid
    /// directions below the singular value cutoff keep their starting values.
    /// Returns the unit-sum grid, the updated flux and the chi-squared / dof
    /// of the fit.
    pub fn solve(
        &self,
        stamp: &StarStamp,
        flux: f64,
        center: (f64, f64),
        start: &[f64],
    ) -> Result<(Vec<f64>, f64, f64, usize), String> {
        let max_uv = self.max_uv();
        let nparams = self.nparams();
        let area = stamp.pixel_area();
        if start.len() != nparams {
            return Err(format!("start has {} values for {} grid points", start.len(), nparams));
        }

        let mut rows: Vec<(Vec<(usize, f64)>, f64, f64)> = Vec::new();
        for k in 0..stamp.npix() {
            let w = stamp.weight[k];
            if w <= 0.0 {
                continue;
            }
            let (u, v) = stamp.local_coord(k);
            let du = u - center.0;
            let dv = v - center.1;
            if du.abs() > max_uv || dv.abs() > max_uv {
                continue;
            }
            rows.push((self.basis_row(du, dv), stamp.data[k], w));
        }

        if rows.len() <= nparams {
            return Err(format!(
                "{} usable pixels for {} grid parameters",
                rows.len(),
                nparams
            ));
        }

        let mut a = DMatrix::<f64>::zeros(rows.len(), nparams);
        let mut b = DVector::<f64>::zeros(rows.len());
        for (r, (basis, data, w)) in rows.iter().enumerate() {
            let sw = w.sqrt();
            for &(col, coef) in basis {
                a[(r, col)] = sw * flux * area * coef;
            }
            b[r] = sw * data;
        }

        let p0 = DVector::from_column_slice(start);
        let offset = &b - &a * &p0;
        let svd = a.clone().svd(true, true);
        let max_sv = svd.singular_values.max();
        if !(max_sv > 0.0) {
            return Err("design matrix is empty".to_string());
        }
        let solution = p0 + svd.solve(&offset, SVD_EPS * max_sv)?;
        if solution.iter().any(|p| !p.is_finite()) {
            return Err("non-finite grid solution".to_string());
        }

        let resid = &b - &a * &solution;
        let chisq = resid.dot(&resid);

        let total: f64 = solution.iter().sum();
        if !(total > 0.0) {
            return Err(format!("grid sums to {}", total));
        }
        let params: Vec<f64> = solution.iter().map(|p| p / total).collect();
        let dof = rows.len() - nparams;
        Ok((params, flux * total, chisq, dof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::tests::gaussian_stamp;

    #[test]
    fn test_gaussian_params_unit_sum() {
        let grid = PixelGrid::new(0.5, 9, Interpolant::Lanczos(3), true);
        let params = grid.gaussian_params(1.0);
        assert_eq!(params.len(), 81);
        assert!((params.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        // peak at the origin
        let peak = params.iter().cloned().fold(f64::MIN, f64::max);
        assert_eq!(params[4 * 9 + 4], peak);
    }

    #[test]
    fn test_draw_unit_has_unit_flux() {
        let grid = PixelGrid::new(1.0, 15, Interpolant::Linear, true);
        let stamp = gaussian_stamp(31, 1.0, 2.0, 0.0, 0.0);
        let params = grid.gaussian_params(2.0);
        let image = grid.draw_unit(&stamp, &params, (0.0, 0.0));
        let total: f64 = image.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "total {}", total);
    }

    #[test]
    fn test_solve_recovers_flux_and_shape() {
        // Grid points coincide with pixel centres, and the outer ring of
        // pixels (unsupported by the grid) holds negligible flux.
        let grid = PixelGrid::new(1.0, 15, Interpolant::Lanczos(3), true);
        let stamp = gaussian_stamp(17, 5000.0, 1.2, 0.0, 0.0);
        let (params, flux, chisq, dof) = grid
            .solve(&stamp, 4000.0, (0.0, 0.0), &grid.gaussian_params(1.0))
            .unwrap();
        assert!((params.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!((flux - 5000.0).abs() / 5000.0 < 1e-6, "flux {}", flux);
        assert!(chisq < 1e-6, "chisq {}", chisq);
        assert_eq!(dof, 17 * 17 - 15 * 15);

        let model = grid.draw_unit(&stamp, &params, (0.0, 0.0));
        let centre = 8 * 17 + 8;
        assert!((model[centre] * flux - stamp.data[centre]).abs() < 1e-3 * stamp.data[centre]);
    }

    #[test]
    fn test_initial_params_per_mode() {
        let grid = PixelGrid::new(1.0, 9, Interpolant::Lanczos(3), true);
        let centre = 4 * 9 + 4;

        let hsm = grid.initial_params(1.2);
        assert_eq!(hsm, grid.gaussian_params(1.2));

        let zero = grid.clone().with_init(PixelGridInit::Zero).initial_params(1.2);
        assert!((zero.iter().sum::<f64>() - ZERO_INIT_SCALE).abs() < 1e-20);
        assert!(zero[centre] > zero[0]);

        let delta = grid.with_init(PixelGridInit::Delta).initial_params(1.2);
        assert_eq!(delta[centre], 1.0);
        assert_eq!(delta.iter().filter(|&&p| p != 0.0).count(), 1);
    }

    #[test]
    fn test_unconstrained_grid_points_keep_start() {
        // Mask the left three columns of the stamp so the two leftmost grid
        // columns see no data.
        let grid = PixelGrid::new(1.0, 9, Interpolant::Lanczos(3), true);
        let mut stamp = gaussian_stamp(11, 5000.0, 1.2, 0.0, 0.0);
        for k in 0..stamp.npix() {
            if stamp.local_coord(k).0 <= -3.0 {
                stamp.weight[k] = 0.0;
            }
        }
        let edge = 4 * 9;

        let solve = |init: PixelGridInit| {
            let grid = grid.clone().with_init(init);
            let (params, ..) = grid.solve(&stamp, 5000.0, (0.0, 0.0), &grid.initial_params(1.2)).unwrap();
            params
        };
        let hsm = solve(PixelGridInit::Hsm);
        let delta = solve(PixelGridInit::Delta);
        let zero = solve(PixelGridInit::Zero);

        assert!(hsm[edge] > 1e-4, "hsm edge {}", hsm[edge]);
        assert!(delta[edge].abs() < 1e-12, "delta edge {}", delta[edge]);
        assert!(zero[edge].abs() < 1e-12, "zero edge {}", zero[edge]);
        // The constrained centre agrees between modes up to renormalization.
        let centre = 4 * 9 + 4;
        assert!((delta[centre] - zero[centre]).abs() < 1e-9);
    }

    #[test]
    fn test_solve_rejects_wrong_start_length() {
        let grid = PixelGrid::new(1.0, 9, Interpolant::Lanczos(3), true);
        let stamp = gaussian_stamp(11, 100.0, 1.0, 0.0, 0.0);
        assert!(grid.solve(&stamp, 100.0, (0.0, 0.0), &[1.0]).is_err());
    }

    #[test]
    fn test_solve_underdetermined() {
        let grid = PixelGrid::new(0.2, 41, Interpolant::Lanczos(3), true);
        let stamp = gaussian_stamp(9, 100.0, 1.0, 0.0, 0.0);
        assert!(grid
            .solve(&stamp, 100.0, (0.0, 0.0), &grid.gaussian_params(1.0))
            .is_err());
    }
}
