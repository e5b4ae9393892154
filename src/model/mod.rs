//! Single-star PSF models and their fitters.

pub mod analytic;
pub mod pixel_grid;

use serde::{Deserialize, Serialize};

use crate::config::{ModelConfig, PsfSection};
use crate::error::{PsfError, Result};
use crate::stamp::{Moments, StarStamp};
use analytic::{
    parameter_bounds, GaussianPSF, LevenbergMarquardt, MoffatPSF, PSFFunction, N_FULL_PARAMS,
};
use pixel_grid::PixelGrid;

/// Number of analytic shape parameters: size, g1, g2
const N_ANALYTIC_SHAPE: usize = 3;
const ANALYTIC_MAX_G: f64 = 0.7;

/// Model family selected by the `psf.model` section.
#[derive(Debug, Clone, PartialEq)]
pub enum PsfModel {
    Gaussian,
    Moffat { beta: f64 },
    PixelGrid(PixelGrid),
}

/// Optimizer limits for a single star.
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub max_iter: usize,
    pub tolerance: f64,
}

impl From<&PsfSection> for FitOptions {
    fn from(section: &PsfSection) -> Self {
        Self {
            max_iter: section.fit_max_iter,
            tolerance: section.fit_tolerance,
        }
    }
}

/// Where a fit starts: the star's own flux and centroid plus a shape.
#[derive(Debug, Clone)]
pub struct FitStart {
    pub flux: f64,
    pub center: (f64, f64),
    pub shape: Vec<f64>,
}

/// Fitted parameters and goodness of fit for one star.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarFit {
    pub index: usize,
    pub flux: f64,
    /// Offset from the catalog position, arcsec
    pub center: (f64, f64),
    pub background: f64,
    /// Shape parameters, the quantities interpolated across the focal plane
    pub params: Vec<f64>,
    pub chisq: f64,
    pub dof: usize,
}

impl StarFit {
    pub fn reduced_chisq(&self) -> f64 {
        if self.dof == 0 {
            f64::INFINITY
        } else {
            self.chisq / self.dof as f64
        }
    }
}

impl PsfModel {
    pub fn from_config(config: &ModelConfig) -> Self {
        match config {
            ModelConfig::Gaussian => PsfModel::Gaussian,
            ModelConfig::Moffat { beta } => PsfModel::Moffat { beta: *beta },
            ModelConfig::PixelGrid {
                scale,
                size,
                interp,
                centered,
                init,
            } => PsfModel::PixelGrid(PixelGrid::new(*scale, *size, *interp, *centered).with_init(*init)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PsfModel::Gaussian => "Gaussian",
            PsfModel::Moffat { .. } => "Moffat",
            PsfModel::PixelGrid(_) => "PixelGrid",
        }
    }

    /// Number of shape parameters per star.
    pub fn nparams(&self) -> usize {
        match self {
            PsfModel::PixelGrid(grid) => grid.nparams(),
            _ => N_ANALYTIC_SHAPE,
        }
    }

    pub fn param_names(&self) -> Vec<String> {
        match self {
            PsfModel::PixelGrid(grid) => (0..grid.size)
                .flat_map(|j| (0..grid.size).map(move |i| format!("p_{}_{}", i, j)))
                .collect(),
            _ => vec!["size".to_string(), "g1".to_string(), "g2".to_string()],
        }
    }

    fn analytic(&self, pixel_area: f64) -> Option<Box<dyn PSFFunction>> {
        match self {
            PsfModel::Gaussian => Some(Box::new(GaussianPSF { pixel_area })),
            PsfModel::Moffat { beta } => Some(Box::new(MoffatPSF {
                beta: *beta,
                pixel_area,
            })),
            PsfModel::PixelGrid(_) => None,
        }
    }

    /// Starting point for the first fit of a star, from its moments.
    /// Pixel grids start from their configured `init` grid as is.
    pub fn initial_start(&self, moments: &Moments) -> FitStart {
        let shape = match self {
            PsfModel::Gaussian => vec![moments.sigma, moments.g1, moments.g2],
            PsfModel::Moffat { beta } => {
                let moffat = MoffatPSF {
                    beta: *beta,
                    pixel_area: 1.0,
                };
                vec![moffat.alpha_for_sigma(moments.sigma), moments.g1, moments.g2]
            }
            PsfModel::PixelGrid(grid) => grid.initial_params(moments.sigma),
        };
        let mut start = FitStart {
            flux: moments.flux,
            center: (moments.du, moments.dv),
            shape,
        };
        if !matches!(self, PsfModel::PixelGrid(_)) {
            self.sanitize_shape(&mut start.shape);
        }
        start
    }

    /// Pull an (interpolated) shape back into the valid domain of the model.
    pub fn sanitize_shape(&self, shape: &mut [f64]) {
        match self {
            PsfModel::PixelGrid(_) => {
                let total: f64 = shape.iter().sum();
                if total > 0.0 {
                    shape.iter_mut().for_each(|p| *p /= total);
                }
            }
            _ => {
                shape[0] = shape[0].max(1e-6);
                shape[1] = shape[1].clamp(-ANALYTIC_MAX_G, ANALYTIC_MAX_G);
                shape[2] = shape[2].clamp(-ANALYTIC_MAX_G, ANALYTIC_MAX_G);
            }
        }
    }

    /// Fit one stamp. Divergence of the optimizer is reported as
    /// `PsfError::FitDivergence` for the stamp's catalog index.
    pub fn fit(&self, stamp: &StarStamp, start: &FitStart, options: FitOptions) -> Result<StarFit> {
        let fit = match self {
            PsfModel::PixelGrid(grid) => {
                let center = if grid.centered { start.center } else { (0.0, 0.0) };
                let (params, flux, chisq, dof) = grid
                    .solve(stamp, start.flux, center, &start.shape)
                    .map_err(|reason| PsfError::divergence(stamp.index, reason))?;
                StarFit {
                    index: stamp.index,
                    flux,
                    center,
                    background: 0.0,
                    params,
                    chisq,
                    dof,
                }
            }
            _ => self.fit_analytic(stamp, start, options)?,
        };

        let finite = fit.flux.is_finite()
            && fit.chisq.is_finite()
            && fit.params.iter().all(|p| p.is_finite());
        if !finite {
            return Err(PsfError::divergence(stamp.index, "non-finite parameters"));
        }
        tracing::debug!(
            "Star {}: flux {:.1} chisq/dof {:.3}",
            stamp.index,
            fit.flux,
            fit.reduced_chisq()
        );
        Ok(fit)
    }

    fn fit_analytic(&self, stamp: &StarStamp, start: &FitStart, options: FitOptions) -> Result<StarFit> {
        let psf = self
            .analytic(stamp.pixel_area())
            .ok_or_else(|| PsfError::divergence(stamp.index, "not an analytic model"))?;

        let mut positions = Vec::with_capacity(stamp.npix());
        let mut values = Vec::with_capacity(stamp.npix());
        let mut weights = Vec::with_capacity(stamp.npix());
        for k in 0..stamp.npix() {
            if stamp.weight[k] > 0.0 {
                positions.push(stamp.local_coord(k));
                values.push(stamp.data[k]);
                weights.push(stamp.weight[k]);
            }
        }

        let mut initial = vec![start.flux, 0.0, start.center.0, start.center.1];
        initial.extend_from_slice(&start.shape);
        let extent = stamp.size as f64 * stamp.pixel_scale;
        let (lower, upper) = parameter_bounds(extent, start.flux);

        let mut lm = LevenbergMarquardt::new(options.max_iter, options.tolerance);
        let solution = lm
            .fit(psf.as_ref(), &positions, &values, &weights, &initial, &lower, &upper)
            .map_err(|e| PsfError::divergence(stamp.index, e.to_string()))?;
        tracing::trace!("Star {}: LM converged in {} iterations", stamp.index, solution.iterations);

        let p = solution.params;
        Ok(StarFit {
            index: stamp.index,
            flux: p[analytic::FLUX],
            center: (p[analytic::DU], p[analytic::DV]),
            background: p[analytic::BACKGROUND],
            params: p[analytic::SIZE..].to_vec(),
            chisq: solution.chisq,
            dof: positions.len() - N_FULL_PARAMS,
        })
    }

    /// Unit-flux model image of `stamp` with the given shape and centre.
    pub fn unit_image(&self, stamp: &StarStamp, shape: &[f64], center: (f64, f64)) -> Vec<f64> {
        match self {
            PsfModel::PixelGrid(grid) => grid.draw_unit(stamp, shape, center),
            _ => {
                let Some(psf) = self.analytic(stamp.pixel_area()) else {
                    return vec![0.0; stamp.npix()];
                };
                let mut params = vec![1.0, 0.0, center.0, center.1];
                params.extend_from_slice(shape);
                (0..stamp.npix())
                    .map(|k| {
                        let (u, v) = stamp.local_coord(k);
                        psf.value(u, v, &params)
                    })
                    .collect()
            }
        }
    }

    /// Model image for a fitted star: `flux * unit + background`.
    pub fn draw(&self, stamp: &StarStamp, fit: &StarFit) -> Vec<f64> {
        self.unit_image(stamp, &fit.params, fit.center)
            .into_iter()
            .map(|m| fit.flux * m + fit.background)
            .collect()
    }

    /// Hold the shape fixed and fit only flux and background, linearly.
    /// The chi-squared of this fit measures how well the shape describes
    /// the star; `dof` is the usable pixel count less two.
    pub fn reflux(&self, stamp: &StarStamp, shape: &[f64], center: (f64, f64)) -> Result<StarFit> {
        let unit = self.unit_image(stamp, shape, center);

        let (mut smm, mut sm, mut s1, mut smd, mut sd) = (0.0, 0.0, 0.0, 0.0, 0.0);
        let mut usable = 0usize;
        for ((&m, &d), &w) in unit.iter().zip(&stamp.data).zip(&stamp.weight) {
            if w <= 0.0 {
                continue;
            }
            usable += 1;
            smm += w * m * m;
            sm += w * m;
            s1 += w;
            smd += w * m * d;
            sd += w * d;
        }
        if usable <= 2 {
            return Err(PsfError::divergence(stamp.index, "too few pixels to reflux"));
        }
        let det = smm * s1 - sm * sm;
        if !(det.abs() > f64::EPSILON * smm * s1) {
            return Err(PsfError::divergence(stamp.index, "degenerate reflux"));
        }
        let flux = (smd * s1 - sm * sd) / det;
        let background = (smm * sd - sm * smd) / det;

        let chisq: f64 = unit
            .iter()
            .zip(&stamp.data)
            .zip(&stamp.weight)
            .filter(|(_, &w)| w > 0.0)
            .map(|((&m, &d), &w)| {
                let r = d - flux * m - background;
                w * r * r
            })
            .sum();
        if !chisq.is_finite() {
            return Err(PsfError::divergence(stamp.index, "non-finite reflux chisq"));
        }

        Ok(StarFit {
            index: stamp.index,
            flux,
            center,
            background,
            params: shape.to_vec(),
            chisq,
            dof: usable - 2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PixelGridInit;
    use crate::interpolant::Interpolant;
    use crate::stamp::tests::gaussian_stamp;

    fn options() -> FitOptions {
        FitOptions {
            max_iter: 200,
            tolerance: 1e-10,
        }
    }

    #[test]
    fn test_gaussian_fit_from_moments() {
        let stamp = gaussian_stamp(25, 3000.0, 1.7, 0.4, -0.3);
        let model = PsfModel::Gaussian;
        let start = model.initial_start(&stamp.moments().unwrap());
        let fit = model.fit(&stamp, &start, options()).unwrap();
        assert!((fit.params[0] - 1.7).abs() < 1e-4, "size {}", fit.params[0]);
        assert!((fit.flux - 3000.0).abs() < 0.5, "flux {}", fit.flux);
        assert!((fit.center.0 - 0.4).abs() < 1e-4);
        assert!((fit.center.1 + 0.3).abs() < 1e-4);
        assert_eq!(fit.dof, 25 * 25 - 7);
    }

    #[test]
    fn test_moffat_start_and_fit() {
        let model = PsfModel::Moffat { beta: 3.0 };
        // Draw a Moffat star with the model itself.
        let mut stamp = gaussian_stamp(31, 0.0, 1.0, 0.0, 0.0);
        let truth = StarFit {
            index: 0,
            flux: 5000.0,
            center: (0.2, 0.1),
            background: 0.0,
            params: vec![2.5, 0.05, -0.02],
            chisq: 0.0,
            dof: 0,
        };
        stamp.data = model.draw(&stamp, &truth);

        let start = model.initial_start(&stamp.moments().unwrap());
        assert_eq!(start.shape.len(), 3);
        let fit = model.fit(&stamp, &start, options()).unwrap();
        for (a, b) in fit.params.iter().zip(&truth.params) {
            assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_fit_divergence_carries_index() {
        let mut stamp = gaussian_stamp(9, 100.0, 1.0, 0.0, 0.0);
        stamp.index = 42;
        stamp.weight = vec![0.0; 81];
        stamp.weight[40] = 1.0;
        let model = PsfModel::Gaussian;
        let start = FitStart {
            flux: 100.0,
            center: (0.0, 0.0),
            shape: vec![1.0, 0.0, 0.0],
        };
        match model.fit(&stamp, &start, options()) {
            Err(PsfError::FitDivergence { index, .. }) => assert_eq!(index, 42),
            other => panic!("expected divergence, got {:?}", other),
        }
    }

    #[test]
    fn test_reflux_with_true_shape() {
        let stamp = gaussian_stamp(21, 1200.0, 1.5, 0.0, 0.0);
        let model = PsfModel::Gaussian;
        let fit = model.reflux(&stamp, &[1.5, 0.0, 0.0], (0.0, 0.0)).unwrap();
        assert!((fit.flux - 1200.0).abs() < 1e-6);
        assert!(fit.background.abs() < 1e-8);
        assert!(fit.chisq < 1e-12);
        assert_eq!(fit.dof, 21 * 21 - 2);

        // A wrong shape leaves a large residual.
        let wrong = model.reflux(&stamp, &[2.5, 0.0, 0.0], (0.0, 0.0)).unwrap();
        assert!(wrong.chisq > 1.0);
    }

    #[test]
    fn test_pixel_grid_fit_and_names() {
        let model = PsfModel::PixelGrid(PixelGrid::new(1.0, 11, Interpolant::Lanczos(3), true));
        assert_eq!(model.nparams(), 121);
        assert_eq!(model.param_names()[12], "p_1_1");

        let stamp = gaussian_stamp(15, 800.0, 1.0, 0.0, 0.0);
        let start = model.initial_start(&stamp.moments().unwrap());
        let fit = model.fit(&stamp, &start, options()).unwrap();
        assert!((fit.params.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!((fit.flux - 800.0).abs() < 1.0, "flux {}", fit.flux);
    }

    #[test]
    fn test_pixel_grid_init_modes_agree_when_constrained() {
        let stamp = gaussian_stamp(15, 800.0, 1.0, 0.0, 0.0);
        let moments = stamp.moments().unwrap();
        let fits: Vec<StarFit> = [PixelGridInit::Hsm, PixelGridInit::Zero, PixelGridInit::Delta]
            .into_iter()
            .map(|init| {
                let grid = PixelGrid::new(1.0, 11, Interpolant::Lanczos(3), true).with_init(init);
                let model = PsfModel::PixelGrid(grid);
                let start = model.initial_start(&moments);
                model.fit(&stamp, &start, options()).unwrap()
            })
            .collect();
        for fit in &fits[1..] {
            assert!((fit.flux - fits[0].flux).abs() < 1e-6 * fits[0].flux);
            for (a, b) in fit.params.iter().zip(&fits[0].params) {
                assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_pixel_grid_start_is_not_renormalized() {
        let stamp = gaussian_stamp(15, 800.0, 1.0, 0.0, 0.0);
        let grid = PixelGrid::new(1.0, 11, Interpolant::Lanczos(3), true).with_init(PixelGridInit::Zero);
        let start = PsfModel::PixelGrid(grid).initial_start(&stamp.moments().unwrap());
        assert!(start.shape.iter().sum::<f64>() < 1e-9);
    }

    #[test]
    fn test_sanitize_shape() {
        let model = PsfModel::Gaussian;
        let mut shape = vec![-1.0, 2.0, -3.0];
        model.sanitize_shape(&mut shape);
        assert!(shape[0] > 0.0);
        assert_eq!(shape[1], ANALYTIC_MAX_G);
        assert_eq!(shape[2], -ANALYTIC_MAX_G);

        let grid = PsfModel::PixelGrid(PixelGrid::new(1.0, 2, Interpolant::Linear, true));
        let mut shape = vec![1.0, 1.0, 1.0, 1.0];
        grid.sanitize_shape(&mut shape);
        assert_eq!(shape, vec![0.25; 4]);
    }
}
