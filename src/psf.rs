//! The fit / interpolate / reject loop and the resulting focal-plane model.

use std::fmt;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::catalog::StarCatalog;
use crate::config::{InterpConfig, ModelConfig, PsfConfig, PsfSection};
use crate::error::{PsfError, Result};
use crate::image::Image;
use crate::interp::{Interpolator, ShapeSample};
use crate::model::{FitOptions, FitStart, PsfModel, StarFit};
use crate::outliers::ChisqOutliers;
use crate::select::{select_stars, SelectedStar};
use crate::stamp::StarStamp;

/// Where the rejection loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitState {
    Fitting { iteration: usize },
    Converged,
    MaxIterExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StarStatus {
    Accepted,
    /// Flagged as an outlier in the given pass
    Rejected { iteration: usize },
    /// Its own fit diverged in the given pass
    FitFailed { iteration: usize },
    /// Held out of the fit, scored against the final model
    Reserved,
}

impl fmt::Display for StarStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StarStatus::Accepted => write!(f, "accepted"),
            StarStatus::Rejected { iteration } => write!(f, "rejected({})", iteration),
            StarStatus::FitFailed { iteration } => write!(f, "fit_failed({})", iteration),
            StarStatus::Reserved => write!(f, "reserved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarRecord {
    pub index: usize,
    pub image_pos: (f64, f64),
    pub field_pos: (f64, f64),
    pub status: StarStatus,
    /// The star's own best fit, from the last pass it took part in
    pub fit: Option<StarFit>,
    /// Flux and background refit with the shape held at the interpolated model
    pub model_fit: Option<StarFit>,
}

/// Interpolated PSF over the focal plane plus the history of every star
/// that went into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocalPlaneModel {
    pub model: ModelConfig,
    pub interp: Interpolator,
    /// One record per selected star, in catalog order
    pub stars: Vec<StarRecord>,
    /// Fit/interpolate/reject passes performed
    pub iterations: usize,
    pub converged: bool,
}

impl FocalPlaneModel {
    pub fn psf_model(&self) -> PsfModel {
        PsfModel::from_config(&self.model)
    }

    /// Shape parameters at a focal-plane position.
    pub fn shape_at(&self, position: (f64, f64)) -> Vec<f64> {
        let mut shape = self.interp.predict(position);
        self.psf_model().sanitize_shape(&mut shape);
        shape
    }

    /// Render the PSF at `position` into a `size` x `size` image with the
    /// given flux, centred on the central pixel.
    pub fn draw(&self, position: (f64, f64), size: usize, pixel_scale: f64, flux: f64) -> Vec<f64> {
        let half = (size / 2) as f64;
        let template = StarStamp {
            index: 0,
            image_pos: (half, half),
            field_pos: position,
            size,
            origin: (0, 0),
            pixel_scale,
            data: vec![0.0; size * size],
            weight: vec![1.0; size * size],
            background: 0.0,
        };
        let shape = self.shape_at(position);
        self.psf_model()
            .unit_image(&template, &shape, (0.0, 0.0))
            .into_iter()
            .map(|m| flux * m)
            .collect()
    }

    pub fn accepted(&self) -> impl Iterator<Item = &StarRecord> {
        self.stars.iter().filter(|s| s.status == StarStatus::Accepted)
    }

    pub fn count(&self, pred: impl Fn(&StarStatus) -> bool) -> usize {
        self.stars.iter().filter(|s| pred(&s.status)).count()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read a saved model, checking that the interpolator matches the model
    /// family before anything queries it.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let model: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        model.model.validate()?;
        model.interp.validate(model.psf_model().nparams())?;
        Ok(model)
    }
}

/// Select stars from the catalog and fit the focal-plane model.
pub fn fit(catalog: &StarCatalog, images: &[Image], config: &PsfConfig) -> Result<FocalPlaneModel> {
    let selection = select_stars(catalog, images, &config.input, &config.select)?;
    fit_stamps(
        &selection.stars,
        &selection.reserve,
        &config.psf,
        config.select.min_stars,
    )
}

/// Starting point for a refit: the star's own flux and centroid with the
/// shape predicted by the interpolator.
fn start_from(model: &PsfModel, star: &SelectedStar, interp: Option<&Interpolator>) -> FitStart {
    match interp {
        None => model.initial_start(&star.moments),
        Some(interp) => {
            let mut shape = interp.predict(star.stamp.field_pos);
            model.sanitize_shape(&mut shape);
            FitStart {
                flux: star.moments.flux,
                center: (star.moments.du, star.moments.dv),
                shape,
            }
        }
    }
}

fn reflux_against(model: &PsfModel, interp: &Interpolator, star: &SelectedStar, center: (f64, f64)) -> Result<StarFit> {
    let mut shape = interp.predict(star.stamp.field_pos);
    model.sanitize_shape(&mut shape);
    model.reflux(&star.stamp, &shape, center)
}

/// Run the rejection loop over already-selected stars. Reserved stars are
/// never used in the fit; they are only scored against the final model.
/// Losing stars to failed fits or rejection so that fewer than `min_stars`
/// remain is a selection error.
pub fn fit_stamps(
    stars: &[SelectedStar],
    reserve: &[SelectedStar],
    section: &PsfSection,
    min_stars: usize,
) -> Result<FocalPlaneModel> {
    let model = PsfModel::from_config(&section.model);
    let options = FitOptions::from(section);
    let outliers = section.outliers.as_ref().map(ChisqOutliers::from_config);

    let mut status = vec![StarStatus::Accepted; stars.len()];
    let mut fits: Vec<Option<StarFit>> = vec![None; stars.len()];
    let mut model_fits: Vec<Option<StarFit>> = vec![None; stars.len()];
    let mut active: Vec<usize> = (0..stars.len()).collect();
    let mut interp: Option<Interpolator> = None;
    let mut iterations = 0;

    tracing::info!(
        "Fitting {} model with {} interpolation to {} stars",
        model.name(),
        interp_name(section),
        stars.len()
    );

    let mut state = FitState::Fitting { iteration: 0 };
    while let FitState::Fitting { iteration } = state {
        iterations = iteration + 1;

        let results: Vec<(usize, Result<StarFit>)> = active
            .par_iter()
            .map(|&i| {
                let start = start_from(&model, &stars[i], interp.as_ref());
                (i, model.fit(&stars[i].stamp, &start, options))
            })
            .collect();
        for (i, result) in results {
            match result {
                Ok(fit) => fits[i] = Some(fit),
                Err(e) => {
                    tracing::warn!("Dropping star {}: {}", stars[i].index(), e);
                    status[i] = StarStatus::FitFailed { iteration };
                }
            }
        }
        active.retain(|&i| status[i] == StarStatus::Accepted);

        let samples: Vec<ShapeSample> = active
            .iter()
            .filter_map(|&i| {
                fits[i].as_ref().map(|fit| ShapeSample {
                    index: stars[i].index(),
                    position: stars[i].stamp.field_pos,
                    params: fit.params.clone(),
                })
            })
            .collect();
        let current = Interpolator::fit(&section.interp, &samples)?;

        let refluxed: Vec<(usize, Result<StarFit>)> = active
            .par_iter()
            .map(|&i| {
                let center = fits[i].as_ref().map_or((0.0, 0.0), |f| f.center);
                (i, reflux_against(&model, &current, &stars[i], center))
            })
            .collect();
        let mut scored = Vec::with_capacity(refluxed.len());
        for (i, result) in refluxed {
            match result {
                Ok(fit) => {
                    scored.push(fit.clone());
                    model_fits[i] = Some(fit);
                }
                Err(e) => {
                    tracing::warn!("Dropping star {}: {}", stars[i].index(), e);
                    status[i] = StarStatus::FitFailed { iteration };
                }
            }
        }

        let flagged = outliers.as_ref().map(|o| o.flag(&scored)).unwrap_or_default();
        for &index in &flagged {
            if let Some(&i) = active.iter().find(|&&i| stars[i].index() == index) {
                status[i] = StarStatus::Rejected { iteration };
            }
        }
        let before = active.len();
        active.retain(|&i| status[i] == StarStatus::Accepted);
        tracing::info!(
            "Iteration {}: {} stars fitted, {} rejected",
            iteration,
            before,
            flagged.len()
        );
        if active.len() < min_stars {
            return Err(PsfError::Selection(format!(
                "{} stars remain after iteration {}, at least {} required",
                active.len(),
                iteration,
                min_stars
            )));
        }

        let removed_any = active.len() != samples.len();
        state = if flagged.is_empty() {
            FitState::Converged
        } else if iteration + 1 >= section.max_iter {
            FitState::MaxIterExceeded
        } else {
            FitState::Fitting {
                iteration: iteration + 1,
            }
        };

        // The final interpolation only describes stars still accepted.
        interp = Some(if removed_any && state == FitState::MaxIterExceeded {
            let survivors: Vec<ShapeSample> = samples
                .into_iter()
                .filter(|s| active.iter().any(|&i| stars[i].index() == s.index))
                .collect();
            let refit = Interpolator::fit(&section.interp, &survivors)?;
            for &i in &active {
                let center = fits[i].as_ref().map_or((0.0, 0.0), |f| f.center);
                model_fits[i] = reflux_against(&model, &refit, &stars[i], center).ok();
            }
            refit
        } else {
            current
        });
    }

    let converged = state == FitState::Converged;
    if !converged {
        tracing::warn!(
            "Outlier rejection did not converge within {} iterations",
            section.max_iter
        );
    }
    let interp = interp.ok_or_else(|| PsfError::Interpolation("no interpolation pass ran".into()))?;

    let mut records: Vec<StarRecord> = stars
        .iter()
        .enumerate()
        .map(|(i, star)| StarRecord {
            index: star.index(),
            image_pos: star.stamp.image_pos,
            field_pos: star.stamp.field_pos,
            status: status[i],
            fit: fits[i].take(),
            model_fit: model_fits[i].take(),
        })
        .collect();

    let reserved: Vec<StarRecord> = reserve
        .par_iter()
        .map(|star| {
            let start = start_from(&model, star, Some(&interp));
            let fit = model.fit(&star.stamp, &start, options).ok();
            let center = fit.as_ref().map_or(start.center, |f| f.center);
            let model_fit = reflux_against(&model, &interp, star, center).ok();
            StarRecord {
                index: star.index(),
                image_pos: star.stamp.image_pos,
                field_pos: star.stamp.field_pos,
                status: StarStatus::Reserved,
                fit,
                model_fit,
            }
        })
        .collect();
    records.extend(reserved);
    records.sort_by_key(|r| r.index);

    let result = FocalPlaneModel {
        model: section.model.clone(),
        interp,
        stars: records,
        iterations,
        converged,
    };
    tracing::info!(
        "Model built from {} stars after {} iterations ({} rejected, {} failed)",
        result.count(|s| *s == StarStatus::Accepted),
        iterations,
        result.count(|s| matches!(s, StarStatus::Rejected { .. })),
        result.count(|s| matches!(s, StarStatus::FitFailed { .. }))
    );
    Ok(result)
}

fn interp_name(section: &PsfSection) -> &'static str {
    match section.interp {
        InterpConfig::Mean => "Mean",
        InterpConfig::BasisPolynomial { .. } => "BasisPolynomial",
        InterpConfig::Knn { .. } => "KNN",
    }
}
