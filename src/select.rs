//! Star selection: flag and predicate cuts, stamp extraction and moments,
//! size-locus rejection and signal-to-noise cuts.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::{CatalogRow, StarCatalog};
use crate::config::{InputConfig, SelectConfig, SelectType};
use crate::error::{PsfError, Result};
use crate::expr::Expr;
use crate::image::Image;
use crate::stamp::{Moments, StarStamp};
use crate::utils::{median, robust_sigma};

const MAX_LOCUS_ITERATIONS: usize = 10;

/// Sizes that agree to better than this fraction of the typical size are
/// treated as identical when estimating the locus scatter.
const MIN_RELATIVE_SCATTER: f64 = 1e-6;

/// A candidate that survived selection, with its stamp and moments.
#[derive(Debug, Clone)]
pub struct SelectedStar {
    /// Which input image the stamp was cut from
    pub image: usize,
    pub stamp: StarStamp,
    pub moments: Moments,
    pub snr: f64,
}

impl SelectedStar {
    pub fn index(&self) -> usize {
        self.stamp.index
    }
}

/// Number of objects remaining after each selection stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectionCounts {
    pub catalog: usize,
    pub flags: usize,
    pub predicates: usize,
    pub moments: usize,
    pub size: usize,
    pub snr: usize,
    pub reserved: usize,
}

impl SelectionCounts {
    /// Stage names and counts, in pipeline order.
    pub fn stages(&self) -> [(&'static str, usize); 7] {
        [
            ("catalog", self.catalog),
            ("flags", self.flags),
            ("predicates", self.predicates),
            ("moments", self.moments),
            ("size", self.size),
            ("snr", self.snr),
            ("reserved", self.reserved),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    /// Stars used for fitting, in catalog order
    pub stars: Vec<SelectedStar>,
    /// Held-out stars, in catalog order
    pub reserve: Vec<SelectedStar>,
    pub counts: SelectionCounts,
}

impl Selection {
    pub fn total(&self) -> usize {
        self.stars.len() + self.reserve.len()
    }
}

/// Objects with any `skip_flag` bit set are dropped; with `use_flag`, all
/// of its bits must be set.
pub fn passes_flags(row: &CatalogRow, input: &InputConfig) -> bool {
    let skip = input.skip_flag.unwrap_or(-1);
    if row.flag & skip != 0 {
        return false;
    }
    match input.use_flag {
        Some(required) => row.flag & required == required,
        None => true,
    }
}

/// Per-pixel noise variance: the configured value, else estimated from the
/// image with a robust sigma.
pub fn noise_variance(image: &Image, input: &InputConfig) -> f64 {
    if let Some(noise) = input.noise {
        return noise;
    }
    let sigma = image.statistics().noise_sigma();
    let variance = sigma * sigma;
    if variance > 0.0 && variance.is_finite() {
        variance
    } else {
        tracing::warn!("Image noise estimate is zero; using unit variance");
        1.0
    }
}

/// Least-squares polynomial in `x` of the given order. Returns `None` when
/// there are too few points or the fit is singular.
fn fit_polynomial(x: &[f64], y: &[f64], order: usize) -> Option<Vec<f64>> {
    let nterms = order + 1;
    if x.len() <= nterms {
        return None;
    }
    let a = DMatrix::from_fn(x.len(), nterms, |r, c| x[r].powi(c as i32));
    let b = DVector::from_column_slice(y);
    let svd = a.svd(true, true);
    let max_sv = svd.singular_values.max();
    if !(max_sv > 0.0) || svd.singular_values.min() < 1e-12 * max_sv {
        return None;
    }
    svd.solve(&b, 0.0).ok().map(|c| c.iter().copied().collect())
}

fn eval_polynomial(coefs: &[f64], x: f64) -> f64 {
    coefs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Residuals of the size measure `T` from the stellar locus, and the
/// robust scatter of the stars that define the locus.
///
/// With `fit_order` the locus is an iteratively clipped polynomial in
/// magnitude; without it the locus is the median size.
pub fn locus_residuals(moments: &[Moments], fit_order: Option<usize>, clip: f64) -> (Vec<f64>, f64) {
    let sizes: Vec<f64> = moments.iter().map(|m| m.size_t()).collect();
    let floor = MIN_RELATIVE_SCATTER * median(&sizes).abs();

    let median_locus = || {
        let center = median(&sizes);
        let resid: Vec<f64> = sizes.iter().map(|t| t - center).collect();
        let sigma = robust_sigma(&resid, 0.0).max(floor);
        (resid, sigma)
    };
    let Some(order) = fit_order else {
        return median_locus();
    };

    let mags: Vec<f64> = moments.iter().map(|m| m.magnitude()).collect();
    let mag_center = median(&mags);
    let x: Vec<f64> = mags.iter().map(|m| m - mag_center).collect();

    let mut keep = vec![true; sizes.len()];
    let mut result = None;
    for _ in 0..MAX_LOCUS_ITERATIONS {
        let (kx, ky): (Vec<f64>, Vec<f64>) = x
            .iter()
            .zip(&sizes)
            .zip(&keep)
            .filter(|(_, &k)| k)
            .map(|((&x, &y), _)| (x, y))
            .unzip();
        let Some(coefs) = fit_polynomial(&kx, &ky, order) else {
            break;
        };
        let resid: Vec<f64> = x
            .iter()
            .zip(&sizes)
            .map(|(&x, &t)| t - eval_polynomial(&coefs, x))
            .collect();
        let kept_resid: Vec<f64> = resid
            .iter()
            .zip(&keep)
            .filter(|(_, &k)| k)
            .map(|(&r, _)| r)
            .collect();
        let sigma = robust_sigma(&kept_resid, median(&kept_resid)).max(floor);

        let new_keep: Vec<bool> = resid.iter().map(|r| r.abs() <= clip * sigma).collect();
        let stable = new_keep == keep;
        keep = new_keep;
        result = Some((resid, sigma));
        if stable {
            break;
        }
    }

    match result {
        Some(found) => found,
        None => {
            tracing::warn!("Size-magnitude locus fit failed; using median size");
            median_locus()
        }
    }
}

/// Run the selector over a catalog and its images.
pub fn select_stars(
    catalog: &StarCatalog,
    images: &[Image],
    input: &InputConfig,
    config: &SelectConfig,
) -> Result<Selection> {
    let mut counts = SelectionCounts {
        catalog: catalog.len(),
        ..Default::default()
    };

    let flagged: Vec<&CatalogRow> = catalog.rows().iter().filter(|r| passes_flags(r, input)).collect();
    counts.flags = flagged.len();

    let predicates = config
        .predicates()
        .into_iter()
        .map(Expr::parse)
        .collect::<Result<Vec<_>>>()?;
    if let Some(first) = catalog.rows().first() {
        for predicate in &predicates {
            let missing: Vec<String> = predicate
                .columns()
                .into_iter()
                .filter(|c| !first.properties.contains_key(c))
                .collect();
            if !missing.is_empty() {
                return Err(PsfError::Config(format!(
                    "selection uses columns not in the catalog: {}",
                    missing.join(", ")
                )));
            }
        }
    }
    let mut candidates = Vec::with_capacity(flagged.len());
    for row in flagged {
        let mut pass = true;
        for predicate in &predicates {
            if !predicate.matches(&row.properties)? {
                pass = false;
                break;
            }
        }
        if pass {
            candidates.push(row);
        }
    }
    counts.predicates = candidates.len();
    tracing::info!(
        "{} of {} objects pass flag and property cuts",
        candidates.len(),
        catalog.len()
    );

    let variances = images
        .iter()
        .map(|image| noise_variance(image, input))
        .collect::<Vec<_>>();
    for row in &candidates {
        if row.image >= images.len() {
            return Err(PsfError::Config(format!(
                "object {} refers to image {} but only {} images were given",
                row.index,
                row.image,
                images.len()
            )));
        }
    }

    let measured: Vec<SelectedStar> = candidates
        .par_iter()
        .filter_map(|row| {
            let stamp = images[row.image].stamp(
                row,
                input.stamp_size,
                input.pixel_scale,
                variances[row.image],
                input.gain,
            );
            let Some(stamp) = stamp else {
                tracing::debug!("Object {}: stamp off the image edge", row.index);
                return None;
            };
            let Some(moments) = stamp.moments() else {
                tracing::debug!("Object {}: moments failed", row.index);
                return None;
            };
            let snr = stamp.snr();
            Some(SelectedStar {
                image: row.image,
                stamp,
                moments,
                snr,
            })
        })
        .collect();
    counts.moments = measured.len();

    let size_cut = match config.kind {
        SelectType::SizeMag => Some(config.hsm_size_reject.unwrap_or(config.locus_clip)),
        _ => config.hsm_size_reject,
    };
    let mut stars = match size_cut {
        Some(nsigma) if !measured.is_empty() => {
            let moments: Vec<Moments> = measured.iter().map(|s| s.moments).collect();
            let fit_order = (config.kind == SelectType::SizeMag).then_some(config.fit_order);
            let (resid, sigma) = locus_residuals(&moments, fit_order, config.locus_clip);
            tracing::debug!("Size locus scatter {:.4e}", sigma);
            measured
                .into_iter()
                .zip(resid)
                .filter(|(_, r)| r.abs() <= nsigma * sigma)
                .map(|(s, _)| s)
                .collect()
        }
        _ => measured,
    };
    counts.size = stars.len();

    if let Some(min_snr) = config.min_snr {
        stars.retain(|s| s.snr >= min_snr);
    }
    if let Some(max_snr) = config.max_snr {
        for star in stars.iter_mut() {
            star.stamp.cap_snr(max_snr);
            star.snr = star.snr.min(max_snr);
        }
    }
    counts.snr = stars.len();

    let (stars, reserve) = split_reserve(stars, config.reserve_frac, config.seed);
    counts.reserved = reserve.len();

    if stars.len() < config.min_stars {
        return Err(PsfError::Selection(format!(
            "{} stars remain after selection, at least {} required",
            stars.len(),
            config.min_stars
        )));
    }
    tracing::info!(
        "Selected {} stars ({} reserved)",
        stars.len() + reserve.len(),
        reserve.len()
    );
    Ok(Selection {
        stars,
        reserve,
        counts,
    })
}

/// Hold out `round(frac * n)` stars chosen by a seeded shuffle. Both halves
/// keep catalog order.
fn split_reserve(stars: Vec<SelectedStar>, frac: f64, seed: u64) -> (Vec<SelectedStar>, Vec<SelectedStar>) {
    let n_reserve = (frac * stars.len() as f64).round() as usize;
    if n_reserve == 0 {
        return (stars, Vec::new());
    }
    let mut order: Vec<usize> = (0..stars.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    let mut reserved = vec![false; stars.len()];
    for &i in order.iter().take(n_reserve) {
        reserved[i] = true;
    }

    let mut keep = Vec::with_capacity(stars.len() - n_reserve);
    let mut reserve = Vec::with_capacity(n_reserve);
    for (star, is_reserved) in stars.into_iter().zip(reserved) {
        if is_reserved {
            reserve.push(star);
        } else {
            keep.push(star);
        }
    }
    (keep, reserve)
}
