//! Interpolation of per-star shape parameters across the focal plane.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::config::InterpConfig;
use crate::error::{PsfError, Result};

/// Ratio of smallest to largest singular value below which a polynomial
/// design matrix counts as singular.
const RANK_TOLERANCE: f64 = 1e-10;

/// One star's shape parameters at its focal-plane position.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeSample {
    pub index: usize,
    pub position: (f64, f64),
    pub params: Vec<f64>,
}

/// A fitted interpolator. Each variant carries everything needed to
/// predict, so the whole thing serializes with the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Interpolator {
    Mean {
        params: Vec<f64>,
    },
    BasisPolynomial {
        order: usize,
        /// Centre and half-width of the bounding box used to map positions
        /// onto [-1, 1]
        center: (f64, f64),
        half_range: (f64, f64),
        /// `coefs[k][p]`: coefficient of basis term `k` for parameter `p`
        coefs: Vec<Vec<f64>>,
    },
    #[serde(rename = "KNN")]
    Knn {
        n_neighbors: usize,
        samples: Vec<KnnSample>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnSample {
    pub index: usize,
    pub position: (f64, f64),
    pub params: Vec<f64>,
}

/// Exponents `(i, j)` of the monomials `u^i v^j` with `i + j <= order`,
/// ordered by total degree.
pub fn monomial_exponents(order: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for degree in 0..=order {
        for i in (0..=degree).rev() {
            out.push((i, degree - i));
        }
    }
    out
}

fn basis_values(order: usize, u: f64, v: f64) -> Vec<f64> {
    monomial_exponents(order)
        .into_iter()
        .map(|(i, j)| u.powi(i as i32) * v.powi(j as i32))
        .collect()
}

fn check_samples(samples: &[ShapeSample]) -> Result<usize> {
    let first = samples
        .first()
        .ok_or_else(|| PsfError::Interpolation("no stars to interpolate".into()))?;
    let nparams = first.params.len();
    if samples.iter().any(|s| s.params.len() != nparams) {
        return Err(PsfError::Interpolation(
            "stars have differing parameter counts".into(),
        ));
    }
    Ok(nparams)
}

impl Interpolator {
    /// Fit the configured interpolator to the samples.
    pub fn fit(config: &InterpConfig, samples: &[ShapeSample]) -> Result<Self> {
        let nparams = check_samples(samples)?;
        let interp = match config {
            InterpConfig::Mean => {
                let mut params = vec![0.0; nparams];
                for sample in samples {
                    for (acc, p) in params.iter_mut().zip(&sample.params) {
                        *acc += p;
                    }
                }
                let n = samples.len() as f64;
                params.iter_mut().for_each(|p| *p /= n);
                Interpolator::Mean { params }
            }
            InterpConfig::BasisPolynomial { order } => Self::fit_polynomial(*order, samples, nparams)?,
            InterpConfig::Knn { n_neighbors } => Interpolator::Knn {
                n_neighbors: *n_neighbors,
                samples: samples
                    .iter()
                    .map(|s| KnnSample {
                        index: s.index,
                        position: s.position,
                        params: s.params.clone(),
                    })
                    .collect(),
            },
        };
        tracing::debug!("Fitted {} interpolator to {} stars", interp.name(), samples.len());
        Ok(interp)
    }

    fn fit_polynomial(order: usize, samples: &[ShapeSample], nparams: usize) -> Result<Self> {
        let exponents = monomial_exponents(order);
        let nbasis = exponents.len();
        if samples.len() < nbasis {
            return Err(PsfError::Interpolation(format!(
                "{} stars cannot constrain {} polynomial terms of order {}",
                samples.len(),
                nbasis,
                order
            )));
        }

        let (mut umin, mut umax) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut vmin, mut vmax) = (f64::INFINITY, f64::NEG_INFINITY);
        for s in samples {
            umin = umin.min(s.position.0);
            umax = umax.max(s.position.0);
            vmin = vmin.min(s.position.1);
            vmax = vmax.max(s.position.1);
        }
        let center = ((umin + umax) / 2.0, (vmin + vmax) / 2.0);
        // A degenerate extent is caught by the rank check below.
        let half = |lo: f64, hi: f64| if hi > lo { (hi - lo) / 2.0 } else { 1.0 };
        let half_range = (half(umin, umax), half(vmin, vmax));

        let n = samples.len();
        let mut a = DMatrix::<f64>::zeros(n, nbasis);
        let mut b = DMatrix::<f64>::zeros(n, nparams);
        for (r, s) in samples.iter().enumerate() {
            let u = (s.position.0 - center.0) / half_range.0;
            let v = (s.position.1 - center.1) / half_range.1;
            for (k, value) in basis_values(order, u, v).into_iter().enumerate() {
                a[(r, k)] = value;
            }
            for (p, value) in s.params.iter().enumerate() {
                b[(r, p)] = *value;
            }
        }

        let svd = a.svd(true, true);
        let max_sv = svd.singular_values.max();
        let min_sv = svd.singular_values.min();
        if !(max_sv > 0.0) || min_sv < RANK_TOLERANCE * max_sv {
            return Err(PsfError::Interpolation(format!(
                "polynomial basis of order {} is singular for {} stars (condition {:.3e})",
                order,
                n,
                max_sv / min_sv
            )));
        }
        let solution = svd
            .solve(&b, 0.0)
            .map_err(|e| PsfError::Interpolation(e.to_string()))?;

        let coefs = (0..nbasis)
            .map(|k| (0..nparams).map(|p| solution[(k, p)]).collect())
            .collect();
        Ok(Interpolator::BasisPolynomial {
            order,
            center,
            half_range,
            coefs,
        })
    }

    /// Check that a deserialized interpolator predicts `nparams` values
    /// everywhere.
    pub fn validate(&self, nparams: usize) -> Result<()> {
        let mismatch = |what: &str, found: usize| -> Result<()> {
            Err(PsfError::Config(format!(
                "{} interpolator {} has {} values, model needs {}",
                self.name(),
                what,
                found,
                nparams
            )))
        };
        match self {
            Interpolator::Mean { params } => {
                if params.len() != nparams {
                    return mismatch("mean", params.len());
                }
            }
            Interpolator::BasisPolynomial {
                order,
                half_range,
                coefs,
                ..
            } => {
                let nbasis = monomial_exponents(*order).len();
                if coefs.len() != nbasis {
                    return Err(PsfError::Config(format!(
                        "BasisPolynomial of order {} needs {} coefficient rows, found {}",
                        order,
                        nbasis,
                        coefs.len()
                    )));
                }
                if let Some(row) = coefs.iter().find(|row| row.len() != nparams) {
                    return mismatch("coefficient row", row.len());
                }
                if !(half_range.0 > 0.0 && half_range.1 > 0.0) {
                    return Err(PsfError::Config("BasisPolynomial half_range must be positive".into()));
                }
            }
            Interpolator::Knn {
                n_neighbors,
                samples,
            } => {
                if *n_neighbors == 0 || samples.is_empty() {
                    return Err(PsfError::Config("KNN interpolator has no neighbours".into()));
                }
                if let Some(sample) = samples.iter().find(|s| s.params.len() != nparams) {
                    return mismatch("sample", sample.params.len());
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Interpolator::Mean { .. } => "Mean",
            Interpolator::BasisPolynomial { .. } => "BasisPolynomial",
            Interpolator::Knn { .. } => "KNN",
        }
    }

    /// Shape parameters at a focal-plane position.
    pub fn predict(&self, position: (f64, f64)) -> Vec<f64> {
        match self {
            Interpolator::Mean { params } => params.clone(),
            Interpolator::BasisPolynomial {
                order,
                center,
                half_range,
                coefs,
            } => {
                let u = (position.0 - center.0) / half_range.0;
                let v = (position.1 - center.1) / half_range.1;
                let nparams = coefs.first().map_or(0, |c| c.len());
                let mut out = vec![0.0; nparams];
                for (basis, row) in basis_values(*order, u, v).into_iter().zip(coefs) {
                    for (acc, c) in out.iter_mut().zip(row) {
                        *acc += basis * c;
                    }
                }
                out
            }
            Interpolator::Knn {
                n_neighbors,
                samples,
            } => {
                let mut by_distance: Vec<(f64, usize, &KnnSample)> = samples
                    .iter()
                    .map(|s| {
                        let du = s.position.0 - position.0;
                        let dv = s.position.1 - position.1;
                        (du * du + dv * dv, s.index, s)
                    })
                    .collect();
                by_distance.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

                let k = (*n_neighbors).min(by_distance.len());
                let nparams = samples.first().map_or(0, |s| s.params.len());
                let mut out = vec![0.0; nparams];
                for (_, _, s) in by_distance.iter().take(k) {
                    for (acc, p) in out.iter_mut().zip(&s.params) {
                        *acc += p;
                    }
                }
                if k > 0 {
                    out.iter_mut().for_each(|p| *p /= k as f64);
                }
                out
            }
        }
    }
}
