//! Outlier criteria applied after each interpolation pass.

use crate::config::OutliersConfig;
use crate::model::StarFit;

/// Fraction of the current sample removed per pass, worst first, when
/// `max_remove` is not configured. Always at least one star.
pub const DEFAULT_MAX_REMOVE: f64 = 0.01;

/// Chi-squared criterion: a star is an outlier when its chi-squared against
/// the interpolated model exceeds `dof + nsigma * sqrt(2 dof)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChisqOutliers {
    pub nsigma: f64,
    pub max_remove: Option<f64>,
}

impl ChisqOutliers {
    pub fn from_config(config: &OutliersConfig) -> Self {
        match config {
            OutliersConfig::Chisq { nsigma, max_remove } => Self {
                nsigma: *nsigma,
                max_remove: *max_remove,
            },
        }
    }

    pub fn threshold(&self, dof: usize) -> f64 {
        let dof = dof as f64;
        dof + self.nsigma * (2.0 * dof).sqrt()
    }

    /// How many stars may go in one pass out of `n`. A count when at least
    /// one, otherwise a fraction of `n`; zero removes nothing.
    fn removal_cap(&self, n: usize) -> usize {
        let limit = self.max_remove.unwrap_or(DEFAULT_MAX_REMOVE);
        if !(limit > 0.0) {
            0
        } else if limit >= 1.0 {
            limit.floor() as usize
        } else {
            ((limit * n as f64).ceil() as usize).max(1)
        }
    }

    /// Catalog indices to remove, worst first. Stars are ranked by how far
    /// over threshold they are, in units of the chi-squared spread.
    pub fn flag(&self, fits: &[StarFit]) -> Vec<usize> {
        let mut over: Vec<(f64, usize)> = fits
            .iter()
            .filter_map(|fit| {
                let threshold = self.threshold(fit.dof);
                if fit.chisq > threshold {
                    let spread = (2.0 * fit.dof as f64).sqrt().max(1.0);
                    Some(((fit.chisq - fit.dof as f64) / spread, fit.index))
                } else {
                    None
                }
            })
            .collect();
        over.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        over.truncate(self.removal_cap(fits.len()));
        over.into_iter().map(|(_, index)| index).collect()
    }
}
