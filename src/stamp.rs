//! Star postage stamps and adaptive moment measurement.

use serde::{Deserialize, Serialize};

/// A background-subtracted square cutout around one catalog object.
///
/// Pixel `k` of `data` is at column `k % size`, row `k / size`; its centre is
/// at image position `(origin.0 + col, origin.1 + row)`. Local coordinates
/// (`du`, `dv`) are measured in arcsec from the catalog position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StarStamp {
    pub index: usize,
    pub image_pos: (f64, f64),
    pub field_pos: (f64, f64),
    pub size: usize,
    pub origin: (usize, usize),
    /// Arcsec per pixel
    pub pixel_scale: f64,
    pub data: Vec<f64>,
    /// Inverse variance; zero marks a masked pixel
    pub weight: Vec<f64>,
    pub background: f64,
}

/// Adaptive Gaussian-weighted moments of a star.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub flux: f64,
    /// Centroid offset from the catalog position, arcsec
    pub du: f64,
    pub dv: f64,
    /// Gaussian-equivalent sigma, arcsec
    pub sigma: f64,
    pub g1: f64,
    pub g2: f64,
}

impl Moments {
    /// `T = 2 sigma^2`, the usual size measure for star/galaxy separation.
    pub fn size_t(&self) -> f64 {
        2.0 * self.sigma * self.sigma
    }

    /// Instrumental magnitude from the moment flux.
    pub fn magnitude(&self) -> f64 {
        -2.5 * self.flux.max(f64::MIN_POSITIVE).log10()
    }
}

const MAX_MOMENT_ITERATIONS: usize = 100;
const MOMENT_TOLERANCE: f64 = 1e-6;

impl StarStamp {
    pub fn npix(&self) -> usize {
        self.data.len()
    }

    /// Local (du, dv) of pixel `k` in arcsec.
    pub fn local_coord(&self, k: usize) -> (f64, f64) {
        let col = (k % self.size) as f64;
        let row = (k / self.size) as f64;
        let x = self.origin.0 as f64 + col;
        let y = self.origin.1 as f64 + row;
        (
            (x - self.image_pos.0) * self.pixel_scale,
            (y - self.image_pos.1) * self.pixel_scale,
        )
    }

    pub fn local_coords(&self) -> Vec<(f64, f64)> {
        (0..self.npix()).map(|k| self.local_coord(k)).collect()
    }

    pub fn pixel_area(&self) -> f64 {
        self.pixel_scale * self.pixel_scale
    }

    /// Signal-to-noise ratio using the image as its own weight:
    /// `sum(w I^2) / sqrt(sum(w I^2))`.
    pub fn snr(&self) -> f64 {
        let sum: f64 = self
            .data
            .iter()
            .zip(&self.weight)
            .map(|(&i, &w)| w * i * i)
            .sum();
        sum.max(0.0).sqrt()
    }

    /// Scale weights down so the S/N does not exceed `max_snr`.
    pub fn cap_snr(&mut self, max_snr: f64) {
        let snr = self.snr();
        if snr > max_snr && snr > 0.0 {
            let factor = (max_snr / snr).powi(2);
            for w in self.weight.iter_mut() {
                *w *= factor;
            }
        }
    }

    /// Adaptive moments with a circular Gaussian weight whose centre and size
    /// are iterated to match the star. Returns `None` if the flux is not
    /// positive or the iteration does not settle.
    pub fn moments(&self) -> Option<Moments> {
        let coords = self.local_coords();
        let stamp_extent = self.size as f64 * self.pixel_scale;

        let mut cu = 0.0;
        let mut cv = 0.0;
        let mut sigma = 2.0 * self.pixel_scale;

        for _ in 0..MAX_MOMENT_ITERATIONS {
            let inv2s2 = 1.0 / (2.0 * sigma * sigma);
            let mut m0 = 0.0;
            let mut mu = 0.0;
            let mut mv = 0.0;
            for (k, &(u, v)) in coords.iter().enumerate() {
                if self.weight[k] <= 0.0 {
                    continue;
                }
                let du = u - cu;
                let dv = v - cv;
                let w = (-(du * du + dv * dv) * inv2s2).exp() * self.data[k];
                m0 += w;
                mu += w * u;
                mv += w * v;
            }
            if !(m0 > 0.0) {
                return None;
            }
            let new_cu = mu / m0;
            let new_cv = mv / m0;

            let mut muu = 0.0;
            let mut mvv = 0.0;
            let mut muv = 0.0;
            for (k, &(u, v)) in coords.iter().enumerate() {
                if self.weight[k] <= 0.0 {
                    continue;
                }
                let du = u - cu;
                let dv = v - cv;
                let w = (-(du * du + dv * dv) * inv2s2).exp() * self.data[k];
                let eu = u - new_cu;
                let ev = v - new_cv;
                muu += w * eu * eu;
                mvv += w * ev * ev;
                muv += w * eu * ev;
            }
            muu /= m0;
            mvv /= m0;
            muv /= m0;

            let trace = muu + mvv;
            if !(trace > 0.0) || !trace.is_finite() {
                return None;
            }
            // For a Gaussian star under a matched Gaussian weight the
            // weighted second moments are half the star's.
            let new_sigma = (trace).sqrt().min(stamp_extent);

            let converged = (new_sigma - sigma).abs() < MOMENT_TOLERANCE * sigma
                && (new_cu - cu).abs() < MOMENT_TOLERANCE * sigma
                && (new_cv - cv).abs() < MOMENT_TOLERANCE * sigma;

            cu = new_cu;
            cv = new_cv;
            sigma = new_sigma;

            if converged {
                if sigma >= stamp_extent || cu.abs() > stamp_extent / 2.0 || cv.abs() > stamp_extent / 2.0 {
                    return None;
                }
                let e1 = (muu - mvv) / trace;
                let e2 = 2.0 * muv / trace;
                let e = (e1 * e1 + e2 * e2).sqrt();
                let (g1, g2) = if e > 1e-12 && e < 1.0 {
                    let scale = 1.0 / (1.0 + (1.0 - e * e).sqrt());
                    (e1 * scale, e2 * scale)
                } else {
                    (0.0, 0.0)
                };
                return Some(Moments {
                    flux: 2.0 * m0,
                    du: cu,
                    dv: cv,
                    sigma,
                    g1,
                    g2,
                });
            }
        }
        None
    }
}
