use std::path::Path;

use bumpalo::Bump;
use fitrs::{Fits, FitsData, FitsDataArray, HeaderValue};

use crate::catalog::CatalogRow;
use crate::error::{PsfError, Result};
use crate::stamp::StarStamp;
use crate::utils::MAD_TO_SIGMA;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageStatistics {
    pub width: usize,
    pub height: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub mad: f64,
}

impl ImageStatistics {
    /// Robust per-pixel noise sigma, `1.4826 * MAD`.
    pub fn noise_sigma(&self) -> f64 {
        self.mad * MAD_TO_SIGMA
    }
}

/// A single-plane image, row-major with x varying fastest.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

fn header_number(value: Option<&HeaderValue>) -> Option<f64> {
    match value {
        Some(HeaderValue::IntegerNumber(n)) => Some(*n as f64),
        Some(HeaderValue::RealFloatingNumber(f)) => Some(*f),
        _ => None,
    }
}

impl Image {
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != width * height {
            return Err(PsfError::Config(format!(
                "Data size mismatch: expected {} pixels, got {}",
                width * height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: usize, height: usize, value: f64) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Load the primary HDU of a FITS file, applying BZERO/BSCALE.
    pub fn from_fits(path: &Path) -> Result<Self> {
        let fits_err = |reason: String| PsfError::Fits {
            path: path.to_path_buf(),
            reason,
        };

        let fits = Fits::open(path)?;
        let hdu = fits
            .get(0)
            .ok_or_else(|| fits_err("No primary HDU found".into()))?;

        let naxis = header_number(hdu.value("NAXIS"))
            .ok_or_else(|| fits_err("Missing NAXIS header".into()))? as usize;
        if naxis < 2 {
            return Err(fits_err(format!("not a 2D image (NAXIS={})", naxis)));
        }
        let width = header_number(hdu.value("NAXIS1"))
            .ok_or_else(|| fits_err("Missing NAXIS1 header".into()))? as usize;
        let height = header_number(hdu.value("NAXIS2"))
            .ok_or_else(|| fits_err("Missing NAXIS2 header".into()))? as usize;
        let bzero = header_number(hdu.value("BZERO")).unwrap_or(0.0);
        let bscale = header_number(hdu.value("BSCALE")).unwrap_or(1.0);

        let raw: Vec<f64> = match hdu.read_data() {
            FitsData::Characters(_) => {
                return Err(fits_err("contains character data, not image data".into()));
            }
            FitsData::IntegersI32(FitsDataArray { data, .. }) => data
                .iter()
                .map(|x| x.map_or(f64::NAN, |v| v as f64))
                .collect(),
            FitsData::IntegersU32(FitsDataArray { data, .. }) => data
                .iter()
                .map(|x| x.map_or(f64::NAN, |v| v as f64))
                .collect(),
            FitsData::FloatingPoint32(FitsDataArray { data, .. }) => {
                data.iter().map(|&x| x as f64).collect()
            }
            FitsData::FloatingPoint64(FitsDataArray { data, .. }) => data.iter().copied().collect(),
        };

        let data: Vec<f64> = raw.into_iter().map(|v| bzero + bscale * v).collect();
        if data.len() < width * height {
            return Err(fits_err(format!(
                "expected {} pixels, got {}",
                width * height,
                data.len()
            )));
        }
        // Only the first plane of a cube is used.
        let mut data = data;
        data.truncate(width * height);

        tracing::info!("Loaded {}x{} image from {}", width, height, path.display());
        Self::new(width, height, data)
    }

    /// Mean, median, extremes and MAD over finite pixels.
    pub fn statistics(&self) -> ImageStatistics {
        // Use arena for temporary allocation
        let arena = Bump::new();
        let mut sorted = bumpalo::collections::Vec::with_capacity_in(self.data.len(), &arena);
        sorted.extend(self.data.iter().copied().filter(|v| v.is_finite()));
        sorted.sort_by(|a, b| a.total_cmp(b));

        if sorted.is_empty() {
            return ImageStatistics {
                width: self.width,
                height: self.height,
                mean: 0.0,
                median: 0.0,
                std_dev: 0.0,
                min: 0.0,
                max: 0.0,
                mad: 0.0,
            };
        }

        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let median_of = |v: &[f64]| {
            if v.len() % 2 == 0 {
                (v[v.len() / 2 - 1] + v[v.len() / 2]) / 2.0
            } else {
                v[v.len() / 2]
            }
        };
        let median = median_of(&sorted);
        let variance = if n > 1 {
            sorted.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };

        let mut deviations = bumpalo::collections::Vec::with_capacity_in(n, &arena);
        deviations.extend(sorted.iter().map(|&x| (x - median).abs()));
        deviations.sort_by(|a, b| a.total_cmp(b));
        let mad = median_of(&deviations);

        ImageStatistics {
            width: self.width,
            height: self.height,
            mean,
            median,
            std_dev: variance.sqrt(),
            min: sorted[0],
            max: sorted[n - 1],
            mad,
        }
    }

    /// Cut a square stamp centred on a catalog position.
    ///
    /// Returns `None` when the stamp would extend past the image edge or
    /// contains no usable pixels. `variance` is the sky variance per pixel;
    /// with a gain, the star's own Poisson noise is added.
    pub fn stamp(
        &self,
        row: &CatalogRow,
        size: usize,
        pixel_scale: f64,
        variance: f64,
        gain: Option<f64>,
    ) -> Option<StarStamp> {
        let xc = row.x.round() as i64;
        let yc = row.y.round() as i64;
        let x0 = xc - (size / 2) as i64;
        let y0 = yc - (size / 2) as i64;
        if x0 < 0 || y0 < 0 || x0 as usize + size > self.width || y0 as usize + size > self.height
        {
            return None;
        }
        let (x0, y0) = (x0 as usize, y0 as usize);

        let mut data = Vec::with_capacity(size * size);
        for j in 0..size {
            let start = (y0 + j) * self.width + x0;
            data.extend_from_slice(&self.data[start..start + size]);
        }

        let mut border: Vec<f64> = Vec::with_capacity(4 * size);
        for j in 0..size {
            for i in 0..size {
                if i == 0 || j == 0 || i == size - 1 || j == size - 1 {
                    let v = data[j * size + i];
                    if v.is_finite() {
                        border.push(v);
                    }
                }
            }
        }
        if border.is_empty() {
            return None;
        }
        let background = crate::utils::median_in_place(&mut border);

        let mut weight = Vec::with_capacity(data.len());
        for value in data.iter_mut() {
            if !value.is_finite() {
                *value = 0.0;
                weight.push(0.0);
                continue;
            }
            *value -= background;
            let mut var = variance;
            if let Some(gain) = gain {
                var += value.max(0.0) / gain;
            }
            weight.push(if var > 0.0 { 1.0 / var } else { 0.0 });
        }
        if weight.iter().all(|&w| w == 0.0) {
            return None;
        }

        Some(StarStamp {
            index: row.index,
            image_pos: (row.x, row.y),
            field_pos: (row.u, row.v),
            size,
            origin: (x0, y0),
            pixel_scale,
            data,
            weight,
            background,
        })
    }
}
