//! YAML configuration for a PSF fitting run.
//!
//! The layout follows the usual four sections:
//!
//! ```yaml
//! input:
//!     image_file_name: exposure.fits
//!     cat_file_name: exposure_cat.csv
//!     x_col: XWIN_IMAGE
//!     y_col: YWIN_IMAGE
//!     flag_col: FLAGS
//! select:
//!     type: SizeMag
//!     initial_select:
//!         type: Properties
//!         where: (CLASS_STAR > 0.9) & (MAG_AUTO < 20)
//!     hsm_size_reject: 4
//!     min_snr: 20
//! psf:
//!     model:
//!         type: PixelGrid
//!         scale: 0.3
//!         size: 17
//!         interp: Lanczos(5)
//!     interp:
//!         type: BasisPolynomial
//!         order: 2
//!     outliers:
//!         type: Chisq
//!         nsigma: 4
//!         max_remove: 0.05
//! output:
//!     dir: output
//!     file_name: psf.json
//! ```
//!
//! Every `type:` key selects a variant of a closed enum at load time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yml::{Mapping, Value};

use crate::error::{PsfError, Result};
use crate::interpolant::Interpolant;

/// A single value or a list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsfConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub select: SelectConfig,
    pub psf: PsfSection,
    #[serde(default)]
    pub output: Option<OutputConfig>,
    /// 0 = warnings only, 1 = progress, 2 = per-star detail, 3 = everything
    #[serde(default)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Directory prepended to relative file names
    #[serde(default)]
    pub dir: Option<String>,
    pub image_file_name: OneOrMany,
    pub cat_file_name: OneOrMany,
    #[serde(default = "default_x_col")]
    pub x_col: String,
    #[serde(default = "default_y_col")]
    pub y_col: String,
    /// Focal-plane coordinate columns; default is pixel position times pixel_scale
    #[serde(default)]
    pub u_col: Option<String>,
    #[serde(default)]
    pub v_col: Option<String>,
    #[serde(default)]
    pub flag_col: Option<String>,
    /// Objects with any of these flag bits set are skipped (default: any bit)
    #[serde(default)]
    pub skip_flag: Option<i64>,
    /// Objects must have all of these flag bits set
    #[serde(default)]
    pub use_flag: Option<i64>,
    #[serde(default)]
    pub property_cols: Vec<String>,
    #[serde(default = "default_stamp_size")]
    pub stamp_size: usize,
    /// Arcsec per pixel
    #[serde(default = "default_pixel_scale")]
    pub pixel_scale: f64,
    /// Electrons per ADU; adds Poisson variance from the star itself
    #[serde(default)]
    pub gain: Option<f64>,
    /// Constant per-pixel variance; estimated from the image when absent
    #[serde(default)]
    pub noise: Option<f64>,
}

fn default_x_col() -> String {
    "x".to_string()
}

fn default_y_col() -> String {
    "y".to_string()
}

fn default_stamp_size() -> usize {
    32
}

fn default_pixel_scale() -> f64 {
    1.0
}

impl InputConfig {
    fn resolve(&self, names: &OneOrMany) -> Vec<PathBuf> {
        names
            .to_vec()
            .into_iter()
            .map(|name| match &self.dir {
                Some(dir) => Path::new(dir).join(name),
                None => PathBuf::from(name),
            })
            .collect()
    }

    pub fn image_paths(&self) -> Vec<PathBuf> {
        self.resolve(&self.image_file_name)
    }

    pub fn catalog_paths(&self) -> Vec<PathBuf> {
        self.resolve(&self.cat_file_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectType {
    /// Flag cuts only
    #[default]
    Flag,
    /// Flag cuts plus a property predicate
    Properties,
    /// Flag and predicate cuts, then a fit to the size-magnitude stellar locus
    SizeMag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSelect {
    #[serde(rename = "type", default = "default_initial_type")]
    pub kind: SelectType,
    #[serde(rename = "where", default)]
    pub where_clause: Option<String>,
}

fn default_initial_type() -> SelectType {
    SelectType::Properties
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectConfig {
    #[serde(rename = "type", default)]
    pub kind: SelectType,
    #[serde(default)]
    pub initial_select: Option<InitialSelect>,
    /// Predicate for `type: Properties`
    #[serde(rename = "where", default)]
    pub where_clause: Option<String>,
    /// Reject objects whose size is further than this many sigma from the locus
    #[serde(default)]
    pub hsm_size_reject: Option<f64>,
    #[serde(default)]
    pub min_snr: Option<f64>,
    /// Weights are scaled down so that no star exceeds this S/N
    #[serde(default)]
    pub max_snr: Option<f64>,
    /// Polynomial order of the size-magnitude locus
    #[serde(default = "default_fit_order")]
    pub fit_order: usize,
    /// Sigma clip applied while iterating the locus fit
    #[serde(default = "default_locus_clip")]
    pub locus_clip: f64,
    #[serde(default = "default_min_stars")]
    pub min_stars: usize,
    /// Fraction of selected stars held out of the fit
    #[serde(default)]
    pub reserve_frac: f64,
    #[serde(default)]
    pub seed: u64,
}

fn default_fit_order() -> usize {
    1
}

fn default_locus_clip() -> f64 {
    3.0
}

fn default_min_stars() -> usize {
    10
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            kind: SelectType::Flag,
            initial_select: None,
            where_clause: None,
            hsm_size_reject: None,
            min_snr: None,
            max_snr: None,
            fit_order: default_fit_order(),
            locus_clip: default_locus_clip(),
            min_stars: default_min_stars(),
            reserve_frac: 0.0,
            seed: 0,
        }
    }
}

impl SelectConfig {
    /// All predicates that apply, initial select first.
    pub fn predicates(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(initial) = &self.initial_select {
            if let Some(w) = &initial.where_clause {
                out.push(w.as_str());
            }
        }
        if let Some(w) = &self.where_clause {
            out.push(w.as_str());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ModelConfig {
    Gaussian,
    Moffat {
        #[serde(default = "default_beta")]
        beta: f64,
    },
    PixelGrid {
        /// Grid spacing in arcsec
        scale: f64,
        /// Grid points per side
        size: usize,
        #[serde(default)]
        interp: Interpolant,
        /// Fit the star centre rather than fixing it at the catalog position
        #[serde(default = "default_true")]
        centered: bool,
        #[serde(default)]
        init: PixelGridInit,
    },
}

/// Starting grid for a star's first pixel-grid fit. Grid directions the
/// data cannot constrain keep their starting values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelGridInit {
    /// Gaussian matching the star's adaptive moments
    #[default]
    #[serde(alias = "Hsm")]
    Hsm,
    /// The moments Gaussian scaled down to almost nothing
    #[serde(alias = "Zero")]
    Zero,
    /// All weight in the central grid point
    #[serde(alias = "Delta")]
    Delta,
}

fn default_beta() -> f64 {
    3.5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InterpConfig {
    Mean,
    #[serde(alias = "Polynomial")]
    BasisPolynomial {
        #[serde(default = "default_order")]
        order: usize,
    },
    #[serde(rename = "KNN")]
    Knn {
        #[serde(default = "default_neighbors")]
        n_neighbors: usize,
    },
}

fn default_order() -> usize {
    1
}

fn default_neighbors() -> usize {
    15
}

impl Default for InterpConfig {
    fn default() -> Self {
        InterpConfig::Mean
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutliersConfig {
    Chisq {
        #[serde(default = "default_nsigma")]
        nsigma: f64,
        /// Absolute count when >= 1, fraction of the current sample when < 1
        #[serde(default)]
        max_remove: Option<f64>,
    },
}

fn default_nsigma() -> f64 {
    4.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsfSection {
    pub model: ModelConfig,
    #[serde(default)]
    pub interp: InterpConfig,
    #[serde(default)]
    pub outliers: Option<OutliersConfig>,
    /// Cap on fit/interpolate/reject passes
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Cap on optimizer iterations for a single star
    #[serde(default = "default_fit_max_iter")]
    pub fit_max_iter: usize,
    /// Relative chi-squared change that counts as converged for a single star
    #[serde(default = "default_fit_tolerance")]
    pub fit_tolerance: f64,
}

fn default_max_iter() -> usize {
    30
}

fn default_fit_max_iter() -> usize {
    100
}

fn default_fit_tolerance() -> f64 {
    1e-8
}

impl PsfSection {
    pub fn new(model: ModelConfig, interp: InterpConfig) -> Self {
        Self {
            model,
            interp,
            outliers: None,
            max_iter: default_max_iter(),
            fit_max_iter: default_fit_max_iter(),
            fit_tolerance: default_fit_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatsConfig {
    /// Per-star residual table written as CSV
    Residuals { file_name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub dir: Option<String>,
    pub file_name: String,
    #[serde(default)]
    pub stats: Vec<StatsConfig>,
}

impl OutputConfig {
    pub fn path_for(&self, name: &str) -> PathBuf {
        match &self.dir {
            Some(dir) => Path::new(dir).join(name),
            None => PathBuf::from(name),
        }
    }
}

impl PsfConfig {
    /// Load a YAML file, apply `key.path=value` overrides and validate.
    pub fn from_file(path: &Path, overrides: &[String]) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text, overrides)
    }

    pub fn from_yaml(text: &str, overrides: &[String]) -> Result<Self> {
        let mut tree: Value = serde_yml::from_str(text)?;
        for item in overrides {
            apply_override(&mut tree, item)?;
        }
        let config: PsfConfig = serde_yml::from_value(tree)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let images = self.input.image_file_name.to_vec();
        let catalogs = self.input.cat_file_name.to_vec();
        if images.is_empty() {
            return Err(PsfError::Config("input.image_file_name is empty".into()));
        }
        if images.len() != catalogs.len() {
            return Err(PsfError::Config(format!(
                "{} images but {} catalogs",
                images.len(),
                catalogs.len()
            )));
        }
        if self.input.stamp_size < 5 {
            return Err(PsfError::Config(format!(
                "input.stamp_size {} is too small",
                self.input.stamp_size
            )));
        }
        if !(self.input.pixel_scale > 0.0) {
            return Err(PsfError::Config("input.pixel_scale must be positive".into()));
        }
        if matches!(self.input.noise, Some(n) if !(n > 0.0 && n.is_finite())) {
            return Err(PsfError::Config("input.noise must be a positive variance".into()));
        }
        if matches!(self.input.gain, Some(g) if !(g > 0.0 && g.is_finite())) {
            return Err(PsfError::Config("input.gain must be positive".into()));
        }
        self.select.validate()?;
        self.psf.validate()
    }
}

impl SelectConfig {
    pub fn validate(&self) -> Result<()> {
        if matches!(self.hsm_size_reject, Some(r) if !(r > 0.0)) {
            return Err(PsfError::Config("select.hsm_size_reject must be positive".into()));
        }
        if matches!(self.min_snr, Some(s) if !(s >= 0.0)) {
            return Err(PsfError::Config("select.min_snr must not be negative".into()));
        }
        if matches!(self.max_snr, Some(s) if !(s > 0.0)) {
            return Err(PsfError::Config("select.max_snr must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.reserve_frac) {
            return Err(PsfError::Config("select.reserve_frac must be in [0, 1)".into()));
        }
        if self.kind == SelectType::Properties && self.predicates().is_empty() {
            return Err(PsfError::Config(
                "select type Properties needs a where clause".into(),
            ));
        }
        if !(self.locus_clip > 0.0) {
            return Err(PsfError::Config("select.locus_clip must be positive".into()));
        }
        Ok(())
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ModelConfig::Gaussian => {}
            ModelConfig::Moffat { beta } => {
                if !(*beta > 1.0) {
                    return Err(PsfError::Config(format!("Moffat beta {} must exceed 1", beta)));
                }
            }
            ModelConfig::PixelGrid { scale, size, .. } => {
                if *size == 0 {
                    return Err(PsfError::Config("PixelGrid size must be positive".into()));
                }
                if !(*scale > 0.0) {
                    return Err(PsfError::Config("PixelGrid scale must be positive".into()));
                }
            }
        }
        Ok(())
    }
}

impl PsfSection {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if let InterpConfig::Knn { n_neighbors } = self.interp {
            if n_neighbors == 0 {
                return Err(PsfError::Config("KNN n_neighbors must be positive".into()));
            }
        }
        if let Some(OutliersConfig::Chisq { nsigma, max_remove }) = &self.outliers {
            if !(*nsigma > 0.0 && nsigma.is_finite()) {
                return Err(PsfError::Config("outliers nsigma must be positive".into()));
            }
            if matches!(max_remove, Some(m) if !(*m > 0.0)) {
                return Err(PsfError::Config("outliers max_remove must be positive".into()));
            }
        }
        if self.max_iter == 0 || self.fit_max_iter == 0 {
            return Err(PsfError::Config("iteration caps must be positive".into()));
        }
        if !(self.fit_tolerance > 0.0) {
            return Err(PsfError::Config("fit_tolerance must be positive".into()));
        }
        Ok(())
    }
}

/// Apply a `a.b.c=value` override to a YAML tree, creating intermediate
/// mappings as needed. The value is parsed as YAML, so numbers stay numbers.
pub fn apply_override(tree: &mut Value, item: &str) -> Result<()> {
    let (key, raw) = item
        .split_once('=')
        .ok_or_else(|| PsfError::Config(format!("override '{}' is not key=value", item)))?;
    let parts: Vec<&str> = key.trim().split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(PsfError::Config(format!("bad override key '{}'", key)));
    }
    let value: Value = serde_yml::from_str(raw.trim())?;

    let mut node = tree;
    for (i, part) in parts.iter().enumerate() {
        if !node.is_mapping() {
            *node = Value::Mapping(Mapping::new());
        }
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| PsfError::Config(format!("bad override key '{}'", key)))?;
        let k = Value::String(part.to_string());
        if i + 1 == parts.len() {
            map.insert(k, value);
            return Ok(());
        }
        if !map.contains_key(&k) {
            map.insert(k.clone(), Value::Mapping(Mapping::new()));
        }
        node = map
            .get_mut(&k)
            .ok_or_else(|| PsfError::Config(format!("bad override key '{}'", key)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
input:
    image_file_name: exposure.fits
    cat_file_name: exposure_cat.csv
    x_col: XWIN_IMAGE
    y_col: YWIN_IMAGE
    flag_col: FLAGS
    property_cols: [MAG_AUTO, CLASS_STAR]
select:
    type: SizeMag
    initial_select:
        type: Properties
        where: (CLASS_STAR > 0.9) & (MAG_AUTO < 20)
    hsm_size_reject: 4
    min_snr: 20
psf:
    model:
        type: PixelGrid
        scale: 0.3
        size: 17
        interp: Lanczos(5)
    interp:
        type: BasisPolynomial
        order: 2
    outliers:
        type: Chisq
        nsigma: 4
        max_remove: 0.05
output:
    dir: output
    file_name: psf.json
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = PsfConfig::from_yaml(SAMPLE, &[]).unwrap();
        assert_eq!(config.input.x_col, "XWIN_IMAGE");
        assert_eq!(config.input.stamp_size, 32);
        assert_eq!(config.select.kind, SelectType::SizeMag);
        assert_eq!(config.select.hsm_size_reject, Some(4.0));
        assert_eq!(config.select.predicates(), vec!["(CLASS_STAR > 0.9) & (MAG_AUTO < 20)"]);
        assert_eq!(
            config.psf.model,
            ModelConfig::PixelGrid {
                scale: 0.3,
                size: 17,
                interp: Interpolant::Lanczos(5),
                centered: true,
                init: PixelGridInit::Hsm,
            }
        );
        assert_eq!(config.psf.interp, InterpConfig::BasisPolynomial { order: 2 });
        assert_eq!(
            config.psf.outliers,
            Some(OutliersConfig::Chisq {
                nsigma: 4.0,
                max_remove: Some(0.05)
            })
        );
        let output = config.output.unwrap();
        assert_eq!(output.path_for(&output.file_name), PathBuf::from("output/psf.json"));
    }

    #[test]
    fn test_overrides_replace_and_create_keys() {
        let overrides = vec![
            "psf.model.size=21".to_string(),
            "psf.interp.order = 3".to_string(),
            "verbose=2".to_string(),
        ];
        let config = PsfConfig::from_yaml(SAMPLE, &overrides).unwrap();
        assert!(matches!(config.psf.model, ModelConfig::PixelGrid { size: 21, .. }));
        assert_eq!(config.psf.interp, InterpConfig::BasisPolynomial { order: 3 });
        assert_eq!(config.verbose, 2);
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let err = PsfConfig::from_yaml(SAMPLE, &["psf.model.size".to_string()]).unwrap_err();
        assert!(matches!(err, PsfError::Config(_)));
    }

    #[test]
    fn test_unknown_model_type_rejected() {
        let bad = SAMPLE.replace("type: PixelGrid", "type: Airy");
        assert!(PsfConfig::from_yaml(&bad, &[]).is_err());
    }

    #[test]
    fn test_validation_catches_mismatched_inputs() {
        let bad = SAMPLE.replace(
            "image_file_name: exposure.fits",
            "image_file_name: [a.fits, b.fits]",
        );
        assert!(matches!(
            PsfConfig::from_yaml(&bad, &[]).unwrap_err(),
            PsfError::Config(_)
        ));
    }

    #[test]
    fn test_pixel_grid_init_modes() {
        for (name, expected) in [
            ("hsm", PixelGridInit::Hsm),
            ("zero", PixelGridInit::Zero),
            ("delta", PixelGridInit::Delta),
            ("Delta", PixelGridInit::Delta),
        ] {
            let overrides = vec![format!("psf.model.init={}", name)];
            let config = PsfConfig::from_yaml(SAMPLE, &overrides).unwrap();
            assert!(
                matches!(config.psf.model, ModelConfig::PixelGrid { init, .. } if init == expected),
                "{}",
                name
            );
        }
        assert!(PsfConfig::from_yaml(SAMPLE, &["psf.model.init=moments".to_string()]).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for item in [
            "input.noise=0",
            "input.noise=-2.5",
            "input.gain=0",
            "input.gain=-1",
            "select.min_snr=-1",
            "select.max_snr=-5",
            "select.max_snr=0",
            "select.hsm_size_reject=.nan",
            "psf.outliers.nsigma=.nan",
            "psf.outliers.max_remove=0",
            "psf.fit_tolerance=0",
        ] {
            let err = PsfConfig::from_yaml(SAMPLE, &[item.to_string()]).unwrap_err();
            assert!(matches!(err, PsfError::Config(_)), "{} gave {:?}", item, err);
        }
        let ok = ["input.noise=4.0", "input.gain=2.0", "select.min_snr=0"].map(String::from);
        assert!(PsfConfig::from_yaml(SAMPLE, &ok).is_ok());
    }

    #[test]
    fn test_properties_needs_where() {
        let select = SelectConfig {
            kind: SelectType::Properties,
            ..Default::default()
        };
        assert!(select.validate().is_err());
    }
}
