pub mod eval;
pub mod fit;
pub mod select;

pub use eval::eval_model;
pub use fit::run_fit;
pub use select::run_select;

use std::path::Path;

use anyhow::{Context, Result};

use psf_field::catalog::StarCatalog;
use psf_field::config::PsfConfig;
use psf_field::image::Image;
use psf_field::logging::init_logging;

/// Load the configuration, start logging at the louder of the command-line
/// and configured verbosity, then read the catalogs and images.
pub(crate) fn load_inputs(
    config_path: &str,
    overrides: &[String],
    verbose: u8,
) -> Result<(PsfConfig, StarCatalog, Vec<Image>)> {
    let config = PsfConfig::from_file(Path::new(config_path), overrides)
        .with_context(|| format!("Failed to load configuration: {}", config_path))?;
    init_logging(verbose.max(config.verbose));

    let catalog = StarCatalog::load(&config.input).context("Failed to read catalogs")?;
    let images = config
        .input
        .image_paths()
        .iter()
        .map(|path| {
            Image::from_fits(path).with_context(|| format!("Failed to read image: {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((config, catalog, images))
}
