use std::path::Path;

use anyhow::{Context, Result};

use psf_field::psf::FocalPlaneModel;

pub fn eval_model(model_path: &str, u: f64, v: f64) -> Result<()> {
    let model = FocalPlaneModel::load(Path::new(model_path))
        .with_context(|| format!("Failed to load model: {}", model_path))?;

    let shape = model.shape_at((u, v));
    let names = model.psf_model().param_names();
    println!("{} model at ({}, {})", model.psf_model().name(), u, v);
    for (name, value) in names.iter().zip(&shape) {
        println!("{:<12} {:>14.6e}", name, value);
    }
    Ok(())
}
