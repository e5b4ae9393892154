use std::path::{Path, PathBuf};

use crate::config::{OutputConfig, StatsConfig};
use crate::error::Result;
use crate::psf::FocalPlaneModel;

/// Write the model and every configured stats table. Returns the paths
/// written, model first.
pub fn write_outputs(model: &FocalPlaneModel, output: &OutputConfig) -> Result<Vec<PathBuf>> {
    if let Some(dir) = &output.dir {
        std::fs::create_dir_all(dir)?;
    }

    let model_path = output.path_for(&output.file_name);
    model.save(&model_path)?;
    tracing::info!(
        "Wrote model to {} at {}",
        model_path.display(),
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    );

    let mut written = vec![model_path];
    for stats in &output.stats {
        match stats {
            StatsConfig::Residuals { file_name } => {
                let path = output.path_for(file_name);
                write_residuals(model, &path)?;
                tracing::info!("Wrote residual table to {}", path.display());
                written.push(path);
            }
        }
    }
    Ok(written)
}

fn format_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// One row per star: position, status, goodness of fit against the
/// interpolated model, and the star's own and interpolated shapes.
pub fn write_residuals(model: &FocalPlaneModel, path: &Path) -> Result<()> {
    let names = model.psf_model().param_names();
    let mut writer = csv::Writer::from_path(path)?;

    let mut header: Vec<String> = ["index", "x", "y", "u", "v", "status", "flux", "chisq", "dof"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(names.iter().map(|n| format!("fit_{}", n)));
    header.extend(names.iter().map(|n| format!("model_{}", n)));
    writer.write_record(&header)?;

    for star in &model.stars {
        let model_fit = star.model_fit.as_ref();
        let mut record = vec![
            star.index.to_string(),
            star.image_pos.0.to_string(),
            star.image_pos.1.to_string(),
            star.field_pos.0.to_string(),
            star.field_pos.1.to_string(),
            star.status.to_string(),
            format_opt(model_fit.map(|f| f.flux)),
            format_opt(model_fit.map(|f| f.chisq)),
            model_fit.map(|f| f.dof.to_string()).unwrap_or_default(),
        ];
        match &star.fit {
            Some(fit) => record.extend(fit.params.iter().map(|p| p.to_string())),
            None => record.extend(names.iter().map(|_| String::new())),
        }
        record.extend(model.shape_at(star.field_pos).iter().map(|p| p.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
