use anyhow::{Context, Result};

use psf_field::psf::{self, StarStatus};

use super::load_inputs;

pub fn run_fit(config_path: &str, overrides: &[String], verbose: u8) -> Result<()> {
    let (config, catalog, images) = load_inputs(config_path, overrides, verbose)?;

    let model = psf::fit(&catalog, &images, &config).context("PSF fit failed")?;

    println!("Model: {} / {}", model.psf_model().name(), model.interp.name());
    println!(
        "Stars: {} accepted, {} rejected, {} failed, {} reserved",
        model.count(|s| *s == StarStatus::Accepted),
        model.count(|s| matches!(s, StarStatus::Rejected { .. })),
        model.count(|s| matches!(s, StarStatus::FitFailed { .. })),
        model.count(|s| *s == StarStatus::Reserved)
    );
    println!(
        "Iterations: {} ({})",
        model.iterations,
        if model.converged { "converged" } else { "did not converge" }
    );

    match &config.output {
        Some(output) => {
            let written = psf_field::output::write_outputs(&model, output)
                .context("Failed to write outputs")?;
            for path in written {
                println!("Wrote {}", path.display());
            }
        }
        None => tracing::warn!("No output section configured; model not saved"),
    }
    println!("Finished at {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    Ok(())
}
