use anyhow::Result;

use psf_field::select::{select_stars, SelectedStar, SelectionCounts};
use psf_field::utils::truncate_string;

use super::load_inputs;

pub fn run_select(config_path: &str, overrides: &[String], verbose: u8, format: &str) -> Result<()> {
    let (config, catalog, images) = load_inputs(config_path, overrides, verbose)?;
    let selection = select_stars(&catalog, &images, &config.input, &config.select)?;

    let mut rows: Vec<(&SelectedStar, bool)> = selection
        .stars
        .iter()
        .map(|s| (s, false))
        .chain(selection.reserve.iter().map(|s| (s, true)))
        .collect();
    rows.sort_by_key(|(s, _)| s.index());

    match format {
        "json" => output_json(&rows, &selection.counts)?,
        "csv" => output_csv(&rows),
        _ => {
            output_table(&rows, &image_names(&config.input));
            print_counts(&selection.counts);
        }
    }
    Ok(())
}

fn image_names(input: &psf_field::config::InputConfig) -> Vec<String> {
    input
        .image_paths()
        .iter()
        .map(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string())
        })
        .collect()
}

fn output_table(rows: &[(&SelectedStar, bool)], images: &[String]) {
    println!(
        "{:<8} {:<24} {:>10} {:>10} {:>12} {:>8} {:>8} {:>8} {:>10} {:<8}",
        "Index", "Image", "X", "Y", "Flux", "Sigma", "G1", "G2", "SNR", "Reserved"
    );
    println!("{:-<110}", "");

    for (star, reserved) in rows {
        let m = &star.moments;
        let image = images.get(star.image).map(String::as_str).unwrap_or("");
        println!(
            "{:<8} {:<24} {:>10.2} {:>10.2} {:>12.1} {:>8.3} {:>8.4} {:>8.4} {:>10.1} {:<8}",
            star.index(),
            truncate_string(image, 24),
            star.stamp.image_pos.0,
            star.stamp.image_pos.1,
            m.flux,
            m.sigma,
            m.g1,
            m.g2,
            star.snr,
            if *reserved { "Yes" } else { "No" }
        );
    }

    println!("\nTotal: {} stars", rows.len());
}

fn print_counts(counts: &SelectionCounts) {
    println!("\nRemaining after each stage:");
    for (stage, count) in counts.stages() {
        println!("  {:<12} {:>8}", stage, count);
    }
}

fn output_json(rows: &[(&SelectedStar, bool)], counts: &SelectionCounts) -> Result<()> {
    let json_rows: Vec<serde_json::Value> = rows
        .iter()
        .map(|(star, reserved)| {
            serde_json::json!({
                "index": star.index(),
                "image": star.image,
                "x": star.stamp.image_pos.0,
                "y": star.stamp.image_pos.1,
                "u": star.stamp.field_pos.0,
                "v": star.stamp.field_pos.1,
                "moments": star.moments,
                "snr": star.snr,
                "reserved": reserved,
            })
        })
        .collect();

    let output = serde_json::json!({
        "counts": counts,
        "stars": json_rows,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn output_csv(rows: &[(&SelectedStar, bool)]) {
    println!("index,x,y,u,v,flux,sigma,g1,g2,snr,reserved");
    for (star, reserved) in rows {
        let m = &star.moments;
        println!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            star.index(),
            star.stamp.image_pos.0,
            star.stamp.image_pos.1,
            star.stamp.field_pos.0,
            star.stamp.field_pos.1,
            m.flux,
            m.sigma,
            m.g1,
            m.g2,
            star.snr,
            reserved
        );
    }
}
