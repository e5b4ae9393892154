/// Scale factor that makes the median absolute deviation comparable to a
/// Gaussian standard deviation.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Shorten `s` to at most `max_len` characters for table columns, marking
/// the cut with `...`.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    kept + "..."
}

/// Median of the values, sorting them in place. NaNs sort last.
pub fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    median_in_place(&mut sorted)
}

/// Median absolute deviation around `center`.
pub fn mad(values: &[f64], center: f64) -> f64 {
    let mut deviations: Vec<f64> = values.iter().map(|&v| (v - center).abs()).collect();
    median_in_place(&mut deviations)
}

/// Robust standard deviation estimate, `1.4826 * MAD`.
pub fn robust_sigma(values: &[f64], center: f64) -> f64 {
    mad(values, center) * MAD_TO_SIGMA
}
