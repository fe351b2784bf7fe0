use crate::insights::ExecutionStats;

/// Summary statistics over a sample. Median takes the element at `n / 2` of the sorted
/// sample (upper middle for even sizes) and p95 the element at `floor(n * 0.95)`.
pub fn compute_stats(values: &[f64]) -> Option<ExecutionStats> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    #[allow(clippy::cast_precision_loss)]
    let average = sorted.iter().sum::<f64>() / n as f64;

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let p95_index = ((n as f64 * 0.95).floor() as usize).min(n - 1);

    Some(ExecutionStats {
        average: format_fixed(average),
        median: format_fixed(sorted[n / 2]),
        min: format_fixed(sorted[0]),
        max: format_fixed(sorted[n - 1]),
        percentile95: format_fixed(sorted[p95_index]),
    })
}

pub fn format_fixed(value: f64) -> String {
    format!("{value:.2}")
}
