//! Subcommand implementations

pub mod fanout;
pub mod sleep_accuracy;
pub mod ticker;

/// Mean and maximum of a set of tick samples, in microseconds
pub(crate) fn summarize(samples: &[u64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let to_micros = |ticks: u64| ticks as f64 / 1_000.0;
    let total: u64 = samples.iter().sum();
    let max = samples.iter().copied().max().unwrap_or(0);
    (to_micros(total) / samples.len() as f64, to_micros(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize() {
        assert_eq!(summarize(&[]), (0.0, 0.0));
        assert_eq!(summarize(&[1_000, 3_000]), (2.0, 3.0));
    }
}
