//! Bucket statistics.

/// Summary of one bucket's wind speeds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Number of samples.
    pub count: u32,
    /// Arithmetic mean.
    pub mean: f64,
    /// Maximum.
    pub max: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

/// Summarize a set of samples. `None` for an empty set.
#[must_use]
pub fn summarize(samples: &[f64]) -> Option<Summary> {
    if samples.is_empty() {
        return None;
    }
    let count = u32::try_from(samples.len()).unwrap_or(u32::MAX);
    let n = f64::from(count);

    let mean = samples.iter().sum::<f64>() / n;
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

    Some(Summary {
        count,
        mean,
        max,
        stddev: variance.sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn test_single_sample() {
        let s = summarize(&[12.5]).unwrap();
        assert_eq!(s.count, 1);
        assert!((s.mean - 12.5).abs() < f64::EPSILON);
        assert!((s.max - 12.5).abs() < f64::EPSILON);
        assert!(s.stddev.abs() < f64::EPSILON);
    }

    #[test]
    fn test_reference_sequence() {
        let s = summarize(&[18.0, 19.0, 21.0, 32.0, 33.0, 19.0, 5.0]).unwrap();
        assert_eq!(s.count, 7);
        assert!((s.mean - 21.0).abs() < 1e-9);
        assert!((s.max - 33.0).abs() < f64::EPSILON);
        // sum of squared deviations is 538
        assert!((s.stddev - (538.0_f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_population_not_sample_stddev() {
        let s = summarize(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((s.stddev - 2.0).abs() < 1e-12);
    }
}
