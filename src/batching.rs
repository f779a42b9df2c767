//! External sort batch sizing.

/// Maps a stream's known or unknown size to the number of items sorted in memory at once.
///
/// Larger inputs get sub-linearly larger batches: `clamp(size ^ weighting, min_batch, max_batch)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchingPolicy {
    min_batch: usize,
    max_batch: usize,
    fallback_batch: usize,
    weighting: f64,
}

impl BatchingPolicy {
    /// Creates a batching policy.
    ///
    /// # Arguments
    /// * `min_batch` - Smallest batch size
    /// * `max_batch` - Largest batch size
    /// * `fallback_batch` - Batch size used when the input size is unknown
    /// * `weighting` - Exponent applied to the input size
    pub fn new(min_batch: usize, max_batch: usize, fallback_batch: usize, weighting: f64) -> Self {
        assert!(min_batch > 0, "minimal batch size must be positive");
        assert!(min_batch <= max_batch, "minimal batch size exceeds the maximal one");
        assert!(fallback_batch > 0, "fallback batch size must be positive");

        BatchingPolicy {
            min_batch,
            max_batch,
            fallback_batch,
            weighting,
        }
    }

    /// Policy producing batches of exactly `batch_size` items.
    pub fn fixed(batch_size: usize) -> Self {
        Self::new(batch_size, batch_size, batch_size, 1.0)
    }

    /// Returns the batch size for the given input size.
    pub fn batch_size(&self, size_hint: Option<usize>) -> usize {
        match size_hint {
            Some(size) => {
                let weighted = (size as f64).powf(self.weighting);
                if weighted >= self.max_batch as f64 {
                    self.max_batch
                } else {
                    (weighted as usize).max(self.min_batch)
                }
            }
            None => self.fallback_batch,
        }
    }
}

impl Default for BatchingPolicy {
    fn default() -> Self {
        BatchingPolicy::new(1_000, 100_000, 10_000, 0.75)
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::BatchingPolicy;

    #[rstest]
    #[case(None, 10_000)]
    #[case(Some(0), 1_000)]
    #[case(Some(100), 1_000)]
    #[case(Some(10_000), 1_000)]
    #[case(Some(1_000_000), 31_622)]
    #[case(Some(100_000_000), 100_000)]
    #[case(Some(usize::MAX), 100_000)]
    fn test_default_policy(#[case] size_hint: Option<usize>, #[case] expected: usize) {
        assert_eq!(BatchingPolicy::default().batch_size(size_hint), expected);
    }

    #[rstest]
    #[case(None)]
    #[case(Some(1))]
    #[case(Some(12))]
    #[case(Some(1_000_000))]
    fn test_fixed_policy(#[case] size_hint: Option<usize>) {
        assert_eq!(BatchingPolicy::fixed(5).batch_size(size_hint), 5);
    }

    #[test]
    fn test_batch_size_grows_monotonically() {
        let policy = BatchingPolicy::new(10, 1_000, 100, 0.5);
        let sizes: Vec<usize> = [1, 100, 401, 10_001, 250_001, 4_000_000]
            .iter()
            .map(|size| policy.batch_size(Some(*size)))
            .collect();

        assert_eq!(sizes, vec![10, 10, 20, 100, 500, 1_000]);
    }
}
