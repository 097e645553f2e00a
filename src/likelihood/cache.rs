//! Bounded window of historical samples used to fit the likelihood
//! distribution.

use crate::likelihood::MetricSample;

/// Ordered, bounded sample window. Ascending by `row_id`; gaps between row ids
/// are allowed, duplicates and out-of-order samples are dropped on append.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleCache {
    samples: Vec<MetricSample>,
    capacity: usize,
}

impl SampleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::new(),
            capacity,
        }
    }

    /// Build a cache from historical samples, typically the store's tail.
    pub fn seeded(history: Vec<MetricSample>, capacity: usize) -> Self {
        let mut cache = Self::new(capacity);
        cache.extend(history);
        cache
    }

    /// Append samples, keeping only the most recent `capacity`.
    pub fn extend<I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = MetricSample>,
    {
        for sample in samples {
            if let Some(last) = self.samples.last() {
                if sample.row_id <= last.row_id {
                    tracing::debug!(
                        row_id = sample.row_id,
                        last_row_id = last.row_id,
                        "dropping out-of-order sample from cache"
                    );
                    continue;
                }
            }
            self.samples.push(sample);
        }

        if self.samples.len() > self.capacity {
            let excess = self.samples.len() - self.capacity;
            self.samples.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn as_slice(&self) -> &[MetricSample] {
        &self.samples
    }
}
