//! Stock record-to-record filters.
//!
//! These are the small, referentially transparent building blocks used to
//! describe an environment's data transformation chain. Every filter is lazy:
//! construction and `filter()` itself do no work, only iteration does.

use rand_chacha::rand_core::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::core::{Deferred, Filter, Stream};

/// A filter which returns exactly what it is given.
pub struct Identity;

impl<T: 'static> Filter<T, T> for Identity {
    fn filter(&self, items: Stream<T>) -> Stream<T> {
        items
    }
}

/// Takes a fixed number of items from the head of the stream.
pub struct Take {
    count: usize,
}

impl Take {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl<T: 'static> Filter<T, T> for Take {
    fn filter(&self, items: Stream<T>) -> Stream<T> {
        Box::new(items.take(self.count))
    }
}

/// Shuffles the stream into a seed-determined order.
///
/// The same seed always yields the same permutation, which is what makes
/// shuffled environments reproducible across runs and across workers.
pub struct Shuffle {
    seed: u64,
}

impl Shuffle {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl<T: Send + 'static> Filter<T, T> for Shuffle {
    fn filter(&self, items: Stream<T>) -> Stream<T> {
        let seed = self.seed;
        // Shuffling has to materialize the stream, so defer that work until
        // the first item is actually pulled.
        Box::new(Deferred::new(move || {
            let mut buffer: Vec<T> = items.collect();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            shuffle_in_place(&mut buffer, &mut rng);
            Box::new(buffer.into_iter()) as Stream<T>
        }))
    }
}

/// Takes a fixed number of uniformly random items from the stream.
///
/// Uses Algorithm L (Li 1994) so streams much longer than the sample are
/// mostly skipped over rather than drawn per item. The same seed always
/// selects the same sample.
pub struct Reservoir {
    count: usize,
    seed: u64,
}

impl Reservoir {
    pub fn new(count: usize, seed: u64) -> Self {
        Self { count, seed }
    }
}

impl<T: Send + 'static> Filter<T, T> for Reservoir {
    fn filter(&self, items: Stream<T>) -> Stream<T> {
        let count = self.count;
        let seed = self.seed;
        Box::new(Deferred::new(move || {
            if count == 0 {
                return Box::new(std::iter::empty()) as Stream<T>;
            }
            let mut items = items;
            let mut rng = ChaCha8Rng::seed_from_u64(seed);

            let mut reservoir: Vec<T> = items.by_ref().take(count).collect();
            shuffle_in_place(&mut reservoir, &mut rng);

            if reservoir.len() == count {
                let mut w: f64 = 1.0;
                loop {
                    let r1 = unit_open(&mut rng);
                    let r2 = unit_open(&mut rng);
                    let r3 = unit_open(&mut rng);
                    w *= (r1.ln() / count as f64).exp();
                    let skip = (r2.ln() / (1.0 - w).ln()).floor() as usize;

                    // Discard `skip` items, then replace a random slot with
                    // the next one; a stream that ends mid-skip leaves the
                    // reservoir as it stands.
                    let Some(replacement) = items.by_ref().nth(skip) else {
                        break;
                    };
                    let slot = ((r3 * count as f64) as usize).min(count - 1);
                    reservoir[slot] = replacement;
                }
            }

            Box::new(reservoir.into_iter()) as Stream<T>
        }))
    }
}

/// Fisher-Yates over a materialized buffer.
fn shuffle_in_place<T>(buffer: &mut [T], rng: &mut ChaCha8Rng) {
    for i in (1..buffer.len()).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        buffer.swap(i, j);
    }
}

/// A uniform draw from the open interval (0, 1); safe to pass to `ln()`.
fn unit_open(rng: &mut ChaCha8Rng) -> f64 {
    ((rng.next_u64() >> 11) + 1) as f64 / ((1u64 << 53) + 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipes::core::{IterSource, Source, SourceExt};
    use std::collections::BTreeSet;

    #[test]
    fn test_identity_passes_items_through() {
        let out: Vec<i64> = IterSource::new(vec![3, 1, 2]).then(Identity).read().collect();
        assert_eq!(out, vec![3, 1, 2]);
    }

    #[test]
    fn test_take_limits_items() {
        let out: Vec<i64> = IterSource::new(vec![1, 2, 3, 4]).then(Take::new(2)).read().collect();
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn test_take_more_than_available() {
        let out: Vec<i64> = IterSource::new(vec![1, 2]).then(Take::new(10)).read().collect();
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn test_shuffle_is_deterministic_per_seed() {
        let items: Vec<i64> = (0..20).collect();
        let a: Vec<i64> = IterSource::new(items.clone()).then(Shuffle::new(7)).read().collect();
        let b: Vec<i64> = IterSource::new(items.clone()).then(Shuffle::new(7)).read().collect();
        let c: Vec<i64> = IterSource::new(items.clone()).then(Shuffle::new(8)).read().collect();

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, items, "shuffle must be a permutation");
    }

    #[test]
    fn test_shuffle_empty_stream() {
        let out: Vec<i64> = IterSource::new(Vec::new()).then(Shuffle::new(1)).read().collect();
        assert!(out.is_empty());
    }

    #[test]
    fn test_reservoir_samples_without_replacement() {
        let items: Vec<i64> = (0..100).collect();
        let sample: Vec<i64> = IterSource::new(items.clone())
            .then(Reservoir::new(10, 3))
            .read()
            .collect();

        assert_eq!(sample.len(), 10);
        let distinct: BTreeSet<i64> = sample.iter().copied().collect();
        assert_eq!(distinct.len(), 10, "sample must not repeat items");
        assert!(sample.iter().all(|x| items.contains(x)));
    }

    #[test]
    fn test_reservoir_is_deterministic_per_seed() {
        let items: Vec<i64> = (0..100).collect();
        let a: Vec<i64> = IterSource::new(items.clone()).then(Reservoir::new(5, 11)).read().collect();
        let b: Vec<i64> = IterSource::new(items.clone()).then(Reservoir::new(5, 11)).read().collect();
        let c: Vec<i64> = IterSource::new(items).then(Reservoir::new(5, 12)).read().collect();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_reservoir_shorter_stream_keeps_everything() {
        let sample: Vec<i64> = IterSource::new(vec![1, 2, 3])
            .then(Reservoir::new(10, 1))
            .read()
            .collect();

        let distinct: BTreeSet<i64> = sample.iter().copied().collect();
        assert_eq!(distinct, BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn test_reservoir_count_zero_is_empty() {
        let sample: Vec<i64> = IterSource::new(vec![1, 2, 3])
            .then(Reservoir::new(0, 1))
            .read()
            .collect();
        assert!(sample.is_empty());
    }
}
