//! Sort-order aware collection operations.

use log;

use crate::error::Result;
use crate::merger::{merge, Difference, DifferenceWithIntersection, Intersection, Union};
use crate::meta::Comparer;
use crate::sort::ExternalSorter;
use crate::storage::{Collection, Item};
use crate::stream::Stream;

/// Operations session composing the external sorter, buffering and the sorted merge.
///
/// Inputs not yet sorted by the requested comparer are sorted first, inputs already carrying its sort
/// key are merged as is.
pub struct Operations<T> {
    sorter: ExternalSorter<T>,
}

impl<T: Item> Operations<T> {
    pub fn new(sorter: ExternalSorter<T>) -> Self {
        Operations { sorter }
    }

    pub fn sorter(&self) -> &ExternalSorter<T> {
        &self.sorter
    }

    /// Sorts a stream, see [`ExternalSorter::sort`].
    pub fn sort<C: Comparer<T>>(&self, source: Stream<T>, comparer: C) -> Result<Stream<T>> {
        self.sorter.sort(source, comparer)
    }

    /// Sorted union of the inputs, duplicates are retained.
    pub fn union<C: Comparer<T>>(&self, inputs: Vec<Stream<T>>, comparer: C) -> Result<Stream<T>> {
        let inputs = self.sort_all(inputs, &comparer)?;
        merge(inputs, comparer, Union, self.sorter.selector())
    }

    /// Values held by exactly one of the two inputs.
    pub fn difference<C: Comparer<T>>(&self, first: Stream<T>, second: Stream<T>, comparer: C) -> Result<Stream<T>> {
        let inputs = self.sort_all(vec![first, second], &comparer)?;
        merge(inputs, comparer, Difference, self.sorter.selector())
    }

    /// Values held by both inputs.
    pub fn intersection<C: Comparer<T>>(&self, first: Stream<T>, second: Stream<T>, comparer: C) -> Result<Stream<T>> {
        self.intersection_all(vec![first, second], comparer)
    }

    /// Values held by every input.
    pub fn intersection_all<C: Comparer<T>>(&self, inputs: Vec<Stream<T>>, comparer: C) -> Result<Stream<T>> {
        let inputs = self.sort_all(inputs, &comparer)?;
        merge(inputs, comparer, Intersection, self.sorter.selector())
    }

    /// Difference of the inputs followed by their intersection.
    pub fn difference_with_intersection<C: Comparer<T>>(
        &self,
        first: Stream<T>,
        second: Stream<T>,
        comparer: C,
    ) -> Result<Stream<T>> {
        let inputs = self.sort_all(vec![first, second], &comparer)?;
        merge(inputs, comparer, DifferenceWithIntersection, self.sorter.selector())
    }

    /// Materializes a stream into a re-iterable collection keeping the stream sort order tag.
    pub fn buffer(&self, source: Stream<T>) -> Result<Collection<T>> {
        let meta = source.meta().clone();
        let mut accumulator = self.sorter.selector().get_for(&meta)?;
        for item in source {
            accumulator.add(item?)?;
        }

        log::debug!("buffered {} items ({})", accumulator.count(), accumulator.medium());
        let collection = accumulator.complete()?;
        return Ok(match meta.sort_key {
            Some(sort_key) => collection.with_sort_key(sort_key),
            None => collection,
        });
    }

    /// Materializes a stream to be read once, the buffer is released after the read.
    pub fn buffer_once(&self, source: Stream<T>) -> Result<Stream<T>> {
        self.buffer(source)?.into_stream()
    }

    fn sort_all<C: Comparer<T>>(&self, inputs: Vec<Stream<T>>, comparer: &C) -> Result<Vec<Stream<T>>> {
        inputs
            .into_iter()
            .map(|input| self.sorter.sort(input, comparer.clone()))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::Operations;
    use crate::batching::BatchingPolicy;
    use crate::meta::{Comparer, Natural};
    use crate::resource::ResourceTracker;
    use crate::sort::ExternalSorterBuilder;
    use crate::storage::test::tmp_dir;
    use crate::storage::Medium;
    use crate::stream::Stream;

    fn operations(tmp_dir: &tempfile::TempDir, tracker: &ResourceTracker) -> Operations<i32> {
        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(tmp_dir.path())
            .with_spill_threshold(2)
            .with_batching(BatchingPolicy::fixed(3))
            .with_tracker(tracker.clone())
            .build()
            .unwrap();
        Operations::new(sorter)
    }

    fn shuffled(mut items: Vec<i32>) -> Stream<i32> {
        items.shuffle(&mut rand::thread_rng());
        Stream::from_items(items)
    }

    fn collect_set(stream: Stream<i32>) -> BTreeSet<i32> {
        stream.map(Result::unwrap).collect()
    }

    #[rstest]
    fn test_difference(tmp_dir: tempfile::TempDir) {
        let tracker = ResourceTracker::new();
        let ops = operations(&tmp_dir, &tracker);

        let result = ops
            .difference(shuffled(vec![2, 4, 6, 7, 7, 9, 12]), shuffled(vec![1, 3, 3, 4, 7]), Natural)
            .unwrap();

        assert_eq!(collect_set(result), BTreeSet::from([1, 2, 3, 6, 9, 12]));
        assert!(tracker.live().is_empty());
    }

    #[rstest]
    fn test_intersection(tmp_dir: tempfile::TempDir) {
        let tracker = ResourceTracker::new();
        let ops = operations(&tmp_dir, &tracker);

        let result = ops
            .intersection_all(
                vec![
                    shuffled(vec![1, 2, 4, 4, 4, 5, 8, 9]),
                    shuffled(vec![1, 3, 7, 9]),
                    shuffled(vec![2, 5, 6, 9]),
                ],
                Natural,
            )
            .unwrap();
        assert_eq!(collect_set(result), BTreeSet::from([9]));

        let result = ops
            .intersection(shuffled(vec![5, 1, 3, 3]), shuffled(vec![3, 4, 5]), Natural)
            .unwrap();
        assert_eq!(collect_set(result), BTreeSet::from([3, 5]));
        assert!(tracker.live().is_empty());
    }

    #[rstest]
    fn test_difference_with_intersection(tmp_dir: tempfile::TempDir) {
        let tracker = ResourceTracker::new();
        let ops = operations(&tmp_dir, &tracker);
        let a = vec![11, 3, 5, 1, 8, 3, 13, 2];
        let b = vec![4, 2, 8, 10, 13, 13, 6];

        let difference: Vec<i32> = ops
            .difference(shuffled(a.clone()), shuffled(b.clone()), Natural)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        let combined: Vec<i32> = ops
            .difference_with_intersection(shuffled(a), shuffled(b), Natural)
            .unwrap()
            .map(Result::unwrap)
            .collect();

        let (first, second) = combined.split_at(difference.len());
        assert_eq!(BTreeSet::from_iter(first.iter().copied()), BTreeSet::from([1, 3, 4, 5, 6, 10, 11]));
        assert_eq!(BTreeSet::from_iter(second.iter().copied()), BTreeSet::from([2, 8, 13]));
        assert!(tracker.live().is_empty());
    }

    #[rstest]
    fn test_union(tmp_dir: tempfile::TempDir) {
        let tracker = ResourceTracker::new();
        let ops = operations(&tmp_dir, &tracker);

        let result: Vec<i32> = ops
            .union(vec![shuffled(vec![3, 1, 2]), shuffled(vec![2, 5]), Stream::empty()], Natural)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(result, vec![1, 2, 2, 3, 5]);
    }

    #[rstest]
    #[case(vec![1], Medium::Memory)]
    #[case(vec![1, 2], Medium::Memory)]
    #[case(vec![1, 2, 3], Medium::File)]
    fn test_buffer(tmp_dir: tempfile::TempDir, #[case] items: Vec<i32>, #[case] expected: Medium) {
        let tracker = ResourceTracker::new();
        let ops = operations(&tmp_dir, &tracker);

        let collection = ops.buffer(Stream::from_vec(items.clone())).unwrap();
        assert_eq!(collection.medium(), expected);
        assert_eq!(collection.len(), items.len());

        for _ in 0..3 {
            let restored: Vec<i32> = collection.iter().unwrap().map(Result::unwrap).collect();
            assert_eq!(restored, items);
        }

        drop(collection);
        assert!(tracker.live().is_empty());
    }

    #[rstest]
    fn test_buffer_keeps_sort_order(tmp_dir: tempfile::TempDir) {
        let tracker = ResourceTracker::new();
        let ops = operations(&tmp_dir, &tracker);

        let sorted = ops.sort(shuffled(vec![4, 2, 3, 1]), Natural).unwrap();
        let buffered = ops.buffer_once(sorted).unwrap();
        assert_eq!(buffered.sort_key(), Some(&Comparer::<i32>::sort_key(&Natural)));
        assert_eq!(buffered.known_count(), Some(4));

        let id = buffered.id();
        let resorted = ops.sort(buffered, Natural).unwrap();
        assert_eq!(resorted.id(), id);

        assert_eq!(resorted.map(Result::unwrap).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(tracker.live().is_empty());
    }
}
