//! Stream metadata: element count and sort order.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Structural identity of a comparer.
///
/// Two comparers order items the same way iff their sort keys are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SortKey(String);

impl SortKey {
    pub fn new(descriptor: impl Into<String>) -> Self {
        SortKey(descriptor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Item comparer with a structural identity.
pub trait Comparer<T>: Clone + 'static {
    /// Compares two items.
    fn compare(&self, a: &T, b: &T) -> Ordering;

    /// Returns the structural identity of the ordering.
    fn sort_key(&self) -> SortKey;
}

/// Natural [`Ord`] ordering.
#[derive(Clone, Copy, Debug, Default)]
pub struct Natural;

impl<T: Ord> Comparer<T> for Natural {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }

    fn sort_key(&self) -> SortKey {
        SortKey::new("natural")
    }
}

/// Reverses the wrapped comparer.
#[derive(Clone, Copy, Debug, Default)]
pub struct Reverse<C>(pub C);

impl<T, C: Comparer<T>> Comparer<T> for Reverse<C> {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        self.0.compare(a, b).reverse()
    }

    fn sort_key(&self) -> SortKey {
        SortKey::new(format!("reverse({})", self.0.sort_key()))
    }
}

/// Comparer built from a compare function and a name identifying its ordering.
pub struct FnComparer<T> {
    name: Arc<str>,
    compare: Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>,
}

impl<T> Clone for FnComparer<T> {
    fn clone(&self) -> Self {
        FnComparer {
            name: self.name.clone(),
            compare: self.compare.clone(),
        }
    }
}

impl<T: 'static> Comparer<T> for FnComparer<T> {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.compare)(a, b)
    }

    fn sort_key(&self) -> SortKey {
        SortKey::new(self.name.as_ref())
    }
}

/// Creates a comparer from a function.
///
/// Comparers sharing a name are considered to order items identically.
pub fn by_fn<T, F>(name: &str, compare: F) -> FnComparer<T>
where
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
    FnComparer {
        name: Arc::from(name),
        compare: Arc::new(compare),
    }
}

/// Metadata riding along a stream handle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    /// Exact number of items, if known.
    pub count: Option<usize>,
    /// Ordering the items are known to follow.
    pub sort_key: Option<SortKey>,
}

impl Meta {
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_sort_key(mut self, sort_key: SortKey) -> Self {
        self.sort_key = Some(sort_key);
        self
    }

    /// Checks whether items are ordered by the given comparer.
    pub fn is_sorted_by<T, C: Comparer<T>>(&self, comparer: &C) -> bool {
        self.sort_key.as_ref() == Some(&comparer.sort_key())
    }

    /// Count of a concatenation, known only when both counts are known.
    pub fn concat_count(&self, other: &Meta) -> Option<usize> {
        Some(self.count? + other.count?)
    }

    /// Number of batches the items split into.
    pub fn batch_count(&self, batch_size: usize) -> Option<usize> {
        let count = self.count?;
        Some((count + batch_size - 1) / batch_size)
    }
}
