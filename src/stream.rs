//! Tagged stream handles.

use std::fmt;
use std::iter;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BoxError, Error, Result};
use crate::meta::{Meta, SortKey};

/// Process-unique stream identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        StreamId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Single-pass fallible stream carrying [`Meta`] alongside the items.
///
/// Dropping the stream disposes every cursor and resource it holds.
pub struct Stream<T> {
    id: StreamId,
    iter: Box<dyn Iterator<Item = Result<T>>>,
    meta: Meta,
}

impl<T: 'static> Stream<T> {
    /// Creates a stream from a fallible iterator and its metadata.
    pub fn new<I>(iter: I, meta: Meta) -> Self
    where
        I: Iterator<Item = Result<T>> + 'static,
    {
        Stream {
            id: StreamId::next(),
            iter: Box::new(iter),
            meta,
        }
    }

    /// Creates an empty stream of a known (zero) size.
    pub fn empty() -> Self {
        Self::new(iter::empty(), Meta::default().with_count(0))
    }

    /// Creates a counted stream over in-memory items.
    pub fn from_vec(items: Vec<T>) -> Self {
        let count = items.len();
        Self::new(items.into_iter().map(Ok), Meta::default().with_count(count))
    }

    /// Creates an untagged stream over infallible items.
    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Self::new(items.into_iter().map(Ok), Meta::default())
    }

    /// Creates an untagged stream over fallible input, input errors are reported as [`Error::InputError`].
    pub fn from_results<I, E>(items: I) -> Self
    where
        I: IntoIterator<Item = std::result::Result<T, E>>,
        I::IntoIter: 'static,
        E: Into<BoxError>,
    {
        Self::new(items.into_iter().map(|item| item.map_err(Error::input)), Meta::default())
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Element count carried by the stream, if known.
    pub fn known_count(&self) -> Option<usize> {
        self.meta.count
    }

    pub fn sort_key(&self) -> Option<&SortKey> {
        self.meta.sort_key.as_ref()
    }

    /// Attaches an element count without altering how the stream is consumed.
    pub fn with_count(mut self, count: usize) -> Self {
        self.meta.count = Some(count);
        self
    }

    /// Attaches a sort order without altering how the stream is consumed.
    pub fn with_sort_key(mut self, sort_key: SortKey) -> Self {
        self.meta.sort_key = Some(sort_key);
        self
    }
}

impl<T> Iterator for Stream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Concatenates two streams. The count is derived only when both inputs are counted.
pub fn concat<T: 'static>(first: Stream<T>, second: Stream<T>) -> Stream<T> {
    let meta = Meta {
        count: first.meta.concat_count(&second.meta),
        sort_key: None,
    };
    Stream::new(first.chain(second), meta)
}

/// Splits a stream into consecutive batches of at most `batch_size` items.
pub fn batches<T: 'static>(stream: Stream<T>, batch_size: usize) -> Batches<T> {
    assert!(batch_size > 0, "batch size must be positive");
    Batches {
        count: stream.meta.batch_count(batch_size),
        inner: Some(stream),
        batch_size,
    }
}

/// Batching adapter, see [`batches`].
pub struct Batches<T> {
    inner: Option<Stream<T>>,
    batch_size: usize,
    count: Option<usize>,
}

impl<T> Batches<T> {
    /// Number of batches, derived from the source count when known.
    pub fn count_hint(&self) -> Option<usize> {
        self.count
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<T> Iterator for Batches<T> {
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let stream = self.inner.as_mut()?;
        let mut batch = Vec::with_capacity(self.batch_size);

        while batch.len() < self.batch_size {
            match stream.next() {
                Some(Ok(item)) => batch.push(item),
                Some(Err(err)) => {
                    self.inner = None;
                    return Some(Err(err));
                }
                None => {
                    self.inner = None;
                    break;
                }
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use rstest::*;

    use super::{batches, concat, Stream};
    use crate::error::Error;
    use crate::meta::SortKey;

    #[rstest]
    #[case(2, vec![vec![1, 2], vec![3, 4], vec![5]])]
    #[case(10, vec![vec![1, 2, 3, 4, 5]])]
    #[case(5, vec![vec![1, 2, 3, 4, 5]])]
    fn test_batches(#[case] size: usize, #[case] expected: Vec<Vec<i32>>) {
        let batched = batches(Stream::from_vec(vec![1, 2, 3, 4, 5]), size);
        assert_eq!(batched.count_hint(), Some(expected.len()));

        let actual: Vec<Vec<i32>> = batched.map(Result::unwrap).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_batches_of_uncounted_stream() {
        let batched = batches(Stream::from_items(0..7), 3);
        assert_eq!(batched.count_hint(), None);
        assert_eq!(batched.count(), 3);
    }

    #[test]
    fn test_batches_stop_on_error() {
        let failure = io::Error::new(io::ErrorKind::Other, "boom");
        let input: Vec<Result<i32, io::Error>> = vec![Ok(1), Ok(2), Ok(3), Err(failure), Ok(5)];
        let mut batched = batches(Stream::from_results(input), 2);

        assert_eq!(batched.next().unwrap().unwrap(), vec![1, 2]);
        assert!(matches!(batched.next(), Some(Err(Error::InputError(_)))));
        assert!(batched.next().is_none());
    }

    #[test]
    fn test_concat() {
        let counted = concat(Stream::from_vec(vec![1, 2]), Stream::from_vec(vec![3]));
        assert_eq!(counted.known_count(), Some(3));
        assert_eq!(counted.map(Result::unwrap).collect::<Vec<_>>(), vec![1, 2, 3]);

        let uncounted = concat(Stream::from_vec(vec![1, 2]), Stream::from_items(vec![3]));
        assert_eq!(uncounted.known_count(), None);
    }

    #[test]
    fn test_tags_keep_identity() {
        let stream = Stream::from_items(vec![1, 2, 3]);
        let id = stream.id();

        let tagged = stream.with_count(3).with_sort_key(SortKey::new("natural"));
        assert_eq!(tagged.id(), id);
        assert_eq!(tagged.known_count(), Some(3));
        assert_eq!(tagged.sort_key(), Some(&SortKey::new("natural")));
    }
}
