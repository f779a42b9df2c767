//! Accumulators, collections and storage medium selection.
//!
//! An [`Accumulator`] is a write-once builder over a resource-backed medium. Completing it seals the
//! accumulator and yields a re-iterable [`Collection`] sharing the same [`Resource`]. Each iteration
//! of a collection creates a fresh [`Cursor`] holding its own token, so the backing store outlives
//! the collection for as long as a cursor still reads from it.

use std::fmt;
use std::sync::Arc;

use log;
use serde::de::DeserializeOwned;
use serde::ser::Serialize;

use crate::buffer::{HybridAccumulator, MemoryAccumulator};
use crate::error::Result;
use crate::meta::{Meta, SortKey};
use crate::resource::{Resource, ResourceTracker, Token};
use crate::stream::Stream;

/// Default number of items kept in memory before spilling.
pub const DEFAULT_SPILL_THRESHOLD: usize = 10_000;

/// Item bound of the spillable collections.
pub trait Item: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Item for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Physical medium underlying an accumulator or a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Medium {
    Memory,
    File,
    Table,
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Medium::Memory => write!(f, "memory"),
            Medium::File => write!(f, "file"),
            Medium::Table => write!(f, "table"),
        }
    }
}

/// Append-only builder over a backing store.
pub trait Accumulator<T> {
    /// Appends an item. Fails with [`Error::AlreadySealed`](crate::Error::AlreadySealed) after completion.
    fn add(&mut self, item: T) -> Result<()>;

    /// Appends every item of the iterator, returns the number of appended items.
    fn add_range(&mut self, items: &mut dyn Iterator<Item = T>) -> Result<usize> {
        let mut added = 0;
        for item in items {
            self.add(item)?;
            added += 1;
        }
        return Ok(added);
    }

    /// Number of items appended so far.
    fn count(&self) -> usize;

    /// Medium currently in use.
    fn medium(&self) -> Medium;

    /// Seals the accumulator and returns a collection over the accumulated items.
    /// Fails with [`Error::AlreadySealed`](crate::Error::AlreadySealed) when called twice.
    fn complete(&mut self) -> Result<Collection<T>>;
}

/// Readable side of a backing store.
pub trait Backing<T>: Send + Sync {
    /// Opens a new independent reader.
    fn open(&self) -> Result<Box<dyn Iterator<Item = Result<T>>>>;

    fn medium(&self) -> Medium;
}

/// Creates accumulators on a secondary storage medium.
pub trait SpillFactory<T>: Send + Sync {
    fn open(&self) -> Result<Box<dyn Accumulator<T>>>;

    fn medium(&self) -> Medium;
}

/// Disposable, re-iterable, sized dataset.
pub struct Collection<T> {
    backing: Arc<dyn Backing<T>>,
    resource: Resource,
    token: Token,
    count: usize,
    sort_key: Option<SortKey>,
}

impl<T: 'static> Collection<T> {
    pub(crate) fn new(backing: Arc<dyn Backing<T>>, resource: Resource, count: usize) -> Result<Self> {
        let token = resource.acquire()?;

        return Ok(Collection {
            backing,
            resource,
            token,
            count,
            sort_key: None,
        });
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn medium(&self) -> Medium {
        self.backing.medium()
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn meta(&self) -> Meta {
        Meta {
            count: Some(self.count),
            sort_key: self.sort_key.clone(),
        }
    }

    /// Tags the collection as ordered by the given sort key.
    pub fn with_sort_key(mut self, sort_key: SortKey) -> Self {
        self.sort_key = Some(sort_key);
        self
    }

    /// Creates a new cursor over the collection.
    pub fn iter(&self) -> Result<Cursor<T>> {
        let token = self.resource.acquire()?;
        let inner = self.backing.open()?;

        return Ok(Cursor {
            inner: Some(inner),
            token,
            _backing: self.backing.clone(),
        });
    }

    /// Converts the collection into a single-pass stream carrying the collection metadata.
    /// The backing store is destroyed once the stream is exhausted or dropped.
    pub fn into_stream(self) -> Result<Stream<T>> {
        let cursor = self.iter()?;
        return Ok(Stream::new(cursor, self.meta()));
    }

    /// Releases the collection's own token, reporting a cleanup failure.
    pub fn close(mut self) -> Result<()> {
        self.token.release()
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("resource", &self.resource)
            .field("medium", &self.backing.medium())
            .field("count", &self.count)
            .field("sort_key", &self.sort_key)
            .finish()
    }
}

/// Single-pass forward reader over a collection.
///
/// Holds its own token, released on exhaustion or drop.
pub struct Cursor<T> {
    inner: Option<Box<dyn Iterator<Item = Result<T>>>>,
    token: Token,
    _backing: Arc<dyn Backing<T>>,
}

impl<T> Cursor<T> {
    /// Disposes the cursor, reporting a cleanup failure.
    pub fn close(mut self) -> Result<()> {
        self.inner = None;
        self.token.release()
    }
}

impl<T> Iterator for Cursor<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.as_mut()?.next();
        if item.is_none() {
            // reader goes away before the store may be deleted
            self.inner = None;
            if let Err(err) = self.token.release() {
                return Some(Err(err));
            }
        }
        item
    }
}

/// Policy choosing the medium of new accumulators.
pub struct AccumulatorSelector<T> {
    threshold: usize,
    spill: Arc<dyn SpillFactory<T>>,
    tracker: ResourceTracker,
}

impl<T> Clone for AccumulatorSelector<T> {
    fn clone(&self) -> Self {
        AccumulatorSelector {
            threshold: self.threshold,
            spill: self.spill.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl<T: Item> AccumulatorSelector<T> {
    /// Creates a selector.
    ///
    /// # Arguments
    /// * `threshold` - Number of items above which accumulation goes to the spill medium
    /// * `spill` - Factory of spill accumulators
    /// * `tracker` - Registry of memory buffer resources
    pub fn new(threshold: usize, spill: Arc<dyn SpillFactory<T>>, tracker: ResourceTracker) -> Self {
        AccumulatorSelector {
            threshold,
            spill,
            tracker,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Returns an accumulator for a known number of items.
    pub fn get_sized(&self, size_hint: usize) -> Result<Box<dyn Accumulator<T>>> {
        if size_hint > self.threshold {
            log::debug!("spilling {} items to {}", size_hint, self.spill.medium());
            self.spill.open()
        } else {
            Ok(Box::new(MemoryAccumulator::new(&self.tracker)))
        }
    }

    /// Returns an accumulator for an unknown number of items.
    /// It buffers in memory and spills once the threshold is reached.
    pub fn get(&self) -> Box<dyn Accumulator<T>> {
        Box::new(HybridAccumulator::new(self.threshold, self.spill.clone(), &self.tracker))
    }

    /// Returns an accumulator sized by the count the source carries, if any.
    pub fn get_for(&self, source: &Meta) -> Result<Box<dyn Accumulator<T>>> {
        match source.count {
            Some(count) => self.get_sized(count),
            None => Ok(self.get()),
        }
    }
}
