//! External sorter.

use std::path::Path;
use std::sync::Arc;

use log;

use crate::batching::BatchingPolicy;
use crate::chunk::FileSpill;
use crate::error::{Error, Result};
use crate::merger::{merge, Union};
use crate::meta::{Comparer, Meta, SortKey};
use crate::resource::ResourceTracker;
use crate::storage::{AccumulatorSelector, Collection, Item, SpillFactory, DEFAULT_SPILL_THRESHOLD};
use crate::stream::{batches, Stream};
use crate::table::{TableBackend, TableSpill, DEFAULT_QUEUE_CAPACITY};

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
pub struct ExternalSorterBuilder<T> {
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Spill file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Number of items above which accumulation spills.
    spill_threshold: usize,
    /// Batch size policy.
    batching: BatchingPolicy,
    /// Database spilled to instead of files.
    table_backend: Option<Arc<dyn TableBackend<T>>>,
    /// Background table writer queue capacity.
    queue_capacity: usize,
    /// Registry of created resources.
    tracker: Option<ResourceTracker>,
}

impl<T: Item> ExternalSorterBuilder<T> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<T>> {
        let tracker = self.tracker.unwrap_or_else(ResourceTracker::global);

        let spill: Arc<dyn SpillFactory<T>> = match self.table_backend {
            Some(backend) => {
                log::info!("spilling to temporary tables (queue capacity: {})", self.queue_capacity);
                Arc::new(TableSpill::new(backend, self.queue_capacity, tracker.clone()))
            }
            None => {
                let tmp_dir = Self::init_tmp_directory(self.tmp_dir.as_deref())?;
                Arc::new(FileSpill::in_temp_dir(Arc::new(tmp_dir), self.rw_buf_size, tracker.clone()))
            }
        };
        log::info!("spill threshold: {} items", self.spill_threshold);

        return Ok(ExternalSorter {
            selector: AccumulatorSelector::new(self.spill_threshold, spill, tracker),
            batching: self.batching,
        });
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(Error::IO)?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<T> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets spill file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<T> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets the number of items above which accumulation spills to secondary storage.
    pub fn with_spill_threshold(mut self, threshold: usize) -> ExternalSorterBuilder<T> {
        self.spill_threshold = threshold;
        return self;
    }

    /// Sets batch size policy.
    pub fn with_batching(mut self, batching: BatchingPolicy) -> ExternalSorterBuilder<T> {
        self.batching = batching;
        return self;
    }

    /// Spills to temporary tables of the backend instead of files.
    pub fn with_table_backend(mut self, backend: Arc<dyn TableBackend<T>>) -> ExternalSorterBuilder<T> {
        self.table_backend = Some(backend);
        return self;
    }

    /// Sets background table writer queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> ExternalSorterBuilder<T> {
        self.queue_capacity = capacity;
        return self;
    }

    /// Sets the registry created resources are reported to.
    pub fn with_tracker(mut self, tracker: ResourceTracker) -> ExternalSorterBuilder<T> {
        self.tracker = Some(tracker);
        return self;
    }
}

impl<T> Default for ExternalSorterBuilder<T> {
    fn default() -> Self {
        ExternalSorterBuilder {
            tmp_dir: None,
            rw_buf_size: None,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            batching: BatchingPolicy::default(),
            table_backend: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tracker: None,
        }
    }
}

/// External sorter.
///
/// Sorting is achieved in two passes. During the first pass it sorts batches of data that each fit in
/// memory and writes them through accumulators, spilling to secondary storage when large, during the
/// second pass it merges the sorted batches together.
pub struct ExternalSorter<T> {
    selector: AccumulatorSelector<T>,
    batching: BatchingPolicy,
}

impl<T: Item> ExternalSorter<T> {
    /// Creates a sorter from an accumulator selector and a batching policy.
    pub fn new(selector: AccumulatorSelector<T>, batching: BatchingPolicy) -> Self {
        ExternalSorter { selector, batching }
    }

    pub fn selector(&self) -> &AccumulatorSelector<T> {
        &self.selector
    }

    pub fn batching(&self) -> &BatchingPolicy {
        &self.batching
    }

    /// Sorts data from the input using a comparer.
    /// Returns a stream tagged with the comparer sort key.
    ///
    /// Input already tagged with the same sort key is returned as is, without being consumed.
    /// On failure the input and every batch created so far are disposed.
    ///
    /// # Arguments
    /// * `source` - Input stream data to be fetched from
    /// * `comparer` - Comparer to be used to order items
    pub fn sort<C: Comparer<T>>(&self, source: Stream<T>, comparer: C) -> Result<Stream<T>> {
        if source.meta().is_sorted_by(&comparer) {
            log::debug!("input already sorted by {}", comparer.sort_key());
            return Ok(source);
        }

        let sort_key = comparer.sort_key();
        let source_meta = source.meta().clone();
        let batch_size = self.batching.batch_size(source_meta.count);
        log::debug!("sorting by {} (batch size: {})", sort_key, batch_size);

        let mut sorted_batches = Vec::new();
        for batch in batches(source, batch_size) {
            let mut batch = batch?;
            batch.sort_by(|a, b| comparer.compare(a, b));
            sorted_batches.push(self.create_batch(batch, &source_meta, &sort_key)?);
        }
        log::debug!("external sort preparation done ({} batches)", sorted_batches.len());

        match sorted_batches.len() {
            0 => Ok(Stream::empty().with_sort_key(sort_key)),
            1 => sorted_batches.remove(0).into_stream(),
            _ => {
                let inputs = sorted_batches
                    .into_iter()
                    .map(Collection::into_stream)
                    .collect::<Result<Vec<_>>>()?;
                merge(inputs, comparer, Union, &self.selector)
            }
        }
    }

    fn create_batch(&self, batch: Vec<T>, source_meta: &Meta, sort_key: &SortKey) -> Result<Collection<T>> {
        log::debug!("saving batch of {} items", batch.len());
        let mut accumulator = self.selector.get_for(source_meta)?;
        accumulator.add_range(&mut batch.into_iter())?;

        let collection = accumulator.complete()?;
        return Ok(collection.with_sort_key(sort_key.clone()));
    }
}
