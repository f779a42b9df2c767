//! Spill medium backed by a temporary database table.
//!
//! The concrete database is an external collaborator described by [`TableBackend`], [`Table`] and
//! [`BulkWriter`]. Items are handed to a background writer thread through a bounded queue: `add`
//! blocks while the queue is full and fails once the writer aborted, `complete` drains the queue and
//! surfaces the writer's terminal error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log;

use crate::error::{BoxError, Error, Result};
use crate::resource::{Resource, ResourceTracker, Token};
use crate::storage::{Accumulator, Backing, Collection, Item, Medium, SpillFactory};

/// Default capacity of the background writer queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Bulk copy writer of a table.
pub trait BulkWriter<T>: Send {
    /// Writes a single item.
    fn write(&mut self, item: T) -> std::result::Result<(), BoxError>;

    /// Finishes the bulk copy, returns the number of written items.
    fn complete(self: Box<Self>) -> std::result::Result<usize, BoxError>;

    /// Cancels the bulk copy.
    fn abort(self: Box<Self>);
}

/// Temporary table.
pub trait Table<T>: Send + Sync {
    /// Human-readable table identity.
    fn name(&self) -> String;

    fn bulk_writer(&self) -> std::result::Result<Box<dyn BulkWriter<T>>, BoxError>;

    /// Reads the table content in insertion order.
    fn scan(&self) -> std::result::Result<Box<dyn Iterator<Item = std::result::Result<T, BoxError>>>, BoxError>;

    fn exists(&self) -> bool;

    fn drop_table(&self) -> std::result::Result<(), BoxError>;
}

/// Database able to create temporary tables.
pub trait TableBackend<T>: Send + Sync {
    fn create_table(&self) -> std::result::Result<Arc<dyn Table<T>>, BoxError>;
}

/// Creates [`TableAccumulator`]s on a backend.
pub struct TableSpill<T> {
    backend: Arc<dyn TableBackend<T>>,
    queue_capacity: usize,
    tracker: ResourceTracker,
}

impl<T> TableSpill<T> {
    pub fn new(backend: Arc<dyn TableBackend<T>>, queue_capacity: usize, tracker: ResourceTracker) -> Self {
        TableSpill {
            backend,
            queue_capacity,
            tracker,
        }
    }
}

impl<T: Item> SpillFactory<T> for TableSpill<T> {
    fn open(&self) -> Result<Box<dyn Accumulator<T>>> {
        let accumulator = TableAccumulator::new(self.backend.as_ref(), self.queue_capacity, &self.tracker)?;
        Ok(Box::new(accumulator))
    }

    fn medium(&self) -> Medium {
        Medium::Table
    }
}

type WorkerHandle = thread::JoinHandle<std::result::Result<usize, BoxError>>;

/// Accumulator feeding a temporary table through a background bulk writer.
pub struct TableAccumulator<T> {
    table: Arc<dyn Table<T>>,
    resource: Resource,
    token: Token,
    sender: Option<mpsc::SyncSender<T>>,
    worker: Option<WorkerHandle>,
    cancelled: Arc<AtomicBool>,
    count: usize,
    sealed: bool,
}

impl<T: Item> TableAccumulator<T> {
    pub fn new(backend: &dyn TableBackend<T>, queue_capacity: usize, tracker: &ResourceTracker) -> Result<Self> {
        let table = backend
            .create_table()
            .map_err(|err| Error::backend("temporary table creation failed", err))?;
        let name = table.name();

        let resource = Resource::new(name.clone(), tracker, {
            let table = table.clone();
            move || table.drop_table()
        });
        let token = resource.acquire()?;

        let writer = table
            .bulk_writer()
            .map_err(|err| Error::backend(format!("bulk copy into {} not started", name), err))?;

        let (sender, receiver) = mpsc::sync_channel(queue_capacity);
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = thread::Builder::new().name(format!("spill-writer {}", name)).spawn({
            let cancelled = cancelled.clone();
            move || write_all(writer, receiver, cancelled)
        })?;
        log::debug!("spill table {} created", name);

        return Ok(TableAccumulator {
            table,
            resource,
            token,
            sender: Some(sender),
            worker: Some(worker),
            cancelled,
            count: 0,
            sealed: false,
        });
    }

    fn join_worker(&mut self) -> Result<usize> {
        let context = format!("bulk copy into {} failed", self.table.name());
        match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok(Ok(written)) => Ok(written),
                Ok(Err(err)) => Err(Error::backend(context, err)),
                Err(_) => Err(Error::backend(context, "spill writer panicked")),
            },
            None => Err(Error::backend(context, "spill writer already aborted")),
        }
    }
}

fn write_all<T>(
    mut writer: Box<dyn BulkWriter<T>>,
    receiver: mpsc::Receiver<T>,
    cancelled: Arc<AtomicBool>,
) -> std::result::Result<usize, BoxError> {
    for item in receiver.iter() {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        if let Err(err) = writer.write(item) {
            writer.abort();
            return Err(err);
        }
    }

    if cancelled.load(Ordering::SeqCst) {
        writer.abort();
        return Err("bulk copy cancelled".into());
    }
    writer.complete()
}

impl<T: Item> Accumulator<T> for TableAccumulator<T> {
    fn add(&mut self, item: T) -> Result<()> {
        if self.sealed {
            return Err(Error::AlreadySealed);
        }
        let sender = match self.sender.as_ref() {
            Some(sender) => sender,
            None => return Err(self.join_worker().err().unwrap_or(Error::AlreadySealed)),
        };

        if sender.send(item).is_err() {
            // the writer hung up, its result tells why
            self.sender = None;
            return match self.join_worker() {
                Ok(_) => Err(Error::backend(
                    format!("bulk copy into {} failed", self.table.name()),
                    "spill writer stopped early",
                )),
                Err(err) => Err(err),
            };
        }
        self.count += 1;
        return Ok(());
    }

    fn count(&self) -> usize {
        self.count
    }

    fn medium(&self) -> Medium {
        Medium::Table
    }

    fn complete(&mut self) -> Result<Collection<T>> {
        if self.sealed {
            return Err(Error::AlreadySealed);
        }
        self.sealed = true;
        self.sender = None;

        let written = self.join_worker()?;
        if written != self.count {
            log::warn!(
                "bulk copy into {} reported {} rows for {} items",
                self.table.name(),
                written,
                self.count
            );
        }

        log::debug!("spill table {} sealed with {} items", self.table.name(), self.count);
        let backing = Arc::new(TableBacking {
            table: self.table.clone(),
        });
        Collection::new(backing, self.resource.clone(), self.count)
    }
}

impl<T> Drop for TableAccumulator<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cancelled.store(true, Ordering::SeqCst);
            self.sender = None;
            if let Ok(Err(err)) = worker.join() {
                log::debug!("spill writer of {} stopped: {}", self.table.name(), err);
            }
        }
        if let Err(err) = self.token.release() {
            log::error!("spill table {} cleanup failed: {}", self.table.name(), err);
        }
    }
}

struct TableBacking<T> {
    table: Arc<dyn Table<T>>,
}

impl<T: Item> Backing<T> for TableBacking<T> {
    fn open(&self) -> Result<Box<dyn Iterator<Item = Result<T>>>> {
        let name = self.table.name();
        let rows = self
            .table
            .scan()
            .map_err(|err| Error::backend(format!("scan of {} failed", name), err))?;

        Ok(Box::new(rows.map(move |row| {
            row.map_err(|err| Error::backend(format!("scan of {} failed", name), err))
        })))
    }

    fn medium(&self) -> Medium {
        Medium::Table
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rstest::*;

    use super::{BulkWriter, Table, TableAccumulator, TableBackend};
    use crate::error::{BoxError, Error};
    use crate::resource::ResourceTracker;
    use crate::storage::{Accumulator, Medium};

    /// In-memory table double, optionally failing after a number of writes.
    pub(crate) struct MemTable {
        name: String,
        rows: Arc<Mutex<Vec<i32>>>,
        dropped: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    struct MemWriter {
        rows: Arc<Mutex<Vec<i32>>>,
        pending: Vec<i32>,
        fail_after: Option<usize>,
    }

    impl BulkWriter<i32> for MemWriter {
        fn write(&mut self, item: i32) -> Result<(), BoxError> {
            if Some(self.pending.len()) == self.fail_after {
                return Err("constraint violation".into());
            }
            self.pending.push(item);
            Ok(())
        }

        fn complete(self: Box<Self>) -> Result<usize, BoxError> {
            let written = self.pending.len();
            self.rows.lock().extend(self.pending);
            Ok(written)
        }

        fn abort(self: Box<Self>) {}
    }

    impl Table<i32> for MemTable {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn bulk_writer(&self) -> Result<Box<dyn BulkWriter<i32>>, BoxError> {
            Ok(Box::new(MemWriter {
                rows: self.rows.clone(),
                pending: Vec::new(),
                fail_after: self.fail_after,
            }))
        }

        fn scan(&self) -> Result<Box<dyn Iterator<Item = Result<i32, BoxError>>>, BoxError> {
            let rows = self.rows.lock().clone();
            Ok(Box::new(rows.into_iter().map(Ok)))
        }

        fn exists(&self) -> bool {
            self.dropped.load(Ordering::SeqCst) == 0
        }

        fn drop_table(&self) -> Result<(), BoxError> {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            self.rows.lock().clear();
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct MemBackend {
        pub(crate) created: AtomicUsize,
        pub(crate) dropped: Arc<AtomicUsize>,
        pub(crate) fail_after: Option<usize>,
        pub(crate) fail_create_at: Option<usize>,
    }

    impl TableBackend<i32> for MemBackend {
        fn create_table(&self) -> Result<Arc<dyn Table<i32>>, BoxError> {
            let id = self.created.load(Ordering::SeqCst);
            if Some(id) == self.fail_create_at {
                return Err("out of table space".into());
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MemTable {
                name: format!("#spill_{}", id),
                rows: Arc::new(Mutex::new(Vec::new())),
                dropped: self.dropped.clone(),
                fail_after: self.fail_after,
            }))
        }
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(1024)]
    fn test_table_accumulator(#[case] queue_capacity: usize) {
        let tracker = ResourceTracker::new();
        let backend = MemBackend::default();
        let saved = Vec::from_iter(0..100);

        let mut accumulator = TableAccumulator::new(&backend, queue_capacity, &tracker).unwrap();
        assert_eq!(accumulator.medium(), Medium::Table);
        accumulator.add_range(&mut saved.clone().into_iter()).unwrap();
        assert_eq!(accumulator.count(), 100);

        let collection = accumulator.complete().unwrap();
        assert!(matches!(accumulator.add(1), Err(Error::AlreadySealed)));
        assert_eq!(collection.medium(), Medium::Table);
        assert_eq!(collection.len(), 100);

        let restored: Vec<i32> = collection.iter().unwrap().map(Result::unwrap).collect();
        assert_eq!(restored, saved);

        drop(accumulator);
        assert_eq!(backend.dropped.load(Ordering::SeqCst), 0);
        drop(collection);
        assert_eq!(backend.dropped.load(Ordering::SeqCst), 1);
        assert!(tracker.live().is_empty());
    }

    #[test]
    fn test_writer_failure_surfaces() {
        let tracker = ResourceTracker::new();
        let backend = MemBackend {
            fail_after: Some(3),
            ..MemBackend::default()
        };

        let mut accumulator = TableAccumulator::new(&backend, 1, &tracker).unwrap();
        let mut failure = None;
        for item in 0..100 {
            if let Err(err) = accumulator.add(item) {
                failure = Some(err);
                break;
            }
        }
        let failure = match failure {
            Some(err) => err,
            None => accumulator.complete().unwrap_err(),
        };

        match failure {
            Error::SpillBackendFailure { context, source } => {
                assert_eq!(context, "bulk copy into #spill_0 failed");
                assert_eq!(source.to_string(), "constraint violation");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        drop(accumulator);
        assert_eq!(backend.dropped.load(Ordering::SeqCst), 1);
        assert!(tracker.live().is_empty());
    }

    #[test]
    fn test_abandoned_accumulator_drops_table() {
        let tracker = ResourceTracker::new();
        let backend = MemBackend::default();

        let mut accumulator = TableAccumulator::new(&backend, 2, &tracker).unwrap();
        accumulator.add_range(&mut (0..10)).unwrap();
        drop(accumulator);

        assert_eq!(backend.dropped.load(Ordering::SeqCst), 1);
        assert!(tracker.live().is_empty());
        assert_eq!(tracker.leaks(), 0);
    }
}
