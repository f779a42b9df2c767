//! Reference counted backing store lifetime.
//!
//! A [`Resource`] guards a physical backing store (temporary file, temporary table, memory buffer).
//! Every borrower holds a [`Token`] obtained through [`Resource::acquire`]. The cleanup callback runs
//! exactly once, at the moment the last outstanding token is released. The decision is taken under a
//! lock while the callback itself runs after the lock is dropped, so slow cleanups (file deletion,
//! table drop) never block concurrent acquisitions, which observe [`Error::AlreadyReleased`] right away.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log;
use parking_lot::Mutex;

use crate::error::{BoxError, Error, Result};

/// Resource cleanup callback.
pub type Cleanup = Box<dyn FnOnce() -> std::result::Result<(), BoxError> + Send>;

struct State {
    ref_count: usize,
    released: bool,
    cleanup: Option<Cleanup>,
}

struct Inner {
    id: u64,
    name: String,
    state: Mutex<State>,
    tracker: ResourceTracker,
}

impl Inner {
    fn release(&self) -> Result<()> {
        let cleanup = {
            let mut state = self.state.lock();
            state.ref_count = state
                .ref_count
                .checked_sub(1)
                .expect("resource reference count underflow");
            if state.ref_count > 0 {
                return Ok(());
            }
            state.released = true;
            state.cleanup.take()
        };

        log::debug!("releasing resource {}", self.name);
        return self.run_cleanup(cleanup);
    }

    fn run_cleanup(&self, cleanup: Option<Cleanup>) -> Result<()> {
        self.tracker.unregister(self.id);
        match cleanup {
            Some(cleanup) => cleanup().map_err(|source| Error::Cleanup {
                resource: self.name.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.released {
            return;
        }

        // owner and all tokens are gone but the count never reached zero
        state.released = true;
        let cleanup = state.cleanup.take();
        self.tracker.record_leak();
        log::warn!(
            "resource {} leaked with {} outstanding references",
            self.name,
            state.ref_count
        );

        if let Err(err) = self.run_cleanup(cleanup) {
            panic!("leaked resource cleanup failed: {}", err);
        }
    }
}

/// Shared-ownership lifetime primitive guarding a backing store.
///
/// Cloning a resource does not affect its reference count, only tokens do.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<Inner>,
}

impl Resource {
    /// Creates a resource registered in the provided tracker.
    ///
    /// # Arguments
    /// * `name` - Human-readable backing store identity used for diagnostics
    /// * `tracker` - Registry the resource is reported to while alive
    /// * `cleanup` - Callback destroying the backing store
    pub fn new<F>(name: impl Into<String>, tracker: &ResourceTracker, cleanup: F) -> Self
    where
        F: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let name = name.into();
        let id = tracker.register(&name);

        return Resource {
            inner: Arc::new(Inner {
                id,
                name,
                state: Mutex::new(State {
                    ref_count: 0,
                    released: false,
                    cleanup: Some(Box::new(cleanup)),
                }),
                tracker: tracker.clone(),
            }),
        };
    }

    /// Creates a resource without a cleanup callback.
    pub fn detached(name: impl Into<String>, tracker: &ResourceTracker) -> Self {
        Self::new(name, tracker, || Ok(()))
    }

    /// Acquires a new token incrementing the reference count.
    pub fn acquire(&self) -> Result<Token> {
        let trace = Backtrace::capture();
        {
            let mut state = self.inner.state.lock();
            if state.released {
                return Err(Error::AlreadyReleased {
                    resource: self.inner.name.clone(),
                });
            }
            state.ref_count += 1;
        }

        return Ok(Token {
            inner: Some(self.inner.clone()),
            trace,
        });
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().ref_count
    }

    pub fn is_released(&self) -> bool {
        self.inner.state.lock().released
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Resource")
            .field("name", &self.inner.name)
            .field("ref_count", &state.ref_count)
            .field("released", &state.released)
            .finish()
    }
}

/// One-shot borrow of a [`Resource`].
///
/// Releasing is idempotent and happens on drop at the latest.
pub struct Token {
    inner: Option<Arc<Inner>>,
    trace: Backtrace,
}

impl Token {
    /// Releases the token. Second and later calls are no-ops.
    /// Returns the cleanup error if this release destroyed the backing store.
    pub fn release(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => inner.release(),
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    /// Stack trace captured at acquisition.
    pub fn trace(&self) -> &Backtrace {
        &self.trace
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("resource release failed: {}", err);
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("resource", &self.inner.as_ref().map(|inner| inner.name.as_str()))
            .finish()
    }
}

#[derive(Default)]
struct TrackerInner {
    next_id: AtomicU64,
    live: Mutex<BTreeMap<u64, String>>,
    leaks: AtomicUsize,
}

/// Diagnostic registry of resources not yet cleaned up.
///
/// Populated in debug and test builds only. The leak counter is always maintained.
/// Tests use a dedicated tracker per case so that parallel cases do not observe each other.
#[derive(Clone, Default)]
pub struct ResourceTracker {
    inner: Arc<TrackerInner>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        ResourceTracker::default()
    }

    /// Process-wide tracker used when none is configured.
    pub fn global() -> ResourceTracker {
        static GLOBAL: OnceLock<ResourceTracker> = OnceLock::new();
        GLOBAL.get_or_init(ResourceTracker::new).clone()
    }

    /// Names of the resources whose cleanup has not run yet.
    pub fn live(&self) -> Vec<String> {
        self.inner.live.lock().values().cloned().collect()
    }

    /// Number of resources dropped without their reference count ever reaching zero.
    pub fn leaks(&self) -> usize {
        self.inner.leaks.load(Ordering::SeqCst)
    }

    /// Clears the registry and the leak counter.
    pub fn reset(&self) {
        self.inner.live.lock().clear();
        self.inner.leaks.store(0, Ordering::SeqCst);
    }

    fn register(&self, name: &str) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if cfg!(any(test, debug_assertions)) {
            self.inner.live.lock().insert(id, name.to_string());
        }
        id
    }

    fn unregister(&self, id: u64) {
        if cfg!(any(test, debug_assertions)) {
            self.inner.live.lock().remove(&id);
        }
    }

    fn record_leak(&self) {
        self.inner.leaks.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("live", &self.live())
            .field("leaks", &self.leaks())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use rstest::*;

    use super::{Resource, ResourceTracker};
    use crate::error::Error;

    fn counted(tracker: &ResourceTracker, name: &str) -> (Resource, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let resource = Resource::new(name, tracker, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (resource, calls)
    }

    #[test]
    fn test_cleanup_on_last_release() {
        let tracker = ResourceTracker::new();
        let (resource, calls) = counted(&tracker, "file-1");

        let mut first = resource.acquire().unwrap();
        let mut second = resource.acquire().unwrap();
        assert_eq!(resource.ref_count(), 2);

        first.release().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.live(), vec!["file-1".to_string()]);

        second.release().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(resource.is_released());
        assert!(tracker.live().is_empty());
        assert_eq!(tracker.leaks(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let tracker = ResourceTracker::new();
        let (resource, calls) = counted(&tracker, "file-2");

        let mut first = resource.acquire().unwrap();
        let _second = resource.acquire().unwrap();

        first.release().unwrap();
        first.release().unwrap();
        drop(first);

        assert_eq!(resource.ref_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_acquire_after_release() {
        let tracker = ResourceTracker::new();
        let (resource, calls) = counted(&tracker, "table-1");

        drop(resource.acquire().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        match resource.acquire() {
            Err(Error::AlreadyReleased { resource }) => assert_eq!(resource, "table-1"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_failure_is_reported() {
        let tracker = ResourceTracker::new();
        let resource = Resource::new("broken", &tracker, || {
            Err(Box::new(io::Error::new(io::ErrorKind::Other, "disk gone")) as _)
        });

        let mut token = resource.acquire().unwrap();
        match token.release() {
            Err(Error::Cleanup { resource, .. }) => assert_eq!(resource, "broken"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(tracker.live().is_empty());
    }

    #[test]
    fn test_leak_is_recorded() {
        let tracker = ResourceTracker::new();
        let (resource, calls) = counted(&tracker, "never-acquired");

        drop(resource);

        assert_eq!(tracker.leaks(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tracker.live().is_empty());
    }

    #[test]
    fn test_forgotten_token_stays_live() {
        let tracker = ResourceTracker::new();
        let (resource, calls) = counted(&tracker, "forgotten");

        std::mem::forget(resource.acquire().unwrap());
        drop(resource);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.live(), vec!["forgotten".to_string()]);

        tracker.reset();
        assert!(tracker.live().is_empty());
    }

    #[test]
    fn test_live_registry_lists_open_resources() {
        let tracker = ResourceTracker::new();
        let (first, _) = counted(&tracker, "spill-a");
        let (second, _) = counted(&tracker, "spill-b");
        let first_token = first.acquire().unwrap();
        let second_token = second.acquire().unwrap();

        assert_eq!(tracker.live(), vec!["spill-a".to_string(), "spill-b".to_string()]);

        drop(first_token);
        assert_eq!(tracker.live(), vec!["spill-b".to_string()]);
        drop(second_token);
        assert!(tracker.live().is_empty());
    }

    #[test]
    fn test_token_keeps_acquisition_trace() {
        let tracker = ResourceTracker::new();
        let (resource, _) = counted(&tracker, "traced");

        let mut token = resource.acquire().unwrap();
        let _ = token.trace().status();
        assert_eq!(resource.ref_count(), 1);

        token.release().unwrap();
        assert!(token.is_released());
        assert!(matches!(resource.acquire(), Err(Error::AlreadyReleased { .. })));
        assert_eq!(resource.ref_count(), 0);
    }

    #[rstest]
    #[case(2, 100)]
    #[case(8, 1000)]
    #[case(32, 200)]
    fn test_concurrent_acquire_release(#[case] threads: usize, #[case] rounds: usize) {
        let tracker = ResourceTracker::new();
        let (resource, calls) = counted(&tracker, "shared");
        let mut owner = resource.acquire().unwrap();

        rayon::scope(|scope| {
            for _ in 0..threads {
                let resource = resource.clone();
                scope.spawn(move |_| {
                    for _ in 0..rounds {
                        let mut token = resource.acquire().unwrap();
                        token.release().unwrap();
                        token.release().unwrap();
                    }
                });
            }
        });

        assert_eq!(resource.ref_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        owner.release().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resource.ref_count(), 0);
        assert!(tracker.live().is_empty());
    }

    #[rstest]
    #[case(4)]
    #[case(16)]
    fn test_concurrent_race_to_zero(#[case] threads: usize) {
        let tracker = ResourceTracker::new();
        let (resource, calls) = counted(&tracker, "racy");

        rayon::scope(|scope| {
            for _ in 0..threads {
                let resource = resource.clone();
                scope.spawn(move |_| {
                    for _ in 0..100 {
                        if let Ok(mut token) = resource.acquire() {
                            token.release().unwrap();
                        }
                    }
                });
            }
        });

        // the count reaches zero at some point of the race, but only once
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resource.ref_count(), 0);
    }
}
