//! Single-flight admission: at most one operation per resource key.
//!
//! One mutex guards the whole key map. Acquire and release are O(1) map
//! operations; engine construction, which may touch the filesystem, runs
//! outside the lock and the insert is re-checked afterwards.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use pkgsvc_core::ResourceKey;
use tracing::debug;

use crate::engine::{EngineError, EngineFactory, PackageEngine};

/// Engine shared between the registry and the worker running it. The busy
/// flag guarantees the mutex is never contended.
type SharedEngine = Arc<Mutex<Box<dyn PackageEngine>>>;

// ---------------------------------------------------------------------------
// AcquireError
// ---------------------------------------------------------------------------

/// Why `acquire` did not hand out a lease.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// Another operation is running against the key. Not fatal; the caller
    /// may retry later.
    #[error("busy")]
    Busy,
    /// The engine for a new key could not be constructed. No handle is
    /// recorded for the key.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// ResourceHandle
// ---------------------------------------------------------------------------

/// Per-key state. Created on first reference and kept for the lifetime of
/// the registry.
struct ResourceHandle {
    engine: SharedEngine,
    busy: bool,
}

impl ResourceHandle {
    fn new(engine: Box<dyn PackageEngine>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            busy: false,
        }
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

struct RegistryInner {
    handles: Mutex<HashMap<ResourceKey, ResourceHandle>>,
    factory: Arc<dyn EngineFactory>,
}

impl RegistryInner {
    fn release(&self, key: &ResourceKey) -> bool {
        match self.handles.lock().get_mut(key) {
            Some(handle) => std::mem::replace(&mut handle.busy, false),
            None => false,
        }
    }
}

/// Thread-safe map from resource key to handle state with atomic
/// acquire-or-reject semantics.
///
/// Cloning is cheap and yields a view of the same registry.
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<RegistryInner>,
}

impl OperationRegistry {
    #[must_use]
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                handles: Mutex::new(HashMap::new()),
                factory,
            }),
        }
    }

    /// Marks the handle for `key` busy and returns a lease on it, opening
    /// the engine on first use.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::Busy`] without changing any state if an
    /// operation is already running against `key`, or
    /// [`AcquireError::Engine`] if the engine could not be opened.
    pub fn acquire(&self, key: &ResourceKey) -> Result<Lease, AcquireError> {
        {
            let mut handles = self.inner.handles.lock();
            if let Some(handle) = handles.get_mut(key) {
                return self.lease(key, handle);
            }
        }

        let engine = self.inner.factory.open(key)?;

        let mut handles = self.inner.handles.lock();
        let handle = match handles.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(package = %key, "discarding engine opened by a concurrent acquire");
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                debug!(package = %key, "registered new resource handle");
                entry.insert(ResourceHandle::new(engine))
            }
        };
        self.lease(key, handle)
    }

    fn lease(&self, key: &ResourceKey, handle: &mut ResourceHandle) -> Result<Lease, AcquireError> {
        if handle.busy {
            return Err(AcquireError::Busy);
        }
        handle.busy = true;
        Ok(Lease {
            key: key.clone(),
            engine: Arc::clone(&handle.engine),
            registry: Arc::clone(&self.inner),
            released: false,
        })
    }

    #[must_use]
    pub fn is_busy(&self, key: &ResourceKey) -> bool {
        self.inner
            .handles
            .lock()
            .get(key)
            .is_some_and(|handle| handle.busy)
    }

    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.inner.handles.lock().contains_key(key)
    }

    /// Number of known resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.handles.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of resources with an operation running.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.inner
            .handles
            .lock()
            .values()
            .filter(|handle| handle.busy)
            .count()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("resources", &self.len())
            .field("busy", &self.busy_count())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Exclusive access to one resource's engine.
///
/// The handle is released exactly once: by [`Lease::release`], or on drop
/// (including while unwinding from a panicking workload).
pub struct Lease {
    key: ResourceKey,
    engine: SharedEngine,
    registry: Arc<RegistryInner>,
    released: bool,
}

impl Lease {
    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Locks the engine. Uncontended while the lease is held.
    pub(crate) fn engine(&self) -> MutexGuard<'_, Box<dyn PackageEngine>> {
        self.engine.lock()
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.key);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use proptest::prelude::*;

    use super::*;
    use crate::engine::testing::ScriptedFactory;

    fn key(path: &str) -> ResourceKey {
        ResourceKey::parse(path).unwrap()
    }

    #[test]
    fn first_acquire_opens_engine_once() {
        let factory = ScriptedFactory::lines(&[]);
        let registry = OperationRegistry::new(factory.clone());
        let a = key("/pkg/A");

        let lease = registry.acquire(&a).unwrap();
        assert!(registry.is_busy(&a));
        lease.release();
        assert!(!registry.is_busy(&a));

        registry.acquire(&a).unwrap().release();
        assert_eq!(factory.opens(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn second_acquire_is_rejected_while_busy() {
        let registry = OperationRegistry::new(ScriptedFactory::lines(&[]));
        let a = key("/pkg/A");

        let lease = registry.acquire(&a).unwrap();
        assert!(matches!(registry.acquire(&a), Err(AcquireError::Busy)));
        assert!(registry.is_busy(&a));

        drop(lease);
        assert!(registry.acquire(&a).is_ok());
    }

    #[test]
    fn distinct_keys_do_not_block_each_other() {
        let registry = OperationRegistry::new(ScriptedFactory::lines(&[]));
        let _a = registry.acquire(&key("/pkg/A")).unwrap();
        let _b = registry.acquire(&key("/pkg/B")).unwrap();
        assert_eq!(registry.busy_count(), 2);
    }

    #[test]
    fn construction_failure_records_nothing() {
        let registry = OperationRegistry::new(ScriptedFactory::rejecting("no manifest"));
        let a = key("/pkg/A");

        let err = registry.acquire(&a).unwrap_err();
        assert!(matches!(err, AcquireError::Engine(EngineError::Construction { .. })));
        assert!(err.to_string().contains("no manifest"));
        assert!(!registry.contains(&a));
        assert!(!registry.is_busy(&a));
    }

    #[test]
    fn release_of_unknown_key_is_a_no_op() {
        let registry = OperationRegistry::new(ScriptedFactory::lines(&[]));
        assert!(!registry.inner.release(&key("/pkg/unknown")));
        assert!(registry.is_empty());
    }

    #[test]
    fn dropping_a_stale_lease_keeps_new_holder_busy() {
        let registry = OperationRegistry::new(ScriptedFactory::lines(&[]));
        let a = key("/pkg/A");

        let mut stale = registry.acquire(&a).unwrap();
        stale.release_once();
        let current = registry.acquire(&a).unwrap();
        drop(stale);
        assert!(registry.is_busy(&a));
        drop(current);
        assert!(!registry.is_busy(&a));
    }

    #[test]
    fn lease_releases_only_once() {
        let registry = OperationRegistry::new(ScriptedFactory::lines(&[]));
        let a = key("/pkg/A");

        let lease = registry.acquire(&a).unwrap();
        lease.release();
        let second = registry.acquire(&a).unwrap();
        // The first lease is gone; nothing may clear the second one's flag.
        assert!(registry.is_busy(&a));
        drop(second);
        assert!(!registry.is_busy(&a));
    }

    #[test]
    fn lease_released_when_holder_panics() {
        let registry = OperationRegistry::new(ScriptedFactory::lines(&[]));
        let a = key("/pkg/A");
        let lease = registry.acquire(&a).unwrap();

        let result = thread::spawn(move || {
            let _lease = lease;
            panic!("workload blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!registry.is_busy(&a));
    }

    #[test]
    fn concurrent_acquires_admit_exactly_one() {
        const THREADS: usize = 16;
        let factory = ScriptedFactory::lines(&[]);
        let registry = OperationRegistry::new(factory.clone());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.acquire(&key("/pkg/A")).ok()
                })
            })
            .collect();

        let leases: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(leases.len(), 1);
        assert_eq!(registry.len(), 1);
        assert!(factory.opens() >= 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Acquire(usize),
        Release(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0..3usize).prop_map(Step::Acquire),
            (0..3usize).prop_map(Step::Release),
        ]
    }

    proptest! {
        #[test]
        fn busy_is_bracketed_by_acquire_and_release(steps in prop::collection::vec(step(), 1..64)) {
            let registry = OperationRegistry::new(ScriptedFactory::lines(&[]));
            let keys = [key("/pkg/a"), key("/pkg/b"), key("/pkg/c")];
            let mut leases: [Option<Lease>; 3] = [None, None, None];

            for step in steps {
                match step {
                    Step::Acquire(i) => {
                        let result = registry.acquire(&keys[i]);
                        if leases[i].is_some() {
                            prop_assert!(matches!(result, Err(AcquireError::Busy)));
                        } else {
                            leases[i] = Some(result.unwrap());
                        }
                    }
                    Step::Release(i) => {
                        if let Some(lease) = leases[i].take() {
                            lease.release();
                        }
                    }
                }
                for i in 0..3 {
                    prop_assert_eq!(registry.is_busy(&keys[i]), leases[i].is_some());
                }
            }
        }
    }
}
