#![forbid(unsafe_code)]

//! Reference counting of activated binary paths.
//!
//! Every path owns a slot guarded by its own lock; activation and deactivation
//! run while that lock is held, which gives exactly-once semantics per path
//! without serializing unrelated paths. A second, short-lived lock guards the
//! index from paths to slots and from referrers to paths. Lock order is always
//! slot, then index.

use crate::domain::FilePath;
use crate::error::Error;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Callback releasing everything an activation acquired.
pub type Deactivation = Box<dyn FnOnce(&FilePath) -> Result<(), Error> + Send>;

struct Activation {
    file: FilePath,
    referrers: FxHashSet<u32>,
    deactivate: Deactivation,
}

#[derive(Default)]
struct Slot {
    active: Option<Activation>,
    /// Set once the slot was removed from the index. Whoever finds a retired
    /// slot looks the path up again.
    retired: bool,
}

#[derive(Default)]
struct Index {
    paths: FxHashMap<Arc<Path>, Arc<Mutex<Slot>>>,
    referrers: FxHashMap<u32, FxHashSet<Arc<Path>>>,
}

#[derive(Debug, Default)]
struct Counters {
    activations: AtomicU64,
    activation_failures: AtomicU64,
    deactivations: AtomicU64,
    deactivation_failures: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_paths: usize,
    pub referrers: usize,
    pub activations: u64,
    pub activation_failures: u64,
    pub deactivations: u64,
    pub deactivation_failures: u64,
}

#[derive(Default)]
pub struct PathRegistry {
    index: Mutex<Index>,
    counters: Counters,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `pid` as a referrer of `path`, activating the path if it had none.
    ///
    /// When `activate` fails nothing is recorded and the error is returned
    /// wrapped in [`Error::Activation`]; a later call starts from scratch.
    pub fn register<A, D>(&self, path: &Path, pid: u32, activate: A, deactivate: D) -> Result<(), Error>
    where
        A: FnOnce(&FilePath) -> Result<(), Error>,
        D: FnOnce(&FilePath) -> Result<(), Error> + Send + 'static,
    {
        loop {
            let (key, slot) = self.slot_for(path);
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }

            if let Some(active) = guard.active.as_mut() {
                if active.referrers.insert(pid) {
                    self.index_referrer(pid, &key);
                }
                return Ok(());
            }

            let file = FilePath::from_arc(Arc::clone(&key), pid);
            if let Err(err) = activate(&file) {
                guard.retired = true;
                self.forget(&key, &slot);
                self.counters
                    .activation_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::Activation {
                    path: key.to_path_buf(),
                    source: Box::new(err),
                });
            }

            debug!(path = %key.display(), pid, "path activated");
            self.counters.activations.fetch_add(1, Ordering::Relaxed);
            guard.active = Some(Activation {
                file,
                referrers: FxHashSet::from_iter([pid]),
                deactivate: Box::new(deactivate),
            });
            self.index_referrer(pid, &key);
            return Ok(());
        }
    }

    /// Remove `pid` from every path it refers to, deactivating the paths left
    /// without referrers.
    ///
    /// Paths are forgotten even when their deactivation fails; the first
    /// failure is returned after every path was processed.
    pub fn unregister(&self, pid: u32) -> Result<(), Error> {
        let paths = self.index.lock().referrers.remove(&pid).unwrap_or_default();

        let mut first_err = None;
        for path in paths {
            let Some(slot) = self.index.lock().paths.get(&path).cloned() else {
                continue;
            };
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            let emptied = match guard.active.as_mut() {
                Some(active) => active.referrers.remove(&pid) && active.referrers.is_empty(),
                None => false,
            };
            if !emptied {
                continue;
            }

            let result = guard.active.take().map_or(Ok(()), |active| self.deactivate(active));
            guard.retired = true;
            self.forget(&path, &slot);
            if let Err(err) = result {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Deactivate every active path regardless of its referrers.
    pub fn clear(&self) {
        for (path, slot) in self.slots() {
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            if let Some(active) = guard.active.take() {
                // Failures are logged and counted by `deactivate`.
                let _ = self.deactivate(active);
            }
            guard.retired = true;
            self.forget(&path, &slot);
        }
        self.index.lock().referrers.clear();
    }

    /// Every referrer currently tracked.
    pub fn registered_processes(&self) -> FxHashSet<u32> {
        self.index.lock().referrers.keys().copied().collect()
    }

    /// Active paths, in no particular order.
    pub fn active_paths(&self) -> Vec<PathBuf> {
        self.slots()
            .into_iter()
            .filter(|(_, slot)| slot.lock().active.is_some())
            .map(|(path, _)| path.to_path_buf())
            .collect()
    }

    pub fn is_active(&self, path: &Path) -> bool {
        let slot = self.index.lock().paths.get(path).cloned();
        slot.is_some_and(|slot| slot.lock().active.is_some())
    }

    /// Referrers of `path`, empty if the path is not active.
    pub fn referrers(&self, path: &Path) -> FxHashSet<u32> {
        let Some(slot) = self.index.lock().paths.get(path).cloned() else {
            return FxHashSet::default();
        };
        let guard = slot.lock();
        guard
            .active
            .as_ref()
            .map(|active| active.referrers.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_paths: self.active_paths().len(),
            referrers: self.index.lock().referrers.len(),
            activations: self.counters.activations.load(Ordering::Relaxed),
            activation_failures: self.counters.activation_failures.load(Ordering::Relaxed),
            deactivations: self.counters.deactivations.load(Ordering::Relaxed),
            deactivation_failures: self.counters.deactivation_failures.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the index, so that slots can be locked without holding
    /// the index lock.
    fn slots(&self) -> Vec<(Arc<Path>, Arc<Mutex<Slot>>)> {
        self.index
            .lock()
            .paths
            .iter()
            .map(|(path, slot)| (Arc::clone(path), Arc::clone(slot)))
            .collect()
    }

    fn slot_for(&self, path: &Path) -> (Arc<Path>, Arc<Mutex<Slot>>) {
        let mut index = self.index.lock();
        if let Some((key, slot)) = index.paths.get_key_value(path) {
            return (Arc::clone(key), Arc::clone(slot));
        }
        let key: Arc<Path> = Arc::from(path);
        let slot = Arc::new(Mutex::new(Slot::default()));
        index.paths.insert(Arc::clone(&key), Arc::clone(&slot));
        (key, slot)
    }

    fn index_referrer(&self, pid: u32, path: &Arc<Path>) {
        self.index
            .lock()
            .referrers
            .entry(pid)
            .or_default()
            .insert(Arc::clone(path));
    }

    /// Drop `path` from the index, unless the entry already belongs to a newer
    /// slot.
    fn forget(&self, path: &Arc<Path>, slot: &Arc<Mutex<Slot>>) {
        let mut index = self.index.lock();
        if index
            .paths
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            index.paths.remove(path);
        }
        index.referrers.retain(|_, paths| {
            paths.remove(path);
            !paths.is_empty()
        });
    }

    fn deactivate(&self, active: Activation) -> Result<(), Error> {
        let Activation {
            file, deactivate, ..
        } = active;
        match deactivate(&file) {
            Ok(()) => {
                debug!(path = %file.path.display(), "path deactivated");
                self.counters.deactivations.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                warn!(path = %file.path.display(), %err, "deactivation failed");
                self.counters
                    .deactivation_failures
                    .fetch_add(1, Ordering::Relaxed);
                Err(Error::Deactivation {
                    path: file.path.to_path_buf(),
                    source: Box::new(err),
                })
            }
        }
    }
}

impl fmt::Debug for PathRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("PathRegistry")
            .field("active_paths", &stats.active_paths)
            .field("referrers", &stats.referrers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Calls {
        activations: AtomicUsize,
        deactivations: AtomicUsize,
    }

    impl Calls {
        fn activations(&self) -> usize {
            self.activations.load(Ordering::SeqCst)
        }

        fn deactivations(&self) -> usize {
            self.deactivations.load(Ordering::SeqCst)
        }
    }

    fn register(registry: &PathRegistry, calls: &Arc<Calls>, path: &str, pid: u32) -> Result<(), Error> {
        let on_activate = Arc::clone(calls);
        let on_deactivate = Arc::clone(calls);
        registry.register(
            Path::new(path),
            pid,
            move |_| {
                on_activate.activations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move |_| {
                on_deactivate.deactivations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
    }

    #[test]
    fn activates_once_and_deactivates_with_last_referrer() {
        let registry = PathRegistry::new();
        let calls = Arc::new(Calls::default());

        register(&registry, &calls, "/lib/libssl.so.3", 300).unwrap();
        register(&registry, &calls, "/lib/libssl.so.3", 301).unwrap();
        assert_eq!(calls.activations(), 1);

        registry.unregister(300).unwrap();
        assert_eq!(calls.deactivations(), 0);
        assert!(registry.is_active(Path::new("/lib/libssl.so.3")));

        registry.unregister(301).unwrap();
        assert_eq!(calls.deactivations(), 1);
        assert!(!registry.is_active(Path::new("/lib/libssl.so.3")));
        assert!(registry.registered_processes().is_empty());
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let registry = PathRegistry::new();
        let calls = Arc::new(Calls::default());

        register(&registry, &calls, "/usr/bin/app", 1).unwrap();
        register(&registry, &calls, "/usr/bin/app", 1).unwrap();

        assert_eq!(calls.activations(), 1);
        assert_eq!(
            registry.referrers(Path::new("/usr/bin/app")),
            FxHashSet::from_iter([1])
        );
        registry.unregister(1).unwrap();
        assert_eq!(calls.deactivations(), 1);
    }

    #[test]
    fn failed_activation_records_nothing() {
        let registry = PathRegistry::new();
        let err = registry
            .register(
                Path::new("/usr/bin/app"),
                7,
                |file| {
                    Err(Error::SymbolNotFound {
                        symbol: "SSL_write".into(),
                        path: file.path.to_path_buf(),
                    })
                },
                |_| Ok(()),
            )
            .unwrap_err();

        assert!(matches!(err.root(), Error::SymbolNotFound { .. }));
        assert!(!registry.is_active(Path::new("/usr/bin/app")));
        assert!(registry.registered_processes().is_empty());
        assert_eq!(registry.stats().activation_failures, 1);

        // A later event retries from scratch.
        let calls = Arc::new(Calls::default());
        register(&registry, &calls, "/usr/bin/app", 7).unwrap();
        assert_eq!(calls.activations(), 1);
    }

    #[test]
    fn failed_deactivation_still_forgets_the_path() {
        let registry = PathRegistry::new();
        registry
            .register(
                Path::new("/usr/bin/app"),
                7,
                |_| Ok(()),
                |file| Err(Error::BinaryNotAttachable(file.path.to_path_buf())),
            )
            .unwrap();

        let err = registry.unregister(7).unwrap_err();
        assert!(matches!(err, Error::Deactivation { .. }));
        assert!(!registry.is_active(Path::new("/usr/bin/app")));
        assert_eq!(registry.stats().deactivation_failures, 1);
    }

    #[test]
    fn unregister_only_touches_paths_of_the_pid() {
        let registry = PathRegistry::new();
        let calls = Arc::new(Calls::default());

        register(&registry, &calls, "/usr/bin/a", 1).unwrap();
        register(&registry, &calls, "/usr/lib/libc.so.6", 1).unwrap();
        register(&registry, &calls, "/usr/lib/libc.so.6", 2).unwrap();
        registry.unregister(1).unwrap();

        assert_eq!(calls.deactivations(), 1);
        assert_eq!(
            registry.active_paths(),
            vec![PathBuf::from("/usr/lib/libc.so.6")]
        );
        assert_eq!(registry.registered_processes(), FxHashSet::from_iter([2]));
    }

    #[test]
    fn clear_ignores_reference_counts() {
        let registry = PathRegistry::new();
        let calls = Arc::new(Calls::default());

        register(&registry, &calls, "/usr/bin/a", 1).unwrap();
        register(&registry, &calls, "/usr/bin/a", 2).unwrap();
        register(&registry, &calls, "/usr/bin/b", 3).unwrap();
        registry.clear();

        assert_eq!(calls.deactivations(), 2);
        assert!(registry.active_paths().is_empty());
        assert!(registry.registered_processes().is_empty());
        assert_eq!(registry.unregister(1).ok(), Some(()));
        assert_eq!(calls.deactivations(), 2);
    }

    #[test]
    fn path_cycles_through_activations() {
        let registry = PathRegistry::new();
        let calls = Arc::new(Calls::default());

        for pid in 1..=3 {
            register(&registry, &calls, "/usr/bin/a", pid).unwrap();
            registry.unregister(pid).unwrap();
        }
        assert_eq!(calls.activations(), 3);
        assert_eq!(calls.deactivations(), 3);
    }

    #[test]
    fn concurrent_referrers_activate_once() {
        let registry = Arc::new(PathRegistry::new());
        let calls = Arc::new(Calls::default());

        let handles: Vec<_> = (0..8u32)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    for round in 0..50u32 {
                        let pid = worker * 1000 + round;
                        register(&registry, &calls, "/usr/lib/libssl.so.3", pid).unwrap();
                        registry.unregister(pid).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.active_paths().is_empty());
        assert_eq!(calls.activations(), calls.deactivations());
        assert!(calls.activations() >= 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u8, u32),
        Unregister(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 1u32..6).prop_map(|(path, pid)| Op::Register(path, pid)),
            (1u32..6).prop_map(Op::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn matches_reference_counting_model(ops in prop::collection::vec(op(), 1..64)) {
            let registry = PathRegistry::new();
            let calls = Arc::new(Calls::default());
            let mut model: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
            let mut expected_activations = 0;
            let mut expected_deactivations = 0;

            for op in ops {
                match op {
                    Op::Register(path, pid) => {
                        let path = format!("/bin/p{path}");
                        register(&registry, &calls, &path, pid).unwrap();
                        let referrers = model.entry(path).or_default();
                        if referrers.is_empty() {
                            expected_activations += 1;
                        }
                        referrers.insert(pid);
                    }
                    Op::Unregister(pid) => {
                        registry.unregister(pid).unwrap();
                        for referrers in model.values_mut() {
                            if referrers.remove(&pid) && referrers.is_empty() {
                                expected_deactivations += 1;
                            }
                        }
                        model.retain(|_, referrers| !referrers.is_empty());
                    }
                }

                prop_assert_eq!(calls.activations(), expected_activations);
                prop_assert_eq!(calls.deactivations(), expected_deactivations);
                for (path, referrers) in &model {
                    let actual: BTreeSet<u32> =
                        registry.referrers(Path::new(path)).into_iter().collect();
                    prop_assert_eq!(&actual, referrers);
                }
                prop_assert_eq!(registry.stats().active_paths, model.len());
            }
        }
    }
}
