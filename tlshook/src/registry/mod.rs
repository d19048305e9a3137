//! Reference-counted registry of instrumented binaries.
//!
//! Many processes can run the same executable. The registry keys them by
//! [`BinaryId`] so that the expensive first registration (binary analysis and
//! hook installation) happens once per binary, and the matching teardown
//! happens when the last interested process goes away.
//!
//! Every binary has its own lock. The two index maps are only locked for
//! short lookups and are never held while a callback runs, so a slow
//! analysis of one binary does not block registrations of other binaries.

pub mod identity;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, warn};
use thiserror::Error;

pub use identity::{BinaryId, FilePath};

use crate::telemetry;

/// Invoked once the last process interested in a binary is gone. Receives
/// the resource produced by the first registration.
pub type UnregisterCallback<T> = Box<dyn FnOnce(&FilePath, T) -> anyhow::Result<()> + Send>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not resolve {}: {source}", path.display())]
    PathResolution {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pid {pid} is already registered for {}", path.display())]
    AlreadyRegistered { pid: u32, path: PathBuf },

    #[error("pid {0} is not registered")]
    NotFound(u32),

    #[error("registration of {} failed: {source:#}", path.display())]
    Registration {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl RegistryError {
    /// Duplicate registrations and unknown pids are expected races between
    /// the notification channel and the periodic sweep.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyRegistered { .. } | Self::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Registered,
    AlreadyRegistered,
    Duplicate,
    RegistrationFailed,
    PathResolutionFailed,
    Unregistered,
    PidRemoved,
    UnregisterNotFound,
    UnregisterFailed,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::AlreadyRegistered => "already_registered",
            Self::Duplicate => "duplicate",
            Self::RegistrationFailed => "registration_failed",
            Self::PathResolutionFailed => "path_resolution_failed",
            Self::Unregistered => "unregistered",
            Self::PidRemoved => "pid_removed",
            Self::UnregisterNotFound => "unregister_not_found",
            Self::UnregisterFailed => "unregister_failed",
        }
    }
}

#[derive(Debug, Default)]
struct RegistryStats {
    registered: AtomicU64,
    already_registered: AtomicU64,
    duplicate: AtomicU64,
    registration_failed: AtomicU64,
    path_resolution_failed: AtomicU64,
    unregistered: AtomicU64,
    pid_removed: AtomicU64,
    unregister_not_found: AtomicU64,
    unregister_failed: AtomicU64,
}

impl RegistryStats {
    fn counter(&self, outcome: Outcome) -> &AtomicU64 {
        match outcome {
            Outcome::Registered => &self.registered,
            Outcome::AlreadyRegistered => &self.already_registered,
            Outcome::Duplicate => &self.duplicate,
            Outcome::RegistrationFailed => &self.registration_failed,
            Outcome::PathResolutionFailed => &self.path_resolution_failed,
            Outcome::Unregistered => &self.unregistered,
            Outcome::PidRemoved => &self.pid_removed,
            Outcome::UnregisterNotFound => &self.unregister_not_found,
            Outcome::UnregisterFailed => &self.unregister_failed,
        }
    }
}

/// Point-in-time copy of the registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    /// Binaries that went from zero to one interested process.
    pub registered: u64,
    /// Processes added to a binary that was already registered.
    pub already_registered: u64,
    pub duplicate: u64,
    pub registration_failed: u64,
    pub path_resolution_failed: u64,
    /// Binaries that went back to zero interested processes.
    pub unregistered: u64,
    /// Processes removed from a binary, whether or not they were the last.
    pub pids_removed: u64,
    pub unregister_not_found: u64,
    pub unregister_failed: u64,
}

struct Registration<T> {
    path: FilePath,
    pids: HashSet<u32>,
    resource: Option<T>,
    on_last: Option<UnregisterCallback<T>>,
    /// Set once the entry left the index; holders of a stale handle retry.
    removed: bool,
}

type Slot<T> = Arc<Mutex<Registration<T>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct FileRegistry<T> {
    name: &'static str,
    by_id: Mutex<HashMap<BinaryId, Slot<T>>>,
    by_pid: Mutex<HashMap<u32, BinaryId>>,
    stats: RegistryStats,
}

impl<T> FileRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            by_id: Mutex::new(HashMap::new()),
            by_pid: Mutex::new(HashMap::new()),
            stats: RegistryStats::default(),
        }
    }

    /// Registers `pid` as interested in the binary at `path`.
    ///
    /// The first process of a binary runs `on_first`; if it fails nothing is
    /// recorded and a later call retries. Further processes of the same
    /// binary only run `on_already`. `on_last` is kept and invoked with the
    /// resource returned by `on_first` once the last process unregisters.
    ///
    /// Concurrent calls for the same binary wait for an in-flight
    /// `on_first` to finish instead of running it twice.
    pub fn register<F, G, U>(
        &self,
        path: impl Into<PathBuf>,
        pid: u32,
        on_first: F,
        on_last: G,
        on_already: U,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(&FilePath) -> anyhow::Result<T>,
        G: FnOnce(&FilePath, T) -> anyhow::Result<()> + Send + 'static,
        U: FnOnce(&FilePath),
    {
        let path = path.into();
        let file = match FilePath::resolve(&path) {
            Ok(file) => file,
            Err(source) => {
                self.count(Outcome::PathResolutionFailed);
                return Err(RegistryError::PathResolution { path, source });
            }
        };

        let displaced = loop {
            let slot = self.slot_for(&file);
            let mut entry = lock(&slot);
            if entry.removed {
                continue;
            }

            if entry.pids.contains(&pid) {
                self.count(Outcome::Duplicate);
                return Err(RegistryError::AlreadyRegistered {
                    pid,
                    path: entry.path.host_path.clone(),
                });
            }

            if entry.pids.is_empty() {
                match on_first(&file) {
                    Ok(resource) => {
                        entry.resource = Some(resource);
                        entry.on_last = Some(Box::new(on_last));
                        self.count(Outcome::Registered);
                    }
                    Err(source) => {
                        entry.removed = true;
                        self.remove_slot(file.id, &slot);
                        self.count(Outcome::RegistrationFailed);
                        return Err(RegistryError::Registration { path, source });
                    }
                }
            } else {
                on_already(&entry.path);
                self.count(Outcome::AlreadyRegistered);
            }

            entry.pids.insert(pid);
            break lock(&self.by_pid)
                .insert(pid, file.id)
                .filter(|previous| *previous != file.id);
        };

        // The pid was reused without us seeing the exit of its previous
        // incarnation.
        if let Some(previous) = displaced {
            debug!(
                "[{}] pid {} moved from binary {} to {}",
                self.name, pid, previous, file.id
            );
            self.remove_pid(previous, pid);
        }

        Ok(())
    }

    /// Drops the interest of `pid`. The last process of a binary triggers
    /// the stored unregister callback and removes the entry.
    pub fn unregister(&self, pid: u32) -> Result<(), RegistryError> {
        let id = lock(&self.by_pid).get(&pid).copied();
        let Some(id) = id else {
            self.count(Outcome::UnregisterNotFound);
            return Err(RegistryError::NotFound(pid));
        };

        if self.remove_pid(id, pid) {
            Ok(())
        } else {
            self.forget_pid(pid, id);
            self.count(Outcome::UnregisterNotFound);
            Err(RegistryError::NotFound(pid))
        }
    }

    /// Binary `pid` is currently registered against.
    pub fn identity_of(&self, pid: u32) -> Option<BinaryId> {
        lock(&self.by_pid).get(&pid).copied()
    }

    /// Snapshot of every pid currently tracked, across all binaries.
    pub fn registered_processes(&self) -> HashSet<u32> {
        lock(&self.by_pid).keys().copied().collect()
    }

    /// Current entries and their interested pids.
    pub fn entries(&self) -> BTreeMap<BinaryId, BTreeSet<u32>> {
        let slots: Vec<Slot<T>> = lock(&self.by_id).values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| {
                let entry = lock(slot);
                (!entry.removed && !entry.pids.is_empty())
                    .then(|| (entry.path.id, entry.pids.iter().copied().collect()))
            })
            .collect()
    }

    /// Unregisters every entry, running each unregister callback.
    pub fn clear(&self) {
        let slots: Vec<(BinaryId, Slot<T>)> = lock(&self.by_id).drain().collect();
        for (id, slot) in slots {
            let mut entry = lock(&slot);
            if entry.removed {
                continue;
            }
            let pids: Vec<u32> = entry.pids.drain().collect();
            for pid in pids {
                self.forget_pid(pid, id);
            }
            self.release(&mut entry);
            entry.removed = true;
            self.count(Outcome::Unregistered);
        }
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        let get = |outcome| self.stats.counter(outcome).load(Ordering::Relaxed);
        RegistryStatsSnapshot {
            registered: get(Outcome::Registered),
            already_registered: get(Outcome::AlreadyRegistered),
            duplicate: get(Outcome::Duplicate),
            registration_failed: get(Outcome::RegistrationFailed),
            path_resolution_failed: get(Outcome::PathResolutionFailed),
            unregistered: get(Outcome::Unregistered),
            pids_removed: get(Outcome::PidRemoved),
            unregister_not_found: get(Outcome::UnregisterNotFound),
            unregister_failed: get(Outcome::UnregisterFailed),
        }
    }

    /// Logs a summary of the registry and publishes its size.
    pub fn log(&self) {
        let binaries = lock(&self.by_id).len();
        let pids = lock(&self.by_pid).len();
        telemetry::record_registry_size(self.name, binaries as u64, pids as u64);
        debug!(
            "[{}] tracking {} binaries across {} processes: {:?}",
            self.name,
            binaries,
            pids,
            self.stats()
        );
    }

    fn count(&self, outcome: Outcome) {
        self.stats.counter(outcome).fetch_add(1, Ordering::Relaxed);
        telemetry::record_registry_event(self.name, outcome.as_str());
    }

    fn slot_for(&self, file: &FilePath) -> Slot<T> {
        lock(&self.by_id)
            .entry(file.id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Registration {
                    path: file.clone(),
                    pids: HashSet::new(),
                    resource: None,
                    on_last: None,
                    removed: false,
                }))
            })
            .clone()
    }

    fn remove_slot(&self, id: BinaryId, slot: &Slot<T>) {
        let mut by_id = lock(&self.by_id);
        if by_id.get(&id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            by_id.remove(&id);
        }
    }

    fn forget_pid(&self, pid: u32, id: BinaryId) {
        let mut by_pid = lock(&self.by_pid);
        if by_pid.get(&pid) == Some(&id) {
            by_pid.remove(&pid);
        }
    }

    /// Returns false if `pid` was not part of the entry for `id`. Only the
    /// removal of the last pid counts as an unregistration of the binary.
    fn remove_pid(&self, id: BinaryId, pid: u32) -> bool {
        let slot = lock(&self.by_id).get(&id).cloned();
        let Some(slot) = slot else {
            return false;
        };

        let mut entry = lock(&slot);
        if entry.removed || !entry.pids.remove(&pid) {
            return false;
        }
        self.forget_pid(pid, id);
        self.count(Outcome::PidRemoved);

        if entry.pids.is_empty() {
            self.release(&mut entry);
            entry.removed = true;
            self.remove_slot(id, &slot);
            self.count(Outcome::Unregistered);
        }
        true
    }

    fn release(&self, entry: &mut Registration<T>) {
        let (Some(resource), Some(on_last)) = (entry.resource.take(), entry.on_last.take()) else {
            return;
        };
        if let Err(e) = on_last(&entry.path, resource) {
            self.count(Outcome::UnregisterFailed);
            warn!(
                "[{}] failed to unregister {}: {:#}",
                self.name,
                entry.path.host_path.display(),
                e
            );
        }
    }
}
