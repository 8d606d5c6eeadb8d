#![forbid(unsafe_code)]

use crate::exclusion::ExclusionCounts;
use crate::registry::RegistryStats;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Live PIDs seen in the process table, our own excluded.
    pub live: usize,
    /// Newly discovered PIDs that received hooks.
    pub attached: usize,
    /// Tracked PIDs found dead and detached.
    pub detached: usize,
    /// Attach or detach attempts that failed.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::NotStarted => "not started",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttacherStatus {
    pub name: String,
    pub state: State,
    pub registry: RegistryStats,
    pub exclusions: ExclusionCounts,
    /// Hooks currently recorded against active paths.
    pub probes: usize,
    pub library_events: u64,
    pub lost_library_events: u64,
    pub syncs: u64,
    pub last_sync: Option<SyncReport>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    library_events: AtomicU64,
    lost_library_events: AtomicU64,
    syncs: AtomicU64,
    last_sync: Mutex<Option<SyncReport>>,
}

impl Counters {
    pub(crate) fn library_event(&self) {
        self.library_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lost_library_events(&self, count: u64) {
        self.lost_library_events.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn sync_done(&self, report: SyncReport) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        *self.last_sync.lock() = Some(report);
    }

    pub(crate) fn library_events(&self) -> u64 {
        self.library_events.load(Ordering::Relaxed)
    }

    pub(crate) fn lost(&self) -> u64 {
        self.lost_library_events.load(Ordering::Relaxed)
    }

    pub(crate) fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub(crate) fn last_sync(&self) -> Option<SyncReport> {
        *self.last_sync.lock()
    }
}
