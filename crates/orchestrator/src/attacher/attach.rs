#![forbid(unsafe_code)]

use crate::attacher::binder::ProbeBinder;
use crate::attacher::stats::{Counters, SyncReport};
use crate::error::Error;
use crate::exclusion::ExclusionFilter;
use crate::process::ProcessTable;
use crate::registry::PathRegistry;
use crate::rules::{AttachRule, RuleSet};
use crate::sources::{LibraryOpen, ProcessEventSource};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Everything the attacher does outside of its event loop. Shared between the
/// loop, the process event callbacks and the public API.
pub(crate) struct AttacherCore {
    pub(crate) rules: RuleSet,
    pub(crate) exclusion: ExclusionFilter,
    pub(crate) table: ProcessTable,
    pub(crate) registry: PathRegistry,
    pub(crate) binder: Arc<ProbeBinder>,
    pub(crate) processes: Arc<dyn ProcessEventSource>,
    pub(crate) counters: Counters,
    exe_resolve_timeout: Duration,
}

impl AttacherCore {
    pub(crate) fn new(
        rules: RuleSet,
        exclusion: ExclusionFilter,
        table: ProcessTable,
        binder: ProbeBinder,
        processes: Arc<dyn ProcessEventSource>,
        exe_resolve_timeout: Duration,
    ) -> Self {
        Self {
            rules,
            exclusion,
            table,
            registry: PathRegistry::new(),
            binder: Arc::new(binder),
            processes,
            counters: Counters::default(),
            exe_resolve_timeout,
        }
    }

    pub(crate) fn attach_pid(&self, pid: u32, with_libraries: bool) -> Result<(), Error> {
        self.exclusion.check_pid(pid)?;
        let process = self.table.resolve(pid, self.exe_resolve_timeout)?;
        self.exclusion.check_process(&process)?;

        let rules = self.rules.for_executable(&process.exe, &process);
        let exe_matched = !rules.is_empty();
        if exe_matched {
            self.register(&process.exe, pid, rules)?;
        }

        let libraries = if with_libraries && self.rules.handles_libraries() {
            self.attach_libraries(pid)?
        } else {
            0
        };

        if !exe_matched && libraries == 0 {
            return Err(Error::NoMatchingRule);
        }
        Ok(())
    }

    pub(crate) fn attach_library(&self, path: &Path, pid: u32) -> Result<(), Error> {
        self.exclusion.check_pid(pid)?;
        let rules = self.rules.for_library(path);
        if rules.is_empty() {
            return Err(Error::NoMatchingRule);
        }
        self.register(path, pid, rules)
    }

    pub(crate) fn detach_pid(&self, pid: u32) -> Result<(), Error> {
        self.registry.unregister(pid)
    }

    /// Attach every mapped library of `pid` some rule asks for. Returns how
    /// many were attached.
    fn attach_libraries(&self, pid: u32) -> Result<usize, Error> {
        let mut attached: Vec<PathBuf> = Vec::new();
        let mut failures = Vec::new();
        for path in self.table.mapped_libraries(pid)? {
            match self.attach_library(&path, pid) {
                Ok(()) => attached.push(path),
                Err(err) if err.is_benign() => {}
                Err(err) => failures.push(err),
            }
        }

        if failures.is_empty() {
            Ok(attached.len())
        } else {
            Err(Error::LibraryAttach {
                pid,
                attached,
                failures,
            })
        }
    }

    fn register(&self, path: &Path, pid: u32, rules: Vec<Arc<AttachRule>>) -> Result<(), Error> {
        let binder = Arc::clone(&self.binder);
        self.registry.register(
            path,
            pid,
            |file| {
                self.exclusion.check_binary(file)?;
                self.binder.attach(file, &rules)
            },
            move |file| binder.detach(file),
        )
    }

    /// Compare the tracked PIDs with the live process table. Unknown live
    /// PIDs go through the attach path; with `track_deletions`, tracked PIDs
    /// that are gone go through the detach path.
    pub(crate) fn sync(&self, track_deletions: bool) -> Result<SyncReport, Error> {
        let mut candidates = self.registry.registered_processes();
        let self_pid = self.exclusion.self_pid();
        let mut report = SyncReport::default();

        match self.table.live_pids() {
            Ok(live) => {
                for pid in live {
                    if pid == self_pid {
                        continue;
                    }
                    report.live += 1;
                    if candidates.remove(&pid) {
                        continue;
                    }
                    match self.attach_pid(pid, true) {
                        Ok(()) => report.attached += 1,
                        Err(err) if err.is_benign() => trace!(pid, %err, "sync: skipped"),
                        Err(err) => {
                            debug!(pid, %err, "sync: attach failed");
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(err) if track_deletions => {
                warn!(%err, "failed to scan processes, checking tracked ones only");
                candidates = self.processes.find_deleted_processes(&candidates);
            }
            Err(err) => return Err(err),
        }

        if track_deletions {
            report.detached = self.detach_dead(candidates, &mut report.failed);
        }

        debug!(?report, "sync done");
        self.counters.sync_done(report);
        Ok(report)
    }

    fn detach_dead(&self, dead: FxHashSet<u32>, failed: &mut usize) -> usize {
        let mut detached = 0;
        for pid in dead {
            match self.detach_pid(pid) {
                Ok(()) => detached += 1,
                Err(err) => {
                    debug!(pid, %err, "sync: detach failed");
                    *failed += 1;
                }
            }
        }
        detached
    }

    pub(crate) fn handle_exec(&self, pid: u32) {
        log_outcome("attach", pid, self.attach_pid(pid, true));
    }

    pub(crate) fn handle_exit(&self, pid: u32) {
        log_outcome("detach", pid, self.detach_pid(pid));
    }

    pub(crate) fn handle_library(&self, open: LibraryOpen) {
        self.counters.library_event();
        log_outcome("attach library", open.pid, self.attach_library(&open.path, open.pid));
    }
}

/// Live event handlers never propagate errors.
fn log_outcome(action: &str, pid: u32, result: Result<(), Error>) {
    match result {
        Ok(()) => trace!(pid, action, "ok"),
        Err(err) if err.is_benign() => trace!(pid, action, %err, "skipped"),
        Err(err) => debug!(pid, action, %err, "failed"),
    }
}
