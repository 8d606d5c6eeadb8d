#![forbid(unsafe_code)]

use crate::error::BoxError;
use crate::process::ProcessTable;
use crate::sources::{PidCallback, ProcessEventSource, Subscribers, Unsubscribe};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Process event source polling the process table.
///
/// Every `interval` the set of PIDs under the proc root is compared with the
/// previous one. New PIDs are reported as execs, vanished ones as exits. The
/// snapshot taken by `initialize` is the baseline and produces no events.
#[derive(Debug)]
pub struct ProcfsMonitor {
    table: ProcessTable,
    interval: Duration,
    exec: Subscribers,
    exit: Subscribers,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProcfsMonitor {
    pub fn new(proc_root: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            table: ProcessTable::new(proc_root),
            interval,
            exec: Subscribers::default(),
            exit: Subscribers::default(),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn from_config(settings: &config::Attacher) -> Self {
        Self::new(settings.proc_root.clone(), settings.poll_interval)
    }

    fn poll_loop(
        table: ProcessTable,
        interval: Duration,
        mut known: FxHashSet<u32>,
        exec: Subscribers,
        exit: Subscribers,
        stop: Arc<AtomicBool>,
    ) {
        while sleep_unless_stopped(&stop, interval) {
            let current: FxHashSet<u32> = match table.live_pids() {
                Ok(pids) => pids.into_iter().collect(),
                Err(err) => {
                    warn!(%err, "failed to list processes");
                    continue;
                }
            };
            for &pid in current.difference(&known) {
                exec.notify(pid);
            }
            for &pid in known.difference(&current) {
                exit.notify(pid);
            }
            known = current;
        }
        trace!("procfs monitor loop exited");
    }
}

/// Sleep for `duration`, waking up regularly to check `stop`. Returns `false`
/// if the monitor was stopped.
fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(STOP_CHECK_INTERVAL));
    }
}

impl ProcessEventSource for ProcfsMonitor {
    fn initialize(&self, use_event_stream: bool) -> Result<(), BoxError> {
        if use_event_stream {
            warn!("process event stream unavailable, polling procfs instead");
        }
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        let baseline: FxHashSet<u32> = self.table.live_pids()?.into_iter().collect();
        self.stop.store(false, Ordering::Relaxed);
        let spawned = {
            let table = self.table.clone();
            let interval = self.interval;
            let exec = self.exec.clone();
            let exit = self.exit.clone();
            let stop = Arc::clone(&self.stop);
            std::thread::Builder::new()
                .name("procfs-monitor".into())
                .spawn(move || Self::poll_loop(table, interval, baseline, exec, exit, stop))?
        };
        *handle = Some(spawned);
        info!(root = %self.table.root().display(), interval = ?self.interval, "procfs monitor started");
        Ok(())
    }

    fn subscribe_exec(&self, callback: PidCallback) -> Unsubscribe {
        self.exec.subscribe(callback)
    }

    fn subscribe_exit(&self, callback: PidCallback) -> Unsubscribe {
        self.exit.subscribe(callback)
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn find_deleted_processes(&self, candidates: &FxHashSet<u32>) -> FxHashSet<u32> {
        candidates
            .iter()
            .copied()
            .filter(|pid| !self.table.is_alive(*pid))
            .collect()
    }
}

impl Drop for ProcfsMonitor {
    fn drop(&mut self) {
        ProcessEventSource::stop(self);
    }
}
