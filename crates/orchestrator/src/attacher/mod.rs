#![forbid(unsafe_code)]

//! The attachment orchestrator: decides which processes and libraries get
//! hooks, drives the path registry, and runs the event loop tying live
//! events and reconciliation together.

mod attach;
mod binder;
mod stats;

pub use binder::AttachCallback;
pub use stats::{AttacherStatus, State, SyncReport};

use crate::attacher::attach::AttacherCore;
use crate::attacher::binder::ProbeBinder;
use crate::domain::ProbeId;
use crate::error::Error;
use crate::exclusion::ExclusionFilter;
use crate::inspect::BinaryInspector;
use crate::probes::ProbeManager;
use crate::process::ProcessTable;
use crate::rules::RuleSet;
use crate::sources::{
    LIBRARY_EVENT_CAPACITY, LibraryEventSink, LibraryOpen, ProcessEventSource,
    SharedLibrarySource, Unsubscribe,
};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Services {
    pub probes: Arc<dyn ProbeManager>,
    pub inspector: Arc<dyn BinaryInspector>,
    pub processes: Arc<dyn ProcessEventSource>,
    /// Only started when some rule targets shared libraries.
    pub libraries: Option<Box<dyn SharedLibrarySource>>,
}

pub struct UprobeAttacher {
    name: String,
    core: Arc<AttacherCore>,
    settings: config::Attacher,
    libraries: Mutex<Option<Box<dyn SharedLibrarySource>>>,
    state: Mutex<State>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UprobeAttacher {
    pub fn new(
        name: impl Into<String>,
        settings: config::Attacher,
        rules: RuleSet,
        services: Services,
        on_attach: Option<AttachCallback>,
    ) -> Result<Self, Error> {
        let exclusion = ExclusionFilter::from_config(&settings)?;
        Ok(Self::with_exclusion(
            name, settings, rules, exclusion, services, on_attach,
        ))
    }

    /// Like [`UprobeAttacher::new`], with an explicit exclusion filter.
    pub fn with_exclusion(
        name: impl Into<String>,
        settings: config::Attacher,
        rules: RuleSet,
        exclusion: ExclusionFilter,
        services: Services,
        on_attach: Option<AttachCallback>,
    ) -> Self {
        let name = name.into();
        let binder = ProbeBinder::new(
            name.clone(),
            services.probes,
            services.inspector,
            on_attach,
        );
        let core = AttacherCore::new(
            rules,
            exclusion,
            ProcessTable::new(settings.proc_root.clone()),
            binder,
            services.processes,
            settings.exe_resolve_timeout,
        );
        Self {
            name,
            core: Arc::new(core),
            settings,
            libraries: Mutex::new(services.libraries),
            state: Mutex::new(State::NotStarted),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// Initialize the event sources, optionally scan every running process,
    /// then start the event loop.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if *state != State::NotStarted {
                return Err(Error::InvalidState {
                    expected: State::NotStarted.as_str(),
                    actual: state.as_str(),
                });
            }
            *state = State::Starting;
        }

        match self.launch().await {
            Ok(task) => {
                *self.task.lock() = Some(task);
                *self.state.lock() = State::Running;
                info!(name = %self.name, "attacher started");
                Ok(())
            }
            Err(err) => {
                warn!(name = %self.name, %err, "attacher failed to start");
                let core = Arc::clone(&self.core);
                let cleanup = tokio::task::spawn_blocking(move || {
                    core.processes.stop();
                    core.registry.clear();
                });
                if let Err(join_err) = cleanup.await {
                    warn!(err = %join_err, "attacher cleanup failed");
                }
                *self.state.lock() = State::Stopped;
                Err(err)
            }
        }
    }

    async fn launch(&self) -> Result<JoinHandle<()>, Error> {
        let core = Arc::clone(&self.core);
        core.processes
            .initialize(self.settings.event_stream)
            .map_err(Error::EventSource)?;

        if self.settings.initial_scan {
            let scan = Arc::clone(&core);
            let report = tokio::task::spawn_blocking(move || scan.sync(false)).await??;
            info!(attached = report.attached, live = report.live, "initial scan done");
        }

        let subscriptions = vec![
            core.processes.subscribe_exec({
                let core = Arc::downgrade(&core);
                Arc::new(move |pid| {
                    if let Some(core) = core.upgrade() {
                        core.handle_exec(pid);
                    }
                })
            }),
            core.processes.subscribe_exit({
                let core = Arc::downgrade(&core);
                Arc::new(move |pid| {
                    if let Some(core) = core.upgrade() {
                        core.handle_exit(pid);
                    }
                })
            }),
        ];

        let mut libraries = self.libraries.lock().take();
        if libraries.is_some() && !core.rules.handles_libraries() {
            debug!("no rule targets shared libraries, library events disabled");
            libraries = None;
        }
        let (mut library_events, mut lost_events) = (None, None);
        if let Some(source) = libraries.as_mut() {
            let (sink, data, lost) = LibraryEventSink::channel(LIBRARY_EVENT_CAPACITY);
            let started = source.init().and_then(|()| source.start(sink));
            if let Err(err) = started {
                for subscription in subscriptions {
                    subscription.unsubscribe();
                }
                return Err(Error::EventSource(err));
            }
            library_events = Some(data);
            lost_events = Some(lost);
        }

        let event_loop = EventLoop {
            core,
            scan_interval: self.settings.scan_interval.max(Duration::from_millis(1)),
            cancel: self.cancel.clone(),
            library_events,
            lost_events,
            subscriptions,
            libraries,
        };
        Ok(tokio::spawn(event_loop.run()))
    }

    /// Stop the event loop and detach every hook. Waits for the loop to
    /// finish its cleanup.
    pub async fn stop(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            match *state {
                State::Running => *state = State::Stopping,
                State::NotStarted => {
                    *state = State::Stopped;
                    return Ok(());
                }
                State::Starting => {
                    return Err(Error::InvalidState {
                        expected: State::Running.as_str(),
                        actual: State::Starting.as_str(),
                    });
                }
                State::Stopping | State::Stopped => return Ok(()),
            }
        }

        self.cancel.cancel();
        let task = self.task.lock().take();
        let result = match task {
            Some(task) => task.await.map_err(Error::from),
            None => Ok(()),
        };
        *self.state.lock() = State::Stopped;
        info!(name = %self.name, "attacher stopped");
        result
    }

    pub fn attach_pid(&self, pid: u32) -> Result<(), Error> {
        self.core.attach_pid(pid, true)
    }

    pub fn attach_pid_with_options(&self, pid: u32, attach_to_libraries: bool) -> Result<(), Error> {
        self.core.attach_pid(pid, attach_to_libraries)
    }

    pub fn detach_pid(&self, pid: u32) -> Result<(), Error> {
        self.core.detach_pid(pid)
    }

    pub fn attach_library(&self, path: &Path, pid: u32) -> Result<(), Error> {
        self.core.attach_library(path, pid)
    }

    /// Run one reconciliation pass on the calling thread.
    pub fn sync(&self, track_deletions: bool) -> Result<SyncReport, Error> {
        self.core.sync(track_deletions)
    }

    pub fn registered_processes(&self) -> FxHashSet<u32> {
        self.core.registry.registered_processes()
    }

    pub fn active_paths(&self) -> Vec<PathBuf> {
        self.core.registry.active_paths()
    }

    pub fn referrers(&self, path: &Path) -> FxHashSet<u32> {
        self.core.registry.referrers(path)
    }

    /// Hooks currently installed for `path`.
    pub fn probes_of(&self, path: &Path) -> Vec<ProbeId> {
        self.core.binder.probes_of(path)
    }

    pub fn status(&self) -> AttacherStatus {
        AttacherStatus {
            name: self.name.clone(),
            state: self.state(),
            registry: self.core.registry.stats(),
            exclusions: self.core.exclusion.counts(),
            probes: self.core.binder.probe_count(),
            library_events: self.core.counters.library_events(),
            lost_library_events: self.core.counters.lost(),
            syncs: self.core.counters.syncs(),
            last_sync: self.core.counters.last_sync(),
        }
    }
}

impl std::fmt::Debug for UprobeAttacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UprobeAttacher")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("rules", &self.core.rules.len())
            .finish()
    }
}

impl Drop for UprobeAttacher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct EventLoop {
    core: Arc<AttacherCore>,
    scan_interval: Duration,
    cancel: CancellationToken,
    library_events: Option<mpsc::Receiver<LibraryOpen>>,
    lost_events: Option<mpsc::UnboundedReceiver<u64>>,
    subscriptions: Vec<Unsubscribe>,
    libraries: Option<Box<dyn SharedLibrarySource>>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.scan_interval, self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let core = Arc::clone(&self.core);
                    match tokio::task::spawn_blocking(move || core.sync(true)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => warn!(%err, "reconciliation failed"),
                        Err(err) => warn!(%err, "reconciliation task failed"),
                    }
                }
                event = next_library_event(&mut self.library_events) => match event {
                    Some(open) => {
                        let core = Arc::clone(&self.core);
                        if let Err(err) = tokio::task::spawn_blocking(move || core.handle_library(open)).await {
                            warn!(%err, "library event task failed");
                        }
                    }
                    None => {
                        warn!("library event source closed");
                        self.library_events = None;
                    }
                },
                lost = next_lost_count(&mut self.lost_events) => match lost {
                    Some(count) => {
                        debug!(count, "library events lost");
                        self.core.counters.lost_library_events(count);
                    }
                    None => self.lost_events = None,
                },
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(self) {
        let EventLoop {
            core,
            subscriptions,
            libraries,
            ..
        } = self;
        let cleanup = tokio::task::spawn_blocking(move || {
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
            core.processes.stop();
            core.registry.clear();
            if let Some(mut libraries) = libraries {
                libraries.stop();
            }
        });
        if let Err(err) = cleanup.await {
            warn!(%err, "attacher cleanup failed");
        }
    }
}

async fn next_library_event(rx: &mut Option<mpsc::Receiver<LibraryOpen>>) -> Option<LibraryOpen> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_lost_count(rx: &mut Option<mpsc::UnboundedReceiver<u64>>) -> Option<u64> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
