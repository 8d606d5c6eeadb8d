#![forbid(unsafe_code)]
#![allow(dead_code)]

use orchestrator::inspect::{BinaryInspector, FunctionMetadata, Inspection};
use orchestrator::rules::SymbolRequest;
use orchestrator::sources::{
    LibraryEventSink, LibraryOpen, PidCallback, ProcessEventSource, SharedLibrarySource,
    Subscribers, Unsubscribe,
};
use orchestrator::{
    AttachCallback, BoxError, ExcludeMode, ExclusionFilter, FilePath, Probe, ProbeId,
    ProbeManager, RuleSet, Services, UprobeAttacher,
};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// PID the attacher believes it runs as.
pub const SELF_PID: u32 = 999;

/// A `/proc` lookalike: `<root>/<pid>/{exe, comm, maps}`.
pub struct FakeProcfs {
    dir: TempDir,
}

impl FakeProcfs {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn spawn(&self, pid: u32, exe: &str, comm: &str, libraries: &[&str]) {
        let dir = self.root().join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        symlink(exe, dir.join("exe")).unwrap();
        std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();

        let mut maps = String::new();
        let mappings = std::iter::once(exe).chain(libraries.iter().copied());
        for (index, path) in mappings.enumerate() {
            let start = 0x7f00_0000_0000u64 + (index as u64) * 0x10_0000;
            maps.push_str(&format!(
                "{start:x}-{:x} r-xp 00000000 fd:01 {} {path}\n",
                start + 0x1000,
                1000 + index
            ));
        }
        maps.push_str("7ffd4e000000-7ffd4e021000 rw-p 00000000 00:00 0 [stack]\n");
        std::fs::write(dir.join("maps"), maps).unwrap();
    }

    pub fn kill(&self, pid: u32) {
        std::fs::remove_dir_all(self.root().join(pid.to_string())).unwrap();
    }
}

/// Probe manager keeping installed hooks in memory.
#[derive(Default)]
pub struct MockProbeManager {
    installed: Mutex<BTreeMap<ProbeId, Probe>>,
    failing: Mutex<FxHashSet<String>>,
    detached: Mutex<Vec<ProbeId>>,
}

impl MockProbeManager {
    /// Make every later install of `func_name` fail.
    pub fn fail_installs_of(&self, func_name: &str) {
        self.failing.lock().insert(func_name.to_string());
    }

    pub fn installed(&self) -> Vec<Probe> {
        self.installed.lock().values().cloned().collect()
    }

    pub fn installed_ids(&self) -> Vec<String> {
        self.installed.lock().keys().map(ToString::to_string).collect()
    }

    pub fn detached(&self) -> Vec<ProbeId> {
        self.detached.lock().clone()
    }
}

impl ProbeManager for MockProbeManager {
    fn add_hook(&self, _name: &str, probe: Probe) -> Result<(), BoxError> {
        if self.failing.lock().contains(&probe.id.func_name) {
            return Err(format!("cannot install {}", probe.id).into());
        }
        self.installed.lock().insert(probe.id.clone(), probe);
        Ok(())
    }

    fn detach_hook(&self, id: &ProbeId) -> Result<(), BoxError> {
        self.detached.lock().push(id.clone());
        match self.installed.lock().remove(id) {
            Some(_) => Ok(()),
            None => Err(format!("{id} is not installed").into()),
        }
    }

    fn get_probe(&self, id: &ProbeId) -> Option<Probe> {
        self.installed.lock().get(id).cloned()
    }
}

#[derive(Default)]
struct BinaryTable {
    symbols: HashMap<String, FunctionMetadata>,
    attachable: bool,
}

/// Binary inspector answering from a table of known binaries.
#[derive(Default)]
pub struct MockInspector {
    binaries: Mutex<HashMap<PathBuf, BinaryTable>>,
    inspections: Mutex<HashMap<PathBuf, usize>>,
    cleanups: Mutex<HashMap<PathBuf, usize>>,
}

impl MockInspector {
    pub fn add_symbol(&self, path: &str, symbol: &str, entry: u64, returns: &[u64]) {
        let mut binaries = self.binaries.lock();
        let binary = binaries.entry(PathBuf::from(path)).or_insert_with(|| BinaryTable {
            attachable: true,
            ..Default::default()
        });
        binary.symbols.insert(
            symbol.to_string(),
            FunctionMetadata {
                entry_location: entry,
                return_locations: returns.to_vec(),
            },
        );
    }

    pub fn set_attachable(&self, path: &str, attachable: bool) {
        self.binaries
            .lock()
            .entry(PathBuf::from(path))
            .or_default()
            .attachable = attachable;
    }

    pub fn inspections(&self, path: &str) -> usize {
        self.inspections.lock().get(Path::new(path)).copied().unwrap_or(0)
    }

    pub fn cleanups(&self, path: &str) -> usize {
        self.cleanups.lock().get(Path::new(path)).copied().unwrap_or(0)
    }
}

impl BinaryInspector for MockInspector {
    fn inspect(&self, file: &FilePath, requests: &[SymbolRequest]) -> Result<Inspection, BoxError> {
        *self
            .inspections
            .lock()
            .entry(file.path.to_path_buf())
            .or_default() += 1;

        let binaries = self.binaries.lock();
        let Some(binary) = binaries.get(&*file.path) else {
            return Ok(Inspection {
                symbols: HashMap::new(),
                attachable: true,
            });
        };
        let symbols = requests
            .iter()
            .filter_map(|request| {
                let metadata = binary.symbols.get(&request.name)?;
                Some((request.name.clone(), metadata.clone()))
            })
            .collect();
        Ok(Inspection {
            symbols,
            attachable: binary.attachable,
        })
    }

    fn cleanup(&self, file: &FilePath) {
        *self
            .cleanups
            .lock()
            .entry(file.path.to_path_buf())
            .or_default() += 1;
    }
}

/// Process event source fired by hand.
pub struct ManualProcessSource {
    proc_root: PathBuf,
    exec: Subscribers,
    exit: Subscribers,
    initialized: AtomicBool,
    stopped: AtomicBool,
}

impl ManualProcessSource {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
            exec: Subscribers::default(),
            exit: Subscribers::default(),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn exec(&self, pid: u32) {
        self.exec.notify(pid);
    }

    pub fn exit(&self, pid: u32) {
        self.exit.notify(pid);
    }

    pub fn subscribers(&self) -> usize {
        self.exec.len() + self.exit.len()
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ProcessEventSource for ManualProcessSource {
    fn initialize(&self, _use_event_stream: bool) -> Result<(), BoxError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_exec(&self, callback: PidCallback) -> Unsubscribe {
        self.exec.subscribe(callback)
    }

    fn subscribe_exit(&self, callback: PidCallback) -> Unsubscribe {
        self.exit.subscribe(callback)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn find_deleted_processes(&self, candidates: &FxHashSet<u32>) -> FxHashSet<u32> {
        candidates
            .iter()
            .copied()
            .filter(|pid| !self.proc_root.join(pid.to_string()).exists())
            .collect()
    }
}

/// Test side of [`ChannelLibrarySource`].
#[derive(Clone, Default)]
pub struct LibraryFeed {
    sink: Arc<Mutex<Option<LibraryEventSink>>>,
    lifecycle: Arc<Mutex<Vec<&'static str>>>,
    broken: Arc<AtomicBool>,
}

impl LibraryFeed {
    /// Make the next `init` fail like a kernel without fanotify.
    pub fn break_init(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn open(&self, path: &str, pid: u32) -> bool {
        let sink = self.sink.lock();
        sink.as_ref().is_some_and(|sink| {
            sink.deliver(LibraryOpen {
                path: PathBuf::from(path),
                pid,
            })
        })
    }

    pub fn lost(&self, count: u64) -> bool {
        let sink = self.sink.lock();
        sink.as_ref().is_some_and(|sink| sink.report_lost(count))
    }

    pub fn lifecycle(&self) -> Vec<&'static str> {
        self.lifecycle.lock().clone()
    }
}

/// Library source whose events are pushed through a [`LibraryFeed`].
pub struct ChannelLibrarySource {
    feed: LibraryFeed,
}

impl ChannelLibrarySource {
    pub fn new(feed: LibraryFeed) -> Self {
        Self { feed }
    }
}

impl SharedLibrarySource for ChannelLibrarySource {
    fn init(&mut self) -> Result<(), BoxError> {
        self.feed.lifecycle.lock().push("init");
        if self.feed.broken.load(Ordering::SeqCst) {
            return Err("fanotify unavailable".into());
        }
        Ok(())
    }

    fn start(&mut self, sink: LibraryEventSink) -> Result<(), BoxError> {
        self.feed.lifecycle.lock().push("start");
        *self.feed.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.feed.lifecycle.lock().push("stop");
        self.feed.sink.lock().take();
    }
}

pub struct Harness {
    pub procfs: FakeProcfs,
    pub probes: Arc<MockProbeManager>,
    pub inspector: Arc<MockInspector>,
    pub processes: Arc<ManualProcessSource>,
    pub feed: LibraryFeed,
    pub attacher: UprobeAttacher,
}

pub struct HarnessBuilder {
    rules: RuleSet,
    settings: config::Attacher,
    exclude: ExcludeMode,
    on_attach: Option<AttachCallback>,
    procfs: FakeProcfs,
}

impl HarnessBuilder {
    pub fn new(rules: RuleSet) -> Self {
        let procfs = FakeProcfs::new();
        let settings = config::Attacher {
            proc_root: procfs.root().to_path_buf(),
            initial_scan: false,
            scan_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        Self {
            rules,
            settings,
            exclude: ExcludeMode::all(),
            on_attach: None,
            procfs,
        }
    }

    /// Processes present before the attacher is built.
    pub fn procfs(&self) -> &FakeProcfs {
        &self.procfs
    }

    pub fn initial_scan(mut self, enabled: bool) -> Self {
        self.settings.initial_scan = enabled;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.settings.scan_interval = interval;
        self
    }

    pub fn exclude(mut self, mode: ExcludeMode) -> Self {
        self.exclude = mode;
        self
    }

    pub fn on_attach(mut self, callback: AttachCallback) -> Self {
        self.on_attach = Some(callback);
        self
    }

    pub fn build(self) -> Harness {
        let probes = Arc::new(MockProbeManager::default());
        let inspector = Arc::new(MockInspector::default());
        let processes = Arc::new(ManualProcessSource::new(self.procfs.root()));
        let feed = LibraryFeed::default();

        let exclusion = ExclusionFilter::new(
            self.exclude,
            config::DEFAULT_INTERNAL_PATTERN,
            SELF_PID,
            self.procfs.root(),
        )
        .unwrap();
        let services = Services {
            probes: probes.clone(),
            inspector: inspector.clone(),
            processes: processes.clone(),
            libraries: Some(Box::new(ChannelLibrarySource::new(feed.clone()))),
        };
        let attacher = UprobeAttacher::with_exclusion(
            "test",
            self.settings,
            self.rules,
            exclusion,
            services,
            self.on_attach,
        );

        Harness {
            procfs: self.procfs,
            probes,
            inspector,
            processes,
            feed,
            attacher,
        }
    }
}

pub fn harness(rules: RuleSet) -> Harness {
    HarnessBuilder::new(rules).build()
}

/// Poll `condition` until it holds or a few seconds passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
