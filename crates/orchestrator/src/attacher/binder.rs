#![forbid(unsafe_code)]

//! Installation and removal of the hooks of one binary.

use crate::domain::{FilePath, Probe, ProbeId};
use crate::error::Error;
use crate::inspect::{BinaryInspector, Inspection};
use crate::probes::ProbeManager;
use crate::rules::{AttachRule, symbol_requests};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Invoked for every hook installed.
pub type AttachCallback = Arc<dyn Fn(&Probe, &FilePath) + Send + Sync>;

pub(crate) struct ProbeBinder {
    name: String,
    probes: Arc<dyn ProbeManager>,
    inspector: Arc<dyn BinaryInspector>,
    on_attach: Option<AttachCallback>,
    /// Hooks installed for each active path.
    attached: Mutex<FxHashMap<Arc<Path>, Vec<ProbeId>>>,
}

impl ProbeBinder {
    pub(crate) fn new(
        name: String,
        probes: Arc<dyn ProbeManager>,
        inspector: Arc<dyn BinaryInspector>,
        on_attach: Option<AttachCallback>,
    ) -> Self {
        Self {
            name,
            probes,
            inspector,
            on_attach,
            attached: Mutex::new(FxHashMap::default()),
        }
    }

    /// Install every hook `rules` ask for in `file`.
    ///
    /// Either every hook ends up installed, or the hooks installed by this
    /// call are removed again before the error is returned.
    pub(crate) fn attach(&self, file: &FilePath, rules: &[Arc<AttachRule>]) -> Result<(), Error> {
        let requests = symbol_requests(rules);
        let inspection =
            self.inspector
                .inspect(file, &requests)
                .map_err(|source| Error::Inspection {
                    path: file.path.to_path_buf(),
                    source,
                })?;

        let mut installed = Vec::new();
        let result = if inspection.attachable {
            self.install(file, rules, &inspection, &mut installed)
        } else {
            Err(Error::BinaryNotAttachable(file.path.to_path_buf()))
        };

        match result {
            Ok(()) => {
                debug!(path = %file.path.display(), pid = file.pid, probes = installed.len(), "binary attached");
                self.attached
                    .lock()
                    .entry(Arc::clone(&file.path))
                    .or_default()
                    .extend(installed);
                Ok(())
            }
            Err(err) => {
                self.rollback(file, installed);
                Err(err)
            }
        }
    }

    fn install(
        &self,
        file: &FilePath,
        rules: &[Arc<AttachRule>],
        inspection: &Inspection,
        installed: &mut Vec<ProbeId>,
    ) -> Result<(), Error> {
        let uid = file.uid();
        let mut active: FxHashSet<&str> = FxHashSet::default();

        for selector in rules.iter().flat_map(|rule| rule.selectors()) {
            for hook in &selector.hooks {
                let Some(metadata) = inspection.symbols.get(&hook.symbol) else {
                    if selector.is_best_effort() {
                        trace!(symbol = %hook.symbol, path = %file.path.display(), "optional symbol missing");
                        continue;
                    }
                    return Err(Error::SymbolNotFound {
                        symbol: hook.symbol.clone(),
                        path: file.path.to_path_buf(),
                    });
                };

                let locations = if hook.manual_return {
                    metadata.return_locations.as_slice()
                } else {
                    std::slice::from_ref(&metadata.entry_location)
                };

                for (index, &offset) in locations.iter().enumerate() {
                    let id = ProbeId::new(hook.func_name.as_str(), format!("{uid}_{index}"));
                    match self.probes.get_probe(&id) {
                        Some(existing) if existing.running => {
                            active.insert(&hook.func_name);
                            continue;
                        }
                        Some(_) => {
                            self.probes
                                .detach_hook(&id)
                                .map_err(|source| Error::ProbeDetach {
                                    probe: id.clone(),
                                    source,
                                })?;
                        }
                        None => {}
                    }

                    let probe = Probe {
                        id: id.clone(),
                        binary_path: file.path.to_path_buf(),
                        offset,
                        symbol: hook.symbol.clone(),
                        running: true,
                    };
                    self.probes
                        .add_hook(&self.name, probe.clone())
                        .map_err(|source| Error::ProbeInstall {
                            probe: id.clone(),
                            source,
                        })?;
                    trace!(probe = %id, path = %file.path.display(), offset, "probe installed");
                    installed.push(id);
                    active.insert(&hook.func_name);

                    if let Some(on_attach) = &self.on_attach {
                        on_attach(&probe, file);
                    }
                }
            }
        }

        for selector in rules.iter().flat_map(|rule| rule.selectors()) {
            selector.validate(&file.path, |hook| active.contains(hook.func_name.as_str()))?;
        }
        Ok(())
    }

    fn rollback(&self, file: &FilePath, installed: Vec<ProbeId>) {
        for id in installed.iter().rev() {
            if let Err(err) = self.probes.detach_hook(id) {
                warn!(probe = %id, path = %file.path.display(), %err, "failed to roll back probe");
            }
        }
        self.inspector.cleanup(file);
    }

    /// Remove every hook recorded for `file` and release inspector state.
    ///
    /// All hooks are attempted; the first failure is returned.
    pub(crate) fn detach(&self, file: &FilePath) -> Result<(), Error> {
        let ids = self.attached.lock().remove(&file.path).unwrap_or_default();
        let mut first_err = None;
        for id in ids {
            if let Err(source) = self.probes.detach_hook(&id) {
                warn!(probe = %id, path = %file.path.display(), err = %source, "failed to detach probe");
                first_err.get_or_insert(Error::ProbeDetach { probe: id, source });
            }
        }
        self.inspector.cleanup(file);
        debug!(path = %file.path.display(), "binary detached");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hooks recorded against `path`.
    pub(crate) fn probes_of(&self, path: &Path) -> Vec<ProbeId> {
        self.attached
            .lock()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn probe_count(&self) -> usize {
        self.attached.lock().values().map(Vec::len).sum()
    }
}
