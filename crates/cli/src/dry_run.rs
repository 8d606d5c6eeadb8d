#![forbid(unsafe_code)]

//! Collaborators that only log what they would do. They let the daemon run
//! the whole attach pipeline without touching the kernel.

use orchestrator::{
    BinaryInspector, BoxError, FilePath, FunctionMetadata, Inspection, Probe, ProbeId,
    ProbeManager, SymbolRequest,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, trace};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

#[derive(Debug, thiserror::Error)]
#[error("probe {0} is not installed")]
pub struct UnknownProbe(ProbeId);

/// Probe manager keeping hooks in memory.
#[derive(Debug, Default)]
pub struct DryRunProbeManager {
    probes: Mutex<FxHashMap<ProbeId, Probe>>,
}

impl DryRunProbeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.probes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.lock().is_empty()
    }
}

impl ProbeManager for DryRunProbeManager {
    fn add_hook(&self, name: &str, mut probe: Probe) -> Result<(), BoxError> {
        info!(
            attacher = name,
            probe = %probe.id,
            path = %probe.binary_path.display(),
            symbol = %probe.symbol,
            offset = probe.offset,
            "would install hook"
        );
        probe.running = true;
        self.probes.lock().insert(probe.id.clone(), probe);
        Ok(())
    }

    fn detach_hook(&self, id: &ProbeId) -> Result<(), BoxError> {
        match self.probes.lock().remove(id) {
            Some(probe) => {
                info!(probe = %id, path = %probe.binary_path.display(), "would remove hook");
                Ok(())
            }
            None => Err(Box::new(UnknownProbe(id.clone()))),
        }
    }

    fn get_probe(&self, id: &ProbeId) -> Option<Probe> {
        self.probes.lock().get(id).cloned()
    }
}

/// Inspector that accepts every ELF file and places each requested symbol at
/// offset zero.
#[derive(Debug, Default)]
pub struct DryRunInspector;

impl DryRunInspector {
    pub fn new() -> Self {
        Self
    }
}

impl BinaryInspector for DryRunInspector {
    fn inspect(&self, file: &FilePath, requests: &[SymbolRequest]) -> Result<Inspection, BoxError> {
        let attachable = is_elf(&file.path)?;
        if !attachable {
            debug!(path = %file.path.display(), "not an ELF file");
            return Ok(Inspection::default());
        }

        let mut symbols = HashMap::with_capacity(requests.len());
        for request in requests {
            let metadata = symbols
                .entry(request.name.clone())
                .or_insert_with(FunctionMetadata::default);
            if request.include_return_locations && metadata.return_locations.is_empty() {
                metadata.return_locations.push(0);
            }
        }
        Ok(Inspection {
            symbols,
            attachable,
        })
    }

    fn cleanup(&self, file: &FilePath) {
        trace!(path = %file.path.display(), "nothing to clean up");
    }
}

fn is_elf(path: &Path) -> std::io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = std::fs::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == ELF_MAGIC),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}
