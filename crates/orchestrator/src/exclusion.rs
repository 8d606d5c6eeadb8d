#![forbid(unsafe_code)]

use crate::domain::FilePath;
use crate::error::Error;
use crate::process::{ProcessRecord, read_comm};
use bitflags::bitflags;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

const BUILDKIT_COMM: &str = "buildkitd";
const CONTAINERD_TMP_MOUNT: &str = "tmpmounts/containerd-mount";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExcludeMode: u8 {
        /// The engine's own PID.
        const SELF = 1 << 0;
        /// Executables of our own components.
        const INTERNAL = 1 << 1;
        /// Buildkit workers.
        const BUILDKIT = 1 << 2;
        /// Binaries under ephemeral containerd mounts.
        const CONTAINERD_TMP = 1 << 3;
    }
}

impl From<&config::Exclude> for ExcludeMode {
    fn from(exclude: &config::Exclude) -> Self {
        let mut mode = ExcludeMode::empty();
        mode.set(ExcludeMode::SELF, exclude.self_process);
        mode.set(ExcludeMode::INTERNAL, exclude.internal);
        mode.set(ExcludeMode::BUILDKIT, exclude.buildkit);
        mode.set(ExcludeMode::CONTAINERD_TMP, exclude.containerd_tmp);
        mode
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exclusion {
    SelfProcess,
    InternalProcess,
    Buildkit,
    ContainerdTmpMount,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Exclusion::SelfProcess => "self-excluded",
            Exclusion::InternalProcess => "internal process rejected",
            Exclusion::Buildkit => "buildkit worker",
            Exclusion::ContainerdTmpMount => "containerd temporary mount",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExclusionCounts {
    pub self_process: u64,
    pub internal: u64,
    pub buildkit: u64,
    pub containerd_tmp: u64,
}

#[derive(Debug, Default)]
struct Counters {
    self_process: AtomicU64,
    internal: AtomicU64,
    buildkit: AtomicU64,
    containerd_tmp: AtomicU64,
}

/// Exclusion policy applied before rule matching.
///
/// Stages run in a fixed order and stop at the first match: own PID,
/// internal executable, buildkit worker, containerd temporary mount.
#[derive(Debug)]
pub struct ExclusionFilter {
    mode: ExcludeMode,
    self_pid: u32,
    internal: Regex,
    proc_root: PathBuf,
    counters: Counters,
}

impl ExclusionFilter {
    pub fn new(
        mode: ExcludeMode,
        internal_pattern: &str,
        self_pid: u32,
        proc_root: impl Into<PathBuf>,
    ) -> Result<Self, Error> {
        Ok(Self {
            mode,
            self_pid,
            internal: Regex::new(internal_pattern)?,
            proc_root: proc_root.into(),
            counters: Counters::default(),
        })
    }

    pub fn from_config(settings: &config::Attacher) -> Result<Self, Error> {
        Self::new(
            ExcludeMode::from(&settings.exclude),
            &settings.exclude.internal_pattern,
            std::process::id(),
            settings.proc_root.clone(),
        )
    }

    pub fn self_pid(&self) -> u32 {
        self.self_pid
    }

    /// First stage, the only one that applies to library events.
    pub fn check_pid(&self, pid: u32) -> Result<(), Error> {
        if self.mode.contains(ExcludeMode::SELF) && pid == self.self_pid {
            return Err(self.excluded(pid, Exclusion::SelfProcess));
        }
        Ok(())
    }

    /// Remaining stages, once the executable of the process is known.
    pub fn check_process(&self, process: &ProcessRecord) -> Result<(), Error> {
        if self.mode.contains(ExcludeMode::INTERNAL)
            && self.internal.is_match(&process.exe.to_string_lossy())
        {
            return Err(self.excluded(process.pid, Exclusion::InternalProcess));
        }
        if self.mode.contains(ExcludeMode::BUILDKIT) && process.comm().is_some_and(is_buildkit) {
            return Err(self.excluded(process.pid, Exclusion::Buildkit));
        }
        if self.mode.contains(ExcludeMode::CONTAINERD_TMP) && is_containerd_tmp_mount(&process.exe)
        {
            return Err(self.excluded(process.pid, Exclusion::ContainerdTmpMount));
        }
        Ok(())
    }

    /// Checks repeated when a binary is about to be activated, since the
    /// activating process and the concrete path are only known then.
    pub fn check_binary(&self, file: &FilePath) -> Result<(), Error> {
        if self.mode.contains(ExcludeMode::BUILDKIT)
            && read_comm(&self.proc_root, file.pid).is_some_and(|comm| is_buildkit(&comm))
        {
            return Err(self.excluded(file.pid, Exclusion::Buildkit));
        }
        if self.mode.contains(ExcludeMode::CONTAINERD_TMP) && is_containerd_tmp_mount(&file.path) {
            return Err(self.excluded(file.pid, Exclusion::ContainerdTmpMount));
        }
        Ok(())
    }

    pub fn counts(&self) -> ExclusionCounts {
        ExclusionCounts {
            self_process: self.counters.self_process.load(Ordering::Relaxed),
            internal: self.counters.internal.load(Ordering::Relaxed),
            buildkit: self.counters.buildkit.load(Ordering::Relaxed),
            containerd_tmp: self.counters.containerd_tmp.load(Ordering::Relaxed),
        }
    }

    fn excluded(&self, pid: u32, reason: Exclusion) -> Error {
        let counter = match reason {
            Exclusion::SelfProcess => &self.counters.self_process,
            Exclusion::InternalProcess => &self.counters.internal,
            Exclusion::Buildkit => &self.counters.buildkit,
            Exclusion::ContainerdTmpMount => &self.counters.containerd_tmp,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(pid, %reason, "excluded");
        Error::Excluded { pid, reason }
    }
}

pub fn is_buildkit(comm: &str) -> bool {
    comm.trim() == BUILDKIT_COMM
}

pub fn is_containerd_tmp_mount(path: &Path) -> bool {
    path.to_string_lossy().contains(CONTAINERD_TMP_MOUNT)
}
