#![forbid(unsafe_code)]

//! Process table access through procfs.

use crate::error::Error;
use crate::retry::{RetryPolicy, retry};
use procfs::process::{MMapPath, Process};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::trace;

/// Reading `comm` races with the start of short-lived processes.
const COMM_READ_POLICY: RetryPolicy = RetryPolicy::attempts(30, Duration::from_millis(1));

/// Metadata of a live process, resolved when an event is handled and dropped
/// afterwards. The command name is only read if someone asks for it.
#[derive(Debug)]
pub struct ProcessRecord {
    pub pid: u32,
    pub exe: PathBuf,
    proc_root: Arc<Path>,
    comm: OnceLock<Option<String>>,
}

impl ProcessRecord {
    pub fn new(proc_root: impl Into<PathBuf>, pid: u32, exe: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            exe: exe.into(),
            proc_root: Arc::from(proc_root.into().as_path()),
            comm: OnceLock::new(),
        }
    }

    /// Command name of the process, `None` if it could not be read.
    pub fn comm(&self) -> Option<&str> {
        self.comm
            .get_or_init(|| read_comm(&self.proc_root, self.pid))
            .as_deref()
    }
}

/// Read `<proc_root>/<pid>/comm`, retrying a bounded number of times.
pub fn read_comm(proc_root: &Path, pid: u32) -> Option<String> {
    let path = proc_root.join(pid.to_string()).join("comm");
    match retry(&COMM_READ_POLICY, || std::fs::read_to_string(&path)) {
        Ok(comm) => Some(comm.trim().to_string()),
        Err(exhausted) => {
            trace!(pid, attempts = exhausted.attempts, err = %exhausted.last, "failed to read comm");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessTable {
    proc_root: Arc<Path>,
}

impl ProcessTable {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: Arc::from(proc_root.into().as_path()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.proc_root
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.pid_dir(pid).exists()
    }

    /// PIDs currently present in the process table.
    pub fn live_pids(&self) -> Result<Vec<u32>, Error> {
        let mut pids = Vec::new();
        for process in procfs::process::all_processes_with_root(&self.proc_root)? {
            match process {
                Ok(process) => pids.push(process.pid as u32),
                Err(err) => trace!(?err, "skipping process entry"),
            }
        }
        Ok(pids)
    }

    /// Resolve the executable of `pid`.
    ///
    /// The `exe` link may not be readable yet right after an exec
    /// notification, so the read is retried until `timeout`.
    pub fn resolve(&self, pid: u32, timeout: Duration) -> Result<ProcessRecord, Error> {
        let link = self.pid_dir(pid).join("exe");
        let policy = RetryPolicy::until(timeout, Duration::from_millis(1));
        let exe = retry(&policy, || std::fs::read_link(&link)).map_err(|exhausted| {
            Error::PathResolutionTimeout {
                pid,
                timeout,
                source: exhausted.last,
            }
        })?;
        Ok(ProcessRecord {
            pid,
            exe,
            proc_root: Arc::clone(&self.proc_root),
            comm: OnceLock::new(),
        })
    }

    /// Distinct file-backed mappings of `pid`, in path order.
    pub fn mapped_libraries(&self, pid: u32) -> Result<Vec<PathBuf>, Error> {
        let process = Process::new_with_root(self.pid_dir(pid))?;
        let mut libraries = BTreeSet::new();
        for map in process.maps()? {
            if map.inode == 0 {
                continue;
            }
            let MMapPath::Path(path) = map.pathname else {
                continue;
            };
            if let Some(path) = sanitize_path(&path) {
                libraries.insert(path);
            }
        }
        Ok(libraries.into_iter().collect())
    }
}

fn sanitize_path(path: &Path) -> Option<PathBuf> {
    if !path.has_root() {
        return None;
    }
    let path_str = path.to_str()?;
    if path_str.contains("(deleted)") {
        return None;
    }
    Some(PathBuf::from(path_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a21000 r-xp 00000000 fd:01 1001 /usr/bin/curl
7f1c2d3e4000-7f1c2d3f5000 r-xp 00000000 fd:01 2002 /usr/lib/libssl.so.3
7f1c2d3f5000-7f1c2d3f6000 r--p 00011000 fd:01 2002 /usr/lib/libssl.so.3
7f1c2d400000-7f1c2d401000 rw-p 00000000 00:00 0
7f1c2d500000-7f1c2d501000 r-xp 00000000 fd:01 3003 /usr/lib/libgone.so (deleted)
7ffd4e000000-7ffd4e021000 rw-p 00000000 00:00 0                          [stack]
";

    fn fake_process(root: &Path, pid: u32, exe: &str, comm: &str, maps: &str) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        symlink(exe, dir.join("exe")).unwrap();
        std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        std::fs::write(dir.join("maps"), maps).unwrap();
    }

    #[test]
    fn resolves_exe_and_lazy_comm() {
        let root = tempdir().unwrap();
        fake_process(root.path(), 100, "/usr/bin/curl", "curl", MAPS);
        let table = ProcessTable::new(root.path());
        assert_eq!(table.root(), root.path());

        let record = table.resolve(100, Duration::from_millis(10)).unwrap();
        assert_eq!(record.exe, PathBuf::from("/usr/bin/curl"));
        assert_eq!(record.comm(), Some("curl"));
    }

    #[test]
    fn unresolvable_exe_times_out() {
        let root = tempdir().unwrap();
        let table = ProcessTable::new(root.path());

        let err = table.resolve(4242, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, Error::PathResolutionTimeout { pid: 4242, .. }));
    }

    #[test]
    fn mapped_libraries_are_distinct_and_file_backed() {
        let root = tempdir().unwrap();
        fake_process(root.path(), 100, "/usr/bin/curl", "curl", MAPS);
        let table = ProcessTable::new(root.path());

        let libs = table.mapped_libraries(100).unwrap();
        assert_eq!(
            libs,
            vec![
                PathBuf::from("/usr/bin/curl"),
                PathBuf::from("/usr/lib/libssl.so.3"),
            ]
        );
    }

    #[test]
    fn live_pids_lists_numeric_entries() {
        let root = tempdir().unwrap();
        fake_process(root.path(), 100, "/usr/bin/curl", "curl", MAPS);
        fake_process(root.path(), 200, "/usr/bin/wget", "wget", MAPS);
        std::fs::create_dir_all(root.path().join("sys")).unwrap();
        let table = ProcessTable::new(root.path());

        let mut pids = table.live_pids().unwrap();
        pids.sort_unstable();
        assert_eq!(pids, vec![100, 200]);
        assert!(table.is_alive(200));
        assert!(!table.is_alive(300));
    }

    #[test]
    fn sanitize_rejects_relative_and_deleted() {
        assert_eq!(sanitize_path(Path::new("relative/lib.so")), None);
        assert_eq!(sanitize_path(Path::new("/lib/x.so (deleted)")), None);
        assert_eq!(
            sanitize_path(Path::new("/lib/x.so")),
            Some(PathBuf::from("/lib/x.so"))
        );
    }
}
