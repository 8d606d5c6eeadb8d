use crate::exclude::Exclude;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Attacher {
    /// Period of the reconciliation scan that compares the tracked processes
    /// against the live process table. Exit notifications can be lost, and a
    /// process can exit before its exec notification is handled; this scan
    /// repairs both. **Measured in seconds**.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub scan_interval: Duration,

    /// Root of the proc filesystem. Point this at the host procfs when running
    /// inside a container.
    pub proc_root: PathBuf,

    /// Whether every running process should be scanned once, synchronously,
    /// before subscribing to live process events.
    pub initial_scan: bool,

    /// Whether the process event source should use a push event stream
    /// instead of polling the process table.
    pub event_stream: bool,

    /// How long to keep retrying `<proc_root>/<pid>/exe` after an exec
    /// notification before giving up. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub exe_resolve_timeout: Duration,

    /// Period of the procfs process monitor when polling. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub poll_interval: Duration,

    /// Which processes and binaries never receive hooks.
    pub exclude: Exclude,
}

impl Default for Attacher {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            proc_root: PathBuf::from("/proc"),
            initial_scan: true,
            event_stream: false,
            exe_resolve_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(500),
            exclude: Exclude::default(),
        }
    }
}
