use serde::{Deserialize, Serialize};

/// Default pattern for the executables of our own components.
pub const DEFAULT_INTERNAL_PATTERN: &str = r"uprobed/.*/(uprobed|[a-z-]+-agent)$";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Exclude {
    /// Never attach to the daemon's own PID.
    pub self_process: bool,

    /// Never attach to executables matching `internal_pattern`.
    pub internal: bool,

    /// Never attach to buildkit workers (`comm` equal to `buildkitd`).
    pub buildkit: bool,

    /// Never attach to binaries living under an ephemeral containerd mount.
    pub containerd_tmp: bool,

    /// Regular expression matched against resolved executable paths when
    /// `internal` is set.
    pub internal_pattern: String,
}

impl Default for Exclude {
    fn default() -> Self {
        Self {
            self_process: true,
            internal: true,
            buildkit: true,
            containerd_tmp: true,
            internal_pattern: DEFAULT_INTERNAL_PATTERN.to_string(),
        }
    }
}
