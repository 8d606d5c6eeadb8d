#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;

/// Identity of an installed hook: the instrumentation program name and a UID
/// unique per binary and attach location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId {
    pub func_name: String,
    pub uid: String,
}

impl ProbeId {
    pub fn new(func_name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            func_name: func_name.into(),
            uid: uid.into(),
        }
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.func_name, self.uid)
    }
}

/// A hook bound to one code location of one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub id: ProbeId,
    pub binary_path: PathBuf,
    /// Offset of the attach location inside the binary.
    pub offset: u64,
    /// Symbol the location was derived from.
    pub symbol: String,
    pub running: bool,
}
