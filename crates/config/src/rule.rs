use serde::{Deserialize, Serialize};

/// Kind of binary a rule can attach to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// The main executable of a process.
    #[serde(rename = "executable")]
    Executable,

    /// Shared libraries opened or mapped by a process.
    #[serde(rename = "shared_library")]
    SharedLibrary,
}

/// How missing symbols are handled for a group of probes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorMode {
    /// Every probe is mandatory. A missing symbol fails the whole activation.
    #[default]
    #[serde(rename = "all_of")]
    AllOf,

    /// Each probe is optional, but at least one of them must end up attached.
    #[serde(rename = "one_of")]
    OneOf,

    /// Every probe is optional.
    #[serde(rename = "best_effort")]
    BestEffort,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Selector {
    pub mode: SelectorMode,

    /// Hook names following `probeType__symbol[__return]`, e.g.
    /// `uprobe__SSL_write` or `uprobe__SSL_read__return`.
    pub probes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Rule {
    /// Regular expression matched against shared library paths. Only used
    /// when `targets` contains `shared_library`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,

    pub targets: Vec<Target>,

    pub selectors: Vec<Selector>,
}
