#![forbid(unsafe_code)]

pub mod attacher;
pub mod domain;
pub mod error;
pub mod exclusion;
pub mod inspect;
pub mod probes;
pub mod process;
pub mod registry;
pub mod retry;
pub mod rules;
pub mod sources;

pub use attacher::{AttachCallback, AttacherStatus, Services, State, SyncReport, UprobeAttacher};
pub use domain::{FilePath, Probe, ProbeId};
pub use error::{BoxError, Error};
pub use exclusion::{ExcludeMode, Exclusion, ExclusionCounts, ExclusionFilter};
pub use inspect::{BinaryInspector, FunctionMetadata, Inspection};
pub use probes::ProbeManager;
pub use process::{ProcessRecord, ProcessTable};
pub use registry::{PathRegistry, RegistryStats};
pub use rules::{AttachRule, AttachTarget, HookName, ProbesSelector, RuleSet, SymbolRequest};
pub use sources::{
    FanotifyLibraryWatcher, LibraryEventSink, LibraryOpen, PidCallback, ProcessEventSource,
    ProcfsMonitor, SharedLibrarySource, Subscribers, Unsubscribe,
};
