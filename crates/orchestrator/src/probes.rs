#![forbid(unsafe_code)]

use crate::domain::{Probe, ProbeId};
use crate::error::BoxError;

/// Installs and removes kernel-level hooks.
pub trait ProbeManager: Send + Sync {
    /// Install `probe` on behalf of the attacher called `name`.
    fn add_hook(&self, name: &str, probe: Probe) -> Result<(), BoxError>;
    /// Remove a previously installed hook.
    fn detach_hook(&self, id: &ProbeId) -> Result<(), BoxError>;
    /// Look up an installed hook.
    fn get_probe(&self, id: &ProbeId) -> Option<Probe>;
}
