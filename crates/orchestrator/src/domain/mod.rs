#![forbid(unsafe_code)]

mod file_path;
mod probe;

pub use file_path::FilePath;
pub use probe::{Probe, ProbeId};
