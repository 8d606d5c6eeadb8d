use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::{Path, PathBuf};

/// uprobed: attaches user-space probes to running binaries.
///
/// uprobed watches process execs and shared library loads, matches them
/// against the configured rules and keeps the hooks of every matching binary
/// installed for as long as some live process references it.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/uprobed/config.toml` and `/etc/uprobed/config.d/*.toml`, where
    /// the latter being a glob pattern. If they don't exist, the default
    /// configuration is used.
    #[arg(short, long, value_parser = validate_file)]
    pub config: Option<PathBuf>,

    /// Root of the proc filesystem, overriding the configured one.
    #[arg(long, value_parser = validate_dir)]
    pub proc_root: Option<PathBuf>,

    /// Skip the scan of already running processes at startup.
    #[arg(long)]
    pub no_initial_scan: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,
}

impl Cli {
    /// Apply command line overrides on top of the loaded settings.
    pub fn apply(&self, settings: &mut config::Attacher) {
        if let Some(root) = &self.proc_root {
            settings.proc_root = root.clone();
        }
        if self.no_initial_scan {
            settings.initial_scan = false;
        }
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.is_file() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

#[inline(always)]
fn validate_dir(dir: &str) -> Result<PathBuf, String> {
    let path = Path::new(dir);
    if path.is_dir() {
        Ok(path.to_owned())
    } else {
        Err(format!("Not a directory: {:?}", path))
    }
}
