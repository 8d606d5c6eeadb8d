#![forbid(unsafe_code)]

use crate::error::Error;
use crate::process::ProcessRecord;
use crate::rules::HookName;
use bitflags::bitflags;
use config::SelectorMode;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

bitflags! {
    /// Kinds of binaries a rule attaches to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttachTarget: u8 {
        const EXECUTABLE = 1 << 0;
        const SHARED_LIBRARY = 1 << 1;
    }
}

impl From<config::Target> for AttachTarget {
    fn from(target: config::Target) -> Self {
        match target {
            config::Target::Executable => AttachTarget::EXECUTABLE,
            config::Target::SharedLibrary => AttachTarget::SHARED_LIBRARY,
        }
    }
}

/// Predicate deciding whether an executable (and the process running it)
/// should receive the rule's hooks.
pub type ExecutableFilter = Arc<dyn Fn(&Path, &ProcessRecord) -> bool + Send + Sync>;

/// A group of hooks attached together and validated together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbesSelector {
    pub mode: SelectorMode,
    pub hooks: Vec<HookName>,
}

impl ProbesSelector {
    pub fn new<I, S>(mode: SelectorMode, names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hooks = names
            .into_iter()
            .map(|name| name.as_ref().parse())
            .collect::<Result<Vec<HookName>, _>>()?;
        Ok(Self { mode, hooks })
    }

    pub fn all_of<I: IntoIterator<Item = S>, S: AsRef<str>>(names: I) -> Result<Self, Error> {
        Self::new(SelectorMode::AllOf, names)
    }

    pub fn one_of<I: IntoIterator<Item = S>, S: AsRef<str>>(names: I) -> Result<Self, Error> {
        Self::new(SelectorMode::OneOf, names)
    }

    pub fn best_effort<I: IntoIterator<Item = S>, S: AsRef<str>>(names: I) -> Result<Self, Error> {
        Self::new(SelectorMode::BestEffort, names)
    }

    /// Whether a symbol missing from the binary is tolerated.
    pub fn is_best_effort(&self) -> bool {
        self.mode != SelectorMode::AllOf
    }

    /// Check the selector's requirement once every hook of an activation has
    /// been processed. `is_active` reports whether a hook has at least one
    /// running probe.
    pub fn validate(&self, path: &Path, is_active: impl Fn(&HookName) -> bool) -> Result<(), Error> {
        let failure = |reason: String| Error::ProbeValidation {
            path: path.to_path_buf(),
            reason,
        };
        match self.mode {
            SelectorMode::BestEffort => Ok(()),
            SelectorMode::AllOf => match self.hooks.iter().find(|hook| !is_active(hook)) {
                Some(hook) => Err(failure(format!("{hook} is not active"))),
                None => Ok(()),
            },
            SelectorMode::OneOf => {
                if self.hooks.iter().any(is_active) {
                    Ok(())
                } else {
                    let names: Vec<_> = self.hooks.iter().map(|h| h.func_name.as_str()).collect();
                    Err(failure(format!("none of {names:?} is active")))
                }
            }
        }
    }
}

/// Immutable description of which binaries receive which hooks.
#[derive(Clone)]
pub struct AttachRule {
    library_pattern: Option<Regex>,
    executable_filter: Option<ExecutableFilter>,
    targets: AttachTarget,
    selectors: Vec<ProbesSelector>,
}

impl AttachRule {
    pub fn new(targets: AttachTarget) -> Self {
        Self {
            library_pattern: None,
            executable_filter: None,
            targets,
            selectors: Vec::new(),
        }
    }

    pub fn with_library_pattern(mut self, pattern: &str) -> Result<Self, Error> {
        self.library_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_executable_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Path, &ProcessRecord) -> bool + Send + Sync + 'static,
    {
        self.executable_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_selector(mut self, selector: ProbesSelector) -> Self {
        self.selectors.push(selector);
        self
    }

    pub fn targets(&self) -> AttachTarget {
        self.targets
    }

    pub fn selectors(&self) -> &[ProbesSelector] {
        &self.selectors
    }

    pub fn library_pattern(&self) -> Option<&Regex> {
        self.library_pattern.as_ref()
    }

    pub fn can_target(&self, target: AttachTarget) -> bool {
        self.targets.intersects(target)
    }

    pub fn matches_library(&self, path: &Path) -> bool {
        if !self.can_target(AttachTarget::SHARED_LIBRARY) {
            return false;
        }
        self.library_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(&path.to_string_lossy()))
    }

    pub fn matches_executable(&self, path: &Path, process: &ProcessRecord) -> bool {
        if !self.can_target(AttachTarget::EXECUTABLE) {
            return false;
        }
        self.executable_filter
            .as_ref()
            .is_none_or(|filter| filter(path, process))
    }
}

impl TryFrom<&config::Rule> for AttachRule {
    type Error = Error;

    fn try_from(rule: &config::Rule) -> Result<Self, Self::Error> {
        let targets = rule
            .targets
            .iter()
            .fold(AttachTarget::empty(), |acc, target| acc | (*target).into());
        let mut attach_rule = AttachRule::new(targets);
        if let Some(pattern) = &rule.library {
            attach_rule = attach_rule.with_library_pattern(pattern)?;
        }
        for selector in &rule.selectors {
            attach_rule = attach_rule.with_selector(ProbesSelector::new(
                selector.mode,
                &selector.probes,
            )?);
        }
        Ok(attach_rule)
    }
}

impl fmt::Debug for AttachRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachRule")
            .field("library_pattern", &self.library_pattern.as_ref().map(Regex::as_str))
            .field("executable_filter", &self.executable_filter.is_some())
            .field("targets", &self.targets)
            .field("selectors", &self.selectors)
            .finish()
    }
}
