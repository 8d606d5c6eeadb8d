#![forbid(unsafe_code)]

use crate::error::Error;
use crate::process::ProcessRecord;
use crate::rules::AttachRule;
use std::path::Path;
use std::sync::Arc;

/// One symbol the binary inspector has to locate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolRequest {
    pub name: String,
    pub include_return_locations: bool,
    pub best_effort: bool,
}

/// The configured rules, in configured order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<AttachRule>>,
    handles_libraries: bool,
}

impl RuleSet {
    pub fn new(rules: impl IntoIterator<Item = AttachRule>) -> Self {
        let rules: Vec<_> = rules.into_iter().map(Arc::new).collect();
        let handles_libraries = rules.iter().any(|rule| rule.library_pattern().is_some());
        Self {
            rules,
            handles_libraries,
        }
    }

    pub fn from_config(rules: &[config::Rule]) -> Result<Self, Error> {
        let rules = rules
            .iter()
            .map(AttachRule::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    /// Whether any rule needs shared library events at all.
    pub fn handles_libraries(&self) -> bool {
        self.handles_libraries
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn for_library(&self, path: &Path) -> Vec<Arc<AttachRule>> {
        self.rules
            .iter()
            .filter(|rule| rule.matches_library(path))
            .cloned()
            .collect()
    }

    pub fn for_executable(&self, path: &Path, process: &ProcessRecord) -> Vec<Arc<AttachRule>> {
        self.rules
            .iter()
            .filter(|rule| rule.matches_executable(path, process))
            .cloned()
            .collect()
    }
}

/// Flatten every selector of every rule into symbol requests.
///
/// The same symbol requested by several selectors yields several requests, so
/// that a mandatory request is never hidden behind a best-effort one.
pub fn symbol_requests(rules: &[Arc<AttachRule>]) -> Vec<SymbolRequest> {
    rules
        .iter()
        .flat_map(|rule| rule.selectors())
        .flat_map(|selector| {
            selector.hooks.iter().map(|hook| SymbolRequest {
                name: hook.symbol.clone(),
                include_return_locations: hook.manual_return,
                best_effort: selector.is_best_effort(),
            })
        })
        .collect()
}
