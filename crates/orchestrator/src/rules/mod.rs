#![forbid(unsafe_code)]

//! Stateless rule matching: which rules apply to a library or an executable,
//! and which symbols they need.

mod hook_name;
mod rule;
mod rule_set;

pub use hook_name::HookName;
pub use rule::{AttachRule, AttachTarget, ExecutableFilter, ProbesSelector};
pub use rule_set::{RuleSet, SymbolRequest, symbol_requests};
