#![forbid(unsafe_code)]

use crate::domain::FilePath;
use crate::error::BoxError;
use crate::rules::SymbolRequest;
use std::collections::HashMap;

/// Attach locations of one symbol, as offsets inside the binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionMetadata {
    pub entry_location: u64,
    /// Only filled when return locations were requested.
    pub return_locations: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inspection {
    /// Symbols that were found. Requested symbols missing from the binary
    /// are simply absent.
    pub symbols: HashMap<String, FunctionMetadata>,
    /// Whether hooks can be installed in this binary at all.
    pub attachable: bool,
}

/// Locates symbols inside binaries.
pub trait BinaryInspector: Send + Sync {
    fn inspect(&self, file: &FilePath, requests: &[SymbolRequest]) -> Result<Inspection, BoxError>;
    /// Release whatever `inspect` keeps for `file`.
    fn cleanup(&self, file: &FilePath);
}
