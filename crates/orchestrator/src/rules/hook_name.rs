#![forbid(unsafe_code)]

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// Name of an instrumentation program, following
/// `probeType__symbol[__return]`.
///
/// The `__return` suffix asks for a hook on every return site of the symbol
/// instead of a single hook at its entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookName {
    pub func_name: String,
    pub symbol: String,
    pub manual_return: bool,
}

impl FromStr for HookName {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::InvalidProbeName {
            name: name.to_string(),
            reason,
        };

        let mut parts = name.split("__");
        let _probe_type = parts.next();
        let symbol = match parts.next() {
            Some(symbol) if !symbol.is_empty() => symbol,
            Some(_) => return Err(invalid("empty function name")),
            None => {
                return Err(invalid(
                    "no double underscore (__) separating probe type and function name",
                ));
            }
        };
        let manual_return = match parts.next() {
            None => false,
            Some("return") => true,
            Some(_) => {
                return Err(invalid(
                    "unexpected third part, format should be probeType__funcName[__return]",
                ));
            }
        };

        Ok(Self {
            func_name: name.to_string(),
            symbol: symbol.to_string(),
            manual_return,
        })
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.func_name)
    }
}
