#![forbid(unsafe_code)]

pub mod cli;
pub mod dry_run;
pub mod signals;
