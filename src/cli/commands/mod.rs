//! CLI command implementations.

pub mod deployment;
pub mod ledger;
pub mod run;
