//! Shared building blocks for the vpnd daemon.
//!
//! - [`shell`]: helper process execution with redacted logging
//! - [`net`]: address classification, interface enumeration, egress probes
//! - [`config`]: daemon TOML configuration and state-directory layout

pub mod config;
pub mod net;
pub mod shell;

pub use shell::{CommandOutput, CommandRunner, ProcessRunner, ShellCommand, ShellError};
