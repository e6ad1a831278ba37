//! # shimbox
//!
//! Runs an application against a virtual registry and file table.
//!
//! The binary is a thin front end over `shimbox-host`: it builds a
//! [`HostContext`](shimbox_host::HostContext) from a config file, supervises
//! one guest and exits with the guest's exit code.
//!
//! ```text
//! shimbox run --config host.json ./app.exe --verbose
//! shimbox snapshot ~/.config/shimbox/sandbox.json
//! ```

pub mod commands;
pub mod tracing_support;

pub use commands::{exit_code_for, load_config, render_snapshot, run, RunOptions};
pub use tracing_support::{init_subscriber, init_subscriber_with_config, TracingConfig, TracingFormat};
