//! A Debug Adapter Protocol bridge for Chrome-style script runtimes.
//!
//! This crate speaks DAP toward an IDE and the remote debugging protocol
//! (`Debugger`/`Runtime`/`Console` domains) toward a script runtime,
//! translating breakpoints, stack traces, variables, and pause state between
//! the two. The runtime connection comes from `kite-rdp`; path, source-map,
//! and line/column transformation are injected behind the seams in
//! [`transform`].

pub mod adapter;
pub mod breakpoints;
pub mod config;
pub mod dap;
pub mod error;
pub mod eval;
pub mod handles;
pub mod pause;
pub mod scripts;
pub mod server;
pub mod skip;
pub mod stack;
pub mod transform;
pub mod variables;

pub use adapter::DebugAdapter;
pub use config::{AttachConfig, InitializeArguments};
pub use error::{AdapterError, AdapterResult};
pub use transform::Transformers;
