//! Reusable, parameterized, multi-step automation macros.
//!
//! Macros are JSON documents loaded from a directory tree, validated,
//! include-expanded and published as an immutable table. The executor
//! interprets them step by step against an [`backend::AutomationBackend`],
//! which may be a local session or a remote one reached over the
//! line-delimited RPC transport in [`rpc`].

pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod logging;
pub mod macros;
pub mod rpc;
pub mod types;

pub use backend::AutomationBackend;
pub use engine::MacroExecutor;
pub use macros::{MacroRegistry, MacroTable};
pub use types::{Error, ExecutionResult, Result};
