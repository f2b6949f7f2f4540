//! CLI module for blockflow
//!
//! This module provides:
//! - Command implementations (run, resume, validate, blocks)
//! - Output handlers (console, JSON, quiet)
//!
//! # Example
//!
//! ```ignore
//! use blockflow::cli::{commands, output};
//!
//! let handler = output::create_handler(output::OutputMode::Console, false);
//! let exit_code = commands::run_flow(&runner, path, payload, None, &*handler).await?;
//! ```

pub mod commands;
pub mod output;

pub use commands::{exit_code, list_blocks, resume_flow, run_flow, validate_flow};
pub use output::{OutputEvent, OutputHandler, OutputMode, create_handler};
