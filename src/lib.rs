//! blockflow - walk block graphs with branching, loops, splits and pause/resume
//!
//! A flow version is a tree of steps rooted at a trigger. [`workflow::FlowRunner`]
//! walks it against a [`block::BlockRegistry`], records every step in a
//! serializable [`workflow::ExecutionContext`], and stops at the first pause.
//! Resuming hands that context back together with the external payload.

pub mod block;
pub mod cli;
pub mod config;
pub mod logging;
pub mod template;
pub mod workflow;
