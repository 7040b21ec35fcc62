//! # hotpatch-core
//!
//! Core types for hotpatch, a chat-driven remote patch workflow.
//!
//! An operator names a target file and describes a change. The file is fetched
//! from the code host, rewritten by a language model, and shown back as a diff.
//! Nothing is committed until the operator confirms.
//!
//! ## Core Paradigm
//!
//! - Targets ARE short keys into a static configuration table
//! - Pending work IS one proposal per operator
//! - Concurrency safety IS the code host's version token (optimistic writes)
//! - Commit and redeploy are separate steps, and both outcomes are reported

mod error;
mod types;

pub mod config;
pub mod fail_open;

pub use config::HotpatchConfig;
pub use error::{HotpatchError, Result};
pub use types::*;
