//! # hotpatch-workflow
//!
//! Propose/confirm workflow for remote file patches.
//!
//! This crate provides:
//! - Instruction parsing and target resolution
//! - Unified diff previews
//! - The per-operator change proposal store
//! - The workflow controller (propose, confirm, cancel, debug, rollback)
//! - Audit log, conversation memory and snapshots
//! - Chat command dispatch for transports

pub mod audit;
pub mod chat;
pub mod controller;
pub mod diff;
pub mod instruction;
pub mod memory;
pub mod proposal_store;
pub mod snapshots;

pub use audit::AuditLog;
pub use chat::{ChatCommand, ChatReply, ChatSession};
pub use controller::{
    ControllerConfig, HealthOutcome, Preview, ProposeOutcome, Rejection, ResolveOutcome,
    SnapshotOutcome, WorkflowController,
};
pub use diff::{render_diff, render_line_diff, DiffPreview, TRUNCATION_MARKER};
pub use instruction::{ParseFailure, ParsedInstruction, TargetTable};
pub use memory::{FileMemory, MemoryProvider};
pub use proposal_store::{InMemoryProposalStore, ProposalStore};
pub use snapshots::{SnapshotInfo, SnapshotStore};
