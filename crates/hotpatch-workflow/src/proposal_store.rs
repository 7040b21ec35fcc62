//! Change proposal store
//!
//! Holds at most one pending proposal per operator. The controller owns the
//! store through this trait so tests can inject a fresh one instead of sharing
//! process-wide state.

use async_trait::async_trait;
use hotpatch_core::{ChangeProposal, OperatorId, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Keyed storage for pending proposals
///
/// Each method is atomic for its key: `put` is a check-then-set that reports
/// what it replaced, and `take` is a check-then-delete.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    /// Pending proposal for `operator`, if any
    async fn get(&self, operator: &OperatorId) -> Result<Option<ChangeProposal>>;

    /// Store `proposal` for its operator, returning the proposal it replaced
    async fn put(&self, proposal: ChangeProposal) -> Result<Option<ChangeProposal>>;

    /// Remove and return the pending proposal for `operator`
    async fn take(&self, operator: &OperatorId) -> Result<Option<ChangeProposal>>;

    /// Discard the pending proposal for `operator`; true if one existed
    async fn delete(&self, operator: &OperatorId) -> Result<bool> {
        Ok(self.take(operator).await?.is_some())
    }
}

/// Process-local proposal store
#[derive(Debug, Default)]
pub struct InMemoryProposalStore {
    pending: Mutex<HashMap<OperatorId, ChangeProposal>>,
}

impl InMemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending proposals across all operators
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OperatorId, ChangeProposal>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProposalStore for InMemoryProposalStore {
    async fn get(&self, operator: &OperatorId) -> Result<Option<ChangeProposal>> {
        Ok(self.lock().get(operator).cloned())
    }

    async fn put(&self, proposal: ChangeProposal) -> Result<Option<ChangeProposal>> {
        let operator = proposal.operator.clone();
        let replaced = self.lock().insert(operator.clone(), proposal);
        if let Some(old) = &replaced {
            debug!("Proposal {} for {} replaced", old.id, operator);
        }
        Ok(replaced)
    }

    async fn take(&self, operator: &OperatorId) -> Result<Option<ChangeProposal>> {
        Ok(self.lock().remove(operator))
    }
}
