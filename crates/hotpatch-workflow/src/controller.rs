//! Workflow controller: propose, review, confirm or cancel
//!
//! The controller is the only component that touches the collaborators. Every
//! failure is turned into an outcome value whose `Display` is the message the
//! operator sees; nothing propagates out as an error.
//!
//! Per operator the state machine is `NoProposal -> Pending` on a successful
//! propose and `Pending -> NoProposal` on any resolve or on overwrite by a new
//! propose. Calls for one operator are serialized; distinct operators never
//! block each other.

use chrono::Utc;
use hotpatch_core::fail_open::fail_open;
use hotpatch_core::config::Limits;
use hotpatch_core::{
    AuditEvent, AuditRecord, ChangeProposal, Decision, DeployOutcome, HotpatchConfig,
    MemoryEntry, OperatorId, ProposalKind, TargetSpec,
};
use hotpatch_remote::{BlobStore, DeployTrigger, TransformRequest, TransformService};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::diff::{render_diff, DiffPreview};
use crate::instruction::{ParseFailure, TargetTable};
use crate::memory::{FileMemory, MemoryProvider};
use crate::proposal_store::{InMemoryProposalStore, ProposalStore};
use crate::snapshots::{SnapshotInfo, SnapshotStore};

/// Characters of the error log used by debug and health
pub const ERROR_TAIL_CHARS: usize = 1000;

/// Fixed reply for anyone but the authorized operator
pub const NOT_AUTHORIZED: &str = "Not authorized.";

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// The single operator allowed to propose and resolve
    pub authorized_operator: OperatorId,
    pub limits: Limits,
    /// Crash log read by `propose_debug` and `health`
    pub error_log: PathBuf,
}

impl ControllerConfig {
    pub fn new(authorized_operator: impl Into<OperatorId>) -> Self {
        Self {
            authorized_operator: authorized_operator.into(),
            limits: Limits::default(),
            error_log: PathBuf::from("error_log.txt"),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_log = path.into();
        self
    }

    pub fn from_config(config: &HotpatchConfig) -> Self {
        Self {
            authorized_operator: OperatorId::new(config.authorized_operator.trim()),
            limits: config.limits.clone(),
            error_log: config.error_log.clone(),
        }
    }
}

/// A successful propose, ready for review
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub proposal_id: Uuid,
    pub target: TargetSpec,
    pub instruction: String,
    pub kind: ProposalKind,
    pub diff: DiffPreview,
}

impl std::fmt::Display for Preview {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let heading = match &self.kind {
            ProposalKind::Edit => "Proposed change",
            ProposalKind::Debug => "Proposed crash fix",
            ProposalKind::Restore { .. } => "Proposed rollback",
        };
        write!(
            f,
            "{} for {} ({}):\n```diff\n{}\n```",
            heading, self.target.key, self.target, self.diff
        )
    }
}

/// Why a propose (or another read-only command) did not go through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Unauthorized,
    Parse(ParseFailure),
    /// The blob store could not be read
    StoreRead(String),
    /// Transform failed, timed out or produced unusable output
    Transform(String),
    /// Debug requested with an empty or missing error log
    NothingToFix,
    Snapshot(String),
    AuditLog(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "{}", NOT_AUTHORIZED),
            Self::Parse(failure) => write!(f, "{}", failure),
            Self::StoreRead(reason) => write!(f, "Could not read the target file: {}", reason),
            Self::Transform(reason) => write!(f, "Transform failed: {}", reason),
            Self::NothingToFix => write!(f, "No crash logs."),
            Self::Snapshot(reason) => write!(f, "Snapshot failed: {}", reason),
            Self::AuditLog(reason) => write!(f, "Deploy log unavailable: {}", reason),
        }
    }
}

/// Result of `propose`, `propose_debug` and `propose_restore`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposeOutcome {
    Preview(Preview),
    Rejected(Rejection),
}

impl ProposeOutcome {
    pub fn is_preview(&self) -> bool {
        matches!(self, Self::Preview(_))
    }

    pub fn preview(&self) -> Option<&Preview> {
        match self {
            Self::Preview(preview) => Some(preview),
            Self::Rejected(_) => None,
        }
    }
}

impl std::fmt::Display for ProposeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preview(preview) => write!(f, "{}", preview),
            Self::Rejected(rejection) => write!(f, "{}", rejection),
        }
    }
}

/// Result of `resolve`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Unauthorized,
    NothingPending,
    /// Proposal outlived `proposal_ttl_secs`; discarded without writing
    Expired,
    Cancelled,
    /// The stored version token was stale; nothing written
    Conflict,
    /// The write failed for a reason other than a stale token
    WriteFailed { reason: String },
    Written { deploy: DeployOutcome },
}

impl ResolveOutcome {
    /// Short status line for a written change
    pub fn status_text(&self) -> Option<&'static str> {
        match self {
            Self::Written { deploy } if deploy.is_success() => Some("written; deployed"),
            Self::Written { .. } => Some("written; deploy failed"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolveOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "{}", NOT_AUTHORIZED),
            Self::NothingPending => write!(f, "No pending change."),
            Self::Expired => write!(f, "Pending change expired. Propose it again."),
            Self::Cancelled => write!(f, "Change cancelled."),
            Self::Conflict => write!(
                f,
                "Someone changed this file since it was proposed. Nothing was written; propose again."
            ),
            Self::WriteFailed { reason } => write!(f, "Write failed: {}", reason),
            Self::Written { .. } => write!(f, "{}", self.status_text().unwrap_or_default()),
        }
    }
}

/// Result of `health`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Unauthorized,
    Healthy,
    /// Tail of the error log
    Crashed { tail: String },
}

impl std::fmt::Display for HealthOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "{}", NOT_AUTHORIZED),
            Self::Healthy => write!(f, "Healthy."),
            Self::Crashed { tail } => write!(f, "Crash:\n\n{}", tail),
        }
    }
}

/// Result of `snapshot`
pub type SnapshotOutcome = std::result::Result<SnapshotInfo, Rejection>;

/// Where the proposed content comes from
enum Rewrite {
    /// Ask the transform service
    Transform,
    /// Use the given content as is
    Replace(String),
}

/// Drives the propose/resolve workflow against the configured collaborators
pub struct WorkflowController {
    config: ControllerConfig,
    targets: TargetTable,
    blob_store: Arc<dyn BlobStore>,
    transform: Arc<dyn TransformService>,
    deploy: Arc<dyn DeployTrigger>,
    proposals: Arc<dyn ProposalStore>,
    memory: Option<Arc<dyn MemoryProvider>>,
    audit: Option<AuditLog>,
    snapshots: Option<SnapshotStore>,
    operator_locks: Mutex<HashMap<OperatorId, Arc<AsyncMutex<()>>>>,
}

impl WorkflowController {
    /// Controller with an in-memory proposal store and no audit, memory or snapshots
    pub fn new(
        config: ControllerConfig,
        targets: TargetTable,
        blob_store: Arc<dyn BlobStore>,
        transform: Arc<dyn TransformService>,
        deploy: Arc<dyn DeployTrigger>,
    ) -> Self {
        Self {
            config,
            targets,
            blob_store,
            transform,
            deploy,
            proposals: Arc::new(InMemoryProposalStore::new()),
            memory: None,
            audit: None,
            snapshots: None,
            operator_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Controller wired to the file-backed state under `config.state_dir`
    pub fn from_config(
        config: &HotpatchConfig,
        blob_store: Arc<dyn BlobStore>,
        transform: Arc<dyn TransformService>,
        deploy: Arc<dyn DeployTrigger>,
    ) -> Self {
        let memory = FileMemory::new(config.memory_path(), config.limits.memory_retained_entries);

        Self::new(
            ControllerConfig::from_config(config),
            TargetTable::from_config(config),
            blob_store,
            transform,
            deploy,
        )
        .with_memory(Arc::new(memory))
        .with_audit_log(AuditLog::new(config.audit_log_path()))
        .with_snapshots(SnapshotStore::new(config.snapshot_dir()))
    }

    pub fn with_proposal_store(mut self, proposals: Arc<dyn ProposalStore>) -> Self {
        self.proposals = proposals;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn targets(&self) -> &TargetTable {
        &self.targets
    }

    pub fn is_authorized(&self, operator: &OperatorId) -> bool {
        *operator == self.config.authorized_operator
    }

    /// Pending proposal for an authorized operator
    pub async fn pending(&self, operator: &OperatorId) -> Option<ChangeProposal> {
        if !self.is_authorized(operator) {
            return None;
        }
        self.proposals.get(operator).await.ok().flatten()
    }

    /// Turn `"<target>: <instruction>"` into a pending proposal
    pub async fn propose(&self, operator: &OperatorId, raw_text: &str) -> ProposeOutcome {
        if !self.is_authorized(operator) {
            warn!("Rejected propose from unauthorized operator {}", operator);
            return ProposeOutcome::Rejected(Rejection::Unauthorized);
        }

        let parsed = match self.targets.parse(raw_text) {
            Ok(parsed) => parsed,
            Err(failure) => {
                debug!("Instruction did not parse: {:?}", failure);
                return ProposeOutcome::Rejected(Rejection::Parse(failure));
            }
        };

        let lock = self.operator_lock(operator);
        let _guard = lock.lock().await;
        self.propose_locked(
            operator,
            parsed.target,
            parsed.instruction,
            ProposalKind::Edit,
            Rewrite::Transform,
        )
        .await
    }

    /// Propose a fix for the latest crash in the error log
    pub async fn propose_debug(&self, operator: &OperatorId, target_key: &str) -> ProposeOutcome {
        if !self.is_authorized(operator) {
            return ProposeOutcome::Rejected(Rejection::Unauthorized);
        }

        let target = match self.targets.resolve(target_key) {
            Ok(target) => target.clone(),
            Err(failure) => return ProposeOutcome::Rejected(Rejection::Parse(failure)),
        };

        let Some(tail) = self.error_tail().await else {
            return ProposeOutcome::Rejected(Rejection::NothingToFix);
        };

        let lock = self.operator_lock(operator);
        let _guard = lock.lock().await;
        self.propose_locked(
            operator,
            target,
            format!("Fix this error:\n{}", tail),
            ProposalKind::Debug,
            Rewrite::Transform,
        )
        .await
    }

    /// Propose restoring `target_key` to a saved snapshot
    pub async fn propose_restore(
        &self,
        operator: &OperatorId,
        target_key: &str,
        snapshot_name: &str,
    ) -> ProposeOutcome {
        if !self.is_authorized(operator) {
            return ProposeOutcome::Rejected(Rejection::Unauthorized);
        }

        let target = match self.targets.resolve(target_key) {
            Ok(target) => target.clone(),
            Err(failure) => return ProposeOutcome::Rejected(Rejection::Parse(failure)),
        };

        let snapshots = match self.snapshot_store() {
            Ok(snapshots) => snapshots,
            Err(rejection) => return ProposeOutcome::Rejected(rejection),
        };
        let content = match snapshots.load(&target, snapshot_name).await {
            Ok(content) => content,
            Err(e) => return ProposeOutcome::Rejected(Rejection::Snapshot(e.to_string())),
        };

        let lock = self.operator_lock(operator);
        let _guard = lock.lock().await;
        self.propose_locked(
            operator,
            target,
            format!("Roll back to {}", snapshot_name),
            ProposalKind::Restore {
                snapshot: snapshot_name.to_string(),
            },
            Rewrite::Replace(content),
        )
        .await
    }

    async fn propose_locked(
        &self,
        operator: &OperatorId,
        target: TargetSpec,
        instruction: String,
        kind: ProposalKind,
        rewrite: Rewrite,
    ) -> ProposeOutcome {
        let (original, token) = match self.blob_store.read(&target).await {
            Ok(read) => read,
            Err(e) => {
                warn!("Read of {} failed: {}", target, e);
                return ProposeOutcome::Rejected(Rejection::StoreRead(e.to_string()));
            }
        };
        debug!("Read {} at {}", target, token);

        if let Some(snapshots) = &self.snapshots {
            fail_open("snapshots::save", || snapshots.save(&target, &original)).await;
        }

        let mut proposed = match rewrite {
            Rewrite::Transform => {
                let proposed = match self.run_transform(&target, &original, &instruction).await {
                    Ok(proposed) => proposed,
                    Err(reason) => return ProposeOutcome::Rejected(Rejection::Transform(reason)),
                };
                if let Err(reason) = check_output(&target, &original, &proposed) {
                    warn!("Transform output for {} rejected: {}", target, reason);
                    return ProposeOutcome::Rejected(Rejection::Transform(reason));
                }
                proposed
            }
            Rewrite::Replace(content) => {
                // Trailing whitespace alone would render an empty diff
                if content.trim_end() == original.trim_end() {
                    return ProposeOutcome::Rejected(Rejection::Snapshot(
                        "snapshot matches the current file".to_string(),
                    ));
                }
                content
            }
        };

        if original.ends_with('\n') && !proposed.ends_with('\n') {
            proposed.push('\n');
        }

        let diff = render_diff(&original, &proposed, self.config.limits.diff_preview_lines);
        let proposal = ChangeProposal::new(
            operator.clone(),
            target.clone(),
            original,
            proposed,
            token,
            instruction.clone(),
        )
        .with_kind(kind.clone());
        let proposal_id = proposal.id;

        match self.proposals.put(proposal).await {
            Ok(Some(replaced)) => info!(
                "Proposal {} for {} replaces {}",
                proposal_id, operator, replaced.id
            ),
            Ok(None) => info!("Proposal {} pending for {}", proposal_id, operator),
            Err(e) => {
                warn!("Could not store proposal for {}: {}", operator, e);
                return ProposeOutcome::Rejected(Rejection::StoreRead(e.to_string()));
            }
        }

        ProposeOutcome::Preview(Preview {
            proposal_id,
            target,
            instruction,
            kind,
            diff,
        })
    }

    async fn run_transform(
        &self,
        target: &TargetSpec,
        original: &str,
        instruction: &str,
    ) -> std::result::Result<String, String> {
        let history = match &self.memory {
            Some(memory) => fail_open("memory::recent", || {
                memory.recent(&target.key, self.config.limits.memory_context_entries)
            })
            .await
            .unwrap_or_default(),
            None => Vec::new(),
        };

        let request = TransformRequest {
            target_key: target.key.clone(),
            file_path: target.path.clone(),
            current_content: original.to_string(),
            instruction: instruction.to_string(),
            history,
        };

        let limit = Duration::from_secs(self.config.limits.transform_timeout_secs);
        match tokio::time::timeout(limit, self.transform.transform(&request)).await {
            Ok(Ok(proposed)) => Ok(proposed),
            Ok(Err(e)) => {
                warn!("Transform for {} failed: {}", target, e);
                Err(e.to_string())
            }
            Err(_) => {
                warn!("Transform for {} timed out", target);
                Err(format!("timed out after {}s", limit.as_secs()))
            }
        }
    }

    /// Confirm or cancel the operator's pending proposal
    pub async fn resolve(&self, operator: &OperatorId, decision: Decision) -> ResolveOutcome {
        if !self.is_authorized(operator) {
            warn!("Rejected {} from unauthorized operator {}", decision, operator);
            return ResolveOutcome::Unauthorized;
        }

        let lock = self.operator_lock(operator);
        let _guard = lock.lock().await;

        let proposal = match self.proposals.take(operator).await {
            Ok(Some(proposal)) => proposal,
            Ok(None) => return ResolveOutcome::NothingPending,
            Err(e) => {
                warn!("Proposal store failed for {}: {}", operator, e);
                return ResolveOutcome::WriteFailed {
                    reason: e.to_string(),
                };
            }
        };

        if let Some(ttl) = self.config.limits.proposal_ttl_secs {
            let ttl = chrono::Duration::seconds(ttl.min(u64::from(u32::MAX)) as i64);
            if proposal.is_expired(ttl, Utc::now()) {
                info!("Proposal {} expired before {}", proposal.id, decision);
                self.audit(AuditEvent::Expired, &proposal, None).await;
                return ResolveOutcome::Expired;
            }
        }

        match decision {
            Decision::Cancel => {
                info!("Proposal {} cancelled", proposal.id);
                self.audit(AuditEvent::Cancel, &proposal, None).await;
                ResolveOutcome::Cancelled
            }
            Decision::Confirm => self.commit(proposal).await,
        }
    }

    async fn commit(&self, proposal: ChangeProposal) -> ResolveOutcome {
        let target = &proposal.target;
        match self
            .blob_store
            .write(target, &proposal.proposed_content, &proposal.version_token)
            .await
        {
            Ok(new_token) => {
                info!("Wrote {} at {}", target, new_token);
            }
            Err(e) if e.is_conflict() => {
                warn!("Proposal {} conflicts: {}", proposal.id, e);
                self.audit(AuditEvent::Conflict, &proposal, Some(e.to_string()))
                    .await;
                return ResolveOutcome::Conflict;
            }
            Err(e) => {
                warn!("Write of {} failed: {}", target, e);
                self.audit(AuditEvent::WriteFailed, &proposal, Some(e.to_string()))
                    .await;
                return ResolveOutcome::WriteFailed {
                    reason: e.to_string(),
                };
            }
        }

        let deploy = self.deploy.trigger(&target.deploy_url).await;
        if !deploy.is_success() {
            warn!("Redeploy of {} failed: {}", target.key, deploy);
        }

        let event = match proposal.kind {
            ProposalKind::Edit => AuditEvent::Push,
            ProposalKind::Debug => AuditEvent::Debug,
            ProposalKind::Restore { .. } => AuditEvent::Rollback,
        };
        self.audit(event, &proposal, Some(deploy.to_string())).await;

        let outcome = ResolveOutcome::Written { deploy };
        if let Some(memory) = &self.memory {
            let status = outcome.to_string();
            fail_open("memory::remember", || {
                remember_exchange(memory.as_ref(), &target.key, &proposal.instruction, &status)
            })
            .await;
        }

        outcome
    }

    /// Save the current content of a target
    pub async fn snapshot(&self, operator: &OperatorId, target_key: &str) -> SnapshotOutcome {
        if !self.is_authorized(operator) {
            return Err(Rejection::Unauthorized);
        }
        let target = self.targets.resolve(target_key).map_err(Rejection::Parse)?;
        let snapshots = self.snapshot_store()?;

        let (content, _) = self
            .blob_store
            .read(target)
            .await
            .map_err(|e| Rejection::StoreRead(e.to_string()))?;
        let info = snapshots
            .save(target, &content)
            .await
            .map_err(|e| Rejection::Snapshot(e.to_string()))?;

        if let Some(audit) = &self.audit {
            let record = AuditRecord::new(
                AuditEvent::Snapshot,
                target.to_string(),
                info.name.clone(),
                operator.as_str(),
            );
            audit.record(record).await;
        }
        Ok(info)
    }

    /// Snapshots of a target, oldest first
    pub async fn list_snapshots(
        &self,
        operator: &OperatorId,
        target_key: &str,
    ) -> std::result::Result<Vec<SnapshotInfo>, Rejection> {
        if !self.is_authorized(operator) {
            return Err(Rejection::Unauthorized);
        }
        let target = self.targets.resolve(target_key).map_err(Rejection::Parse)?;
        self.snapshot_store()?
            .list(target)
            .await
            .map_err(|e| Rejection::Snapshot(e.to_string()))
    }

    /// The last `n` audit records
    pub async fn recent_audit(
        &self,
        operator: &OperatorId,
        n: usize,
    ) -> std::result::Result<Vec<AuditRecord>, Rejection> {
        if !self.is_authorized(operator) {
            return Err(Rejection::Unauthorized);
        }
        match &self.audit {
            Some(audit) => audit
                .recent(n)
                .await
                .map_err(|e| Rejection::AuditLog(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Healthy, or the tail of the error log
    pub async fn health(&self, operator: &OperatorId) -> HealthOutcome {
        if !self.is_authorized(operator) {
            return HealthOutcome::Unauthorized;
        }
        match self.error_tail().await {
            Some(tail) => HealthOutcome::Crashed { tail },
            None => HealthOutcome::Healthy,
        }
    }

    fn snapshot_store(&self) -> std::result::Result<&SnapshotStore, Rejection> {
        self.snapshots
            .as_ref()
            .ok_or_else(|| Rejection::Snapshot("snapshots are not configured".to_string()))
    }

    async fn error_tail(&self) -> Option<String> {
        let log = match tokio::fs::read_to_string(&self.config.error_log).await {
            Ok(log) => log,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read {}: {}", self.config.error_log.display(), e);
                return None;
            }
        };
        if log.trim().is_empty() {
            return None;
        }
        Some(tail_chars(&log, ERROR_TAIL_CHARS).to_string())
    }

    async fn audit(&self, event: AuditEvent, proposal: &ChangeProposal, detail: Option<String>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut record = AuditRecord::new(
            event,
            proposal.target.to_string(),
            proposal.summary(),
            proposal.operator.as_str(),
        );
        if let Some(detail) = detail {
            record = record.with_detail(detail);
        }
        audit.record(record).await;
    }

    fn operator_lock(&self, operator: &OperatorId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .operator_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks
            .entry(operator.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

async fn remember_exchange(
    memory: &dyn MemoryProvider,
    target_key: &str,
    instruction: &str,
    status: &str,
) -> hotpatch_core::Result<()> {
    memory
        .remember(target_key, MemoryEntry::user(instruction))
        .await?;
    memory
        .remember(target_key, MemoryEntry::assistant(status))
        .await
}

/// Reject transform output that cannot be a sensible rewrite
fn check_output(target: &TargetSpec, original: &str, proposed: &str) -> std::result::Result<(), String> {
    if proposed.trim().is_empty() {
        return Err("model returned an empty file".to_string());
    }
    if let Some(missing) = target.markers.iter().find(|m| !proposed.contains(m.as_str())) {
        return Err(format!("output is missing required marker `{}`", missing));
    }
    if proposed.trim_end() == original.trim_end() {
        return Err("no changes".to_string());
    }
    Ok(())
}

fn tail_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpatch_remote::{MemoryBlobStore, RecordingDeployTrigger, ScriptedTransform};
    use tempfile::TempDir;

    struct Fixture {
        controller: Arc<WorkflowController>,
        store: Arc<MemoryBlobStore>,
        transform: Arc<ScriptedTransform>,
        deploy: Arc<RecordingDeployTrigger>,
        temp_dir: TempDir,
    }

    fn demo() -> TargetSpec {
        TargetSpec::new("demo", "acme", "demo-bot", "demo.py", "https://demo.example")
    }

    fn operator() -> OperatorId {
        OperatorId::from("42")
    }

    fn build(
        store: MemoryBlobStore,
        transform: ScriptedTransform,
        deploy: RecordingDeployTrigger,
        limits: Limits,
    ) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(store);
        let transform = Arc::new(transform);
        let deploy = Arc::new(deploy);

        let config = ControllerConfig::new("42")
            .with_limits(limits)
            .with_error_log(temp_dir.path().join("error_log.txt"));
        let controller = WorkflowController::new(
            config,
            TargetTable::new(vec![demo()]),
            store.clone(),
            transform.clone(),
            deploy.clone(),
        )
        .with_memory(Arc::new(FileMemory::new(temp_dir.path().join("memory.json"), 10)))
        .with_audit_log(AuditLog::new(temp_dir.path().join("deploy_log.jsonl")))
        .with_snapshots(SnapshotStore::new(temp_dir.path().join("snapshots")));

        Fixture {
            controller: Arc::new(controller),
            store,
            transform,
            deploy,
            temp_dir,
        }
    }

    fn fixture(transform: ScriptedTransform) -> Fixture {
        build(
            MemoryBlobStore::new().with_file(&demo(), "v1", "t1"),
            transform,
            RecordingDeployTrigger::succeeding(),
            Limits::default(),
        )
    }

    async fn audit_events(fx: &Fixture) -> Vec<AuditEvent> {
        fx.controller
            .recent_audit(&operator(), 100)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.event)
            .collect()
    }

    #[tokio::test]
    async fn test_unauthorized_operator_touches_nothing() {
        let fx = fixture(ScriptedTransform::new().then_reply("v2"));
        assert!(fx.controller.propose(&operator(), "demo: change to v2").await.is_preview());

        let stranger = OperatorId::from("7");
        let outcome = fx.controller.propose(&stranger, "demo: change to v3").await;
        assert_eq!(outcome, ProposeOutcome::Rejected(Rejection::Unauthorized));
        assert_eq!(outcome.to_string(), "Not authorized.");

        let resolved = fx.controller.resolve(&stranger, Decision::Confirm).await;
        assert_eq!(resolved, ResolveOutcome::Unauthorized);
        assert_eq!(resolved.to_string(), "Not authorized.");
        assert_eq!(fx.controller.health(&stranger).await, HealthOutcome::Unauthorized);
        assert!(fx.controller.pending(&stranger).await.is_none());

        assert_eq!(fx.transform.requests().len(), 1);
        assert!(fx.store.writes().is_empty());
        let pending = fx.controller.pending(&operator()).await.unwrap();
        assert_eq!(pending.proposed_content, "v2");
    }

    #[tokio::test]
    async fn test_parse_failures_create_nothing() {
        let fx = fixture(ScriptedTransform::new().then_reply("v2"));

        let outcome = fx.controller.propose(&operator(), "demo change to v2").await;
        assert_eq!(
            outcome,
            ProposeOutcome::Rejected(Rejection::Parse(ParseFailure::MissingDelimiter))
        );

        let outcome = fx.controller.propose(&operator(), "prod: change to v2").await;
        assert_eq!(
            outcome,
            ProposeOutcome::Rejected(Rejection::Parse(ParseFailure::UnknownTarget(
                "prod".to_string()
            )))
        );

        assert!(fx.transform.requests().is_empty());
        assert!(fx.controller.pending(&operator()).await.is_none());
    }

    #[tokio::test]
    async fn test_store_read_failure() {
        let fx = build(
            MemoryBlobStore::new().denying_access(),
            ScriptedTransform::new().then_reply("v2"),
            RecordingDeployTrigger::succeeding(),
            Limits::default(),
        );

        let outcome = fx.controller.propose(&operator(), "demo: change to v2").await;
        assert!(matches!(outcome, ProposeOutcome::Rejected(Rejection::StoreRead(_))));
        assert!(fx.transform.requests().is_empty());
    }

    #[tokio::test]
    async fn test_second_propose_replaces_first() {
        let fx = fixture(ScriptedTransform::new().then_reply("v2").then_reply("v3"));

        fx.controller.propose(&operator(), "demo: change to v2").await;
        fx.controller.propose(&operator(), "demo: change to v3").await;

        let outcome = fx.controller.resolve(&operator(), Decision::Confirm).await;
        assert_eq!(outcome.status_text(), Some("written; deployed"));

        let writes = fx.store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].content, "v3");
        assert_eq!(fx.store.content(&demo()).as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn test_cancel_clears_without_write() {
        let fx = fixture(ScriptedTransform::new().then_reply("v2"));
        fx.controller.propose(&operator(), "demo: change to v2").await;

        let outcome = fx.controller.resolve(&operator(), Decision::Cancel).await;
        assert_eq!(outcome, ResolveOutcome::Cancelled);
        assert!(fx.store.writes().is_empty());
        assert!(fx.deploy.calls().is_empty());

        let again = fx.controller.resolve(&operator(), Decision::Cancel).await;
        assert_eq!(again, ResolveOutcome::NothingPending);
        assert_eq!(audit_events(&fx).await, vec![AuditEvent::Cancel]);
    }

    #[tokio::test]
    async fn test_confirm_writes_captured_token() {
        let fx = fixture(ScriptedTransform::new().then_reply("v2"));

        let outcome = fx.controller.propose(&operator(), "demo: change to v2").await;
        let preview = outcome.preview().unwrap();
        assert_eq!(
            preview.diff.to_string(),
            "--- before\n+++ after\n@@ -1 +1 @@\n-v1\n+v2"
        );

        let outcome = fx.controller.resolve(&operator(), Decision::Confirm).await;
        assert_eq!(outcome.to_string(), "written; deployed");

        let writes = fx.store.writes();
        assert_eq!(writes[0].token, hotpatch_core::VersionToken::from("t1"));
        assert!(writes[0].accepted);
        assert_eq!(fx.deploy.calls(), vec!["https://demo.example".to_string()]);
        assert!(fx.controller.pending(&operator()).await.is_none());
        assert_eq!(audit_events(&fx).await, vec![AuditEvent::Push]);
    }

    #[tokio::test]
    async fn test_conflict_discards_without_deploy() {
        let fx = fixture(ScriptedTransform::new().then_reply("v2"));
        fx.controller.propose(&operator(), "demo: change to v2").await;

        fx.store.external_edit(&demo(), "v1 edited elsewhere", "t2");

        let outcome = fx.controller.resolve(&operator(), Decision::Confirm).await;
        assert_eq!(outcome, ResolveOutcome::Conflict);
        assert!(fx.deploy.calls().is_empty());
        assert_eq!(fx.store.content(&demo()).as_deref(), Some("v1 edited elsewhere"));
        assert!(fx.controller.pending(&operator()).await.is_none());
        assert_eq!(audit_events(&fx).await, vec![AuditEvent::Conflict]);
    }

    #[tokio::test]
    async fn test_failed_deploy_still_reports_written() {
        let fx = build(
            MemoryBlobStore::new().with_file(&demo(), "v1", "t1"),
            ScriptedTransform::new().then_reply("v2"),
            RecordingDeployTrigger::with_outcome(DeployOutcome::Rejected { status: 500 }),
            Limits::default(),
        );
        fx.controller.propose(&operator(), "demo: change to v2").await;

        let outcome = fx.controller.resolve(&operator(), Decision::Confirm).await;
        assert_eq!(outcome.to_string(), "written; deploy failed");
        assert_eq!(fx.store.content(&demo()).as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_rejected_write_is_not_deployed() {
        let fx = build(
            MemoryBlobStore::new()
                .with_file(&demo(), "v1", "t1")
                .read_only(),
            ScriptedTransform::new().then_reply("v2"),
            RecordingDeployTrigger::succeeding(),
            Limits::default(),
        );
        assert!(fx.controller.propose(&operator(), "demo: change to v2").await.is_preview());

        let outcome = fx.controller.resolve(&operator(), Decision::Confirm).await;
        match &outcome {
            ResolveOutcome::WriteFailed { reason } => assert!(reason.contains("write access denied")),
            other => panic!("expected WriteFailed, got {:?}", other),
        }
        assert!(outcome.to_string().starts_with("Write failed: "));
        assert!(fx.deploy.calls().is_empty());
        assert_eq!(fx.store.content(&demo()).as_deref(), Some("v1"));
        assert!(fx.controller.pending(&operator()).await.is_none());

        let records = fx.controller.recent_audit(&operator(), 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, AuditEvent::WriteFailed);
        assert!(records[0]
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("write access denied")));
    }

    #[tokio::test]
    async fn test_unwritable_audit_log_does_not_block_resolve() {
        let temp_dir = TempDir::new().unwrap();
        // A regular file where the log's parent directory should be
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let store = Arc::new(MemoryBlobStore::new().with_file(&demo(), "v1", "t1"));
        let deploy = Arc::new(RecordingDeployTrigger::succeeding());
        let controller = WorkflowController::new(
            ControllerConfig::new("42").with_error_log(temp_dir.path().join("error_log.txt")),
            TargetTable::new(vec![demo()]),
            store.clone(),
            Arc::new(ScriptedTransform::new().then_reply("v2").then_reply("v3")),
            deploy.clone(),
        )
        .with_audit_log(AuditLog::new(blocker.join("deploy_log.jsonl")))
        .with_snapshots(SnapshotStore::new(temp_dir.path().join("snapshots")));

        assert!(controller.propose(&operator(), "demo: change to v2").await.is_preview());
        let outcome = controller.resolve(&operator(), Decision::Confirm).await;
        assert_eq!(outcome.to_string(), "written; deployed");
        assert_eq!(store.content(&demo()).as_deref(), Some("v2"));
        assert_eq!(deploy.calls(), vec!["https://demo.example".to_string()]);

        assert!(controller.propose(&operator(), "demo: change to v3").await.is_preview());
        let outcome = controller.resolve(&operator(), Decision::Cancel).await;
        assert_eq!(outcome, ResolveOutcome::Cancelled);
        assert!(controller.pending(&operator()).await.is_none());
        assert_eq!(store.content(&demo()).as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_unusable_transform_output() {
        let fx = fixture(
            ScriptedTransform::new()
                .then_fail("model overloaded")
                .then_reply("   ")
                .then_reply("v1"),
        );

        for _ in 0..3 {
            let outcome = fx.controller.propose(&operator(), "demo: change to v2").await;
            assert!(matches!(outcome, ProposeOutcome::Rejected(Rejection::Transform(_))));
        }
        assert!(fx.controller.pending(&operator()).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_marker_is_rejected() {
        let target = demo().with_markers(vec!["import".to_string()]);
        let fx = build(
            MemoryBlobStore::new().with_file(&target, "import os\n", "t1"),
            ScriptedTransform::new().then_reply("print('hi')\n"),
            RecordingDeployTrigger::succeeding(),
            Limits::default(),
        );
        let controller = WorkflowController::new(
            ControllerConfig::new("42"),
            TargetTable::new(vec![target]),
            fx.store.clone(),
            fx.transform.clone(),
            fx.deploy.clone(),
        );

        let outcome = controller.propose(&operator(), "demo: drop imports").await;
        match outcome {
            ProposeOutcome::Rejected(Rejection::Transform(reason)) => {
                assert!(reason.contains("import"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transform_timeout() {
        let limits = Limits {
            transform_timeout_secs: 0,
            ..Limits::default()
        };
        let fx = build(
            MemoryBlobStore::new().with_file(&demo(), "v1", "t1"),
            ScriptedTransform::new()
                .then_reply("v2")
                .with_delay(Duration::from_millis(200)),
            RecordingDeployTrigger::succeeding(),
            limits,
        );

        let outcome = fx.controller.propose(&operator(), "demo: change to v2").await;
        assert!(matches!(outcome, ProposeOutcome::Rejected(Rejection::Transform(_))));
        assert!(fx.controller.pending(&operator()).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_proposal_is_discarded() {
        let limits = Limits {
            proposal_ttl_secs: Some(0),
            ..Limits::default()
        };
        let fx = build(
            MemoryBlobStore::new().with_file(&demo(), "v1", "t1"),
            ScriptedTransform::new().then_reply("v2"),
            RecordingDeployTrigger::succeeding(),
            limits,
        );
        fx.controller.propose(&operator(), "demo: change to v2").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = fx.controller.resolve(&operator(), Decision::Confirm).await;
        assert_eq!(outcome, ResolveOutcome::Expired);
        assert!(fx.store.writes().is_empty());
        assert!(fx.controller.pending(&operator()).await.is_none());
    }

    #[tokio::test]
    async fn test_trailing_newline_is_kept() {
        let fx = build(
            MemoryBlobStore::new().with_file(&demo(), "v1\n", "t1"),
            ScriptedTransform::new().then_reply("v2"),
            RecordingDeployTrigger::succeeding(),
            Limits::default(),
        );
        fx.controller.propose(&operator(), "demo: change to v2").await;
        let pending = fx.controller.pending(&operator()).await.unwrap();
        assert_eq!(pending.proposed_content, "v2\n");
    }

    #[tokio::test]
    async fn test_memory_feeds_next_transform() {
        let fx = fixture(ScriptedTransform::new().then_reply("v2").then_reply("v3"));

        fx.controller.propose(&operator(), "demo: change to v2").await;
        fx.controller.resolve(&operator(), Decision::Confirm).await;
        fx.controller.propose(&operator(), "demo: change to v3").await;

        let requests = fx.transform.requests();
        assert!(requests[0].history.is_empty());
        let history: Vec<&str> = requests[1].history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(history, vec!["change to v2", "written; deployed"]);
        assert_eq!(requests[1].current_content, "v2");
    }

    #[tokio::test]
    async fn test_debug_flow() {
        let fx = fixture(ScriptedTransform::new().then_reply("v1 fixed"));

        let outcome = fx.controller.propose_debug(&operator(), "demo").await;
        assert_eq!(outcome, ProposeOutcome::Rejected(Rejection::NothingToFix));
        assert_eq!(fx.controller.health(&operator()).await, HealthOutcome::Healthy);

        let log = format!("{}\nZeroDivisionError: division by zero", "x".repeat(2000));
        std::fs::write(fx.temp_dir.path().join("error_log.txt"), &log).unwrap();

        let outcome = fx.controller.propose_debug(&operator(), "demo").await;
        let preview = outcome.preview().unwrap();
        assert_eq!(preview.kind, ProposalKind::Debug);

        let request = &fx.transform.requests()[0];
        assert!(request.instruction.starts_with("Fix this error:\n"));
        assert!(request.instruction.ends_with("division by zero"));
        assert_eq!(
            request.instruction.len(),
            "Fix this error:\n".len() + ERROR_TAIL_CHARS
        );

        match fx.controller.health(&operator()).await {
            HealthOutcome::Crashed { tail } => assert!(tail.ends_with("division by zero")),
            other => panic!("unexpected health: {other:?}"),
        }

        fx.controller.resolve(&operator(), Decision::Confirm).await;
        assert_eq!(audit_events(&fx).await, vec![AuditEvent::Debug]);
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let fx = fixture(ScriptedTransform::new());

        let saved = fx.controller.snapshot(&operator(), "demo").await.unwrap();
        fx.store.external_edit(&demo(), "v9", "t9");

        let listed = fx.controller.list_snapshots(&operator(), "demo").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, saved.name);

        let outcome = fx
            .controller
            .propose_restore(&operator(), "demo", &saved.name)
            .await;
        let preview = outcome.preview().unwrap();
        assert!(preview.diff.lines.contains(&"+v1".to_string()));

        let outcome = fx.controller.resolve(&operator(), Decision::Confirm).await;
        assert_eq!(outcome.status_text(), Some("written; deployed"));
        assert_eq!(fx.store.content(&demo()).as_deref(), Some("v1"));
        assert_eq!(
            audit_events(&fx).await,
            vec![AuditEvent::Snapshot, AuditEvent::Rollback]
        );
        assert!(fx.transform.requests().is_empty());
    }

    #[tokio::test]
    async fn test_restore_differing_only_in_trailing_newline_is_rejected() {
        let fx = fixture(ScriptedTransform::new());

        let saved = fx.controller.snapshot(&operator(), "demo").await.unwrap();
        fx.store.external_edit(&demo(), "v1\n", "t2");

        let outcome = fx
            .controller
            .propose_restore(&operator(), "demo", &saved.name)
            .await;
        assert!(matches!(outcome, ProposeOutcome::Rejected(Rejection::Snapshot(_))));
        assert!(fx.controller.pending(&operator()).await.is_none());
    }

    #[tokio::test]
    async fn test_restore_rejects_bad_snapshot_name() {
        let fx = fixture(ScriptedTransform::new());
        let outcome = fx
            .controller
            .propose_restore(&operator(), "demo", "../../etc/passwd")
            .await;
        assert!(matches!(outcome, ProposeOutcome::Rejected(Rejection::Snapshot(_))));
    }

    #[tokio::test]
    async fn test_concurrent_confirm_and_cancel_act_once() {
        let fx = fixture(ScriptedTransform::new().then_reply("v2"));
        fx.controller.propose(&operator(), "demo: change to v2").await;

        let confirm = {
            let controller = fx.controller.clone();
            tokio::spawn(async move { controller.resolve(&operator(), Decision::Confirm).await })
        };
        let cancel = {
            let controller = fx.controller.clone();
            tokio::spawn(async move { controller.resolve(&operator(), Decision::Cancel).await })
        };

        let outcomes = vec![confirm.await.unwrap(), cancel.await.unwrap()];
        let nothing = outcomes
            .iter()
            .filter(|o| **o == ResolveOutcome::NothingPending)
            .count();
        assert_eq!(nothing, 1);
        assert!(fx.store.writes().len() <= 1);
    }

    #[test]
    fn test_tail_chars_is_char_safe() {
        assert_eq!(tail_chars("héllo", 3), "llo");
        assert_eq!(tail_chars("ab", 5), "ab");
        assert_eq!(tail_chars("日本語テキスト", 2), "スト");
    }
}
