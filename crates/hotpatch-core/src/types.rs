//! Core type definitions for the propose/confirm workflow

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque principal identifier supplied by the chat transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorId(String);

impl OperatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OperatorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Revision marker supplied by the blob store (a content hash on GitHub)
///
/// The workflow never looks inside a token. It is captured at read time and
/// handed back on write so the store can reject stale updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A configured blob store location plus the endpoint that redeploys it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Short identifier used in instructions (e.g. `nowbot`)
    pub key: String,
    /// Owning namespace on the code host
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// File path inside the repository
    pub path: String,
    /// Branch the file lives on
    pub branch: String,
    /// Base URL of the deployed service
    pub deploy_url: String,
    /// Substrings a rewritten file must still contain
    pub markers: Vec<String>,
}

impl TargetSpec {
    pub fn new(
        key: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        path: impl Into<String>,
        deploy_url: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            repo: repo.into(),
            path: path.into(),
            branch: "main".to_string(),
            deploy_url: deploy_url.into(),
            markers: Vec::new(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_markers(mut self, markers: Vec<String>) -> Self {
        self.markers = markers;
        self
    }

    /// Final path component, used for snapshot names
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl std::fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.owner, self.repo, self.path)
    }
}

/// Operator decision on a pending proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Confirm,
    Cancel,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirm => write!(f, "confirm"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "confirm" | "push" | "yes" => Ok(Self::Confirm),
            "cancel" | "no" => Ok(Self::Cancel),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

/// Where a proposal came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProposalKind {
    /// Free-form operator instruction
    Edit,
    /// Fix generated from the error log
    Debug,
    /// Restore of a saved snapshot
    Restore { snapshot: String },
}

/// An unresolved, diff-previewed change awaiting confirm or cancel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeProposal {
    pub id: Uuid,
    pub operator: OperatorId,
    pub target: TargetSpec,
    pub original_content: String,
    pub proposed_content: String,
    pub version_token: VersionToken,
    pub instruction: String,
    pub kind: ProposalKind,
    pub created_at: DateTime<Utc>,
}

/// Maximum characters of the instruction kept in audit summaries
const SUMMARY_CHARS: usize = 120;

impl ChangeProposal {
    pub fn new(
        operator: OperatorId,
        target: TargetSpec,
        original_content: impl Into<String>,
        proposed_content: impl Into<String>,
        version_token: VersionToken,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operator,
            target,
            original_content: original_content.into(),
            proposed_content: proposed_content.into(),
            version_token,
            instruction: instruction.into(),
            kind: ProposalKind::Edit,
            created_at: Utc::now(),
        }
    }

    pub fn with_kind(mut self, kind: ProposalKind) -> Self {
        self.kind = kind;
        self
    }

    /// Whether the proposal is older than `ttl` at `now`
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at > ttl
    }

    /// One-line instruction summary for audit records
    pub fn summary(&self) -> String {
        let first_line = self.instruction.lines().next().unwrap_or_default();
        if first_line.chars().count() > SUMMARY_CHARS {
            let truncated: String = first_line.chars().take(SUMMARY_CHARS).collect();
            format!("{truncated}...")
        } else {
            first_line.to_string()
        }
    }
}

/// Result of signalling a redeploy
///
/// The operator only sees success or failure; the variant is kept for the
/// audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeployOutcome {
    /// Endpoint answered 200 or 204
    Deployed { status: u16 },
    /// Endpoint answered with any other status
    Rejected { status: u16 },
    /// Request never got a response (connect error, timeout)
    Unreachable { reason: String },
}

impl DeployOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Deployed { .. })
    }
}

impl std::fmt::Display for DeployOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deployed { status } => write!(f, "deployed (HTTP {})", status),
            Self::Rejected { status } => write!(f, "deploy rejected (HTTP {})", status),
            Self::Unreachable { reason } => write!(f, "deploy unreachable: {}", reason),
        }
    }
}

/// Speaker of a conversation memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryRole {
    User,
    Assistant,
}

/// One remembered exchange for a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: MemoryRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MemoryRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MemoryRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Kind of event written to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Push,
    Debug,
    Rollback,
    Cancel,
    Conflict,
    WriteFailed,
    Expired,
    Snapshot,
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Debug => write!(f, "debug"),
            Self::Rollback => write!(f, "rollback"),
            Self::Cancel => write!(f, "cancel"),
            Self::Conflict => write!(f, "conflict"),
            Self::WriteFailed => write!(f, "write_failed"),
            Self::Expired => write!(f, "expired"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    /// Target file in `owner/repo:path` form
    pub file: String,
    pub summary: String,
    pub actor: String,
    /// Diagnostic detail (deploy outcome, store error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn new(
        event: AuditEvent,
        file: impl Into<String>,
        summary: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            file: file.into(),
            summary: summary.into(),
            actor: actor.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl std::fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} - {} by {}: {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S"),
            self.event,
            self.actor,
            self.summary
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}
