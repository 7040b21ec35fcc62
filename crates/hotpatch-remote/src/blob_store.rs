//! Versioned blob store abstraction
//!
//! A blob store hands out a file's content together with a version token and
//! only accepts a write that presents the token it currently holds. That check
//! is what keeps a confirmed proposal from overwriting someone else's edit.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hotpatch_core::{HotpatchError, Result, TargetSpec, VersionToken};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::types::{ContentsResponse, PutContentsRequest, PutContentsResponse};

/// Trait for the code host holding target files (allows fakes in tests)
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the file's content and current version token
    ///
    /// Fails with `NotFound` when the path does not exist and `Auth` when
    /// credentials are rejected.
    async fn read(&self, target: &TargetSpec) -> Result<(String, VersionToken)>;

    /// Replace the file's content if `token` is still current
    ///
    /// Fails with `Conflict` when the store's token has moved on. Returns the
    /// new token on success.
    async fn write(
        &self,
        target: &TargetSpec,
        content: &str,
        token: &VersionToken,
    ) -> Result<VersionToken>;
}

/// Per-request bound used until [`GitHubBlobStore::with_timeout`] overrides it
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// GitHub contents API client
#[derive(Clone)]
pub struct GitHubBlobStore {
    client: reqwest::Client,
    api_base: String,
    token: String,
    commit_message: String,
    timeout: Duration,
}

impl GitHubBlobStore {
    /// Create a client for `api_base` (e.g. `https://api.github.com`)
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            commit_message: "Auto update from hotpatch".to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound every request to the code host
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the commit message used for writes
    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = message.into();
        self
    }

    fn contents_url(&self, target: &TargetSpec) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            target.owner,
            target.repo,
            target.path.trim_start_matches('/')
        )
    }

    fn transport_error(&self, e: reqwest::Error) -> HotpatchError {
        if e.is_timeout() {
            HotpatchError::Store(format!(
                "code host timed out after {}s",
                self.timeout.as_secs_f32()
            ))
        } else {
            HotpatchError::Store(format!("Failed to reach code host: {}", e))
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .timeout(self.timeout)
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .header("x-github-api-version", "2022-11-28")
            .header("user-agent", "hotpatch")
    }
}

#[async_trait]
impl BlobStore for GitHubBlobStore {
    #[instrument(skip(self, target), fields(file = %target))]
    async fn read(&self, target: &TargetSpec) -> Result<(String, VersionToken)> {
        let url = self.contents_url(target);
        debug!("GET {} (ref {})", url, target.branch);

        let response = self
            .request(reqwest::Method::GET, &url)
            .query(&[("ref", target.branch.as_str())])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_status(status, &body, target));
        }

        let contents: ContentsResponse = response
            .json()
            .await
            .map_err(|e| HotpatchError::Store(format!("Failed to parse contents: {}", e)))?;

        let content = decode_content(&contents)?;
        Ok((content, VersionToken::new(contents.sha)))
    }

    #[instrument(skip(self, target, content, token), fields(file = %target, token = %token))]
    async fn write(
        &self,
        target: &TargetSpec,
        content: &str,
        token: &VersionToken,
    ) -> Result<VersionToken> {
        let url = self.contents_url(target);
        let body = PutContentsRequest {
            message: self.commit_message.clone(),
            content: STANDARD.encode(content.as_bytes()),
            sha: token.as_str().to_string(),
            branch: target.branch.clone(),
        };
        debug!("PUT {} ({} bytes)", url, content.len());

        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_status(status, &body, target));
        }

        let written: PutContentsResponse = response
            .json()
            .await
            .map_err(|e| HotpatchError::Store(format!("Failed to parse write response: {}", e)))?;

        Ok(VersionToken::new(written.content.sha))
    }
}

/// Decode a contents payload into UTF-8 text
fn decode_content(contents: &ContentsResponse) -> Result<String> {
    if !contents.encoding.is_empty() && contents.encoding != "base64" {
        return Err(HotpatchError::Store(format!(
            "Unsupported content encoding: {}",
            contents.encoding
        )));
    }

    // GitHub wraps base64 at 60 columns
    let compact: String = contents
        .content
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| HotpatchError::Store(format!("Invalid base64 content: {}", e)))?;

    String::from_utf8(bytes)
        .map_err(|_| HotpatchError::Store("File content is not valid UTF-8".to_string()))
}

/// Map a non-success code host status to the error taxonomy
fn map_error_status(status: StatusCode, body: &str, target: &TargetSpec) -> HotpatchError {
    match status.as_u16() {
        404 => HotpatchError::NotFound(target.to_string()),
        401 | 403 => HotpatchError::Auth(format!("code host returned {}", status)),
        409 => HotpatchError::Conflict(format!("{} changed since it was read", target)),
        422 if body.contains("sha") => {
            HotpatchError::Conflict(format!("{} rejected the version token", target))
        }
        _ => HotpatchError::Store(format!("code host returned {}: {}", status, body.trim())),
    }
}

/// A write attempt seen by [`MemoryBlobStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub path: String,
    pub content: String,
    pub token: VersionToken,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    content: String,
    token: VersionToken,
}

/// In-memory blob store for tests and dry runs
///
/// Files are keyed by `owner/repo:path`. New tokens are the sha256 of the
/// written content.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    writes: Mutex<Vec<RecordedWrite>>,
    deny_access: bool,
    deny_writes: bool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file with an explicit token
    pub fn with_file(self, target: &TargetSpec, content: &str, token: &str) -> Self {
        self.put(target, content, VersionToken::new(token));
        self
    }

    /// Reject every call with `Auth`
    pub fn denying_access(mut self) -> Self {
        self.deny_access = true;
        self
    }

    /// Serve reads but reject every write with `Auth` (a read-only credential)
    pub fn read_only(mut self) -> Self {
        self.deny_writes = true;
        self
    }

    /// Change a file behind the workflow's back (simulates a concurrent edit)
    pub fn external_edit(&self, target: &TargetSpec, content: &str, token: &str) {
        self.put(target, content, VersionToken::new(token));
    }

    /// Current content of a file
    pub fn content(&self, target: &TargetSpec) -> Option<String> {
        self.lock_blobs()
            .get(&target.to_string())
            .map(|b| b.content.clone())
    }

    /// Current token of a file
    pub fn token(&self, target: &TargetSpec) -> Option<VersionToken> {
        self.lock_blobs()
            .get(&target.to_string())
            .map(|b| b.token.clone())
    }

    /// Every write attempt, accepted or not
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn put(&self, target: &TargetSpec, content: &str, token: VersionToken) {
        self.lock_blobs().insert(
            target.to_string(),
            StoredBlob {
                content: content.to_string(),
                token,
            },
        );
    }

    fn lock_blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredBlob>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn content_token(content: &str) -> VersionToken {
        VersionToken::new(hex::encode(Sha256::digest(content.as_bytes())))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, target: &TargetSpec) -> Result<(String, VersionToken)> {
        if self.deny_access {
            return Err(HotpatchError::Auth("access denied".to_string()));
        }

        self.lock_blobs()
            .get(&target.to_string())
            .map(|b| (b.content.clone(), b.token.clone()))
            .ok_or_else(|| HotpatchError::NotFound(target.to_string()))
    }

    async fn write(
        &self,
        target: &TargetSpec,
        content: &str,
        token: &VersionToken,
    ) -> Result<VersionToken> {
        if self.deny_access {
            return Err(HotpatchError::Auth("access denied".to_string()));
        }
        if self.deny_writes {
            return Err(HotpatchError::Auth("write access denied".to_string()));
        }

        let key = target.to_string();
        let mut blobs = self.lock_blobs();
        let current = blobs
            .get(&key)
            .ok_or_else(|| HotpatchError::NotFound(key.clone()))?;
        let accepted = current.token == *token;

        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedWrite {
                path: key.clone(),
                content: content.to_string(),
                token: token.clone(),
                accepted,
            });

        if !accepted {
            return Err(HotpatchError::Conflict(format!(
                "{} is at {}, write presented {}",
                key, current.token, token
            )));
        }

        let new_token = Self::content_token(content);
        blobs.insert(
            key,
            StoredBlob {
                content: content.to_string(),
                token: new_token.clone(),
            },
        );
        Ok(new_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo() -> TargetSpec {
        TargetSpec::new("demo", "acme", "demo-bot", "demo.py", "https://demo.example")
    }

    #[tokio::test]
    async fn test_memory_store_read_write() {
        let store = MemoryBlobStore::new().with_file(&demo(), "v1", "t1");

        let (content, token) = store.read(&demo()).await.unwrap();
        assert_eq!(content, "v1");
        assert_eq!(token, VersionToken::from("t1"));

        let new_token = store.write(&demo(), "v2", &token).await.unwrap();
        assert_ne!(new_token, token);
        assert_eq!(store.content(&demo()).as_deref(), Some("v2"));
        assert_eq!(store.token(&demo()), Some(new_token));
    }

    #[tokio::test]
    async fn test_memory_store_rejects_stale_token() {
        let store = MemoryBlobStore::new().with_file(&demo(), "v1", "t1");
        store.external_edit(&demo(), "v1-external", "t2");

        let result = store.write(&demo(), "v2", &VersionToken::from("t1")).await;
        assert!(matches!(result, Err(HotpatchError::Conflict(_))));
        assert_eq!(store.content(&demo()).as_deref(), Some("v1-external"));

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert!(!writes[0].accepted);
    }

    #[tokio::test]
    async fn test_memory_store_missing_and_denied() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.read(&demo()).await,
            Err(HotpatchError::NotFound(_))
        ));

        let denied = MemoryBlobStore::new()
            .with_file(&demo(), "v1", "t1")
            .denying_access();
        assert!(matches!(denied.read(&demo()).await, Err(HotpatchError::Auth(_))));
    }

    #[test]
    fn test_decode_wrapped_base64() {
        let contents = ContentsResponse {
            sha: "abc".to_string(),
            content: "aW1wb3J0IG9z\nCnByaW50KDEp\n".to_string(),
            encoding: "base64".to_string(),
        };
        assert_eq!(decode_content(&contents).unwrap(), "import os\nprint(1)");
    }

    #[test]
    fn test_status_mapping() {
        let target = demo();
        assert!(matches!(
            map_error_status(StatusCode::NOT_FOUND, "", &target),
            HotpatchError::NotFound(_)
        ));
        assert!(matches!(
            map_error_status(StatusCode::UNAUTHORIZED, "", &target),
            HotpatchError::Auth(_)
        ));
        assert!(map_error_status(StatusCode::CONFLICT, "", &target).is_conflict());
        assert!(map_error_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message":"sha wasn't supplied"}"#,
            &target
        )
        .is_conflict());
        assert!(matches!(
            map_error_status(StatusCode::BAD_GATEWAY, "upstream", &target),
            HotpatchError::Store(_)
        ));
    }

    #[tokio::test]
    async fn test_read_only_store_rejects_writes() {
        let store = MemoryBlobStore::new().with_file(&demo(), "v1", "t1").read_only();

        let (content, token) = store.read(&demo()).await.unwrap();
        assert_eq!(content, "v1");
        let err = store.write(&demo(), "v2", &token).await.unwrap_err();
        assert!(matches!(err, HotpatchError::Auth(_)));
        assert!(!err.is_conflict());
        assert!(store.writes().is_empty());
        assert_eq!(store.content(&demo()).as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_unresponsive_code_host_times_out() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let store = GitHubBlobStore::new(format!("http://{}", addr), "token")
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        match store.read(&demo()).await {
            Err(HotpatchError::Store(msg)) => assert!(msg.contains("timed out"), "{}", msg),
            other => panic!("expected a Store timeout, got {:?}", other),
        }
        match store.write(&demo(), "v2", &VersionToken::from("t1")).await {
            Err(HotpatchError::Store(msg)) => assert!(msg.contains("timed out"), "{}", msg),
            other => panic!("expected a Store timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[test]
    fn test_contents_url() {
        let store = GitHubBlobStore::new("https://api.github.com/", "token");
        assert_eq!(
            store.contents_url(&demo()),
            "https://api.github.com/repos/acme/demo-bot/contents/demo.py"
        );
    }
}
