//! Redeploy trigger
//!
//! Fire-and-forget signal sent after a successful write. There are no retries:
//! the write is already committed, so a failed trigger is reported to the
//! operator as "written, not deployed".

use async_trait::async_trait;
use hotpatch_core::DeployOutcome;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Path appended to a target's deploy URL
const REBUILD_PATH: &str = "__rebuild";

/// Trait for redeploy signals (allows recording fakes in tests)
#[async_trait]
pub trait DeployTrigger: Send + Sync {
    /// Signal a redeploy of the service at `endpoint`
    ///
    /// Never fails: every problem is folded into the returned outcome.
    async fn trigger(&self, endpoint: &str) -> DeployOutcome;
}

/// POSTs to `{endpoint}/__rebuild` with a bounded timeout
#[derive(Clone)]
pub struct HttpDeployTrigger {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDeployTrigger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn rebuild_url(endpoint: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), REBUILD_PATH)
    }
}

impl Default for HttpDeployTrigger {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl DeployTrigger for HttpDeployTrigger {
    async fn trigger(&self, endpoint: &str) -> DeployOutcome {
        let url = Self::rebuild_url(endpoint);
        debug!("Triggering redeploy at {}", url);

        match self.client.post(&url).timeout(self.timeout).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status == 200 || status == 204 {
                    DeployOutcome::Deployed { status }
                } else {
                    warn!("Redeploy at {} answered {}", url, status);
                    DeployOutcome::Rejected { status }
                }
            }
            Err(e) => {
                warn!("Redeploy at {} unreachable: {}", url, e);
                let reason = if e.is_timeout() {
                    format!("timed out after {}s", self.timeout.as_secs())
                } else {
                    e.to_string()
                };
                DeployOutcome::Unreachable { reason }
            }
        }
    }
}

/// Records every endpoint it is asked to trigger and returns a fixed outcome
#[derive(Debug)]
pub struct RecordingDeployTrigger {
    outcome: DeployOutcome,
    calls: Mutex<Vec<String>>,
}

impl RecordingDeployTrigger {
    /// A trigger that always succeeds
    pub fn succeeding() -> Self {
        Self::with_outcome(DeployOutcome::Deployed { status: 200 })
    }

    /// A trigger that always fails with `outcome`
    pub fn with_outcome(outcome: DeployOutcome) -> Self {
        Self {
            outcome,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Endpoints triggered so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl DeployTrigger for RecordingDeployTrigger {
    async fn trigger(&self, endpoint: &str) -> DeployOutcome {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(endpoint.to_string());
        self.outcome.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_url() {
        assert_eq!(
            HttpDeployTrigger::rebuild_url("https://bot.example.com/"),
            "https://bot.example.com/__rebuild"
        );
        assert_eq!(
            HttpDeployTrigger::rebuild_url("https://bot.example.com"),
            "https://bot.example.com/__rebuild"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_collapses_to_outcome() {
        // Port 9 (discard) on localhost is closed in test environments
        let trigger = HttpDeployTrigger::new(Duration::from_secs(2));
        let outcome = trigger.trigger("http://127.0.0.1:9").await;
        assert!(matches!(outcome, DeployOutcome::Unreachable { .. }));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_recording_trigger() {
        let trigger = RecordingDeployTrigger::with_outcome(DeployOutcome::Rejected { status: 503 });
        let outcome = trigger.trigger("https://a.example").await;
        assert_eq!(outcome, DeployOutcome::Rejected { status: 503 });
        assert_eq!(trigger.calls(), vec!["https://a.example".to_string()]);
    }
}
