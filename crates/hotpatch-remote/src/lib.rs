//! # hotpatch-remote
//!
//! Clients for the three external collaborators of the patch workflow:
//! - Blob store: reads a file with its version token, writes conditioned on it
//! - Transform service: rewrites a file from an instruction (Anthropic API)
//! - Deploy trigger: signals a redeploy and reports how it went
//!
//! Each collaborator is a trait so the workflow can run against the in-memory
//! and recording implementations shipped here for tests.

mod auth;
mod blob_store;
mod circuit_breaker;
mod deploy;
mod transform;
mod types;

pub use auth::{get_api_key, get_code_host_token};
pub use blob_store::{
    BlobStore, GitHubBlobStore, MemoryBlobStore, RecordedWrite, DEFAULT_STORE_TIMEOUT,
};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use deploy::{DeployTrigger, HttpDeployTrigger, RecordingDeployTrigger};
pub use transform::{
    build_transform_prompt, clean_model_output, AnthropicTransform, ScriptedTransform,
    TransformRequest, TransformService,
};
pub use types::*;
