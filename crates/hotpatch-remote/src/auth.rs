//! Credential lookup for the code host and the model API
//!
//! Both credentials come from environment variables whose names are set in
//! configuration (`github.token_env`, `model.api_key_env`).

use hotpatch_core::{HotpatchError, Result};
use std::env;

/// Get the code host access token from `var`
pub fn get_code_host_token(var: &str) -> Result<String> {
    read_secret(var).ok_or_else(|| {
        HotpatchError::Auth(format!(
            "No code host token found. Set {}=<personal access token>",
            var
        ))
    })
}

/// Get the model API key from `var`
///
/// Falls back to `ANTHROPIC_API_KEY` when a custom variable is configured but
/// unset.
pub fn get_api_key(var: &str) -> Result<String> {
    if let Some(key) = read_secret(var) {
        tracing::debug!("Using model API key from {}", var);
        return Ok(key);
    }

    if var != "ANTHROPIC_API_KEY" {
        if let Some(key) = read_secret("ANTHROPIC_API_KEY") {
            tracing::debug!("{} unset, using ANTHROPIC_API_KEY", var);
            return Ok(key);
        }
    }

    Err(HotpatchError::Auth(format!(
        "No model API key found. Set {}=sk-ant-api03-...",
        var
    )))
}

fn read_secret(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
