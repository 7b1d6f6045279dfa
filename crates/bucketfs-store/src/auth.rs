//! Authentication modes for the object-store client.
//!
//! Three modes cover the configuration surface: anonymous access (public
//! buckets and emulators), a static bearer token read from a credential
//! file, and a token endpoint that is queried for a short-lived token.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// How requests to the store are authenticated.
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// No Authorization header at all.
    Anonymous,
    /// A fixed bearer token.
    StaticToken(String),
    /// A URL returning `{"access_token": "..."}` on GET.
    TokenUrl(String),
}

/// Shape of a credential file: `{"token": "..."}`.
#[derive(Debug, Deserialize)]
struct KeyFile {
    token: String,
}

/// Shape of a token-endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl AuthMode {
    /// Builds the mode from the configured knobs.
    ///
    /// Precedence: anonymous wins, then an explicit token URL, then the
    /// credential file.
    pub fn from_config(
        anonymous: bool,
        key_file: Option<&Path>,
        token_url: Option<&str>,
    ) -> Result<Self> {
        if anonymous {
            return Ok(AuthMode::Anonymous);
        }
        if let Some(url) = token_url {
            return Ok(AuthMode::TokenUrl(url.to_string()));
        }
        let path = key_file.context("no credentials: set key_file or enable anonymous_access")?;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let key: KeyFile = serde_json::from_str(&raw)
            .with_context(|| format!("malformed key file {}", path.display()))?;
        Ok(AuthMode::StaticToken(key.token))
    }

    /// Resolves the bearer token to attach, if any.
    pub async fn bearer_token(&self, client: &reqwest::Client) -> Result<Option<String>> {
        match self {
            AuthMode::Anonymous => Ok(None),
            AuthMode::StaticToken(token) => Ok(Some(token.clone())),
            AuthMode::TokenUrl(url) => {
                debug!(url, "fetching access token");
                let response: TokenResponse = client
                    .get(url)
                    .send()
                    .await
                    .context("token endpoint unreachable")?
                    .error_for_status()
                    .context("token endpoint returned error status")?
                    .json()
                    .await
                    .context("malformed token response")?;
                Ok(Some(response.access_token))
            }
        }
    }
}
