//! REST trust-score lookup.
//!
//! Queries `GET <base>/v1/score/<agent_id>` and expects `{ "score": <n> }`.
//! Any non-200, timeout, or parse failure degrades to unknown rather than
//! erroring; the score source is advisory.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::trust::{clamp_score, TrustResolver};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolver backed by a REST score service.
pub struct RestResolver {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: i64,
}

impl RestResolver {
    /// Create a resolver for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty URL or if the HTTP client
    /// cannot be constructed.
    pub fn new(base_url: &str) -> Result<Self> {
        if base_url.is_empty() {
            return Err(Error::Config(
                "trust service URL must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl TrustResolver for RestResolver {
    async fn get_score(&self, agent_id: &str) -> Result<Option<u8>> {
        let url = format!("{}/v1/score/{agent_id}", self.base_url);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(agent = agent_id, error = %e, "score lookup failed");
                return Ok(None);
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }
        match response.json::<ScoreResponse>().await {
            Ok(body) => Ok(Some(clamp_score(body.score))),
            Err(e) => {
                warn!(agent = agent_id, error = %e, "score response unparseable");
                Ok(None)
            }
        }
    }

    fn source(&self) -> &'static str {
        "rest"
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_url() {
        assert!(RestResolver::new("").is_err());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let resolver = RestResolver::new("https://scores.example/").expect("resolver");
        assert_eq!(resolver.base_url, "https://scores.example");
    }
}
