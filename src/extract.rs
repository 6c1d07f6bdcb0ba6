//! Identifier extraction from requests.
//!
//! Routes name where their agent and context identifiers live with a small
//! source spec — `header.<name>`, `body.<dotted.path>`, or `query.<name>` —
//! parsed and validated at construction so a typo fails at startup rather
//! than silently collapsing every request to the fallback.
//!
//! Requests with no extractable agent collapse to `"anonymous"`; missing
//! context collapses to `"default"`. Both are observable in pricing stats.

use axum::http::HeaderMap;

use crate::error::{Error, Result};

/// Agent identifier used when none can be extracted.
pub const ANONYMOUS_AGENT: &str = "anonymous";

/// Context identifier used when none can be extracted.
pub const DEFAULT_CONTEXT: &str = "default";

/// Conventional header consulted when a route has no agent source.
pub const AGENT_HEADER: &str = "x-agent-id";

/// Where in the request an identifier lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    /// A request header, matched case-insensitively.
    Header(String),
    /// A dotted path into the JSON body.
    Body(Vec<String>),
    /// A query-string parameter.
    Query(String),
}

impl FieldSource {
    /// Parse a source spec like `body.threadId` or `header.x-agent-id`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown prefix or an empty path.
    pub fn parse(spec: &str) -> Result<Self> {
        let (prefix, rest) = spec
            .split_once('.')
            .ok_or_else(|| Error::Extraction(format!("invalid field source: {spec}")))?;
        if rest.is_empty() {
            return Err(Error::Extraction(format!("invalid field source: {spec}")));
        }
        match prefix {
            "header" => Ok(Self::Header(rest.to_ascii_lowercase())),
            "body" => Ok(Self::Body(rest.split('.').map(String::from).collect())),
            "query" => Ok(Self::Query(rest.to_string())),
            _ => Err(Error::Extraction(format!(
                "unknown field source prefix: {prefix}"
            ))),
        }
    }

    /// Extract the identifier from a request's pieces, if present.
    #[must_use]
    pub fn extract(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Option<String> {
        match self {
            Self::Header(name) => headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(String::from),
            Self::Body(path) => {
                let mut value = body?;
                for segment in path {
                    value = value.get(segment)?;
                }
                value_to_identifier(value)
            }
            Self::Query(name) => {
                let query = query?;
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.into_owned())
                    .filter(|value| !value.is_empty())
            }
        }
    }
}

/// Render a JSON leaf as an identifier string.
fn value_to_identifier(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Resolve the agent identifier for a request.
///
/// Uses the route's configured source first, then the conventional
/// `X-Agent-Id` header, then the anonymous fallback.
#[must_use]
pub fn agent_id(
    source: Option<&FieldSource>,
    headers: &HeaderMap,
    query: Option<&str>,
    body: Option<&serde_json::Value>,
) -> String {
    source
        .and_then(|s| s.extract(headers, query, body))
        .or_else(|| {
            headers
                .get(AGENT_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(String::from)
        })
        .unwrap_or_else(|| ANONYMOUS_AGENT.to_string())
}

/// Resolve the context identifier for a request.
#[must_use]
pub fn context_id(
    source: Option<&FieldSource>,
    headers: &HeaderMap,
    query: Option<&str>,
    body: Option<&serde_json::Value>,
) -> String {
    source
        .and_then(|s| s.extract(headers, query, body))
        .unwrap_or_else(|| DEFAULT_CONTEXT.to_string())
}
