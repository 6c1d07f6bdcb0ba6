//! Pluggable trust-score resolution.
//!
//! A [`TrustResolver`] maps an agent identifier to a reputation score in
//! `0..=100`, or `None` when the agent is unknown. The pricing engine treats
//! an unknown score exactly like no score at all.
//!
//! Variants: a static in-memory map, a REST lookup, and the default
//! attestation-network resolver. [`ScoreCache`] wraps any of them with a TTL
//! cache that may serve stale entries when the backend errors, and
//! [`resolve_with_deadline`] bounds a lookup with a hard deadline at the
//! call site.

mod attestation;
mod rest;
mod static_map;

pub use attestation::{AttestationConfig, AttestationResolver};
pub use rest::RestResolver;
pub use static_map::StaticResolver;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Result;

/// Default TTL for cached scores.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Hard deadline the admission layer puts on a trust lookup.
pub const TRUST_LOOKUP_DEADLINE: Duration = Duration::from_secs(3);

/// Source of reputation scores for agents.
#[async_trait]
pub trait TrustResolver: Send + Sync {
    /// Resolve the score for an agent; `None` means unknown.
    async fn get_score(&self, agent_id: &str) -> Result<Option<u8>>;

    /// Short name of the backing source, for logs.
    fn source(&self) -> &'static str;
}

/// Clamp a raw backend value into the `0..=100` score range.
#[must_use]
pub fn clamp_score(raw: i64) -> u8 {
    u8::try_from(raw.clamp(0, 100)).unwrap_or(100)
}

/// Resolve a score, racing the resolver against `deadline`.
///
/// Whichever resolves first wins; a timed-out or failed lookup degrades to
/// unknown rather than surfacing an error. The abandoned lookup is simply
/// discarded.
pub async fn resolve_with_deadline(
    resolver: &dyn TrustResolver,
    agent_id: &str,
    deadline: Duration,
) -> Option<u8> {
    match tokio::time::timeout(deadline, resolver.get_score(agent_id)).await {
        Ok(Ok(score)) => score,
        Ok(Err(e)) => {
            warn!(agent = agent_id, source = resolver.source(), error = %e, "trust lookup failed");
            None
        }
        Err(_) => {
            warn!(agent = agent_id, source = resolver.source(), "trust lookup timed out");
            None
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    score: Option<u8>,
    fetched_at: Instant,
}

/// TTL cache in front of another resolver.
///
/// A fresh entry short-circuits the backend. On backend error a stale entry
/// is served instead of failing, since an out-of-date score beats no score
/// for pricing purposes.
pub struct ScoreCache {
    inner: Arc<dyn TrustResolver>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ScoreCache {
    /// Wrap a resolver with the default TTL.
    #[must_use]
    pub fn new(inner: Arc<dyn TrustResolver>) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL)
    }

    /// Wrap a resolver with a custom TTL.
    #[must_use]
    pub fn with_ttl(inner: Arc<dyn TrustResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop entries older than `max_age`.
    pub fn sweep(&self, max_age: Duration) {
        self.entries
            .write()
            .retain(|_, entry| entry.fetched_at.elapsed() < max_age);
    }
}

#[async_trait]
impl TrustResolver for ScoreCache {
    async fn get_score(&self, agent_id: &str) -> Result<Option<u8>> {
        if let Some(entry) = self.entries.read().get(agent_id) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.score);
            }
        }

        match self.inner.get_score(agent_id).await {
            Ok(score) => {
                self.entries.write().insert(
                    agent_id.to_string(),
                    CacheEntry {
                        score,
                        fetched_at: Instant::now(),
                    },
                );
                Ok(score)
            }
            Err(e) => {
                // Serve the stale entry, if any, rather than failing.
                if let Some(entry) = self.entries.read().get(agent_id) {
                    debug!(agent = agent_id, "serving stale trust score after backend error");
                    return Ok(entry.score);
                }
                Err(e)
            }
        }
    }

    fn source(&self) -> &'static str {
        self.inner.source()
    }
}
