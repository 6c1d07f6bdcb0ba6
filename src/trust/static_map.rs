//! Static in-memory trust scores.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::trust::{clamp_score, TrustResolver};

/// Resolver backed by a fixed map, mostly for tests and closed deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    scores: HashMap<String, u8>,
}

impl StaticResolver {
    /// Build a resolver from `(agent, score)` pairs; scores are clamped.
    pub fn new<I, S>(scores: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        Self {
            scores: scores
                .into_iter()
                .map(|(agent, score)| (agent.into(), clamp_score(score)))
                .collect(),
        }
    }
}

#[async_trait]
impl TrustResolver for StaticResolver {
    async fn get_score(&self, agent_id: &str) -> Result<Option<u8>> {
        Ok(self.scores.get(agent_id).copied())
    }

    fn source(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_and_unknown() {
        let resolver = StaticResolver::new([("alice", 85), ("bob", 140), ("carol", -3)]);
        assert_eq!(resolver.get_score("alice").await.expect("ok"), Some(85));
        assert_eq!(resolver.get_score("bob").await.expect("ok"), Some(100));
        assert_eq!(resolver.get_score("carol").await.expect("ok"), Some(0));
        assert_eq!(resolver.get_score("mallory").await.expect("ok"), None);
    }
}
