//! Attestation-network trust resolver.
//!
//! Subscribes on one or more relays for attestation events about an agent
//! and condenses them into a score. One subscription per relay; a relay is
//! read until its end-of-stored-events marker or the fetch timeout,
//! whichever comes first. Relays are tried in order and aggregation stops
//! at the first relay that returns anything.
//!
//! Scoring: dedup to the most recent event per attester, weight by
//! attestation type, decay by age with a 90-day half-life, then scale by how
//! many distinct attesters vouched:
//!
//! ```text
//! quality = sum(weight * decay) / sum(weight)
//! score   = round(min(1, attesters / 5) * quality * 100)
//! ```
//!
//! Self-attestations are discarded before scoring. An agent with events but
//! no third-party attesters scores 0; an agent with no events at all is
//! unknown.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::macaroon::unix_now_secs;
use crate::trust::TrustResolver;

/// Attestation-network configuration.
#[derive(Debug, Clone)]
pub struct AttestationConfig {
    /// Relay websocket URLs, tried in order.
    pub relays: Vec<String>,
    /// Domain label attestations are tagged with.
    pub domain: String,
    /// Event kind carrying attestations.
    pub event_kind: u64,
    /// Stop collecting after this many events per relay.
    pub max_events: usize,
    /// Per-relay collection timeout.
    pub fetch_timeout: Duration,
    /// Half-life for temporal decay of attestations.
    pub half_life: Duration,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
            ],
            domain: "agent-trust".to_string(),
            event_kind: 38_383,
            max_events: 50,
            fetch_timeout: Duration::from_secs(2),
            half_life: Duration::from_secs(90 * 24 * 60 * 60),
        }
    }
}

/// One attestation event as delivered by a relay.
#[derive(Debug, Clone, Deserialize)]
struct AttestationEvent {
    pubkey: String,
    created_at: u64,
    #[serde(default)]
    tags: Vec<Vec<String>>,
}

/// Resolver that scores agents from relay attestations.
#[derive(Debug, Clone)]
pub struct AttestationResolver {
    config: AttestationConfig,
}

impl AttestationResolver {
    /// Create a resolver with the given configuration.
    #[must_use]
    pub fn new(config: AttestationConfig) -> Self {
        Self { config }
    }

    /// Collect attestation events about `agent_id` from one relay.
    async fn fetch_events(&self, relay: &str, agent_id: &str) -> Result<Vec<AttestationEvent>> {
        let (stream, _) = connect_async(relay.to_string())
            .await
            .map_err(|e| Error::Trust(format!("relay connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        let sub_id = format!("toll-{:08x}", rand::thread_rng().next_u32());
        let request = serde_json::json!([
            "REQ",
            sub_id,
            {
                "kinds": [self.config.event_kind],
                "#p": [agent_id],
                "#t": [self.config.domain],
                "limit": self.config.max_events,
            }
        ]);
        write
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|e| Error::Trust(format!("relay subscribe failed: {e}")))?;

        let mut events = Vec::new();
        let collect = async {
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                match frame.get(0).and_then(serde_json::Value::as_str) {
                    Some("EVENT") => {
                        if let Some(raw) = frame.get(2) {
                            match serde_json::from_value::<AttestationEvent>(raw.clone()) {
                                Ok(event) => events.push(event),
                                Err(e) => debug!(relay, error = %e, "skipping malformed event"),
                            }
                        }
                        if events.len() >= self.config.max_events {
                            break;
                        }
                    }
                    // End of stored events: nothing more to wait for.
                    Some("EOSE") => break,
                    _ => {}
                }
            }
        };
        let timed_out = tokio::time::timeout(self.config.fetch_timeout, collect)
            .await
            .is_err();
        if timed_out {
            debug!(relay, collected = events.len(), "relay fetch timed out");
        }

        let close = serde_json::json!(["CLOSE", sub_id]);
        let _ = write.send(Message::Text(close.to_string())).await;
        Ok(events)
    }
}

#[async_trait]
impl TrustResolver for AttestationResolver {
    async fn get_score(&self, agent_id: &str) -> Result<Option<u8>> {
        for relay in &self.config.relays {
            match self.fetch_events(relay, agent_id).await {
                Ok(events) if !events.is_empty() => {
                    let score = score_events(&events, agent_id, &self.config, unix_now_secs());
                    debug!(
                        agent = agent_id,
                        relay = %relay,
                        events = events.len(),
                        score = u32::from(score),
                        "agent scored"
                    );
                    return Ok(Some(score));
                }
                Ok(_) => {}
                Err(e) => warn!(relay = %relay, error = %e, "relay fetch failed"),
            }
        }
        Ok(None)
    }

    fn source(&self) -> &'static str {
        "attestation"
    }
}

/// Weight for an attestation type label.
fn attestation_weight(kind: &str) -> f64 {
    match kind {
        "service-quality" => 1.5,
        "work-completed" => 1.2,
        "identity-continuity" => 1.0,
        _ => 0.8,
    }
}

/// First value for a tag key, e.g. `["type", "service-quality"]`.
fn tag_value<'a>(tags: &'a [Vec<String>], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.first().is_some_and(|k| k == key))
        .and_then(|tag| tag.get(1))
        .map(String::as_str)
}

/// Condense events into a `0..=100` score.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn score_events(
    events: &[AttestationEvent],
    subject: &str,
    config: &AttestationConfig,
    now_secs: u64,
) -> u8 {
    // Most recent event per attester; self-attestations carry no weight.
    let mut latest: std::collections::HashMap<&str, &AttestationEvent> =
        std::collections::HashMap::new();
    for event in events {
        if event.pubkey == subject {
            continue;
        }
        let entry = latest.entry(event.pubkey.as_str()).or_insert(event);
        if event.created_at > entry.created_at {
            *entry = event;
        }
    }
    if latest.is_empty() {
        return 0;
    }

    let half_life = config.half_life.as_secs_f64().max(1.0);
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for event in latest.values() {
        let weight = attestation_weight(tag_value(&event.tags, "type").unwrap_or("general-trust"));
        let age = now_secs.saturating_sub(event.created_at) as f64;
        let decay = 0.5_f64.powf(age / half_life);
        weighted += weight * decay;
        total_weight += weight;
    }

    let quality = weighted / total_weight;
    let network_factor = (latest.len() as f64 / 5.0).min(1.0);
    (network_factor * quality * 100.0).round() as u8
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn event(pubkey: &str, created_at: u64, kind: Option<&str>) -> AttestationEvent {
        let mut tags = vec![
            vec!["p".to_string(), "subject".to_string()],
            vec!["t".to_string(), "agent-trust".to_string()],
        ];
        if let Some(kind) = kind {
            tags.push(vec!["type".to_string(), kind.to_string()]);
        }
        AttestationEvent {
            pubkey: pubkey.to_string(),
            created_at,
            tags,
        }
    }

    #[test]
    fn test_five_fresh_attesters_score_full() {
        let events: Vec<_> = (0..5)
            .map(|i| event(&format!("attester-{i}"), NOW, Some("general-trust")))
            .collect();
        let score = score_events(&events, "subject", &AttestationConfig::default(), NOW);
        assert_eq!(score, 100);
    }

    #[test]
    fn test_fewer_attesters_scale_down() {
        let events = vec![event("a", NOW, None), event("b", NOW, None)];
        let score = score_events(&events, "subject", &AttestationConfig::default(), NOW);
        assert_eq!(score, 40); // 2 of 5 attesters, full quality
    }

    #[test]
    fn test_decay_halves_at_half_life() {
        let config = AttestationConfig::default();
        let old = NOW - config.half_life.as_secs();
        let events: Vec<_> = (0..5)
            .map(|i| event(&format!("attester-{i}"), old, None))
            .collect();
        let score = score_events(&events, "subject", &config, NOW);
        assert_eq!(score, 50);
    }

    #[test]
    fn test_self_attestations_score_zero() {
        let events = vec![event("subject", NOW, None), event("subject", NOW - 10, None)];
        let score = score_events(&events, "subject", &AttestationConfig::default(), NOW);
        assert_eq!(score, 0);
    }

    #[test]
    fn test_dedup_keeps_most_recent_per_attester() {
        let config = AttestationConfig::default();
        let stale = NOW - config.half_life.as_secs() * 10;
        // Five attesters each with a stale and a fresh event; only the fresh
        // ones should count, so quality stays at 1.
        let mut events = Vec::new();
        for i in 0..5 {
            events.push(event(&format!("attester-{i}"), stale, None));
            events.push(event(&format!("attester-{i}"), NOW, None));
        }
        let score = score_events(&events, "subject", &config, NOW);
        assert_eq!(score, 100);
    }

    #[test]
    fn test_attestation_weights() {
        assert!((attestation_weight("service-quality") - 1.5).abs() < f64::EPSILON);
        assert!((attestation_weight("work-completed") - 1.2).abs() < f64::EPSILON);
        assert!((attestation_weight("identity-continuity") - 1.0).abs() < f64::EPSILON);
        assert!((attestation_weight("general-trust") - 0.8).abs() < f64::EPSILON);
        assert!((attestation_weight("unheard-of") - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tag_value() {
        let tags = vec![
            vec!["p".to_string(), "abc".to_string()],
            vec!["type".to_string(), "service-quality".to_string()],
        ];
        assert_eq!(tag_value(&tags, "type"), Some("service-quality"));
        assert_eq!(tag_value(&tags, "missing"), None);
    }
}
