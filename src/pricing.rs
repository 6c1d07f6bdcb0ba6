//! Progressive pricing engine.
//!
//! Computes the toll for an (agent, context) pair and keeps the in-memory
//! activity bookkeeping that drives it. The price for the `k+1`-th action in
//! a context is geometric in `k`, clamped to a hard cap, then adjusted by a
//! trust discount and a cooldown bonus:
//!
//! 1. `progressive = min(ceil(base * multiplier^k), cap)`, with `k = 0`
//!    returning the literal base price.
//! 2. A trust score at or above `free_above` waives the toll entirely; one at
//!    or above `discount_above` takes `discount_percent` off.
//! 3. An agent whose last action (in any context) is older than the cooldown
//!    window earns `bonus_percent` off.
//!
//! Discounts and bonuses never drop a nonzero price below 1 sat; only the
//! trust free pass produces a zero quote.
//!
//! Quotes are dry-run by default: challenge emission must not ratchet prices
//! for clients that never pay. Activity is recorded only through
//! [`PricingEngine::commit`], which counts and appends under a single lock so
//! concurrent commits for the same pair each see the other's increment.
//!
//! All state is process-local and volatile; a restart resets every agent to
//! its first-action price.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Trust-discount configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustDiscountConfig {
    /// Enable the trust branch.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Scores at or above this waive the toll entirely.
    #[serde(default = "default_free_above")]
    pub free_above: u8,

    /// Scores at or above this earn a partial discount.
    #[serde(default = "default_discount_above")]
    pub discount_above: u8,

    /// Percentage taken off for a partial discount.
    #[serde(default = "default_discount_percent")]
    pub discount_percent: u8,
}

impl Default for TrustDiscountConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            free_above: default_free_above(),
            discount_above: default_discount_above(),
            discount_percent: default_discount_percent(),
        }
    }
}

/// Cooldown-bonus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// Enable the cooldown branch.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// An agent idle longer than this (milliseconds) earns the bonus.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Percentage taken off when the bonus applies.
    #[serde(default = "default_bonus_percent")]
    pub bonus_percent: u8,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_ms: default_window_ms(),
            bonus_percent: default_bonus_percent(),
        }
    }
}

/// Pricing engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Floor price in sats for a first action.
    #[serde(default = "default_base_sats")]
    pub base_sats: u64,

    /// Geometric factor per prior action in the same context.
    #[serde(default = "default_multiplier")]
    pub progressive_multiplier: f64,

    /// Hard ceiling on the progressive component.
    #[serde(default = "default_cap")]
    pub progressive_cap: u64,

    /// Trust-discount settings.
    #[serde(default)]
    pub trust: TrustDiscountConfig,

    /// Cooldown-bonus settings.
    #[serde(default)]
    pub cooldown: CooldownConfig,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_sats: default_base_sats(),
            progressive_multiplier: default_multiplier(),
            progressive_cap: default_cap(),
            trust: TrustDiscountConfig::default(),
            cooldown: CooldownConfig::default(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_free_above() -> u8 {
    80
}

const fn default_discount_above() -> u8 {
    30
}

const fn default_discount_percent() -> u8 {
    50
}

const fn default_window_ms() -> u64 {
    60_000
}

const fn default_bonus_percent() -> u8 {
    25
}

const fn default_base_sats() -> u64 {
    1
}

fn default_multiplier() -> f64 {
    1.5
}

const fn default_cap() -> u64 {
    50
}

/// Itemized quote components, surfaced in 402 challenge bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBreakdown {
    /// Configured base price.
    pub base: u64,
    /// Progressive component before discounts.
    pub progressive: u64,
    /// Prior committed actions by this agent in this context.
    pub prior_actions_in_context: usize,
    /// Trust score used for the quote, if one was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<u8>,
    /// Sats taken off by the trust branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_discount: Option<u64>,
    /// Sats taken off by the cooldown branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_bonus: Option<u64>,
    /// Final price in sats.
    #[serde(rename = "final")]
    pub final_sats: u64,
}

/// A computed quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    /// Price in sats; zero means the action is free.
    pub sats: u64,
    /// Itemized components.
    pub breakdown: PriceBreakdown,
}

/// Aggregate engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Distinct contexts with recorded activity.
    pub contexts: usize,
    /// Distinct agents with a last-action timestamp.
    pub agents: usize,
    /// Total committed actions across all contexts.
    pub total_actions: usize,
}

/// One committed action.
#[derive(Debug, Clone)]
struct ActivityRecord {
    agent_id: String,
    timestamp_ms: u64,
}

#[derive(Debug, Default)]
struct EngineState {
    /// Ordered activity per context, append-only within the horizon.
    activity: HashMap<String, Vec<ActivityRecord>>,
    /// Most recent committed action per agent, across all contexts.
    last_action: HashMap<String, u64>,
}

/// Stateful pricing engine.
///
/// Keep one engine per tenant; the activity map lives inside the value, not
/// in a global.
#[derive(Debug)]
pub struct PricingEngine {
    config: PricingConfig,
    state: Mutex<EngineState>,
}

impl PricingEngine {
    /// Create an engine with the given configuration.
    #[must_use]
    pub fn new(config: PricingConfig) -> Self {
        Self {
            config,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Compute the current quote without recording activity.
    #[must_use]
    pub fn quote(&self, agent_id: &str, context_id: &str, trust_score: Option<u8>) -> Quote {
        self.calculate(agent_id, context_id, trust_score, true, unix_now_ms())
    }

    /// Compute the quote and record the action.
    ///
    /// The count-prior-actions read and the append are one critical section,
    /// so two simultaneous commits for the same (agent, context) each observe
    /// the other's increment.
    pub fn commit(&self, agent_id: &str, context_id: &str, trust_score: Option<u8>) -> Quote {
        self.calculate(agent_id, context_id, trust_score, false, unix_now_ms())
    }

    fn calculate(
        &self,
        agent_id: &str,
        context_id: &str,
        trust_score: Option<u8>,
        dry_run: bool,
        now_ms: u64,
    ) -> Quote {
        let cfg = &self.config;
        let mut state = self.state.lock();

        let prior = state
            .activity
            .get(context_id)
            .map_or(0, |records| {
                records.iter().filter(|r| r.agent_id == agent_id).count()
            });

        let progressive = self.progressive_component(prior);
        let mut price = progressive;
        let mut trust_discount = None;
        let mut cooldown_bonus = None;
        let trust_score = trust_score.filter(|_| cfg.trust.enabled);

        if let Some(score) = trust_score {
            if score >= cfg.trust.free_above {
                trust_discount = Some(price);
                price = 0;
            } else if score >= cfg.trust.discount_above {
                let discount = price * u64::from(cfg.trust.discount_percent) / 100;
                price = price.saturating_sub(discount).max(1);
                trust_discount = Some(discount);
            }
        }

        if cfg.cooldown.enabled && price > 0 {
            let rested = state.last_action.get(agent_id).map_or(true, |last| {
                now_ms.saturating_sub(*last) > cfg.cooldown.window_ms
            });
            if rested {
                let bonus = price * u64::from(cfg.cooldown.bonus_percent) / 100;
                price = price.saturating_sub(bonus).max(1);
                if bonus > 0 {
                    cooldown_bonus = Some(bonus);
                }
            }
        }

        if !dry_run {
            state
                .activity
                .entry(context_id.to_string())
                .or_default()
                .push(ActivityRecord {
                    agent_id: agent_id.to_string(),
                    timestamp_ms: now_ms,
                });
            state.last_action.insert(agent_id.to_string(), now_ms);
            debug!(
                agent = agent_id,
                context = context_id,
                sats = price,
                prior,
                "committed action"
            );
        }

        Quote {
            sats: price,
            breakdown: PriceBreakdown {
                base: cfg.base_sats,
                progressive,
                prior_actions_in_context: prior,
                trust_score,
                trust_discount,
                cooldown_bonus,
                final_sats: price,
            },
        }
    }

    /// Progressive component for `prior` committed actions.
    ///
    /// Saturates at the cap for large exponents rather than overflowing.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn progressive_component(&self, prior: usize) -> u64 {
        let cfg = &self.config;
        if prior == 0 {
            return cfg.base_sats;
        }
        let exponent = i32::try_from(prior).unwrap_or(i32::MAX);
        let raw = cfg.base_sats as f64 * cfg.progressive_multiplier.powi(exponent);
        if !raw.is_finite() || raw >= cfg.progressive_cap as f64 {
            cfg.progressive_cap
        } else {
            (raw.ceil() as u64).min(cfg.progressive_cap)
        }
    }

    /// Number of committed actions for an (agent, context) pair.
    #[must_use]
    pub fn activity_count(&self, agent_id: &str, context_id: &str) -> usize {
        self.state
            .lock()
            .activity
            .get(context_id)
            .map_or(0, |records| {
                records.iter().filter(|r| r.agent_id == agent_id).count()
            })
    }

    /// Drop activity older than `max_age` and empty context buckets.
    ///
    /// Returns the number of records removed. Agent last-action entries older
    /// than the horizon are dropped as well.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_at(max_age, unix_now_ms())
    }

    fn cleanup_at(&self, max_age: Duration, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX));
        let mut state = self.state.lock();

        let mut removed = 0;
        state.activity.retain(|_, records| {
            let before = records.len();
            records.retain(|r| r.timestamp_ms >= cutoff);
            removed += before - records.len();
            !records.is_empty()
        });
        state.last_action.retain(|_, last| *last >= cutoff);

        if removed > 0 {
            debug!(removed, "swept expired activity");
        }
        removed
    }

    /// Aggregate counters over the current state.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let state = self.state.lock();
        EngineStats {
            contexts: state.activity.len(),
            agents: state.last_action.len(),
            total_actions: state.activity.values().map(Vec::len).sum(),
        }
    }

    /// Erase all activity and last-action state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.activity.clear();
        state.last_action.clear();
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new(PricingConfig::default())
    }
}

/// Current wall-clock time as UNIX milliseconds.
pub(crate) fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    /// base=1, multiplier=1.5, cap=50, trust and cooldown disabled.
    fn bare_config() -> PricingConfig {
        PricingConfig {
            trust: TrustDiscountConfig {
                enabled: false,
                ..Default::default()
            },
            cooldown: CooldownConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn bare_config_with_base(base_sats: u64) -> PricingConfig {
        PricingConfig {
            base_sats,
            ..bare_config()
        }
    }

    #[test]
    fn test_first_action_is_base_price() {
        let engine = PricingEngine::new(bare_config());
        let quote = engine.quote("a", "t", None);
        assert_eq!(quote.sats, 1);
        assert_eq!(quote.breakdown.prior_actions_in_context, 0);
        assert_eq!(quote.breakdown.final_sats, 1);
    }

    #[test]
    fn test_progression_sequence() {
        let engine = PricingEngine::new(bare_config());
        let sats: Vec<u64> = (0..10).map(|_| engine.commit("a", "t", None).sats).collect();
        assert_eq!(sats, vec![1, 2, 3, 4, 6, 8, 12, 18, 26, 39]);

        // The 11th quote hits the cap: 1.5^10 is roughly 57.7, clamped to 50.
        let quote = engine.quote("a", "t", None);
        assert_eq!(quote.sats, 50);
    }

    #[test]
    fn test_quote_is_dry_run() {
        let engine = PricingEngine::new(bare_config());
        for _ in 0..5 {
            engine.quote("a", "t", None);
        }
        assert_eq!(engine.activity_count("a", "t"), 0);
        assert_eq!(engine.stats().total_actions, 0);
        assert_eq!(engine.quote("a", "t", None).sats, 1);
    }

    #[test]
    fn test_contexts_are_independent() {
        let engine = PricingEngine::new(bare_config());
        for _ in 0..3 {
            engine.commit("a", "t1", None);
        }
        assert_eq!(engine.quote("a", "t2", None).sats, 1);
        assert_eq!(engine.quote("a", "t1", None).sats, 4);
    }

    #[test]
    fn test_agents_are_independent_within_context() {
        let engine = PricingEngine::new(bare_config());
        for _ in 0..3 {
            engine.commit("a", "t", None);
        }
        assert_eq!(engine.quote("b", "t", None).sats, 1);
    }

    #[test]
    fn test_trust_free_pass() {
        let mut config = bare_config_with_base(10);
        config.trust.enabled = true;
        let engine = PricingEngine::new(config);

        let quote = engine.quote("a", "t", Some(85));
        assert_eq!(quote.sats, 0);
        assert_eq!(quote.breakdown.trust_discount, Some(10));
        assert_eq!(quote.breakdown.trust_score, Some(85));
    }

    #[test]
    fn test_trust_partial_discount() {
        let mut config = bare_config_with_base(10);
        config.trust.enabled = true;
        let engine = PricingEngine::new(config);

        let quote = engine.quote("a", "t", Some(50));
        assert_eq!(quote.sats, 5);
        assert_eq!(quote.breakdown.trust_discount, Some(5));
    }

    #[test]
    fn test_low_trust_no_discount() {
        let mut config = bare_config_with_base(10);
        config.trust.enabled = true;
        let engine = PricingEngine::new(config);

        let quote = engine.quote("a", "t", Some(10));
        assert_eq!(quote.sats, 10);
        assert_eq!(quote.breakdown.trust_discount, None);
        assert_eq!(quote.breakdown.trust_score, Some(10));
    }

    #[test]
    fn test_unknown_trust_skips_branch() {
        let mut config = bare_config_with_base(10);
        config.trust.enabled = true;
        let engine = PricingEngine::new(config);

        let quote = engine.quote("a", "t", None);
        assert_eq!(quote.sats, 10);
        assert_eq!(quote.breakdown.trust_score, None);
    }

    #[test]
    fn test_discount_never_free() {
        let mut config = bare_config_with_base(1);
        config.trust.enabled = true;
        let engine = PricingEngine::new(config);

        // floor(1 * 50 / 100) = 0 discount; price stays at the 1-sat floor.
        let quote = engine.quote("a", "t", Some(50));
        assert_eq!(quote.sats, 1);
    }

    #[test]
    fn test_cooldown_bonus_on_first_action() {
        let mut config = bare_config_with_base(10);
        config.cooldown = CooldownConfig {
            enabled: true,
            window_ms: 0,
            bonus_percent: 25,
        };
        let engine = PricingEngine::new(config);

        let quote = engine.quote("a", "t", None);
        assert_eq!(quote.sats, 8);
        assert_eq!(quote.breakdown.cooldown_bonus, Some(2));
    }

    #[test]
    fn test_no_cooldown_inside_window() {
        let mut config = bare_config_with_base(10);
        config.cooldown = CooldownConfig {
            enabled: true,
            window_ms: 60_000,
            bonus_percent: 25,
        };
        let engine = PricingEngine::new(config);

        engine.commit("a", "t", None);
        // Last action is just now, so the agent has not rested.
        let quote = engine.quote("a", "t", None);
        assert_eq!(quote.breakdown.cooldown_bonus, None);
    }

    #[test]
    fn test_cooldown_after_window_elapsed() {
        let mut config = bare_config_with_base(10);
        config.cooldown = CooldownConfig {
            enabled: true,
            window_ms: 60_000,
            bonus_percent: 25,
        };
        let engine = PricingEngine::new(config);

        let start = unix_now_ms();
        engine.calculate("a", "t", None, false, start);
        let quote = engine.calculate("a", "t", None, true, start + 61_000);
        assert_eq!(quote.breakdown.cooldown_bonus, Some(3)); // floor(15 * 0.25)
        assert_eq!(quote.sats, 12);
    }

    #[test]
    fn test_free_pass_skips_cooldown() {
        let mut config = bare_config_with_base(10);
        config.trust.enabled = true;
        config.cooldown = CooldownConfig {
            enabled: true,
            window_ms: 0,
            bonus_percent: 25,
        };
        let engine = PricingEngine::new(config);

        let quote = engine.quote("a", "t", Some(90));
        assert_eq!(quote.sats, 0);
        assert_eq!(quote.breakdown.cooldown_bonus, None);
    }

    #[test]
    fn test_saturates_at_cap_for_large_k() {
        let engine = PricingEngine::new(bare_config());
        for _ in 0..200 {
            engine.commit("a", "t", None);
        }
        assert_eq!(engine.quote("a", "t", None).sats, 50);
    }

    #[test]
    fn test_stats_and_reset() {
        let engine = PricingEngine::new(bare_config());
        engine.commit("a", "t1", None);
        engine.commit("a", "t2", None);
        engine.commit("b", "t1", None);

        let stats = engine.stats();
        assert_eq!(stats.contexts, 2);
        assert_eq!(stats.agents, 2);
        assert_eq!(stats.total_actions, 3);

        engine.reset();
        let stats = engine.stats();
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.agents, 0);
        assert_eq!(stats.total_actions, 0);
    }

    #[test]
    fn test_cleanup_drops_old_records() {
        let engine = PricingEngine::new(bare_config());
        let start = unix_now_ms();
        engine.calculate("a", "t", None, false, start);
        engine.calculate("a", "t", None, false, start + 10_000);

        // Horizon of 5 s from a vantage 12 s in: only the first record ages out.
        let removed = engine.cleanup_at(Duration::from_secs(5), start + 12_000);
        assert_eq!(removed, 1);
        assert_eq!(engine.activity_count("a", "t"), 1);

        let removed = engine.cleanup_at(Duration::from_secs(5), start + 60_000);
        assert_eq!(removed, 1);
        assert_eq!(engine.stats().contexts, 0);
        assert_eq!(engine.stats().agents, 0);
    }

    #[test]
    fn test_concurrent_commits_all_counted() {
        use std::sync::Arc;

        let engine = Arc::new(PricingEngine::new(bare_config()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        engine.commit("a", "t", None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(engine.activity_count("a", "t"), 400);
    }
}
