//! Configuration for tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::admission::GateConfig;
use crate::error::{Error, Result};
use crate::extract::FieldSource;
use crate::pricing::PricingConfig;
use crate::trust::{
    AttestationConfig, AttestationResolver, RestResolver, ScoreCache, StaticResolver,
    TrustResolver,
};
use crate::wallet::{LightningWallet, LnbitsWallet, MemoryWallet};

/// Wallet backend selection.
///
/// The tagged form keeps the choice unambiguous: exactly one backend per
/// process, checked at parse time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "backend")]
pub enum WalletBackendConfig {
    /// In-process wallet minting its own preimages; for tests and demos.
    #[default]
    Memory,
    /// LNbits-compatible REST backend.
    Lnbits {
        /// Base URL, e.g. `https://lnbits.example`.
        url: String,
        /// Invoice-key for the target wallet.
        api_key: String,
    },
}

/// Trust-score source selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "source")]
pub enum TrustSourceConfig {
    /// Attestation-network resolver (default).
    Attestation {
        /// Relay URLs; empty uses the built-in preset.
        #[serde(default)]
        relays: Vec<String>,
        /// Domain label attestations are tagged with.
        #[serde(default = "default_trust_domain")]
        domain: String,
    },
    /// REST score service.
    Rest {
        /// Base URL of the score service.
        url: String,
    },
    /// Fixed in-memory scores.
    Static {
        /// Agent-to-score map.
        #[serde(default)]
        scores: HashMap<String, i64>,
    },
}

impl Default for TrustSourceConfig {
    fn default() -> Self {
        Self::Attestation {
            relays: Vec::new(),
            domain: default_trust_domain(),
        }
    }
}

/// Trust resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Which resolver to use.
    #[serde(default)]
    pub source: TrustSourceConfig,

    /// Score cache TTL in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            source: TrustSourceConfig::default(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollConfig {
    /// HMAC secret for macaroons. Hex 32-byte secrets are keyed as raw
    /// bytes, anything else as UTF-8. Required.
    #[serde(default)]
    pub secret: String,

    /// Wallet backend.
    #[serde(default)]
    pub wallet: WalletBackendConfig,

    /// Pricing parameters.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Trust resolution.
    #[serde(default)]
    pub trust: TrustConfig,

    /// Macaroon lifetime in seconds.
    #[serde(default = "default_invoice_ttl_secs")]
    pub invoice_ttl_secs: u64,

    /// Activity records older than this are swept, in seconds.
    #[serde(default = "default_activity_horizon_secs")]
    pub activity_horizon_secs: u64,

    /// Agent identifier source spec, e.g. `header.x-agent-id`.
    #[serde(default)]
    pub agent_from: Option<String>,

    /// Context identifier source spec, e.g. `body.threadId`.
    #[serde(default)]
    pub context_from: Option<String>,

    /// Invoice description prefix.
    #[serde(default = "default_description")]
    pub description: String,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TollConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            wallet: WalletBackendConfig::default(),
            pricing: PricingConfig::default(),
            trust: TrustConfig::default(),
            invoice_ttl_secs: default_invoice_ttl_secs(),
            activity_horizon_secs: default_activity_horizon_secs(),
            agent_from: None,
            context_from: None,
            description: default_description(),
            log_level: default_log_level(),
        }
    }
}

fn default_trust_domain() -> String {
    "agent-trust".to_string()
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_invoice_ttl_secs() -> u64 {
    600
}

const fn default_activity_horizon_secs() -> u64 {
    86_400
}

fn default_description() -> String {
    "tollgate".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollConfig {
    /// Check the configuration for startup-fatal problems.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing secret, an incomplete wallet backend,
    /// or an unparseable identifier source.
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(Error::Config("secret is required".to_string()));
        }
        if let WalletBackendConfig::Lnbits { url, api_key } = &self.wallet {
            if url.is_empty() || api_key.is_empty() {
                return Err(Error::Config(
                    "lnbits wallet needs both url and api_key".to_string(),
                ));
            }
        }
        if let TrustSourceConfig::Rest { url } = &self.trust.source {
            if url.is_empty() {
                return Err(Error::Config("rest trust source needs a url".to_string()));
            }
        }
        if let Some(spec) = &self.agent_from {
            FieldSource::parse(spec)?;
        }
        if let Some(spec) = &self.context_from {
            FieldSource::parse(spec)?;
        }
        Ok(())
    }

    /// Build the wallet backend this configuration names.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the backend cannot be constructed.
    pub fn build_wallet(&self) -> Result<Arc<dyn LightningWallet>> {
        match &self.wallet {
            WalletBackendConfig::Memory => Ok(Arc::new(MemoryWallet::new())),
            WalletBackendConfig::Lnbits { url, api_key } => {
                Ok(Arc::new(LnbitsWallet::new(url, api_key)?))
            }
        }
    }

    /// Build the trust resolver, wrapped in the TTL cache.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the resolver cannot be constructed.
    pub fn build_resolver(&self) -> Result<Arc<dyn TrustResolver>> {
        let inner: Arc<dyn TrustResolver> = match &self.trust.source {
            TrustSourceConfig::Attestation { relays, domain } => {
                let mut config = AttestationConfig::default();
                if !relays.is_empty() {
                    config.relays.clone_from(relays);
                }
                config.domain.clone_from(domain);
                Arc::new(AttestationResolver::new(config))
            }
            TrustSourceConfig::Rest { url } => Arc::new(RestResolver::new(url)?),
            TrustSourceConfig::Static { scores } => Arc::new(StaticResolver::new(
                scores.iter().map(|(agent, score)| (agent.clone(), *score)),
            )),
        };
        Ok(Arc::new(ScoreCache::with_ttl(
            inner,
            Duration::from_secs(self.trust.cache_ttl_secs),
        )))
    }

    /// Derive the per-route gate configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable identifier sources.
    pub fn gate_config(&self) -> Result<GateConfig> {
        let mut config = GateConfig::new(&self.secret)
            .with_description(&self.description)
            .with_invoice_ttl_secs(self.invoice_ttl_secs);
        if let Some(spec) = &self.agent_from {
            config = config.with_agent_from(FieldSource::parse(spec)?);
        }
        if let Some(spec) = &self.context_from {
            config = config.with_context_from(FieldSource::parse(spec)?);
        }
        Ok(config)
    }

    /// Activity sweep horizon as a duration.
    #[must_use]
    pub fn activity_horizon(&self) -> Duration {
        Duration::from_secs(self.activity_horizon_secs)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn minimal_config() -> TollConfig {
        TollConfig {
            secret: "test-secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_secret_rejected() {
        let config = TollConfig::default();
        assert!(config.validate().is_err());
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_incomplete_lnbits_rejected() {
        let config = TollConfig {
            wallet: WalletBackendConfig::Lnbits {
                url: "https://lnbits.example".to_string(),
                api_key: String::new(),
            },
            ..minimal_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_field_source_rejected() {
        let config = TollConfig {
            context_from: Some("cookie.thread".to_string()),
            ..minimal_config()
        };
        assert!(config.validate().is_err());

        let config = TollConfig {
            context_from: Some("body.threadId".to_string()),
            agent_from: Some("header.x-agent-id".to_string()),
            ..minimal_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tollgate.toml");

        let config = TollConfig {
            context_from: Some("body.threadId".to_string()),
            trust: TrustConfig {
                source: TrustSourceConfig::Static {
                    scores: HashMap::from([("alice".to_string(), 85)]),
                },
                cache_ttl_secs: 60,
            },
            ..minimal_config()
        };
        config.to_file(&path).expect("write");

        let loaded = TollConfig::from_file(&path).expect("read");
        assert_eq!(loaded.secret, "test-secret");
        assert_eq!(loaded.trust.cache_ttl_secs, 60);
        assert!(matches!(
            loaded.trust.source,
            TrustSourceConfig::Static { .. }
        ));
        assert_eq!(loaded.invoice_ttl_secs, 600);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: TollConfig = toml::from_str(
            r#"
            secret = "s3cret"

            [wallet]
            backend = "memory"

            [pricing]
            base_sats = 2
            "#,
        )
        .expect("parse");
        assert_eq!(config.pricing.base_sats, 2);
        assert!(config.validate().is_ok());
        assert!(matches!(config.wallet, WalletBackendConfig::Memory));
    }

    #[tokio::test]
    async fn test_build_static_resolver() {
        let config = TollConfig {
            trust: TrustConfig {
                source: TrustSourceConfig::Static {
                    scores: HashMap::from([("alice".to_string(), 140)]),
                },
                cache_ttl_secs: 300,
            },
            ..minimal_config()
        };
        let resolver = config.build_resolver().expect("resolver");
        assert_eq!(resolver.get_score("alice").await.expect("ok"), Some(100));
        assert_eq!(resolver.get_score("bob").await.expect("ok"), None);
    }
}
