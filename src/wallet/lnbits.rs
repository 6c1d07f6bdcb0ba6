//! Hosted wallet backend speaking the LNbits REST API.
//!
//! Two endpoints cover the whole adapter contract:
//!
//! - `POST /api/v1/payments` mints an invoice,
//! - `GET /api/v1/payments/<payment_hash>` reports settlement.
//!
//! The backend must return the bolt-11 payment hash from invoice creation;
//! a response without one is rejected rather than papered over with a hash
//! of the invoice string, which would never match any preimage.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pricing::unix_now_ms;
use crate::wallet::{Invoice, InvoiceStatus, InvoiceTable, LightningWallet, WalletStats};

/// Request envelope for all backend calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Wallet backend over an LNbits-compatible REST endpoint.
pub struct LnbitsWallet {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    table: InvoiceTable,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    #[serde(default)]
    payment_hash: String,
    #[serde(default, alias = "bolt11")]
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct PaymentStatusResponse {
    #[serde(default)]
    paid: bool,
    #[serde(default)]
    preimage: Option<String>,
}

impl LnbitsWallet {
    /// Create a wallet client for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty URL or key, or if the
    /// HTTP client cannot be constructed.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        if base_url.is_empty() {
            return Err(Error::Config("wallet URL must not be empty".to_string()));
        }
        if api_key.is_empty() {
            return Err(Error::Config("wallet API key must not be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
            table: InvoiceTable::default(),
        })
    }
}

#[async_trait]
impl LightningWallet for LnbitsWallet {
    async fn create_invoice(&self, amount_sats: u64, description: &str) -> Result<Invoice> {
        let url = format!("{}/api/v1/payments", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({
                "out": false,
                "amount": amount_sats,
                "memo": description,
                "unit": "sat",
            }))
            .send()
            .await
            .map_err(|e| Error::Wallet(format!("invoice mint failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Wallet(format!(
                "invoice mint failed: backend returned {}",
                response.status()
            )));
        }

        let body: CreateInvoiceResponse = response
            .json()
            .await
            .map_err(|e| Error::Wallet(format!("invoice mint returned invalid JSON: {e}")))?;

        if body.payment_hash.is_empty() {
            return Err(Error::Wallet(
                "backend did not return a payment hash".to_string(),
            ));
        }
        if body.payment_request.is_empty() {
            return Err(Error::Wallet(
                "backend did not return a payment request".to_string(),
            ));
        }

        let invoice = Invoice {
            bolt11: body.payment_request,
            payment_hash: body.payment_hash,
            amount_sats,
            description: description.to_string(),
            created_at_ms: unix_now_ms(),
        };
        self.table.insert(invoice.clone(), None);
        debug!(payment_hash = %invoice.payment_hash, amount_sats, "invoice minted");
        Ok(invoice)
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceStatus> {
        // Always ask the backend; the local table is a cache, and a missing
        // entry must not be read as "unpaid".
        let url = format!("{}/api/v1/payments/{payment_hash}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Wallet(format!("invoice lookup failed: {e}")))?;

        if !response.status().is_success() {
            warn!(payment_hash, status = %response.status(), "invoice lookup rejected");
            return Err(Error::Wallet(format!(
                "invoice lookup failed: backend returned {}",
                response.status()
            )));
        }

        let body: PaymentStatusResponse = response
            .json()
            .await
            .map_err(|e| Error::Wallet(format!("invoice lookup returned invalid JSON: {e}")))?;

        if body.paid {
            self.table.mark_settled(payment_hash, body.preimage.clone());
        }
        Ok(InvoiceStatus {
            paid: body.paid,
            preimage: body.preimage,
        })
    }

    fn stats(&self) -> WalletStats {
        self.table.stats()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_config() {
        assert!(LnbitsWallet::new("", "key").is_err());
        assert!(LnbitsWallet::new("http://localhost:5000", "").is_err());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let wallet = LnbitsWallet::new("http://localhost:5000/", "key").expect("wallet");
        assert_eq!(wallet.base_url, "http://localhost:5000");
    }

    #[test]
    fn test_create_response_accepts_bolt11_alias() {
        let body: CreateInvoiceResponse =
            serde_json::from_str(r#"{"payment_hash":"aa","bolt11":"lnbc1"}"#).expect("parse");
        assert_eq!(body.payment_request, "lnbc1");
        assert_eq!(body.payment_hash, "aa");
    }
}
