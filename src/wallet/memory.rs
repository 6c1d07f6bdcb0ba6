//! In-memory wallet backend.
//!
//! Mints real preimage/payment-hash pairs without any Lightning node behind
//! them, which makes it the natural backend for tests, demos, and local
//! development: settle an invoice with [`MemoryWallet::settle`] and the
//! revealed preimage passes [`verify_preimage`](super::verify_preimage)
//! against the minted hash.

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pricing::unix_now_ms;
use crate::wallet::{Invoice, InvoiceStatus, InvoiceTable, LightningWallet, WalletStats};

/// Wallet backend holding everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryWallet {
    table: InvoiceTable,
}

impl MemoryWallet {
    /// Create an empty wallet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle an invoice, returning the revealed preimage.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown payment hash.
    pub fn settle(&self, payment_hash: &str) -> Result<String> {
        let preimage = self
            .table
            .entry_status(payment_hash)
            .and_then(|(_, preimage)| preimage)
            .ok_or_else(|| Error::Wallet(format!("unknown payment hash: {payment_hash}")))?;
        self.table.mark_settled(payment_hash, Some(preimage.clone()));
        debug!(payment_hash, "invoice settled");
        Ok(preimage)
    }

    /// Look up a minted invoice by payment hash.
    #[must_use]
    pub fn invoice(&self, payment_hash: &str) -> Option<Invoice> {
        self.table.get(payment_hash)
    }
}

#[async_trait]
impl LightningWallet for MemoryWallet {
    async fn create_invoice(&self, amount_sats: u64, description: &str) -> Result<Invoice> {
        let mut preimage = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        let payment_hash = hex::encode(Sha256::digest(preimage));

        // Not a parseable bolt-11 string, but shaped enough for display.
        let bolt11 = format!("lnbcrt{}n1p{}", amount_sats, &payment_hash[..24]);
        let invoice = Invoice {
            bolt11,
            payment_hash: payment_hash.clone(),
            amount_sats,
            description: description.to_string(),
            created_at_ms: unix_now_ms(),
        };
        self.table
            .insert(invoice.clone(), Some(hex::encode(preimage)));
        debug!(payment_hash = %invoice.payment_hash, amount_sats, "invoice minted");
        Ok(invoice)
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceStatus> {
        let (paid, preimage) = self
            .table
            .entry_status(payment_hash)
            .ok_or_else(|| Error::Wallet(format!("unknown payment hash: {payment_hash}")))?;
        Ok(InvoiceStatus {
            paid,
            preimage: if paid { preimage } else { None },
        })
    }

    fn stats(&self) -> WalletStats {
        self.table.stats()
    }
}
