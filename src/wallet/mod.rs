//! Lightning wallet abstraction.
//!
//! The admission layer only ever needs two operations from a wallet: mint a
//! bolt-11 invoice and look up whether it has settled. Concrete backends
//! implement [`LightningWallet`]; the in-memory variant doubles as the
//! injectable stub for tests and demos.
//!
//! Backends MUST surface the real bolt-11 payment hash from invoice
//! creation. Hashing the invoice string as a stand-in is not a payment hash
//! and breaks preimage verification.

mod lnbits;
mod memory;

pub use lnbits::LnbitsWallet;
pub use memory::MemoryWallet;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use crate::error::Result;

/// An invoice minted by a wallet backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// bolt-11 payment request.
    pub bolt11: String,
    /// Hex payment hash; SHA-256 of the settlement preimage.
    pub payment_hash: String,
    /// Invoice amount in sats.
    pub amount_sats: u64,
    /// Human-readable description.
    pub description: String,
    /// Creation time, UNIX milliseconds.
    pub created_at_ms: u64,
}

/// Settlement state of an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceStatus {
    /// Whether the backend reports the invoice as settled.
    pub paid: bool,
    /// Hex settlement preimage, revealed once paid.
    pub preimage: Option<String>,
}

/// Aggregate wallet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WalletStats {
    /// Invoices minted by this process.
    pub invoices_issued: usize,
    /// Invoices observed as settled.
    pub invoices_settled: usize,
}

/// Narrow wallet interface consumed by the admission layer.
///
/// `lookup_invoice` must be idempotent and safe to call repeatedly. Backend
/// errors propagate to the caller, which decides the fail-open policy.
#[async_trait]
pub trait LightningWallet: Send + Sync {
    /// Mint an invoice for `amount_sats`.
    async fn create_invoice(&self, amount_sats: u64, description: &str) -> Result<Invoice>;

    /// Look up the settlement state for a payment hash.
    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceStatus>;

    /// Counters over this process's invoice table.
    fn stats(&self) -> WalletStats;

    /// Release the backend connection, if any.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Check that `preimage_hex` is the SHA-256 preimage of `payment_hash_hex`.
///
/// This is the sole cryptographic proof of payment the admission layer
/// accepts. The digest comparison is constant-time; malformed hex simply
/// fails.
#[must_use]
pub fn verify_preimage(preimage_hex: &str, payment_hash_hex: &str) -> bool {
    let Ok(preimage) = hex::decode(preimage_hex) else {
        return false;
    };
    let Ok(payment_hash) = hex::decode(payment_hash_hex) else {
        return false;
    };
    let digest = Sha256::digest(&preimage);
    bool::from(digest.as_slice().ct_eq(&payment_hash))
}

#[derive(Debug, Clone)]
struct TableEntry {
    invoice: Invoice,
    paid: bool,
    preimage: Option<String>,
}

/// In-process invoice table keyed by payment hash.
///
/// Backends keep minted invoices here so stats and settled-preimage lookups
/// are cheap. A missing entry says nothing about settlement; the backend
/// remains authoritative.
#[derive(Debug, Default)]
pub(crate) struct InvoiceTable {
    entries: RwLock<HashMap<String, TableEntry>>,
}

impl InvoiceTable {
    fn insert(&self, invoice: Invoice, preimage: Option<String>) {
        self.entries.write().insert(
            invoice.payment_hash.clone(),
            TableEntry {
                invoice,
                paid: false,
                preimage,
            },
        );
    }

    fn mark_settled(&self, payment_hash: &str, preimage: Option<String>) {
        if let Some(entry) = self.entries.write().get_mut(payment_hash) {
            entry.paid = true;
            if preimage.is_some() {
                entry.preimage = preimage;
            }
        }
    }

    fn get(&self, payment_hash: &str) -> Option<Invoice> {
        self.entries
            .read()
            .get(payment_hash)
            .map(|e| e.invoice.clone())
    }

    fn entry_status(&self, payment_hash: &str) -> Option<(bool, Option<String>)> {
        self.entries
            .read()
            .get(payment_hash)
            .map(|e| (e.paid, e.preimage.clone()))
    }

    fn stats(&self) -> WalletStats {
        let entries = self.entries.read();
        WalletStats {
            invoices_issued: entries.len(),
            invoices_settled: entries.values().filter(|e| e.paid).count(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_preimage_matches_its_hash() {
        let preimage = [7u8; 32];
        let hash = hex::encode(Sha256::digest(preimage));
        assert!(verify_preimage(&hex::encode(preimage), &hash));
    }

    #[test]
    fn test_verify_preimage_rejects_wrong_hash() {
        let preimage = [7u8; 32];
        let other = hex::encode(Sha256::digest([8u8; 32]));
        assert!(!verify_preimage(&hex::encode(preimage), &other));
    }

    #[test]
    fn test_verify_preimage_rejects_bad_hex() {
        let hash = hex::encode(Sha256::digest([7u8; 32]));
        assert!(!verify_preimage("zz", &hash));
        assert!(!verify_preimage(&hex::encode([7u8; 32]), "not-hex"));
    }

    #[test]
    fn test_invoice_table_stats() {
        let table = InvoiceTable::default();
        let invoice = Invoice {
            bolt11: "lnbcrt1".to_string(),
            payment_hash: "aa".to_string(),
            amount_sats: 1,
            description: "test".to_string(),
            created_at_ms: 0,
        };
        table.insert(invoice, None);
        assert_eq!(table.stats().invoices_issued, 1);
        assert_eq!(table.stats().invoices_settled, 0);

        table.mark_settled("aa", Some("bb".to_string()));
        assert_eq!(table.stats().invoices_settled, 1);
        assert_eq!(
            table.entry_status("aa"),
            Some((true, Some("bb".to_string())))
        );
    }
}
