//! # tollgate
//!
//! An HTTP admission-control layer that gates state-changing routes behind a
//! Lightning micropayment using the L402 protocol (HTTP 402 + macaroon
//! credential + payment preimage).
//!
//! Each action is priced dynamically: geometric progression in the number of
//! prior actions by the same agent in the same context, discounted by an
//! externally supplied trust score, with a bonus for agents who space their
//! actions out. Spam gets progressively expensive; occasional, reputable, or
//! rested use stays cheap or free.
//!
//! ## Components
//!
//! - [`macaroon`] — chained-HMAC credentials bound to a payment hash and
//!   request-shape caveats
//! - [`pricing`] — the stateful quote engine
//! - [`wallet`] — the two-operation Lightning wallet seam
//! - [`trust`] — pluggable reputation scores (static, REST, attestations)
//! - [`admission`] — the per-request state machine tying it together
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{middleware, routing::post, Router};
//! use tollgate::admission::{admit, GateConfig, TollGate};
//! use tollgate::pricing::PricingConfig;
//! use tollgate::trust::StaticResolver;
//! use tollgate::wallet::MemoryWallet;
//!
//! # fn main() -> tollgate::Result<()> {
//! let gate = TollGate::new(
//!     GateConfig::new("my-hmac-secret"),
//!     PricingConfig::default(),
//!     Arc::new(MemoryWallet::new()),
//!     Arc::new(StaticResolver::default()),
//! )?;
//!
//! let app: Router = Router::new().route(
//!     "/threads/:id/replies",
//!     post(|| async { "stored" })
//!         .layer(middleware::from_fn_with_state(gate.clone(), admit)),
//! );
//! # Ok(())
//! # }
//! ```
//!
//! All pricing and invoice state is process-local and volatile; a restart
//! resets every agent to its first-action price.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod config;
pub mod error;
pub mod extract;
pub mod macaroon;
pub mod pricing;
pub mod trust;
pub mod wallet;

pub use admission::{admit, GateConfig, TollError, TollFree, TollGate, TollPaid};
pub use config::TollConfig;
pub use error::{Error, Result};
pub use macaroon::{Macaroon, MacaroonError};
pub use pricing::{PriceBreakdown, PricingConfig, PricingEngine, Quote};
pub use trust::TrustResolver;
pub use wallet::{verify_preimage, LightningWallet};
