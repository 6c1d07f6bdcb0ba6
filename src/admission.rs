//! L402 admission middleware.
//!
//! Gates state-changing routes behind a Lightning toll. A request without
//! credentials gets a 402 challenge carrying an invoice and a macaroon bound
//! to the invoice's payment hash and the request shape; a retry presenting
//! `Authorization: L402 <macaroon>:<preimage>` is verified and, on success,
//! handed to the downstream handler with the toll marked as paid.
//!
//! Challenge emission quotes the price as a dry run so clients that never
//! pay cannot ratchet their own prices; activity is committed only after
//! both the preimage and the macaroon verify. The committing calculation
//! uses the retry's own (agent, context) pair; the macaroon caveats bind
//! those identifiers, so the two sources must agree or verification fails
//! first.
//!
//! Internal errors while minting a challenge fail open: the downstream
//! handler runs untolled with a [`TollError`] annotation on the request.
//! A wallet outage that locks every write is strictly worse than briefly
//! ungated writes; operators wanting fail-closed behavior can wrap the
//! route and turn [`TollError`] into a 503.

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, request::Parts, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::extract::{self, FieldSource};
use crate::macaroon::{
    create_macaroon, decode_macaroon, encode_macaroon, unix_now_secs, verify_macaroon, CaveatSet,
    RequestContext,
};
use crate::pricing::{EngineStats, PriceBreakdown, PricingConfig, PricingEngine};
use crate::trust::{resolve_with_deadline, TrustResolver, TRUST_LOOKUP_DEADLINE};
use crate::wallet::{verify_preimage, LightningWallet, WalletStats};

/// Largest request body buffered for identifier extraction.
const BODY_LIMIT: usize = 1024 * 1024;

/// Per-route gate configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// HMAC secret for macaroon minting; hex 32-byte or arbitrary UTF-8.
    pub secret: String,
    /// Macaroon lifetime, seconds from mint.
    pub invoice_ttl_secs: u64,
    /// Invoice description prefix; the context id is appended.
    pub description: String,
    /// Where the agent identifier lives in the request.
    pub agent_from: Option<FieldSource>,
    /// Where the context identifier lives in the request.
    pub context_from: Option<FieldSource>,
    /// Hard deadline on the trust lookup.
    pub trust_deadline: Duration,
}

impl GateConfig {
    /// Create a configuration with defaults for everything but the secret.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            invoice_ttl_secs: 600,
            description: "tollgate".to_string(),
            agent_from: None,
            context_from: None,
            trust_deadline: TRUST_LOOKUP_DEADLINE,
        }
    }

    /// Set the invoice description prefix.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the macaroon lifetime.
    #[must_use]
    pub fn with_invoice_ttl_secs(mut self, secs: u64) -> Self {
        self.invoice_ttl_secs = secs;
        self
    }

    /// Set the agent identifier source.
    #[must_use]
    pub fn with_agent_from(mut self, source: FieldSource) -> Self {
        self.agent_from = Some(source);
        self
    }

    /// Set the context identifier source.
    #[must_use]
    pub fn with_context_from(mut self, source: FieldSource) -> Self {
        self.context_from = Some(source);
        self
    }
}

/// Marker: the request presented valid L402 credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TollPaid;

/// Marker: the quote was zero, no toll required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TollFree;

/// Marker: challenge minting failed and the request was waved through.
#[derive(Debug, Clone)]
pub struct TollError(pub String);

/// Combined gate counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GateStats {
    /// Pricing engine counters.
    #[serde(flatten)]
    pub pricing: EngineStats,
    /// Wallet counters.
    #[serde(flatten)]
    pub wallet: WalletStats,
}

struct GateInner {
    config: GateConfig,
    pricing: PricingEngine,
    wallet: Arc<dyn LightningWallet>,
    trust: Arc<dyn TrustResolver>,
}

/// One admission gate: pricing engine, wallet, trust resolver, and secret.
///
/// Cheap to clone; clones share all state. Instantiate one gate per tenant
/// (or per route needing independent pricing) and mount [`admit`] as route
/// middleware with the gate as its state.
#[derive(Clone)]
pub struct TollGate {
    inner: Arc<GateInner>,
}

impl TollGate {
    /// Build a gate.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty secret. A missing wallet
    /// or resolver is unrepresentable; both are required arguments.
    pub fn new(
        config: GateConfig,
        pricing: PricingConfig,
        wallet: Arc<dyn LightningWallet>,
        trust: Arc<dyn TrustResolver>,
    ) -> Result<Self> {
        if config.secret.is_empty() {
            return Err(Error::Config(
                "admission secret must not be empty".to_string(),
            ));
        }
        info!(
            description = %config.description,
            invoice_ttl_secs = config.invoice_ttl_secs,
            trust_source = trust.source(),
            "admission gate ready"
        );
        Ok(Self {
            inner: Arc::new(GateInner {
                config,
                pricing: PricingEngine::new(pricing),
                wallet,
                trust,
            }),
        })
    }

    /// The gate's pricing engine.
    #[must_use]
    pub fn pricing(&self) -> &PricingEngine {
        &self.inner.pricing
    }

    /// The gate's wallet backend.
    #[must_use]
    pub fn wallet(&self) -> &Arc<dyn LightningWallet> {
        &self.inner.wallet
    }

    /// Combined counters over pricing and wallet state.
    #[must_use]
    pub fn stats(&self) -> GateStats {
        GateStats {
            pricing: self.inner.pricing.stats(),
            wallet: self.inner.wallet.stats(),
        }
    }

    /// Spawn a periodic sweep dropping activity older than `horizon`.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        horizon: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.inner.pricing.cleanup(horizon);
            }
        })
    }

    /// Release the wallet backend connection.
    ///
    /// # Errors
    ///
    /// Propagates the backend's teardown error.
    pub async fn close(&self) -> Result<()> {
        self.inner.wallet.close().await
    }
}

/// 402 challenge body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeBody {
    /// HTTP status, always 402.
    pub status: u16,
    /// Human-readable status line.
    pub message: &'static str,
    /// Authentication protocol, always `"L402"`.
    pub protocol: &'static str,
    /// Hex payment hash of the minted invoice.
    pub payment_hash: String,
    /// bolt-11 payment request.
    pub invoice: String,
    /// Base64-encoded macaroon.
    pub macaroon: String,
    /// Toll in sats.
    pub amount_sats: u64,
    /// Context the toll was priced against.
    pub context_id: String,
    /// Invoice description.
    pub description: String,
    /// Itemized quote.
    pub pricing: PriceBreakdown,
    /// How to pay and retry.
    pub instructions: Instructions,
}

/// Human-readable payment walkthrough embedded in challenges.
#[derive(Debug, Serialize)]
pub struct Instructions {
    /// Pay the invoice.
    pub step1: String,
    /// Collect the preimage.
    pub step2: String,
    /// Retry with credentials.
    pub step3: String,
}

impl Instructions {
    fn new() -> Self {
        Self {
            step1: "Pay the Lightning invoice in `invoice`".to_string(),
            step2: "Collect the payment preimage revealed on settlement".to_string(),
            step3: "Retry with header: Authorization: L402 <macaroon>:<preimage>".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthFailureBody {
    error: &'static str,
    detail: String,
}

fn unauthorized(detail: impl Into<String>) -> Response {
    let detail = detail.into();
    debug!(%detail, "rejecting L402 credentials");
    (
        StatusCode::UNAUTHORIZED,
        Json(AuthFailureBody {
            error: "Invalid L402 credentials",
            detail,
        }),
    )
        .into_response()
}

/// Strip a case-insensitive `L402 ` scheme tag from an Authorization value.
fn strip_l402_scheme(auth: &str) -> Option<&str> {
    let auth = auth.trim();
    if auth.len() > 5 && auth[..5].eq_ignore_ascii_case("l402 ") {
        Some(auth[5..].trim())
    } else {
        None
    }
}

/// Route middleware running the admission state machine.
///
/// Mount with `axum::middleware::from_fn_with_state(gate, admit)` on each
/// protected route.
pub async fn admit(State(gate): State<TollGate>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(AuthFailureBody {
                    error: "Unreadable request body",
                    detail: e.to_string(),
                }),
            )
                .into_response();
        }
    };
    let json_body: Option<serde_json::Value> = serde_json::from_slice(&bytes).ok();

    let config = &gate.inner.config;
    let agent_id = extract::agent_id(
        config.agent_from.as_ref(),
        &parts.headers,
        parts.uri.query(),
        json_body.as_ref(),
    );
    let context_id = extract::context_id(
        config.context_from.as_ref(),
        &parts.headers,
        parts.uri.query(),
        json_body.as_ref(),
    );

    let credentials = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(strip_l402_scheme)
        .map(str::to_string);

    match credentials {
        Some(token) => verify_retry(&gate, &token, &agent_id, &context_id, parts, bytes, next).await,
        None => challenge(&gate, &agent_id, &context_id, parts, bytes, next).await,
    }
}

/// Verify presented credentials and, on success, commit the activity and run
/// the downstream handler.
async fn verify_retry(
    gate: &TollGate,
    token: &str,
    agent_id: &str,
    context_id: &str,
    parts: Parts,
    bytes: Bytes,
    next: Next,
) -> Response {
    let pieces: Vec<&str> = token.split(':').collect();
    let &[encoded, preimage] = pieces.as_slice() else {
        return unauthorized("Invalid L402 format: expected L402 <macaroon>:<preimage>");
    };
    if encoded.is_empty() || preimage.is_empty() {
        return unauthorized("Invalid L402 format: expected L402 <macaroon>:<preimage>");
    }

    let Ok(macaroon) = decode_macaroon(encoded) else {
        return unauthorized("Invalid macaroon encoding");
    };

    if !verify_preimage(preimage, &macaroon.id) {
        return unauthorized("Preimage does not match payment hash");
    }

    let ctx = RequestContext {
        endpoint: parts.uri.path(),
        method: parts.method.as_str(),
        context_id,
        agent_id,
    };
    if let Err(e) = verify_macaroon(&gate.inner.config.secret, &macaroon, &ctx) {
        return unauthorized(e.to_string());
    }

    let quote = gate.inner.pricing.commit(agent_id, context_id, None);
    info!(
        agent = agent_id,
        context = context_id,
        payment_hash = %macaroon.id,
        sats = quote.sats,
        "toll paid"
    );

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(TollPaid);
    next.run(request).await
}

/// Quote the toll and either wave the request through or answer 402.
async fn challenge(
    gate: &TollGate,
    agent_id: &str,
    context_id: &str,
    parts: Parts,
    bytes: Bytes,
    next: Next,
) -> Response {
    let config = &gate.inner.config;
    let trust_score =
        resolve_with_deadline(gate.inner.trust.as_ref(), agent_id, config.trust_deadline).await;
    let quote = gate.inner.pricing.quote(agent_id, context_id, trust_score);

    if quote.sats == 0 {
        debug!(agent = agent_id, context = context_id, "toll waived by trust score");
        let mut request = Request::from_parts(parts, Body::from(bytes));
        request.extensions_mut().insert(TollFree);
        return next.run(request).await;
    }

    let description = format!("{}: {}", config.description, context_id);
    let invoice = match gate
        .inner
        .wallet
        .create_invoice(quote.sats, &description)
        .await
    {
        Ok(invoice) => invoice,
        Err(e) => {
            warn!(error = %e, "invoice mint failed; waving request through");
            let mut request = Request::from_parts(parts, Body::from(bytes));
            request.extensions_mut().insert(TollError(e.to_string()));
            return next.run(request).await;
        }
    };

    let caveats = CaveatSet {
        expires_at: Some(unix_now_secs() + config.invoice_ttl_secs),
        endpoint: Some(parts.uri.path().to_string()),
        method: Some(parts.method.to_string()),
        context: Some(context_id.to_string()),
        agent: Some(agent_id.to_string()),
        max_actions: None,
    };
    let macaroon = create_macaroon(&config.secret, &invoice.payment_hash, &caveats);
    let encoded = encode_macaroon(&macaroon);

    debug!(
        agent = agent_id,
        context = context_id,
        sats = quote.sats,
        payment_hash = %invoice.payment_hash,
        "challenge minted"
    );

    let authenticate = format!(
        r#"L402 invoice="{}", macaroon="{}""#,
        invoice.bolt11, encoded
    );
    let body = ChallengeBody {
        status: 402,
        message: "Payment Required",
        protocol: "L402",
        payment_hash: invoice.payment_hash,
        invoice: invoice.bolt11,
        macaroon: encoded,
        amount_sats: quote.sats,
        context_id: context_id.to_string(),
        description,
        pricing: quote.breakdown,
        instructions: Instructions::new(),
    };
    (
        StatusCode::PAYMENT_REQUIRED,
        [(header::WWW_AUTHENTICATE, authenticate)],
        Json(body),
    )
        .into_response()
}
