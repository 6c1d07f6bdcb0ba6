//! tollgate-demo entry point.
//!
//! A tiny discussion server whose reply endpoint sits behind an L402 toll,
//! backed by the in-memory wallet. A faucet endpoint settles invoices and
//! reveals preimages so the whole flow can be driven with curl:
//!
//! ```text
//! curl -X POST localhost:8402/replies \
//!     -H 'x-agent-id: alice' -H 'content-type: application/json' \
//!     -d '{"threadId":"t-1","text":"hello"}'
//! # -> 402 with invoice + macaroon
//! curl -X POST localhost:8402/pay/<paymentHash>
//! # -> preimage
//! curl -X POST localhost:8402/replies \
//!     -H 'authorization: L402 <macaroon>:<preimage>' ...
//! ```

mod cli;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use clap::Parser;
use cli::Cli;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tollgate::admission::{admit, TollError, TollFree, TollPaid, TollGate};
use tollgate::wallet::MemoryWallet;
use tollgate::TollConfig;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Clone)]
struct AppState {
    gate: TollGate,
    wallet: Arc<MemoryWallet>,
    replies: Arc<RwLock<HashMap<String, Vec<serde_json::Value>>>>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("tollgate-demo v{}", env!("CARGO_PKG_VERSION"));

    let mut config = cli
        .config
        .as_deref()
        .map(TollConfig::from_file)
        .transpose()?
        .unwrap_or_default();
    if config.secret.is_empty() {
        config.secret = cli.secret.clone();
    }
    if let Some(base_sats) = cli.base_sats {
        config.pricing.base_sats = base_sats;
    }
    if config.context_from.is_none() {
        config.context_from = Some("body.threadId".to_string());
    }
    config.validate()?;

    // The demo always runs on the in-memory wallet so the faucet endpoint
    // can settle invoices; a hosted backend has its own payment rail.
    let wallet = Arc::new(MemoryWallet::new());
    let resolver = config.build_resolver()?;
    let gate = TollGate::new(
        config.gate_config()?,
        config.pricing.clone(),
        Arc::clone(&wallet) as Arc<dyn tollgate::LightningWallet>,
        resolver,
    )?;
    let _sweeper = gate.spawn_sweeper(Duration::from_secs(600), config.activity_horizon());

    let state = AppState {
        gate: gate.clone(),
        wallet,
        replies: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route(
            "/replies",
            post(post_reply).layer(middleware::from_fn_with_state(gate.clone(), admit)),
        )
        .route("/threads/:thread_id/replies", get(list_replies))
        .route("/pay/:payment_hash", post(pay_invoice))
        .route("/stats", get(stats))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("demo forum listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    gate.close().await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ReplyBody {
    #[serde(rename = "threadId")]
    thread_id: String,
    text: String,
}

async fn post_reply(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> Response {
    let toll = if request.extensions().get::<TollPaid>().is_some() {
        "paid"
    } else if request.extensions().get::<TollFree>().is_some() {
        "free"
    } else if let Some(TollError(detail)) = request.extensions().get::<TollError>() {
        tracing::warn!(%detail, "reply accepted without toll");
        "waived"
    } else {
        "untolled"
    };

    let bytes = match axum::body::to_bytes(request.into_body(), 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let Ok(body) = serde_json::from_slice::<ReplyBody>(&bytes) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "threadId and text are required"})),
        )
            .into_response();
    };

    let reply = serde_json::json!({"text": body.text, "toll": toll});
    state
        .replies
        .write()
        .entry(body.thread_id.clone())
        .or_default()
        .push(reply.clone());

    (StatusCode::CREATED, Json(reply)).into_response()
}

async fn list_replies(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Json<Vec<serde_json::Value>> {
    Json(
        state
            .replies
            .read()
            .get(&thread_id)
            .cloned()
            .unwrap_or_default(),
    )
}

/// Faucet: settle an invoice and reveal its preimage.
async fn pay_invoice(
    State(state): State<AppState>,
    Path(payment_hash): Path<String>,
) -> Response {
    match state.wallet.settle(&payment_hash) {
        Ok(preimage) => Json(serde_json::json!({
            "paymentHash": payment_hash,
            "preimage": preimage,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.gate.stats()))
}
