//! Macaroon credentials for L402 challenges.
//!
//! A macaroon binds a Lightning payment hash to a set of request-shape
//! caveats under a chained HMAC-SHA256:
//!
//! ```text
//! sig0 = HMAC(secret, payment_hash)
//! sigN = HMAC(hex(sigN-1), caveatN)
//! ```
//!
//! The key for each chained step is the *hex ASCII* of the prior signature,
//! not its raw bytes. This is part of the wire contract; both sides must
//! agree or verification fails.
//!
//! On the wire a macaroon is the Base64 of its canonical JSON form
//! `{"id": "...", "caveats": [...], "signature": "..."}`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Caveat key: UNIX-seconds expiry.
pub const CAVEAT_EXPIRES_AT: &str = "expires_at";
/// Caveat key: request path the credential is bound to.
pub const CAVEAT_ENDPOINT: &str = "endpoint";
/// Caveat key: HTTP verb the credential is bound to.
pub const CAVEAT_METHOD: &str = "method";
/// Caveat key: pricing context identifier.
pub const CAVEAT_CONTEXT: &str = "context";
/// Caveat key: agent identifier.
pub const CAVEAT_AGENT: &str = "agent";
/// Caveat key: reserved action budget (not enforced).
pub const CAVEAT_MAX_ACTIONS: &str = "max_actions";

/// Errors raised while decoding or verifying a macaroon.
///
/// The `Display` form of each variant is the exact `detail` string surfaced
/// in 401 responses, so these messages are part of the HTTP contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacaroonError {
    /// The token is not Base64 JSON of the expected shape.
    #[error("Invalid macaroon encoding")]
    Encoding,

    /// The chained HMAC did not match.
    #[error("Invalid signature")]
    Signature,

    /// The `expires_at` caveat is in the past.
    #[error("Macaroon expired")]
    Expired,

    /// The request path does not match the `endpoint` caveat.
    #[error("Endpoint mismatch: expected {0}")]
    EndpointMismatch(String),

    /// The request verb does not match the `method` caveat.
    #[error("Method mismatch: expected {0}")]
    MethodMismatch(String),

    /// The request context does not match the `context` caveat.
    #[error("Context mismatch: expected {0}")]
    ContextMismatch(String),

    /// The request agent does not match the `agent` caveat.
    #[error("Agent mismatch: expected {0}")]
    AgentMismatch(String),
}

/// A macaroon credential.
///
/// Field order is significant: the canonical JSON encoding follows the
/// struct order below and only the issuer round-trips it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macaroon {
    /// The payment hash (hex) this credential is bound to.
    pub id: String,
    /// Ordered caveat strings of the form `"<key> = <value>"`.
    pub caveats: Vec<String>,
    /// Final HMAC hex digest over the id and caveats.
    pub signature: String,
}

/// Caveats to embed when minting a macaroon.
///
/// Only the fields actually set are emitted, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct CaveatSet {
    /// UNIX-seconds expiry.
    pub expires_at: Option<u64>,
    /// Request path.
    pub endpoint: Option<String>,
    /// HTTP verb.
    pub method: Option<String>,
    /// Pricing context identifier.
    pub context: Option<String>,
    /// Agent identifier.
    pub agent: Option<String>,
    /// Reserved action budget.
    pub max_actions: Option<u64>,
}

impl CaveatSet {
    /// Serialize the set into ordered caveat strings.
    ///
    /// The string form is `"<key> = <value>"` with single spaces around the
    /// equals sign; integers are rendered in decimal. Empty values are never
    /// emitted.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        let mut caveats = Vec::new();
        if let Some(expires_at) = self.expires_at {
            caveats.push(format!("{CAVEAT_EXPIRES_AT} = {expires_at}"));
        }
        if let Some(ref endpoint) = self.endpoint {
            if !endpoint.is_empty() {
                caveats.push(format!("{CAVEAT_ENDPOINT} = {endpoint}"));
            }
        }
        if let Some(ref method) = self.method {
            if !method.is_empty() {
                caveats.push(format!("{CAVEAT_METHOD} = {method}"));
            }
        }
        if let Some(ref context) = self.context {
            if !context.is_empty() {
                caveats.push(format!("{CAVEAT_CONTEXT} = {context}"));
            }
        }
        if let Some(ref agent) = self.agent {
            if !agent.is_empty() {
                caveats.push(format!("{CAVEAT_AGENT} = {agent}"));
            }
        }
        if let Some(max_actions) = self.max_actions {
            caveats.push(format!("{CAVEAT_MAX_ACTIONS} = {max_actions}"));
        }
        caveats
    }
}

/// Request shape a macaroon is verified against.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Request path (e.g. `/threads/42/replies`).
    pub endpoint: &'a str,
    /// HTTP verb (compared case-insensitively).
    pub method: &'a str,
    /// Context identifier extracted from the request.
    pub context_id: &'a str,
    /// Agent identifier extracted from the request.
    pub agent_id: &'a str,
}

/// Derive the root MAC key from the configured secret.
///
/// A 64-char lowercase-hex secret is interpreted as 32 raw key bytes;
/// anything else is keyed as UTF-8.
fn root_key(secret: &str) -> Vec<u8> {
    let is_hex_key =
        secret.len() == 64 && secret.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if is_hex_key {
        // Cannot fail: checked to be valid lowercase hex above.
        hex::decode(secret).unwrap_or_else(|_| secret.as_bytes().to_vec())
    } else {
        secret.as_bytes().to_vec()
    }
}

/// One HMAC-SHA256 step, hex-encoded.
fn hmac_hex(key: &[u8], message: &[u8]) -> String {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Compute the chained signature over an id and ordered caveat strings.
#[must_use]
pub fn chain_signature(secret: &str, id: &str, caveats: &[String]) -> String {
    let mut signature = hmac_hex(&root_key(secret), id.as_bytes());
    for caveat in caveats {
        signature = hmac_hex(signature.as_bytes(), caveat.as_bytes());
    }
    signature
}

/// Mint a macaroon bound to `payment_hash` with the given caveats.
#[must_use]
pub fn create_macaroon(secret: &str, payment_hash: &str, caveats: &CaveatSet) -> Macaroon {
    let caveats = caveats.to_strings();
    let signature = chain_signature(secret, payment_hash, &caveats);
    Macaroon {
        id: payment_hash.to_string(),
        caveats,
        signature,
    }
}

/// Verify a macaroon's MAC and caveats against a request.
///
/// The MAC is recomputed over the stored caveat order and compared in
/// constant time; any byte flipped in the id, a caveat, the ordering, or
/// the signature fails with [`MacaroonError::Signature`]. Caveats are then
/// checked in order; unknown keys are ignored for forward compatibility.
///
/// # Errors
///
/// Returns the first failing check as a [`MacaroonError`].
pub fn verify_macaroon(
    secret: &str,
    macaroon: &Macaroon,
    ctx: &RequestContext<'_>,
) -> std::result::Result<(), MacaroonError> {
    let expected = chain_signature(secret, &macaroon.id, &macaroon.caveats);
    if !bool::from(expected.as_bytes().ct_eq(macaroon.signature.as_bytes())) {
        return Err(MacaroonError::Signature);
    }

    for caveat in &macaroon.caveats {
        let Some((key, value)) = caveat.split_once(" = ") else {
            continue;
        };
        match key {
            CAVEAT_EXPIRES_AT => {
                let expires_at: u64 = value.parse().map_err(|_| MacaroonError::Expired)?;
                if unix_now_secs() > expires_at {
                    return Err(MacaroonError::Expired);
                }
            }
            CAVEAT_ENDPOINT => {
                if ctx.endpoint != value {
                    return Err(MacaroonError::EndpointMismatch(value.to_string()));
                }
            }
            CAVEAT_METHOD => {
                if !ctx.method.eq_ignore_ascii_case(value) {
                    return Err(MacaroonError::MethodMismatch(value.to_string()));
                }
            }
            CAVEAT_CONTEXT => {
                if ctx.context_id != value {
                    return Err(MacaroonError::ContextMismatch(value.to_string()));
                }
            }
            CAVEAT_AGENT => {
                if ctx.agent_id != value {
                    return Err(MacaroonError::AgentMismatch(value.to_string()));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Encode a macaroon to its opaque ASCII token (Base64 of canonical JSON).
#[must_use]
pub fn encode_macaroon(macaroon: &Macaroon) -> String {
    // Serializing a plain struct of strings cannot fail.
    let json = serde_json::to_string(macaroon).unwrap_or_default();
    BASE64.encode(json.as_bytes())
}

/// Decode an opaque token back into a macaroon.
///
/// # Errors
///
/// Returns [`MacaroonError::Encoding`] on any parse failure; callers cannot
/// distinguish why a token was rejected.
pub fn decode_macaroon(token: &str) -> std::result::Result<Macaroon, MacaroonError> {
    let bytes = BASE64.decode(token).map_err(|_| MacaroonError::Encoding)?;
    let json = String::from_utf8(bytes).map_err(|_| MacaroonError::Encoding)?;
    serde_json::from_str(&json).map_err(|_| MacaroonError::Encoding)
}

/// Current wall-clock time as UNIX seconds.
pub(crate) fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";
    const HASH: &str = "aa00bb11cc22dd33ee44ff55aa66bb77cc88dd99ee00ff11aa22bb33cc44dd55";

    fn test_caveats() -> CaveatSet {
        CaveatSet {
            expires_at: Some(unix_now_secs() + 600),
            endpoint: Some("/threads/42/replies".to_string()),
            method: Some("POST".to_string()),
            context: Some("thread-42".to_string()),
            agent: Some("alice".to_string()),
            max_actions: None,
        }
    }

    fn test_ctx() -> RequestContext<'static> {
        RequestContext {
            endpoint: "/threads/42/replies",
            method: "POST",
            context_id: "thread-42",
            agent_id: "alice",
        }
    }

    #[test]
    fn test_caveat_string_form() {
        let caveats = CaveatSet {
            expires_at: Some(1000),
            endpoint: Some("/x".to_string()),
            ..Default::default()
        }
        .to_strings();
        assert_eq!(caveats, vec!["expires_at = 1000", "endpoint = /x"]);
    }

    #[test]
    fn test_empty_values_not_emitted() {
        let caveats = CaveatSet {
            endpoint: Some(String::new()),
            agent: Some("alice".to_string()),
            ..Default::default()
        }
        .to_strings();
        assert_eq!(caveats, vec!["agent = alice"]);
    }

    #[test]
    fn test_round_trip_verifies() {
        let mac = create_macaroon(SECRET, HASH, &test_caveats());
        let encoded = encode_macaroon(&mac);
        let decoded = decode_macaroon(&encoded).expect("decodable");
        assert_eq!(decoded, mac);
        assert!(verify_macaroon(SECRET, &decoded, &test_ctx()).is_ok());
    }

    #[test]
    fn test_decode_garbage() {
        assert_eq!(decode_macaroon("not base64!!"), Err(MacaroonError::Encoding));
        let not_json = BASE64.encode(b"plain text");
        assert_eq!(decode_macaroon(&not_json), Err(MacaroonError::Encoding));
    }

    #[test]
    fn test_mutated_id_fails() {
        let mut mac = create_macaroon(SECRET, HASH, &test_caveats());
        mac.id.replace_range(0..1, "b");
        assert_eq!(
            verify_macaroon(SECRET, &mac, &test_ctx()),
            Err(MacaroonError::Signature)
        );
    }

    #[test]
    fn test_mutated_caveat_fails() {
        let mut mac = create_macaroon(SECRET, HASH, &test_caveats());
        mac.caveats[3] = "context = thread-43".to_string();
        assert_eq!(
            verify_macaroon(SECRET, &mac, &test_ctx()),
            Err(MacaroonError::Signature)
        );
    }

    #[test]
    fn test_reordered_caveats_fail() {
        let mut mac = create_macaroon(SECRET, HASH, &test_caveats());
        mac.caveats.swap(0, 1);
        assert_eq!(
            verify_macaroon(SECRET, &mac, &test_ctx()),
            Err(MacaroonError::Signature)
        );
    }

    #[test]
    fn test_mutated_signature_fails() {
        let mut mac = create_macaroon(SECRET, HASH, &test_caveats());
        let flipped = if mac.signature.starts_with('0') { "1" } else { "0" };
        mac.signature.replace_range(0..1, flipped);
        assert_eq!(
            verify_macaroon(SECRET, &mac, &test_ctx()),
            Err(MacaroonError::Signature)
        );
    }

    #[test]
    fn test_wrong_secret_fails() {
        let mac = create_macaroon(SECRET, HASH, &test_caveats());
        assert_eq!(
            verify_macaroon("other-secret", &mac, &test_ctx()),
            Err(MacaroonError::Signature)
        );
    }

    #[test]
    fn test_expired() {
        let caveats = CaveatSet {
            expires_at: Some(unix_now_secs() - 1),
            ..Default::default()
        };
        let mac = create_macaroon(SECRET, HASH, &caveats);
        assert_eq!(
            verify_macaroon(SECRET, &mac, &test_ctx()),
            Err(MacaroonError::Expired)
        );
    }

    #[test]
    fn test_endpoint_mismatch() {
        let mac = create_macaroon(SECRET, HASH, &test_caveats());
        let ctx = RequestContext {
            endpoint: "/other",
            ..test_ctx()
        };
        assert_eq!(
            verify_macaroon(SECRET, &mac, &ctx),
            Err(MacaroonError::EndpointMismatch(
                "/threads/42/replies".to_string()
            ))
        );
    }

    #[test]
    fn test_method_case_insensitive() {
        let mac = create_macaroon(SECRET, HASH, &test_caveats());
        let ctx = RequestContext {
            method: "post",
            ..test_ctx()
        };
        assert!(verify_macaroon(SECRET, &mac, &ctx).is_ok());

        let ctx = RequestContext {
            method: "DELETE",
            ..test_ctx()
        };
        assert_eq!(
            verify_macaroon(SECRET, &mac, &ctx),
            Err(MacaroonError::MethodMismatch("POST".to_string()))
        );
    }

    #[test]
    fn test_agent_and_context_mismatch() {
        let mac = create_macaroon(SECRET, HASH, &test_caveats());
        let ctx = RequestContext {
            agent_id: "mallory",
            ..test_ctx()
        };
        assert_eq!(
            verify_macaroon(SECRET, &mac, &ctx),
            Err(MacaroonError::AgentMismatch("alice".to_string()))
        );

        let ctx = RequestContext {
            context_id: "thread-43",
            ..test_ctx()
        };
        assert_eq!(
            verify_macaroon(SECRET, &mac, &ctx),
            Err(MacaroonError::ContextMismatch("thread-42".to_string()))
        );
    }

    #[test]
    fn test_unknown_caveats_ignored() {
        let mut mac = create_macaroon(SECRET, HASH, &test_caveats());
        mac.caveats.push("tier = gold".to_string());
        mac.signature = chain_signature(SECRET, &mac.id, &mac.caveats);
        assert!(verify_macaroon(SECRET, &mac, &test_ctx()).is_ok());
    }

    #[test]
    fn test_hex_secret_keys_as_bytes() {
        let hex_secret = "00".repeat(32);
        let utf8_equivalent = create_macaroon(&hex_secret, HASH, &test_caveats());
        // A hex secret keys the MAC with its decoded bytes, so verifying the
        // same token with the literal string as UTF-8 must not be possible.
        assert_eq!(utf8_equivalent.signature.len(), 64);
        let raw = root_key(&hex_secret);
        assert_eq!(raw, vec![0u8; 32]);
        assert_eq!(root_key("short"), b"short".to_vec());
    }

    #[test]
    fn test_chain_depends_on_order_and_id() {
        let caveats = vec!["a = 1".to_string(), "b = 2".to_string()];
        let reversed = vec!["b = 2".to_string(), "a = 1".to_string()];
        assert_ne!(
            chain_signature(SECRET, HASH, &caveats),
            chain_signature(SECRET, HASH, &reversed)
        );
        assert_ne!(
            chain_signature(SECRET, HASH, &caveats),
            chain_signature(SECRET, &HASH.to_uppercase(), &caveats)
        );
    }
}
