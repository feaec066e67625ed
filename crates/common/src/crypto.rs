//! Signed-request verification for the relay's mutating entrypoint
//!
//! Canonical signing string:
//! `METHOD "\n" PATH_WITH_QUERY "\n" TS "\n" NONCE "\n" HEX(SHA256(BODY))`
//!
//! Verification runs against the raw, unparsed body and must happen before
//! any JSON parsing. The nonce cache rejects replays within a sliding TTL
//! window; expired entries are swept opportunistically on each call.

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TS_SKEW_MS: i64 = 120_000;
const DEFAULT_NONCE_TTL_MS: i64 = 5 * 60_000;
const MIN_NONCE_LEN: usize = 8;

/// Verification failure with a stable code
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("shared secret is not configured")]
    SecretNotConfigured,
    #[error("signature missing")]
    SignatureMissing,
    #[error("timestamp is not a number")]
    TsInvalid,
    #[error("timestamp outside accepted skew")]
    TsOutOfRange,
    #[error("nonce missing or too short")]
    NonceInvalid,
    #[error("nonce already seen")]
    Replay,
    #[error("signature mismatch")]
    SignatureInvalid,
}

impl VerifyError {
    pub fn code(&self) -> &'static str {
        match self {
            VerifyError::SecretNotConfigured => "HMAC_SECRET_NOT_CONFIGURED",
            VerifyError::SignatureMissing => "HMAC_SIGNATURE_MISSING",
            VerifyError::TsInvalid => "HMAC_TS_INVALID",
            VerifyError::TsOutOfRange => "HMAC_TS_OUT_OF_RANGE",
            VerifyError::NonceInvalid => "HMAC_NONCE_INVALID",
            VerifyError::Replay => "HMAC_REPLAY",
            VerifyError::SignatureInvalid => "HMAC_SIGNATURE_INVALID",
        }
    }
}

/// The signed parts of an inbound request, as carried on the wire
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path_with_query: &'a str,
    pub raw_body: &'a [u8],
    pub ts: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub signature_hex: Option<&'a str>,
}

/// Replay-protected request authenticator.
///
/// Owns its nonce cache so multiple verifiers can coexist and the cache can
/// be swapped for a shared store under multi-instance deployment.
pub struct RequestVerifier {
    secret: Option<Vec<u8>>,
    ts_skew_ms: i64,
    nonce_ttl_ms: i64,
    nonces: DashMap<String, i64>,
}

impl RequestVerifier {
    pub fn new(secret: Option<Vec<u8>>) -> Self {
        Self {
            secret,
            ts_skew_ms: DEFAULT_TS_SKEW_MS,
            nonce_ttl_ms: DEFAULT_NONCE_TTL_MS,
            nonces: DashMap::new(),
        }
    }

    pub fn with_windows(mut self, ts_skew_ms: i64, nonce_ttl_ms: i64) -> Self {
        self.ts_skew_ms = ts_skew_ms;
        self.nonce_ttl_ms = nonce_ttl_ms;
        self
    }

    /// Verify a signed request against the current clock
    pub fn verify(&self, req: &SignedRequest<'_>) -> Result<(), VerifyError> {
        self.verify_at(req, crate::now_ms())
    }

    /// Verify a signed request at an explicit instant.
    ///
    /// The nonce is recorded only once the timestamp and nonce shape checks
    /// pass; a request failing those can be resubmitted with the same nonce.
    /// A request failing only the signature has already consumed its nonce.
    pub fn verify_at(&self, req: &SignedRequest<'_>, now_ms: i64) -> Result<(), VerifyError> {
        let secret = self
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(VerifyError::SecretNotConfigured)?;
        let signature_hex = req
            .signature_hex
            .filter(|s| !s.is_empty())
            .ok_or(VerifyError::SignatureMissing)?;

        let ts: i64 = req
            .ts
            .and_then(|t| t.trim().parse().ok())
            .ok_or(VerifyError::TsInvalid)?;
        let nonce = req
            .nonce
            .filter(|n| n.len() >= MIN_NONCE_LEN)
            .ok_or(VerifyError::NonceInvalid)?;

        if (now_ms - ts).abs() > self.ts_skew_ms {
            return Err(VerifyError::TsOutOfRange);
        }

        self.nonces.retain(|_, expires_at| *expires_at > now_ms);
        match self.nonces.entry(nonce.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(VerifyError::Replay),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now_ms + self.nonce_ttl_ms);
            }
        }

        let canonical = canonical_string(req.method, req.path_with_query, ts, nonce, req.raw_body);
        let expected = hmac_hex(secret, canonical.as_bytes());

        if !hex_eq(&expected, signature_hex) {
            return Err(VerifyError::SignatureInvalid);
        }

        Ok(())
    }
}

/// Build the canonical signing string
pub fn canonical_string(
    method: &str,
    path_with_query: &str,
    ts: i64,
    nonce: &str,
    raw_body: &[u8],
) -> String {
    let body_sha = hex::encode(Sha256::digest(raw_body));
    format!(
        "{}\n{}\n{}\n{}\n{}",
        method.to_uppercase(),
        path_with_query,
        ts,
        nonce,
        body_sha
    )
}

/// Produce the hex signature a caller must attach to a request
pub fn sign_request(
    secret: &[u8],
    method: &str,
    path_with_query: &str,
    ts: i64,
    nonce: &str,
    raw_body: &[u8],
) -> String {
    let canonical = canonical_string(method, path_with_query, ts, nonce, raw_body);
    hmac_hex(secret, canonical.as_bytes())
}

fn hmac_hex(secret: &[u8], msg: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(msg);
    hex::encode(mac.finalize().into_bytes())
}

fn hex_eq(expected_hex: &str, provided_hex: &str) -> bool {
    let expected = match hex::decode(expected_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let provided = match hex::decode(provided_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(&provided).into()
}
