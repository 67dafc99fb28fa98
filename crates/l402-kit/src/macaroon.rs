//! Chained-HMAC bearer credentials (macaroons).
//!
//! A macaroon binds an identifier (the Lightning payment hash) to an ordered
//! list of caveat strings. The signature is a chained HMAC-SHA256: the chain
//! starts at `HMAC(secret, identifier)` and folds each caveat in insertion
//! order, so caveats are append-only — stripping or reordering one breaks the
//! chain for any verifier holding the secret.
//!
//! The wire format is base64url (unpadded) over compact JSON
//! `{"id":...,"caveats":[...],"signature":...}` and is interoperable with any
//! other implementation sharing the same secret.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bon::Builder;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// A decoded macaroon. Field order matches the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macaroon {
    /// Identifier the chain starts from, typically the payment hash.
    #[serde(rename = "id")]
    pub identifier: String,
    /// Ordered caveat strings of the form `key = value`.
    pub caveats: Vec<String>,
    /// Hex-encoded final HMAC chain digest.
    pub signature: String,
}

/// Malformed token or issuance input, distinct from a verification failure.
#[derive(Debug, thiserror::Error)]
pub enum MacaroonFormatError {
    #[error("macaroon secret must not be empty")]
    EmptySecret,
    #[error("invalid base64 token: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid token payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("macaroon token missing {0}")]
    MissingField(&'static str),
}

/// A verification failure. `reason()` yields the machine-readable string
/// surfaced to callers across trust boundaries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("macaroon signature mismatch")]
    SignatureMismatch,
    #[error("macaroon expired")]
    Expired,
    #[error("endpoint mismatch: expected {expected}, got {actual}")]
    EndpointMismatch { expected: String, actual: String },
    #[error("method mismatch: expected {expected}, got {actual}")]
    MethodMismatch { expected: String, actual: String },
    #[error("ip mismatch: expected {expected}, got {actual}")]
    IpMismatch { expected: String, actual: String },
    #[error("malformed caveat: {0}")]
    MalformedCaveat(String),
}

impl VerifyError {
    pub fn reason(&self) -> &'static str {
        match self {
            VerifyError::SignatureMismatch => "signature_mismatch",
            VerifyError::Expired => "expired",
            VerifyError::EndpointMismatch { .. } => "endpoint_mismatch",
            VerifyError::MethodMismatch { .. } => "method_mismatch",
            VerifyError::IpMismatch { .. } => "ip_mismatch",
            VerifyError::MalformedCaveat(_) => "malformed_caveat",
        }
    }
}

/// Request-side facts that recognized caveats are checked against.
#[derive(Debug, Clone)]
pub struct VerifyContext {
    /// Current unix time in seconds.
    pub now: u64,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub ip: Option<String>,
}

impl VerifyContext {
    /// Context at the current system time with no request bindings.
    pub fn now() -> Self {
        VerifyContext {
            now: unix_now(),
            endpoint: None,
            method: None,
            ip: None,
        }
    }

    pub fn at(now: u64) -> Self {
        VerifyContext {
            now,
            endpoint: None,
            method: None,
            ip: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// Standard restrictions folded into a macaroon at issuance.
///
/// The caveat order is fixed (`expires_at`, `endpoint`, `method`, `ip`) so
/// that two mints given the same options produce byte-identical tokens.
#[derive(Debug, Clone, Builder)]
pub struct IssueOptions {
    #[builder(into)]
    pub payment_hash: String,
    /// Absolute expiry, unix seconds.
    pub expires_at: u64,
    #[builder(into)]
    pub endpoint: Option<String>,
    #[builder(into)]
    pub method: Option<String>,
    #[builder(into)]
    pub ip: Option<String>,
}

impl IssueOptions {
    fn caveats(&self) -> Vec<String> {
        let mut caveats = vec![caveat("expires_at", self.expires_at)];
        if let Some(endpoint) = &self.endpoint {
            caveats.push(caveat("endpoint", endpoint));
        }
        if let Some(method) = &self.method {
            caveats.push(caveat("method", method));
        }
        if let Some(ip) = &self.ip {
            caveats.push(caveat("ip", ip));
        }
        caveats
    }
}

/// Formats a single `key = value` caveat string.
pub fn caveat(key: &str, value: impl std::fmt::Display) -> String {
    format!("{key} = {value}")
}

/// Issues and verifies macaroons under one immutable secret.
///
/// Stateless apart from the secret; safe for unsynchronized concurrent use.
#[derive(Clone)]
pub struct MacaroonMint {
    secret: Vec<u8>,
}

impl std::fmt::Debug for MacaroonMint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacaroonMint").finish_non_exhaustive()
    }
}

impl MacaroonMint {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, MacaroonFormatError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(MacaroonFormatError::EmptySecret);
        }
        Ok(MacaroonMint {
            secret: secret.to_vec(),
        })
    }

    /// Issues a macaroon over `identifier` with the given caveats, in order.
    pub fn issue(&self, identifier: &str, caveats: Vec<String>) -> Macaroon {
        let signature = hex::encode(chain_signature(&self.secret, identifier, &caveats));
        Macaroon {
            identifier: identifier.to_string(),
            caveats,
            signature,
        }
    }

    /// Issues a macaroon bound to a payment hash with the standard caveats.
    pub fn issue_with(&self, options: &IssueOptions) -> Macaroon {
        self.issue(&options.payment_hash, options.caveats())
    }

    /// Recomputes the HMAC chain and checks every recognized caveat against
    /// `context`.
    ///
    /// A signature mismatch short-circuits before any caveat is inspected, so
    /// a tampered caveat list never leaks which caveat disagreed. Unrecognized
    /// caveat keys are treated as satisfied.
    pub fn verify(&self, macaroon: &Macaroon, context: &VerifyContext) -> Result<(), VerifyError> {
        let expected = chain_signature(&self.secret, &macaroon.identifier, &macaroon.caveats);
        let stored = hex::decode(&macaroon.signature).map_err(|_| VerifyError::SignatureMismatch)?;
        if !bool::from(stored.ct_eq(&expected)) {
            return Err(VerifyError::SignatureMismatch);
        }

        for raw in &macaroon.caveats {
            let (key, value) = raw
                .split_once(" = ")
                .ok_or_else(|| VerifyError::MalformedCaveat(raw.clone()))?;
            let value = value.trim();
            match key.trim() {
                "expires_at" => {
                    let expires_at: u64 = value
                        .parse()
                        .map_err(|_| VerifyError::MalformedCaveat(raw.clone()))?;
                    if context.now > expires_at {
                        return Err(VerifyError::Expired);
                    }
                }
                "endpoint" => {
                    if let Some(endpoint) = &context.endpoint
                        && endpoint != value
                    {
                        return Err(VerifyError::EndpointMismatch {
                            expected: value.to_string(),
                            actual: endpoint.clone(),
                        });
                    }
                }
                "method" => {
                    if let Some(method) = &context.method
                        && !method.eq_ignore_ascii_case(value)
                    {
                        return Err(VerifyError::MethodMismatch {
                            expected: value.to_string(),
                            actual: method.clone(),
                        });
                    }
                }
                "ip" => {
                    if let Some(ip) = &context.ip
                        && ip != value
                    {
                        return Err(VerifyError::IpMismatch {
                            expected: value.to_string(),
                            actual: ip.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl Macaroon {
    /// Encodes to the opaque wire token.
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self)
            .expect("macaroon serialization cannot fail: plain string fields");
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes a wire token. Tolerates standard base64 padding.
    pub fn decode(token: &str) -> Result<Macaroon, MacaroonFormatError> {
        let bytes = URL_SAFE_NO_PAD.decode(token.trim_end_matches('='))?;
        let macaroon: Macaroon = serde_json::from_slice(&bytes)?;
        if macaroon.identifier.is_empty() {
            return Err(MacaroonFormatError::MissingField("id"));
        }
        if macaroon.signature.is_empty() {
            return Err(MacaroonFormatError::MissingField("signature"));
        }
        Ok(macaroon)
    }
}

/// `sha256(preimage) == payment_hash`, constant-time on the digest bytes.
///
/// Empty or non-hex input fails without panicking.
pub fn verify_preimage(preimage: &str, payment_hash: &str) -> bool {
    if preimage.is_empty() || payment_hash.is_empty() {
        return false;
    }
    let Ok(preimage) = hex::decode(preimage) else {
        return false;
    };
    let Ok(expected) = hex::decode(payment_hash) else {
        return false;
    };
    let digest = Sha256::digest(&preimage);
    bool::from(digest.as_slice().ct_eq(&expected))
}

fn chain_signature(secret: &[u8], identifier: &str, caveats: &[String]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(identifier.as_bytes());
    let mut signature = mac.finalize().into_bytes();
    for caveat in caveats {
        let mut mac = HmacSha256::new_from_slice(&signature)
            .expect("HMAC accepts keys of any length");
        mac.update(caveat.as_bytes());
        signature = mac.finalize().into_bytes();
    }
    signature.to_vec()
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
