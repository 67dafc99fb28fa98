//! L402 protocol headers and challenge body.
//!
//! Challenge: `WWW-Authenticate: L402 invoice="lnbc...", macaroon="..."`.
//! Proof: `Authorization: L402 <macaroon>:<preimage>`.

use serde::{Deserialize, Serialize};

/// Parsed `Authorization: L402` credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L402Credentials {
    pub macaroon: String,
    pub preimage: String,
}

/// Formats a `WWW-Authenticate` header value for a 402 response.
pub fn format_challenge(invoice: &str, macaroon: &str) -> String {
    format!(r#"L402 invoice="{invoice}", macaroon="{macaroon}""#)
}

/// Formats an `Authorization` header value for the authenticated retry.
pub fn format_authorization(macaroon: &str, preimage: &str) -> String {
    format!("L402 {macaroon}:{preimage}")
}

/// Parses an `Authorization: L402 <macaroon>:<preimage>` header value.
///
/// The scheme match is case-insensitive. Returns `None` for anything that is
/// not a well-formed L402 header.
pub fn parse_authorization(header: Option<&str>) -> Option<L402Credentials> {
    let trimmed = header?.trim();
    let (scheme, credentials) = trimmed.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("l402") {
        return None;
    }
    let (macaroon, preimage) = credentials.trim().split_once(':')?;
    if macaroon.is_empty() || preimage.is_empty() {
        return None;
    }
    Some(L402Credentials {
        macaroon: macaroon.to_string(),
        preimage: preimage.to_string(),
    })
}

/// JSON body of a 402 challenge response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeBody {
    pub status: u16,
    pub message: String,
    pub payment_hash: String,
    pub invoice: String,
    pub macaroon: String,
    pub amount_sats: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Instructions>,
}

/// Human-readable payment walkthrough embedded in the challenge body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instructions {
    pub step1: String,
    pub step2: String,
    pub step3: String,
}

impl Default for Instructions {
    fn default() -> Self {
        Instructions {
            step1: "Pay the Lightning invoice above".to_string(),
            step2: "Get the preimage from the payment receipt".to_string(),
            step3: "Retry the request with header: Authorization: L402 <macaroon>:<preimage>"
                .to_string(),
        }
    }
}

impl ChallengeBody {
    pub fn new(
        invoice: impl Into<String>,
        macaroon: impl Into<String>,
        payment_hash: impl Into<String>,
        amount_sats: u64,
        description: Option<String>,
    ) -> Self {
        ChallengeBody {
            status: 402,
            message: "Payment Required".to_string(),
            payment_hash: payment_hash.into(),
            invoice: invoice.into(),
            macaroon: macaroon.into(),
            amount_sats,
            description,
            protocol: "L402".to_string(),
            instructions: Some(Instructions::default()),
        }
    }
}
