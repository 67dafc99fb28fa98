//! Nostr Wallet Connect control channel.
//!
//! Talks NIP-47 to a remote wallet over a relay WebSocket: requests go out as
//! kind-23194 events encrypted to the wallet key, responses come back as
//! kind-23195 events correlated by the request event id, and settlement
//! pushes arrive as kind-23196 notifications. One background reader task owns
//! all inbound dispatch.

pub mod client;
pub mod crypto;
pub mod event;

use std::time::Duration;

use url::Url;

pub use client::NwcClient;

/// Errors raised by the wallet control channel.
#[derive(Debug, thiserror::Error)]
pub enum NwcError {
    #[error("invalid NWC url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("wallet request timed out after {0:?}")]
    Timeout(Duration),
    #[error("wallet error ({code}): {message}")]
    Wallet { code: String, message: String },
    #[error("wallet session closed")]
    Closed,
    #[error("relay rejected request: {0}")]
    Relay(String),
    #[error("envelope error: {0}")]
    Envelope(String),
    #[error("malformed wallet response: {0}")]
    Malformed(String),
}

/// Parsed NWC connection parameters.
///
/// Connection string format:
/// `nostr+walletconnect://<wallet_pubkey>?relay=<url>&secret=<hex>`.
#[derive(Debug, Clone)]
pub struct NwcConfig {
    pub relay_url: Url,
    /// Wallet service x-only public key, hex.
    pub wallet_pubkey: String,
    /// Session secret key, hex.
    pub secret_key: String,
    /// Client x-only public key derived from the secret.
    pub client_pubkey: String,
    /// Budget for a single request/response exchange.
    pub request_timeout: Duration,
    /// Budget for a pay_invoice exchange, which can take longer.
    pub payment_timeout: Duration,
    /// Fallback poll cadence while waiting for a settlement push.
    pub poll_interval: Duration,
}

impl NwcConfig {
    pub fn parse(nwc_url: &str) -> Result<Self, NwcError> {
        let parsed = Url::parse(nwc_url)
            .map_err(|err| NwcError::InvalidUrl(format!("unparseable url: {err}")))?;
        if parsed.scheme() != "nostr+walletconnect" {
            return Err(NwcError::InvalidUrl(format!(
                "unexpected scheme {} (expected nostr+walletconnect)",
                parsed.scheme()
            )));
        }
        let wallet_pubkey = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| NwcError::InvalidUrl("missing wallet pubkey".to_string()))?
            .to_string();

        let mut relay = None;
        let mut secret = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "relay" => relay = Some(value.into_owned()),
                "secret" => secret = Some(value.into_owned()),
                _ => {}
            }
        }
        let relay = relay.ok_or_else(|| NwcError::InvalidUrl("missing relay parameter".into()))?;
        let relay_url = Url::parse(&relay)
            .map_err(|err| NwcError::InvalidUrl(format!("bad relay url: {err}")))?;
        let secret_key =
            secret.ok_or_else(|| NwcError::InvalidUrl("missing secret parameter".into()))?;
        let client_pubkey = crypto::derive_pubkey_hex(&secret_key)?;

        Ok(NwcConfig {
            relay_url,
            wallet_pubkey,
            secret_key,
            client_pubkey,
            request_timeout: Duration::from_secs(30),
            payment_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        })
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn payment_timeout(mut self, timeout: Duration) -> Self {
        self.payment_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
