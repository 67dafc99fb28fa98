//! Auto-pay HTTP client for L402-gated APIs.
//!
//! Sends the request unauthenticated; on a 402 challenge it checks the price
//! against the budget ceiling, pays the invoice through the wallet, and
//! retries exactly once with the `Authorization: L402` proof. A second
//! challenge on the retried response is a protocol error, never a second
//! payment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bon::Builder;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::concepts::Wallet;
use crate::l402::{ChallengeBody, format_authorization};

/// Errors raised by the auto-pay client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError<E: std::error::Error + 'static> {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed payment challenge: {0}")]
    MalformedChallenge(&'static str),
    #[error("invoice amount {amount_sats} sats exceeds budget of {max_sats} sats")]
    BudgetExceeded { amount_sats: u64, max_sats: u64 },
    #[error("payment timed out")]
    PaymentTimeout,
    #[error("wallet returned no preimage for settled payment")]
    MissingPreimage,
    #[error("server issued a second payment challenge after payment")]
    RepeatedChallenge,
    #[error("wallet error: {0}")]
    Wallet(#[source] E),
}

/// One request through the toll client.
#[derive(Debug, Clone, Builder)]
pub struct FetchRequest {
    #[builder(into)]
    pub url: String,
    #[builder(default = Method::GET)]
    pub method: Method,
    #[builder(default)]
    pub headers: HeaderMap,
    /// JSON body for POST/PUT-style requests.
    pub body: Option<Value>,
    /// Per-request budget override.
    pub max_sats: Option<u64>,
    /// Per-request auto-retry override.
    pub auto_retry: Option<bool>,
}

/// Response from a toll-gated request, with payment info when one was made.
#[derive(Debug)]
pub struct TollResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    pub paid: bool,
    pub amount_sats: u64,
    pub payment_hash: Option<String>,
}

impl TollResponse {
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Spending totals across the client's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendingStats {
    pub total_spent_sats: u64,
    pub request_count: u64,
    pub payment_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_spent: AtomicU64,
    requests: AtomicU64,
    payments: AtomicU64,
}

/// An HTTP client that pays L402 challenges automatically.
#[derive(Builder)]
pub struct TollClient<W: Wallet> {
    pub wallet: W,
    /// Budget ceiling per request; challenges above it are refused before any
    /// wallet call.
    #[builder(default = 100)]
    pub max_sats: u64,
    #[builder(default = true)]
    pub auto_retry: bool,
    /// Total budget for obtaining the preimage once a challenge is accepted.
    #[builder(default = Duration::from_secs(60))]
    pub payment_timeout: Duration,
    /// Headers attached to every request.
    #[builder(default)]
    pub default_headers: HeaderMap,
    #[builder(default)]
    pub http: reqwest::Client,
    #[builder(skip)]
    counters: Counters,
}

impl<W: Wallet> TollClient<W> {
    /// Convenience GET.
    pub async fn get(&self, url: &str) -> Result<TollResponse, ClientError<W::Error>> {
        self.fetch(FetchRequest::builder().url(url).build()).await
    }

    /// Sends a request, paying a 402 challenge if one comes back.
    pub async fn fetch(
        &self,
        request: FetchRequest,
    ) -> Result<TollResponse, ClientError<W::Error>> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let response = self.send(&request, None).await?;
        let auto_retry = request.auto_retry.unwrap_or(self.auto_retry);
        if response.status() != StatusCode::PAYMENT_REQUIRED || !auto_retry {
            return read_response(response, false, 0, None).await;
        }

        let challenge: ChallengeBody = response
            .json()
            .await
            .map_err(|_| ClientError::MalformedChallenge("could not parse 402 body"))?;
        if challenge.invoice.is_empty() {
            return Err(ClientError::MalformedChallenge("challenge missing invoice"));
        }
        if challenge.macaroon.is_empty() {
            return Err(ClientError::MalformedChallenge("challenge missing macaroon"));
        }

        let max_sats = request.max_sats.unwrap_or(self.max_sats);
        if challenge.amount_sats > max_sats {
            return Err(ClientError::BudgetExceeded {
                amount_sats: challenge.amount_sats,
                max_sats,
            });
        }

        tracing::debug!(
            "paying challenge: {} sats for {}",
            challenge.amount_sats,
            request.url
        );
        let preimage = self.pay(&challenge).await?;

        let authorization = format_authorization(&challenge.macaroon, &preimage);
        let retried = self.send(&request, Some(&authorization)).await?;
        if retried.status() == StatusCode::PAYMENT_REQUIRED {
            return Err(ClientError::RepeatedChallenge);
        }

        self.counters.payments.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_spent
            .fetch_add(challenge.amount_sats, Ordering::Relaxed);

        read_response(
            retried,
            true,
            challenge.amount_sats,
            Some(challenge.payment_hash),
        )
        .await
    }

    pub fn spending(&self) -> SpendingStats {
        SpendingStats {
            total_spent_sats: self.counters.total_spent.load(Ordering::Relaxed),
            request_count: self.counters.requests.load(Ordering::Relaxed),
            payment_count: self.counters.payments.load(Ordering::Relaxed),
        }
    }

    async fn send(
        &self,
        request: &FetchRequest,
        authorization: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.as_str())
            .headers(self.default_headers.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(authorization) = authorization {
            builder = builder.header(http::header::AUTHORIZATION, authorization);
        }
        builder.send().await
    }

    /// Pays the invoice and returns the preimage, within `payment_timeout`.
    ///
    /// Wallets that acknowledge before settling return no preimage from
    /// `pay_invoice`; the settlement push supplies it then. The payment is
    /// never re-sent.
    async fn pay(&self, challenge: &ChallengeBody) -> Result<String, ClientError<W::Error>> {
        let obtain = async {
            let payment = self
                .wallet
                .pay_invoice(&challenge.invoice)
                .await
                .map_err(ClientError::Wallet)?;
            if let Some(preimage) = payment.preimage {
                return Ok(preimage);
            }
            let status = self
                .wallet
                .wait_for_payment(&challenge.payment_hash, self.payment_timeout)
                .await
                .map_err(ClientError::Wallet)?;
            status.preimage.ok_or(ClientError::MissingPreimage)
        };
        tokio::time::timeout(self.payment_timeout, obtain)
            .await
            .map_err(|_| ClientError::PaymentTimeout)?
    }
}

async fn read_response<E: std::error::Error + 'static>(
    response: reqwest::Response,
    paid: bool,
    amount_sats: u64,
    payment_hash: Option<String>,
) -> Result<TollResponse, ClientError<E>> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await?;
    Ok(TollResponse {
        status,
        headers,
        body,
        paid,
        amount_sats,
        payment_hash,
    })
}
