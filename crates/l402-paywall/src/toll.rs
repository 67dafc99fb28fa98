//! The toll gate: L402 protocol state machine for one guarded operation.
//!
//! A request lands in one of three outcomes: a grant for a presented proof, a
//! free-tier grant, or a 402 challenge minted against a fresh invoice. The
//! only server-side state a challenge leaves behind is the wallet's own
//! invoice record — the macaroon carries everything the verifier needs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bon::Builder;
use serde::Serialize;

use l402_kit::concepts::{CreateInvoice, Invoice, Wallet};
use l402_kit::l402::{ChallengeBody, L402Credentials, parse_authorization};
use l402_kit::macaroon::{IssueOptions, Macaroon, MacaroonMint, VerifyContext, verify_preimage};

use crate::errors::TollRejection;
use crate::ledger::RateLedger;
use crate::observe::{GrantEvent, SettlementEvent, TollObserver};

/// Price of one request: fixed, or computed from the request context.
#[derive(Clone)]
pub enum Pricing {
    Fixed(u64),
    Dynamic(Arc<dyn Fn(&RequestContext) -> u64 + Send + Sync>),
}

impl Pricing {
    pub fn dynamic(f: impl Fn(&RequestContext) -> u64 + Send + Sync + 'static) -> Self {
        Pricing::Dynamic(Arc::new(f))
    }

    fn resolve(&self, ctx: &RequestContext) -> u64 {
        match self {
            Pricing::Fixed(sats) => *sats,
            Pricing::Dynamic(f) => f(ctx),
        }
    }
}

impl From<u64> for Pricing {
    fn from(sats: u64) -> Self {
        Pricing::Fixed(sats)
    }
}

impl std::fmt::Debug for Pricing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pricing::Fixed(sats) => f.debug_tuple("Fixed").field(sats).finish(),
            Pricing::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Invoice description: defaulted from the request, fixed, or computed.
#[derive(Clone, Default)]
pub enum DescriptionPolicy {
    /// `API access: {method} {endpoint}`.
    #[default]
    FromRequest,
    Fixed(String),
    Dynamic(Arc<dyn Fn(&RequestContext) -> String + Send + Sync>),
}

impl DescriptionPolicy {
    pub fn dynamic(f: impl Fn(&RequestContext) -> String + Send + Sync + 'static) -> Self {
        DescriptionPolicy::Dynamic(Arc::new(f))
    }

    fn resolve(&self, ctx: &RequestContext) -> String {
        match self {
            DescriptionPolicy::FromRequest => {
                format!("API access: {} {}", ctx.method, ctx.endpoint)
            }
            DescriptionPolicy::Fixed(description) => description.clone(),
            DescriptionPolicy::Dynamic(f) => f(ctx),
        }
    }
}

impl From<&str> for DescriptionPolicy {
    fn from(description: &str) -> Self {
        DescriptionPolicy::Fixed(description.to_string())
    }
}

impl From<String> for DescriptionPolicy {
    fn from(description: String) -> Self {
        DescriptionPolicy::Fixed(description)
    }
}

impl std::fmt::Debug for DescriptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptionPolicy::FromRequest => f.write_str("FromRequest"),
            DescriptionPolicy::Fixed(description) => {
                f.debug_tuple("Fixed").field(description).finish()
            }
            DescriptionPolicy::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Free-tier allowance per identity.
#[derive(Debug, Clone, Builder)]
pub struct FreeTier {
    pub requests: u32,
    #[builder(default = Duration::from_secs(3600))]
    pub window: Duration,
}

/// The three request facts the gate needs from the host framework.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub endpoint: String,
    pub method: String,
    pub client_id: String,
}

impl RequestContext {
    pub fn new(
        endpoint: impl Into<String>,
        method: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        RequestContext {
            endpoint: endpoint.into(),
            method: method.into(),
            client_id: client_id.into(),
        }
    }

    /// Extracts context from an `http` request: path, method, and the first
    /// `X-Forwarded-For` entry (falling back to `"unknown"`).
    pub fn from_http<B>(request: &http::Request<B>) -> Self {
        let client_id = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        RequestContext {
            endpoint: request.uri().path().to_string(),
            method: request.method().as_str().to_string(),
            client_id,
        }
    }
}

/// A granted request, attached to request extensions by the adapters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub paid: bool,
    pub free: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    pub amount_sats: u64,
    pub client_id: String,
}

/// L402 gate for one guarded operation.
///
/// Configuration is immutable after construction; dynamic pricing and
/// descriptions are pure functions of the request context.
#[derive(Builder)]
pub struct TollGate<W: Wallet> {
    pub wallet: Arc<W>,
    pub mint: MacaroonMint,
    #[builder(into)]
    pub pricing: Pricing,
    #[builder(default, into)]
    pub description: DescriptionPolicy,
    /// How long a challenged invoice stays payable.
    #[builder(default = Duration::from_secs(300))]
    pub invoice_expiry: Duration,
    /// How long a paid macaroon keeps granting access.
    #[builder(default = Duration::from_secs(3600))]
    pub macaroon_expiry: Duration,
    #[builder(default = true)]
    pub bind_endpoint: bool,
    #[builder(default = true)]
    pub bind_method: bool,
    #[builder(default = false)]
    pub bind_ip: bool,
    pub free_tier: Option<FreeTier>,
    pub observer: Option<Arc<dyn TollObserver>>,
    #[builder(skip)]
    ledger: RateLedger,
}

impl<W: Wallet + Send + Sync + 'static> TollGate<W> {
    /// Runs one request through the gate.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        authorization: Option<&str>,
    ) -> Result<Grant, TollRejection> {
        if let Some(credentials) = parse_authorization(authorization) {
            return self.verify_credentials(ctx, &credentials);
        }

        if let Some(free_tier) = &self.free_tier
            && self
                .ledger
                .try_consume(&ctx.client_id, free_tier.requests, free_tier.window)
        {
            let grant = Grant {
                paid: false,
                free: true,
                payment_hash: None,
                amount_sats: 0,
                client_id: ctx.client_id.clone(),
            };
            self.notify_grant(ctx, &grant);
            return Ok(grant);
        }

        Err(self.challenge(ctx).await)
    }

    /// Wraps [`handle`](Self::handle) for generic `http` consumers: extracts
    /// the context and `Authorization` header, attaches the [`Grant`] to the
    /// request extensions, and runs the handler.
    pub async fn handle_request<Fun, Fut, ReqBody, ResBody>(
        &self,
        mut request: http::Request<ReqBody>,
        handler: Fun,
    ) -> Result<http::Response<ResBody>, TollRejection>
    where
        Fun: FnOnce(http::Request<ReqBody>) -> Fut,
        Fut: Future<Output = http::Response<ResBody>>,
    {
        let ctx = RequestContext::from_http(&request);
        let authorization = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let grant = self.handle(&ctx, authorization.as_deref()).await?;
        request.extensions_mut().insert(grant);
        Ok(handler(request).await)
    }

    fn verify_credentials(
        &self,
        ctx: &RequestContext,
        credentials: &L402Credentials,
    ) -> Result<Grant, TollRejection> {
        let macaroon = Macaroon::decode(&credentials.macaroon)
            .map_err(|err| TollRejection::unauthorized("invalid_macaroon", err))?;

        if !verify_preimage(&credentials.preimage, &macaroon.identifier) {
            return Err(TollRejection::unauthorized(
                "invalid_preimage",
                "preimage does not match payment hash",
            ));
        }

        let mut verify_ctx = VerifyContext::now();
        if self.bind_endpoint {
            verify_ctx = verify_ctx.endpoint(&ctx.endpoint);
        }
        if self.bind_method {
            verify_ctx = verify_ctx.method(&ctx.method);
        }
        if self.bind_ip {
            verify_ctx = verify_ctx.ip(&ctx.client_id);
        }
        self.mint
            .verify(&macaroon, &verify_ctx)
            .map_err(|err| TollRejection::unauthorized(err.reason(), &err))?;

        let grant = Grant {
            paid: true,
            free: false,
            payment_hash: Some(macaroon.identifier.clone()),
            amount_sats: self.pricing.resolve(ctx),
            client_id: ctx.client_id.clone(),
        };
        tracing::debug!(
            "grant: {} {} paid by {}",
            ctx.method,
            ctx.endpoint,
            ctx.client_id
        );
        self.notify_grant(ctx, &grant);
        Ok(grant)
    }

    /// Mints a fresh invoice + macaroon challenge.
    async fn challenge(&self, ctx: &RequestContext) -> TollRejection {
        let amount_sats = self.pricing.resolve(ctx);
        let description = self.description.resolve(ctx);

        let invoice = match self
            .wallet
            .create_invoice(
                CreateInvoice::builder()
                    .amount_sats(amount_sats)
                    .description(description.clone())
                    .expiry_secs(self.invoice_expiry.as_secs())
                    .build(),
            )
            .await
        {
            Ok(invoice) => invoice,
            Err(err) => {
                tracing::error!("invoice creation failed: {err}");
                return TollRejection::service_unavailable(format!(
                    "failed to create invoice: {err}"
                ));
            }
        };

        let options = IssueOptions::builder()
            .payment_hash(&invoice.payment_hash)
            .expires_at(unix_now() + self.macaroon_expiry.as_secs())
            .maybe_endpoint(self.bind_endpoint.then(|| ctx.endpoint.clone()))
            .maybe_method(self.bind_method.then(|| ctx.method.clone()))
            .maybe_ip(self.bind_ip.then(|| ctx.client_id.clone()))
            .build();
        let token = self.mint.issue_with(&options).encode();

        tracing::debug!(
            "challenge: {} sats for {} {} from {}",
            amount_sats,
            ctx.method,
            ctx.endpoint,
            ctx.client_id
        );
        self.spawn_settlement_monitor(ctx, &invoice, amount_sats);

        TollRejection::challenge(ChallengeBody::new(
            invoice.payment_request,
            token,
            invoice.payment_hash,
            amount_sats,
            Some(description),
        ))
    }

    /// Watches the challenged invoice for the observer, detached from the
    /// request. Only spawned when an observer is configured.
    fn spawn_settlement_monitor(&self, ctx: &RequestContext, invoice: &Invoice, amount_sats: u64) {
        let Some(observer) = self.observer.clone() else {
            return;
        };
        let wallet = Arc::clone(&self.wallet);
        let payment_hash = invoice.payment_hash.clone();
        let timeout = self.invoice_expiry;
        let endpoint = ctx.endpoint.clone();
        let client_id = ctx.client_id.clone();

        tokio::spawn(async move {
            match wallet.wait_for_payment(&payment_hash, timeout).await {
                Ok(status) if status.settled => observer.on_settlement(&SettlementEvent {
                    payment_hash,
                    amount_sats,
                    endpoint,
                    client_id,
                    preimage: status.preimage,
                    settled_at: status.settled_at,
                }),
                Ok(_) => {}
                Err(err) => tracing::debug!("settlement monitor ended: {err}"),
            }
        });
    }

    fn notify_grant(&self, ctx: &RequestContext, grant: &Grant) {
        if let Some(observer) = &self.observer {
            observer.on_grant(&GrantEvent {
                endpoint: ctx.endpoint.clone(),
                client_id: grant.client_id.clone(),
                paid: grant.paid,
                free: grant.free,
                amount_sats: grant.amount_sats,
                payment_hash: grant.payment_hash.clone(),
            });
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
