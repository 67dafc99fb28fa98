//! Auto-pay client end-to-end against a live L402-gated server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use sha2::{Digest, Sha256};

use l402_kit::client::{ClientError, TollClient};
use l402_kit::concepts::{CreateInvoice, Invoice, InvoiceStatus, Payment, Wallet};
use l402_kit::l402::{ChallengeBody, parse_authorization};
use l402_kit::macaroon::{IssueOptions, Macaroon, MacaroonMint, VerifyContext, verify_preimage};

const SECRET: &str = "autopay-test-secret";

fn preimage_pair() -> (String, String) {
    let preimage = "11".repeat(32);
    let payment_hash = hex::encode(Sha256::digest(hex::decode(&preimage).unwrap()));
    (preimage, payment_hash)
}

#[derive(Debug, thiserror::Error)]
#[error("mock wallet failure")]
struct MockWalletError;

/// Wallet stub that settles every payment with a fixed preimage.
#[derive(Clone)]
struct MockWallet {
    preimage: String,
    payment_hash: String,
    pay_calls: Arc<AtomicU64>,
}

impl MockWallet {
    fn new(preimage: String, payment_hash: String) -> Self {
        MockWallet {
            preimage,
            payment_hash,
            pay_calls: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Wallet for MockWallet {
    type Error = MockWalletError;

    async fn create_invoice(&self, _params: CreateInvoice) -> Result<Invoice, MockWalletError> {
        Ok(Invoice {
            payment_request: "lnbc-mock".to_string(),
            payment_hash: self.payment_hash.clone(),
        })
    }

    async fn lookup_invoice(&self, _payment_hash: &str) -> Result<InvoiceStatus, MockWalletError> {
        Ok(InvoiceStatus {
            settled: true,
            preimage: Some(self.preimage.clone()),
            settled_at: Some(1_700_000_000),
        })
    }

    async fn pay_invoice(&self, _payment_request: &str) -> Result<Payment, MockWalletError> {
        self.pay_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Payment {
            preimage: Some(self.preimage.clone()),
            payment_hash: Some(self.payment_hash.clone()),
        })
    }

    async fn wait_for_payment(
        &self,
        _payment_hash: &str,
        _timeout: Duration,
    ) -> Result<InvoiceStatus, MockWalletError> {
        self.lookup_invoice(_payment_hash).await
    }
}

#[derive(Clone)]
struct GateState {
    mint: MacaroonMint,
    payment_hash: String,
    price_sats: u64,
}

/// Minimal server-side L402 gate built from the kit's own primitives.
async fn guarded(State(state): State<GateState>, headers: HeaderMap) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if let Some(credentials) = parse_authorization(authorization) {
        let Ok(macaroon) = Macaroon::decode(&credentials.macaroon) else {
            return StatusCode::UNAUTHORIZED.into_response();
        };
        if !verify_preimage(&credentials.preimage, &macaroon.identifier) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        if state.mint.verify(&macaroon, &VerifyContext::now()).is_err() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        return Json(json!({ "data": "paid content" })).into_response();
    }

    let options = IssueOptions::builder()
        .payment_hash(&state.payment_hash)
        .expires_at(u64::MAX)
        .build();
    let token = state.mint.issue_with(&options).encode();
    let body = ChallengeBody::new(
        "lnbc-mock",
        token,
        state.payment_hash.clone(),
        state.price_sats,
        None,
    );
    (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
}

/// Server that answers every request with a fresh 402, paid or not.
async fn greedy(State(state): State<GateState>) -> Response {
    let options = IssueOptions::builder()
        .payment_hash(&state.payment_hash)
        .expires_at(u64::MAX)
        .build();
    let token = state.mint.issue_with(&options).encode();
    let body = ChallengeBody::new(
        "lnbc-mock",
        token,
        state.payment_hash.clone(),
        state.price_sats,
        None,
    );
    (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
}

async fn spawn_server(price_sats: u64, greedy_mode: bool) -> (String, GateState) {
    let (_, payment_hash) = preimage_pair();
    let state = GateState {
        mint: MacaroonMint::new(SECRET).unwrap(),
        payment_hash,
        price_sats,
    };
    let app = if greedy_mode {
        Router::new().route("/api/data", get(greedy)).with_state(state.clone())
    } else {
        Router::new().route("/api/data", get(guarded)).with_state(state.clone())
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api/data"), state)
}

#[tokio::test]
async fn pays_challenge_and_retries_once() {
    let (preimage, payment_hash) = preimage_pair();
    let (url, _) = spawn_server(21, false).await;
    let wallet = MockWallet::new(preimage, payment_hash.clone());
    let client = TollClient::builder().wallet(wallet.clone()).max_sats(50).build();

    let response = client.get(&url).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.paid);
    assert_eq!(response.amount_sats, 21);
    assert_eq!(response.payment_hash.as_deref(), Some(payment_hash.as_str()));
    assert_eq!(wallet.pay_calls.load(Ordering::SeqCst), 1);

    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["data"], "paid content");

    let spending = client.spending();
    assert_eq!(spending.payment_count, 1);
    assert_eq!(spending.total_spent_sats, 21);
}

#[tokio::test]
async fn over_budget_challenge_is_refused_before_any_wallet_call() {
    let (preimage, payment_hash) = preimage_pair();
    let (url, _) = spawn_server(500, false).await;
    let wallet = MockWallet::new(preimage, payment_hash);
    let client = TollClient::builder().wallet(wallet.clone()).max_sats(100).build();

    match client.get(&url).await {
        Err(ClientError::BudgetExceeded { amount_sats, max_sats }) => {
            assert_eq!(amount_sats, 500);
            assert_eq!(max_sats, 100);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(wallet.pay_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_challenge_is_a_terminal_protocol_error() {
    let (preimage, payment_hash) = preimage_pair();
    let (url, _) = spawn_server(21, true).await;
    let wallet = MockWallet::new(preimage, payment_hash);
    let client = TollClient::builder().wallet(wallet.clone()).build();

    match client.get(&url).await {
        Err(ClientError::RepeatedChallenge) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    // Paid exactly once; the retry must never trigger a second payment.
    assert_eq!(wallet.pay_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_challenge_responses_pass_through() {
    let app = Router::new().route("/plain", get(|| async { "hello" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (preimage, payment_hash) = preimage_pair();
    let wallet = MockWallet::new(preimage, payment_hash);
    let client = TollClient::builder().wallet(wallet.clone()).build();

    let response = client.get(&format!("http://{addr}/plain")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(!response.paid);
    assert_eq!(response.body, "hello");
    assert_eq!(wallet.pay_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auto_retry_disabled_returns_the_challenge() {
    let (preimage, payment_hash) = preimage_pair();
    let (url, _) = spawn_server(21, false).await;
    let wallet = MockWallet::new(preimage, payment_hash);
    let client = TollClient::builder()
        .wallet(wallet.clone())
        .auto_retry(false)
        .build();

    let response = client.get(&url).await.unwrap();
    assert_eq!(response.status, StatusCode::PAYMENT_REQUIRED);
    let challenge: ChallengeBody = response.json().unwrap();
    assert_eq!(challenge.amount_sats, 21);
    assert_eq!(wallet.pay_calls.load(Ordering::SeqCst), 0);
}
