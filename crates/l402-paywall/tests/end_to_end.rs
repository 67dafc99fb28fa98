//! Full protocol round trip through the axum layer: challenge, pay, retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Json;
use axum::routing::get;
use axum::{Extension, Router};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use l402_kit::concepts::{CreateInvoice, Invoice, InvoiceStatus, Payment, Wallet};
use l402_kit::l402::format_authorization;
use l402_kit::macaroon::MacaroonMint;
use l402_paywall::axum::TollLayer;
use l402_paywall::observe::{TollObserver, TollStats};
use l402_paywall::toll::{FreeTier, Grant, TollGate};

const SECRET: &str = "end-to-end-secret";

/// Preimage/hash pair for the nth mock invoice.
fn pair(n: u64) -> (String, String) {
    let preimage_bytes = [n as u8; 32];
    let preimage = hex::encode(preimage_bytes);
    let payment_hash = hex::encode(Sha256::digest(preimage_bytes));
    (preimage, payment_hash)
}

#[derive(Debug, thiserror::Error)]
#[error("mock wallet failure")]
struct MockWalletError;

/// Wallet stub issuing sequentially numbered invoices.
#[derive(Debug, Default)]
struct SeqWallet {
    counter: AtomicU64,
}

impl SeqWallet {
    fn issued(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Wallet for SeqWallet {
    type Error = MockWalletError;

    async fn create_invoice(&self, _params: CreateInvoice) -> Result<Invoice, MockWalletError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let (_, payment_hash) = pair(n);
        Ok(Invoice {
            payment_request: format!("lnbc-e2e-{n}"),
            payment_hash,
        })
    }

    async fn lookup_invoice(&self, _payment_hash: &str) -> Result<InvoiceStatus, MockWalletError> {
        Ok(InvoiceStatus::default())
    }

    async fn pay_invoice(&self, _payment_request: &str) -> Result<Payment, MockWalletError> {
        Err(MockWalletError)
    }

    async fn wait_for_payment(
        &self,
        _payment_hash: &str,
        _timeout: Duration,
    ) -> Result<InvoiceStatus, MockWalletError> {
        Ok(InvoiceStatus::default())
    }
}

/// "Pays" a challenged invoice by recovering the preimage for its hash.
fn pay_offline(wallet: &SeqWallet, payment_hash: &str) -> String {
    for n in 0..wallet.issued() {
        let (preimage, hash) = pair(n);
        if hash == payment_hash {
            return preimage;
        }
    }
    panic!("no invoice with payment hash {payment_hash}");
}

async fn handler(Extension(grant): Extension<Grant>) -> Json<Value> {
    Json(json!({ "data": "premium", "paid": grant.paid, "free": grant.free }))
}

fn app(gate: TollGate<SeqWallet>) -> Router {
    Router::new()
        .route("/api/data", get(handler))
        .layer(TollLayer::new(gate))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get_request(authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri("/api/data")
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(authorization) = authorization {
        builder = builder.header(header::AUTHORIZATION, authorization);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn challenge_pay_retry_round_trip() {
    let wallet = Arc::new(SeqWallet::default());
    let stats = Arc::new(TollStats::new());
    let gate = TollGate::builder()
        .wallet(Arc::clone(&wallet))
        .mint(MacaroonMint::new(SECRET).unwrap())
        .pricing(21u64)
        .observer(Arc::clone(&stats) as Arc<dyn TollObserver>)
        .build();
    let app = app(gate);

    // Unauthenticated GET is challenged.
    let response = app.clone().oneshot(get_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let www_authenticate = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(www_authenticate.starts_with("L402 invoice="));
    let challenge = body_json(response).await;
    assert_eq!(challenge["status"], 402);
    assert_eq!(challenge["amountSats"], 21);
    let payment_hash = challenge["paymentHash"].as_str().unwrap().to_string();
    let macaroon = challenge["macaroon"].as_str().unwrap().to_string();

    // Pay that exact invoice and retry with the proof.
    let preimage = pay_offline(&wallet, &payment_hash);
    let authorization = format_authorization(&macaroon, &preimage);
    let response = app
        .clone()
        .oneshot(get_request(Some(&authorization)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"], "premium");
    assert_eq!(body["paid"], true);

    // A fresh unauthenticated GET gets a fresh challenge.
    let response = app.clone().oneshot(get_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let second = body_json(response).await;
    assert_ne!(second["paymentHash"].as_str().unwrap(), payment_hash);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_paid, 1);
    assert_eq!(snapshot.total_revenue, 21);
    assert_eq!(snapshot.endpoints["/api/data"].paid, 1);
}

#[tokio::test]
async fn tampered_proof_is_rejected() {
    let wallet = Arc::new(SeqWallet::default());
    let gate = TollGate::builder()
        .wallet(Arc::clone(&wallet))
        .mint(MacaroonMint::new(SECRET).unwrap())
        .pricing(21u64)
        .build();
    let app = app(gate);

    let response = app.clone().oneshot(get_request(None)).await.unwrap();
    let challenge = body_json(response).await;
    let macaroon = challenge["macaroon"].as_str().unwrap().to_string();

    // A preimage for a different invoice does not satisfy this macaroon.
    let authorization = format_authorization(&macaroon, &hex::encode([0xEEu8; 32]));
    let response = app
        .clone()
        .oneshot(get_request(Some(&authorization)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid_preimage");
}

#[tokio::test]
async fn free_tier_flows_through_the_layer() {
    let wallet = Arc::new(SeqWallet::default());
    let gate = TollGate::builder()
        .wallet(Arc::clone(&wallet))
        .mint(MacaroonMint::new(SECRET).unwrap())
        .pricing(21u64)
        .free_tier(FreeTier::builder().requests(1).build())
        .build();
    let app = app(gate);

    let response = app.clone().oneshot(get_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["free"], true);

    let response = app.clone().oneshot(get_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    // The free-tier denial never consumed an invoice until the challenge.
    assert_eq!(wallet.issued(), 1);
}
