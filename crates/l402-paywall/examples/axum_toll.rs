//! Gate an axum route behind a Lightning toll.
//!
//! ```sh
//! NWC_URL="nostr+walletconnect://..." TOLL_SECRET="change-me" cargo run --example axum_toll
//! ```

use std::sync::Arc;

use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::{Value, json};

use l402_kit::macaroon::MacaroonMint;
use l402_kit::nwc::{NwcClient, NwcConfig};
use l402_paywall::axum::TollLayer;
use l402_paywall::observe::{TollObserver, TollStats};
use l402_paywall::toll::{FreeTier, Grant, TollGate};

async fn data(Extension(grant): Extension<Grant>) -> Json<Value> {
    Json(json!({
        "data": "premium content",
        "paid": grant.paid,
        "free": grant.free,
    }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let nwc_url = std::env::var("NWC_URL")
        .expect("Please set `NWC_URL` in environment variables");
    let secret = std::env::var("TOLL_SECRET")
        .expect("Please set `TOLL_SECRET` in environment variables");

    let config = NwcConfig::parse(&nwc_url).expect("NWC_URL must be a valid connection string");
    let wallet = NwcClient::connect(config)
        .await
        .expect("failed to connect to relay");
    tracing::info!("wallet channel connected");

    let stats = Arc::new(TollStats::new());
    let gate = TollGate::builder()
        .wallet(Arc::new(wallet))
        .mint(MacaroonMint::new(secret).expect("TOLL_SECRET must not be empty"))
        .pricing(10u64)
        .description("Premium API access")
        .free_tier(FreeTier::builder().requests(3).build())
        .observer(Arc::clone(&stats) as Arc<dyn TollObserver>)
        .build();

    let dashboard = {
        let stats = Arc::clone(&stats);
        move || async move { Json(serde_json::to_value(stats.snapshot()).unwrap()) }
    };

    let app = Router::new()
        .route("/api/data", get(data))
        .layer(TollLayer::new(gate))
        .route("/api/stats", get(dashboard));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
}
