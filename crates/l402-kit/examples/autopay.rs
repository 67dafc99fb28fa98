//! Fetch an L402-gated URL, paying the challenge through an NWC wallet.
//!
//! ```sh
//! NWC_URL="nostr+walletconnect://..." cargo run --example autopay -- https://api.example.com/data
//! ```

use l402_kit::client::TollClient;
use l402_kit::nwc::{NwcClient, NwcConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let nwc_url = std::env::var("NWC_URL")
        .expect("Please set `NWC_URL` in environment variables");
    let url = std::env::args()
        .nth(1)
        .expect("Usage: autopay <url>");

    let config = NwcConfig::parse(&nwc_url).expect("NWC_URL must be a valid connection string");
    let wallet = NwcClient::connect(config)
        .await
        .expect("failed to connect to relay");

    let client = TollClient::builder().wallet(wallet.clone()).max_sats(100).build();
    match client.get(&url).await {
        Ok(response) => {
            tracing::info!(
                "{} ({}{})",
                response.status,
                if response.paid { "paid " } else { "free" },
                if response.paid {
                    format!("{} sats", response.amount_sats)
                } else {
                    String::new()
                },
            );
            println!("{}", response.body);
        }
        Err(err) => tracing::error!("request failed: {err}"),
    }

    wallet.close().await;
}
