//! Core traits and types used across the L402 kit.

use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

/// A freshly created Lightning invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Encoded payment request (bolt11).
    pub payment_request: String,
    /// Hex payment hash.
    pub payment_hash: String,
}

/// Settlement state of an invoice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceStatus {
    pub settled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<u64>,
}

/// Outcome of paying an invoice.
///
/// `preimage` is absent when the wallet acknowledges the payment before it
/// settles; callers then obtain it via [`Wallet::wait_for_payment`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
}

/// Parameters for invoice creation.
#[derive(Debug, Clone, Builder)]
pub struct CreateInvoice {
    pub amount_sats: u64,
    #[builder(into)]
    pub description: String,
    /// Invoice expiry in seconds.
    #[builder(default = 300)]
    pub expiry_secs: u64,
}

/// A Lightning wallet the kit can drive.
///
/// The access gate and auto-pay client are generic over this seam; the NWC
/// control channel is the shipped implementation. Methods return `Send`
/// futures so gates can run them from spawned tasks and tower services.
pub trait Wallet {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates an invoice and returns its payment request and hash.
    fn create_invoice(
        &self,
        params: CreateInvoice,
    ) -> impl Future<Output = Result<Invoice, Self::Error>> + Send;

    /// Looks up the current settlement state of an invoice.
    fn lookup_invoice(
        &self,
        payment_hash: &str,
    ) -> impl Future<Output = Result<InvoiceStatus, Self::Error>> + Send;

    /// Pays an encoded invoice.
    fn pay_invoice(
        &self,
        payment_request: &str,
    ) -> impl Future<Output = Result<Payment, Self::Error>> + Send;

    /// Blocks the calling task (only) until the invoice settles or `timeout`
    /// elapses.
    fn wait_for_payment(
        &self,
        payment_hash: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<InvoiceStatus, Self::Error>> + Send;
}
