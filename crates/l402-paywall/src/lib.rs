//! Server-side L402 access gate.
//!
//! A [`toll::TollGate`] turns an unauthenticated request into a 402 challenge
//! (invoice + macaroon) and a proof-bearing retry into a grant. Free-tier
//! allowances come from [`ledger::RateLedger`]; revenue observation hangs off
//! the [`observe::TollObserver`] seam.

pub mod errors;
pub mod ledger;
pub mod observe;
pub mod toll;

#[cfg(feature = "axum")]
pub mod axum;
