//! Core SDK for building L402 Lightning paywall integrations.
//!
//! L402 gates an HTTP operation behind a Lightning payment: the server
//! answers an unauthenticated request with a 402 challenge carrying an
//! invoice and a macaroon, and grants access once the caller retries with
//! the macaroon and the payment preimage.

pub mod concepts;
pub mod l402;
pub mod macaroon;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "nwc")]
pub mod nwc;
