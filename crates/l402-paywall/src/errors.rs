//! Structured rejection responses from the gate.

use http::StatusCode;
use l402_kit::l402::{ChallengeBody, format_challenge};
use serde::Serialize;

/// A request the gate did not grant: a 402 challenge, an access rejection,
/// or a payment-subsystem failure.
///
/// Wallet failures are 503s, never conflated with access rejections and never
/// downgraded to free access.
#[derive(Debug, Clone)]
pub struct TollRejection {
    pub status: StatusCode,
    /// `WWW-Authenticate` value, present on challenges.
    pub www_authenticate: Option<String>,
    pub body: RejectionBody,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RejectionBody {
    Challenge(ChallengeBody),
    Error {
        /// Machine-readable reason.
        error: String,
        message: String,
    },
}

impl TollRejection {
    /// 402 with the invoice/macaroon challenge.
    pub fn challenge(body: ChallengeBody) -> Self {
        TollRejection {
            status: StatusCode::PAYMENT_REQUIRED,
            www_authenticate: Some(format_challenge(&body.invoice, &body.macaroon)),
            body: RejectionBody::Challenge(body),
        }
    }

    /// 401 for invalid or failed credentials.
    pub fn unauthorized(reason: impl Into<String>, message: impl std::fmt::Display) -> Self {
        TollRejection {
            status: StatusCode::UNAUTHORIZED,
            www_authenticate: None,
            body: RejectionBody::Error {
                error: reason.into(),
                message: message.to_string(),
            },
        }
    }

    /// 503 for payment-subsystem failures.
    pub fn service_unavailable(message: impl std::fmt::Display) -> Self {
        TollRejection {
            status: StatusCode::SERVICE_UNAVAILABLE,
            www_authenticate: None,
            body: RejectionBody::Error {
                error: "wallet_unavailable".to_string(),
                message: message.to_string(),
            },
        }
    }

    /// Machine-readable reason for non-challenge rejections.
    pub fn reason(&self) -> Option<&str> {
        match &self.body {
            RejectionBody::Error { error, .. } => Some(error),
            RejectionBody::Challenge(_) => None,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for TollRejection {
    fn into_response(self) -> axum::response::Response {
        let mut response = (self.status, axum::Json(self.body)).into_response();
        if let Some(value) = self
            .www_authenticate
            .and_then(|v| http::HeaderValue::from_str(&v).ok())
        {
            response
                .headers_mut()
                .insert(http::header::WWW_AUTHENTICATE, value);
        }
        response
    }
}
