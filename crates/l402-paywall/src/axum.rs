//! Axum/tower adapter for the toll gate.
//!
//! Wrap a route (or router) in a [`TollLayer`]; granted requests carry a
//! [`Grant`](crate::toll::Grant) in their extensions, readable with
//! `Extension<Grant>`.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};

use l402_kit::concepts::Wallet;

use crate::toll::{RequestContext, TollGate};

/// Tower layer gating a service behind an L402 toll.
pub struct TollLayer<W: Wallet> {
    gate: Arc<TollGate<W>>,
}

impl<W: Wallet> TollLayer<W> {
    pub fn new(gate: TollGate<W>) -> Self {
        TollLayer {
            gate: Arc::new(gate),
        }
    }
}

impl<W: Wallet> Clone for TollLayer<W> {
    fn clone(&self) -> Self {
        TollLayer {
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<W: Wallet, S> Layer<S> for TollLayer<W> {
    type Service = TollService<W, S>;

    fn layer(&self, inner: S) -> Self::Service {
        TollService {
            gate: Arc::clone(&self.gate),
            inner,
        }
    }
}

pub struct TollService<W: Wallet, S> {
    gate: Arc<TollGate<W>>,
    inner: S,
}

impl<W: Wallet, S: Clone> Clone for TollService<W, S> {
    fn clone(&self) -> Self {
        TollService {
            gate: Arc::clone(&self.gate),
            inner: self.inner.clone(),
        }
    }
}

impl<W, S> Service<Request> for TollService<W, S>
where
    W: Wallet + Send + Sync + 'static,
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let gate = Arc::clone(&self.gate);
        // Take the ready service and leave the clone behind (tower idiom for
        // 'static futures).
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut ctx = RequestContext::from_http(&request);
            // Without X-Forwarded-For, fall back to the peer address when the
            // server was started with connect info.
            if ctx.client_id == "unknown"
                && let Some(connect_info) = request
                    .extensions()
                    .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
            {
                ctx.client_id = connect_info.0.ip().to_string();
            }
            let authorization = request
                .headers()
                .get(http::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            match gate.handle(&ctx, authorization.as_deref()).await {
                Ok(grant) => {
                    request.extensions_mut().insert(grant);
                    inner.call(request).await
                }
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}
