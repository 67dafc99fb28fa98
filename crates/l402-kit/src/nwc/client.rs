//! The NWC wallet session.
//!
//! One writer task owns the WebSocket sink, one reader task owns inbound
//! dispatch. Requests suspend on a oneshot waiter keyed by the request event
//! id; settlement waiters are keyed by payment hash. Waiters are always
//! removed on timeout or teardown so neither map grows without bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::crypto::SessionKeys;
use super::event::{
    Event, KIND_NWC_NOTIFICATION, KIND_NWC_REQUEST, KIND_NWC_RESPONSE, RelayMessage, build_signed,
    event_frame, parse_relay_message, req_frame,
};
use super::{NwcConfig, NwcError};
use crate::concepts::{CreateInvoice, Invoice, InvoiceStatus, Payment, Wallet};

/// NIP-47 request content.
#[derive(Debug, Serialize)]
struct WalletRequest<'a> {
    method: &'a str,
    params: Value,
}

/// NIP-47 response content.
#[derive(Debug, Deserialize)]
struct WalletResponse {
    #[serde(default)]
    #[allow(dead_code)]
    result_type: Option<String>,
    #[serde(default)]
    error: Option<WalletErrorBody>,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WalletErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// NIP-47 notification content.
#[derive(Debug, Deserialize)]
struct WalletNotification {
    notification_type: String,
    notification: Value,
}

type PendingWaiter = oneshot::Sender<Result<Value, NwcError>>;
type SettlementWaiter = (u64, oneshot::Sender<InvoiceStatus>);

struct Shared {
    pending: Mutex<HashMap<String, PendingWaiter>>,
    settlements: Mutex<HashMap<String, Vec<SettlementWaiter>>>,
    waiter_seq: AtomicU64,
    outbound: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl Shared {
    fn fail_outstanding(&self) {
        let pending: Vec<PendingWaiter> = {
            let mut map = self.pending.lock();
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(NwcError::Closed));
        }
        // Dropping the senders resolves settlement waiters with a recv error,
        // which they surface as Closed.
        self.settlements.lock().clear();
    }
}

/// A connected NWC wallet session.
///
/// Cheap to clone; all clones share the session. `close()` tears the session
/// down and fails every outstanding waiter.
#[derive(Clone)]
pub struct NwcClient {
    config: NwcConfig,
    keys: Arc<SessionKeys>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NwcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NwcClient")
            .field("relay_url", &self.config.relay_url.as_str())
            .field("wallet_pubkey", &self.config.wallet_pubkey)
            .finish_non_exhaustive()
    }
}

impl NwcClient {
    /// Connects to the relay and installs the standing response/notification
    /// subscription.
    pub async fn connect(config: NwcConfig) -> Result<Self, NwcError> {
        let keys = Arc::new(SessionKeys::derive(
            &config.secret_key,
            &config.wallet_pubkey,
        )?);

        let (socket, _) = tokio_tungstenite::connect_async(config.relay_url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let sub_id = hex::encode(rand::random::<[u8; 16]>());
        let filter = json!({
            "kinds": [KIND_NWC_RESPONSE, KIND_NWC_NOTIFICATION],
            "authors": [config.wallet_pubkey],
            "#p": [config.client_pubkey],
        });
        sink.send(WsMessage::Text(req_frame(&sub_id, &filter)))
            .await?;

        let (outbound, mut outbound_rx) = mpsc::channel::<WsMessage>(32);
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            settlements: Mutex::new(HashMap::new()),
            waiter_seq: AtomicU64::new(0),
            outbound,
            cancel: cancel.clone(),
        });

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    maybe = outbound_rx.recv() => match maybe {
                        Some(message) => {
                            if let Err(err) = sink.send(message).await {
                                tracing::warn!("relay write failed: {err}");
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        // All client handles dropped.
                        None => {
                            writer_cancel.cancel();
                            break;
                        }
                    },
                }
            }
            let _ = sink.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader_keys = Arc::clone(&keys);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shared.cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(WsMessage::Text(text))) => {
                            handle_frame(&text, &reader_keys, &reader_shared);
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!("relay read failed: {err}");
                            break;
                        }
                    },
                }
            }
            reader_shared.cancel.cancel();
            reader_shared.fail_outstanding();
        });

        Ok(NwcClient {
            config,
            keys,
            shared,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Tears down the session and fails all outstanding waiters.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.fail_outstanding();
    }

    /// One encrypted request/response exchange, correlated by event id.
    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, NwcError> {
        if self.is_closed() {
            return Err(NwcError::Closed);
        }

        let content = serde_json::to_string(&WalletRequest { method, params })
            .map_err(|err| NwcError::Malformed(err.to_string()))?;
        let sealed = self.keys.seal(&content)?;
        let tags = vec![vec!["p".to_string(), self.config.wallet_pubkey.clone()]];
        let event = build_signed(&self.keys, KIND_NWC_REQUEST, tags, sealed);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(event.id.clone(), tx);

        if self
            .shared
            .outbound
            .send(WsMessage::Text(event_frame(&event)))
            .await
            .is_err()
        {
            self.shared.pending.lock().remove(&event.id);
            return Err(NwcError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NwcError::Closed),
            Err(_) => {
                // Release the waiter entry on timeout.
                self.shared.pending.lock().remove(&event.id);
                Err(NwcError::Timeout(timeout))
            }
        }
    }

    /// Creates an invoice via `make_invoice`.
    pub async fn create_invoice(&self, params: CreateInvoice) -> Result<Invoice, NwcError> {
        let result = self
            .request(
                "make_invoice",
                json!({
                    // NWC amounts are millisats.
                    "amount": params.amount_sats * 1000,
                    "description": params.description,
                    "expiry": params.expiry_secs,
                }),
                self.config.request_timeout,
            )
            .await?;

        let payment_request = result
            .get("invoice")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NwcError::Malformed("make_invoice returned no invoice".to_string()))?
            .to_string();
        let payment_hash = result
            .get("payment_hash")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                NwcError::Malformed("make_invoice returned no payment_hash".to_string())
            })?
            .to_string();

        Ok(Invoice {
            payment_request,
            payment_hash,
        })
    }

    /// Looks up settlement state via `lookup_invoice`.
    pub async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceStatus, NwcError> {
        let result = self
            .request(
                "lookup_invoice",
                json!({ "payment_hash": payment_hash }),
                self.config.request_timeout,
            )
            .await?;
        Ok(status_from_result(&result))
    }

    /// Pays an invoice via `pay_invoice`.
    pub async fn pay_invoice(&self, payment_request: &str) -> Result<Payment, NwcError> {
        let result = self
            .request(
                "pay_invoice",
                json!({ "invoice": payment_request }),
                self.config.payment_timeout,
            )
            .await?;

        Ok(Payment {
            preimage: result
                .get("preimage")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            payment_hash: result
                .get("payment_hash")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Waits for a settlement push, with a periodic `lookup_invoice` fallback
    /// for relays or wallets that never push.
    ///
    /// Other outstanding requests and waiters are unaffected. On timeout the
    /// waiter entry is released and `NwcError::Timeout` is returned.
    pub async fn wait_for_payment(
        &self,
        payment_hash: &str,
        timeout: Duration,
    ) -> Result<InvoiceStatus, NwcError> {
        if self.is_closed() {
            return Err(NwcError::Closed);
        }

        let waiter_id = self.shared.waiter_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.shared
            .settlements
            .lock()
            .entry(payment_hash.to_string())
            .or_default()
            .push((waiter_id, tx));

        let wait = async {
            // The invoice may have settled before the waiter was registered.
            match self.lookup_invoice(payment_hash).await {
                Ok(status) if status.settled => return Ok(status),
                Ok(_) => {}
                Err(err) => tracing::debug!("initial settlement lookup failed: {err}"),
            }

            let mut poll = tokio::time::interval(self.config.poll_interval);
            poll.reset();
            loop {
                tokio::select! {
                    pushed = &mut rx => match pushed {
                        Ok(status) => break Ok(status),
                        Err(_) => break Err(NwcError::Closed),
                    },
                    _ = poll.tick() => {
                        match self.lookup_invoice(payment_hash).await {
                            Ok(status) if status.settled => break Ok(status),
                            Ok(_) => {}
                            Err(err) => tracing::debug!("settlement poll failed: {err}"),
                        }
                    }
                }
            }
        };

        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(NwcError::Timeout(timeout)),
        };

        // Release this waiter however the wait ended.
        let mut settlements = self.shared.settlements.lock();
        if let Some(waiters) = settlements.get_mut(payment_hash) {
            waiters.retain(|(id, _)| *id != waiter_id);
            if waiters.is_empty() {
                settlements.remove(payment_hash);
            }
        }
        drop(settlements);

        result
    }
}

impl Wallet for NwcClient {
    type Error = NwcError;

    async fn create_invoice(&self, params: CreateInvoice) -> Result<Invoice, NwcError> {
        NwcClient::create_invoice(self, params).await
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceStatus, NwcError> {
        NwcClient::lookup_invoice(self, payment_hash).await
    }

    async fn pay_invoice(&self, payment_request: &str) -> Result<Payment, NwcError> {
        NwcClient::pay_invoice(self, payment_request).await
    }

    async fn wait_for_payment(
        &self,
        payment_hash: &str,
        timeout: Duration,
    ) -> Result<InvoiceStatus, NwcError> {
        NwcClient::wait_for_payment(self, payment_hash, timeout).await
    }
}

fn status_from_result(result: &Value) -> InvoiceStatus {
    let preimage = result
        .get("preimage")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let settled_at = result.get("settled_at").and_then(Value::as_u64);
    InvoiceStatus {
        settled: preimage.is_some() || settled_at.is_some(),
        preimage,
        settled_at,
    }
}

/// Dispatches one inbound relay frame.
///
/// Envelopes that fail the author check, signature verification, or AEAD
/// opening are logged and dropped; so are responses without a matching
/// outstanding request.
fn handle_frame(text: &str, keys: &SessionKeys, shared: &Shared) {
    let Some(message) = parse_relay_message(text) else {
        tracing::debug!("dropping unparseable relay frame");
        return;
    };

    match message {
        RelayMessage::Event { event, .. } => handle_event(event, keys, shared),
        RelayMessage::Ok {
            event_id,
            accepted: false,
            message,
        } => {
            // The relay refused our request event; fail its waiter now rather
            // than letting it run out the timeout.
            if let Some(tx) = shared.pending.lock().remove(&event_id) {
                let _ = tx.send(Err(NwcError::Relay(message)));
            }
        }
        RelayMessage::Notice(message) => tracing::debug!("relay notice: {message}"),
        RelayMessage::Closed { subscription, message } => {
            tracing::warn!("relay closed subscription {subscription}: {message}");
        }
        _ => {}
    }
}

fn handle_event(event: Event, keys: &SessionKeys, shared: &Shared) {
    if event.pubkey != keys.peer_pubkey_hex() {
        tracing::warn!("dropping event from unexpected author {}", event.pubkey);
        return;
    }
    if !event.id_is_valid() {
        tracing::warn!("dropping event with invalid id");
        return;
    }
    let Some(id_bytes) = event.id_bytes() else {
        tracing::warn!("dropping event with non-hex id");
        return;
    };
    if !keys.verify_peer_signature(&id_bytes, &event.sig) {
        tracing::warn!("dropping event with invalid signature");
        return;
    }
    let plaintext = match keys.open(&event.content) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            tracing::warn!("rejecting envelope: {err}");
            return;
        }
    };

    match event.kind {
        KIND_NWC_RESPONSE => {
            let Some(request_id) = event.tag("e") else {
                tracing::debug!("dropping response without request correlation tag");
                return;
            };
            let Some(tx) = shared.pending.lock().remove(request_id) else {
                tracing::debug!("dropping response for unknown request {request_id}");
                return;
            };
            let outcome = match serde_json::from_str::<WalletResponse>(&plaintext) {
                Ok(WalletResponse {
                    error: Some(error), ..
                }) => Err(NwcError::Wallet {
                    code: error.code,
                    message: error.message,
                }),
                Ok(response) => Ok(response.result.unwrap_or(Value::Null)),
                Err(err) => Err(NwcError::Malformed(err.to_string())),
            };
            let _ = tx.send(outcome);
        }
        KIND_NWC_NOTIFICATION => {
            let notification = match serde_json::from_str::<WalletNotification>(&plaintext) {
                Ok(notification) => notification,
                Err(err) => {
                    tracing::debug!("dropping malformed notification: {err}");
                    return;
                }
            };
            if notification.notification_type != "payment_received" {
                return;
            }
            let Some(payment_hash) = notification
                .notification
                .get("payment_hash")
                .and_then(Value::as_str)
            else {
                return;
            };
            let status = status_from_result(&notification.notification);
            if let Some(waiters) = shared.settlements.lock().remove(payment_hash) {
                for (_, tx) in waiters {
                    let _ = tx.send(status.clone());
                }
            }
        }
        other => tracing::debug!("ignoring event of kind {other}"),
    }
}
