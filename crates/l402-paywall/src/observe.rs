//! Grant observation and in-memory revenue stats.
//!
//! The gate reports through the narrow [`TollObserver`] seam; [`TollStats`]
//! is the shipped implementation. All state is process-lifetime and resets
//! on restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

/// A granted request, paid or free.
#[derive(Debug, Clone)]
pub struct GrantEvent {
    pub endpoint: String,
    pub client_id: String,
    pub paid: bool,
    pub free: bool,
    pub amount_sats: u64,
    pub payment_hash: Option<String>,
}

/// A settled invoice observed by the gate's settlement monitor.
#[derive(Debug, Clone)]
pub struct SettlementEvent {
    pub payment_hash: String,
    pub amount_sats: u64,
    pub endpoint: String,
    pub client_id: String,
    pub preimage: Option<String>,
    pub settled_at: Option<u64>,
}

/// Observer seam for revenue tracking and payment hooks.
pub trait TollObserver: Send + Sync {
    fn on_grant(&self, _event: &GrantEvent) {}
    fn on_settlement(&self, _event: &SettlementEvent) {}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub revenue: u64,
    pub requests: u64,
    pub paid: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub endpoint: String,
    pub amount_sats: u64,
    pub payer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

/// Point-in-time stats summary in the dashboard wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_revenue: u64,
    pub total_requests: u64,
    pub total_paid: u64,
    pub unique_payers: usize,
    pub endpoints: HashMap<String, EndpointStats>,
    /// Most recent first, capped at 20.
    pub recent_payments: Vec<PaymentRecord>,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_revenue: u64,
    total_requests: u64,
    total_paid: u64,
    endpoints: HashMap<String, EndpointStats>,
    payers: HashSet<String>,
    recent: VecDeque<PaymentRecord>,
}

/// In-memory payment statistics tracker.
#[derive(Debug, Default)]
pub struct TollStats {
    inner: Mutex<StatsInner>,
}

const MAX_RECENT: usize = 100;
const SNAPSHOT_RECENT: usize = 20;

impl TollStats {
    pub fn new() -> Self {
        TollStats::default()
    }

    /// Records one granted request.
    pub fn record(
        &self,
        endpoint: &str,
        paid: bool,
        amount_sats: u64,
        payer_id: &str,
        payment_hash: Option<&str>,
    ) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        let entry = inner.endpoints.entry(endpoint.to_string()).or_default();
        entry.requests += 1;

        if paid && amount_sats > 0 {
            entry.revenue += amount_sats;
            entry.paid += 1;
            inner.total_revenue += amount_sats;
            inner.total_paid += 1;
            inner.payers.insert(payer_id.to_string());
            inner.recent.push_back(PaymentRecord {
                endpoint: endpoint.to_string(),
                amount_sats,
                payer_id: payer_id.to_string(),
                payment_hash: payment_hash.map(str::to_string),
                timestamp: unix_millis(),
            });
            if inner.recent.len() > MAX_RECENT {
                inner.recent.pop_front();
            }
        } else {
            entry.free += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            total_revenue: inner.total_revenue,
            total_requests: inner.total_requests,
            total_paid: inner.total_paid,
            unique_payers: inner.payers.len(),
            endpoints: inner.endpoints.clone(),
            recent_payments: inner
                .recent
                .iter()
                .rev()
                .take(SNAPSHOT_RECENT)
                .cloned()
                .collect(),
        }
    }
}

impl TollObserver for TollStats {
    fn on_grant(&self, event: &GrantEvent) {
        self.record(
            &event.endpoint,
            event.paid,
            event.amount_sats,
            &event.client_id,
            event.payment_hash.as_deref(),
        );
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
