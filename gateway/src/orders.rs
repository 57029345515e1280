//! Local ↔ broker order identity and status reconciliation.
//!
//! Two paths update the same snapshot per broker order id: the pushed status
//! stream and the periodic "all open orders" poll. A poll never overwrites an
//! event-sourced snapshot that is at least as recent; it only fills gaps.

use std::time::Duration;

use optiondesk_broker::{OpenOrderRow, OrderStatusEvent};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::time::Instant;

use crate::account::now_ms;

pub const PENDING_SUBMIT: &str = "PendingSubmit";
pub const REJECTED: &str = "Rejected";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Event,
    OpenOrder,
    Submit,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusSnapshot {
    pub local_order_id: Option<String>,
    pub broker_order_id: i64,
    pub status: Option<String>,
    pub filled: Option<f64>,
    pub remaining: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub last_fill_price: Option<f64>,
    pub perm_id: Option<i64>,
    pub client_id: Option<i32>,
    pub why_held: Option<String>,
    pub source: StatusSource,
    pub updated_at: i64,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl OrderStatusSnapshot {
    fn submitted(local_order_id: &str, broker_order_id: i64, updated_at: i64) -> Self {
        Self {
            local_order_id: Some(local_order_id.to_string()),
            broker_order_id,
            status: Some(PENDING_SUBMIT.to_string()),
            filled: None,
            remaining: None,
            avg_fill_price: None,
            last_fill_price: None,
            perm_id: None,
            client_id: None,
            why_held: None,
            source: StatusSource::Submit,
            updated_at,
        }
    }

    pub fn from_event(event: &OrderStatusEvent, updated_at: i64) -> Self {
        Self {
            local_order_id: None,
            broker_order_id: event.order_id,
            status: non_empty(&event.status),
            filled: Some(event.filled),
            remaining: Some(event.remaining),
            avg_fill_price: Some(event.avg_fill_price),
            last_fill_price: Some(event.last_fill_price),
            perm_id: (event.perm_id != 0).then_some(event.perm_id),
            client_id: Some(event.client_id),
            why_held: non_empty(&event.why_held),
            source: StatusSource::Event,
            updated_at,
        }
    }

    pub fn from_open_order(row: &OpenOrderRow, updated_at: i64) -> Self {
        Self {
            local_order_id: None,
            broker_order_id: row.order_id,
            status: row.status.as_deref().and_then(non_empty),
            filled: row.filled,
            remaining: row.remaining,
            avg_fill_price: row.avg_fill_price,
            last_fill_price: row.last_fill_price,
            perm_id: row.perm_id.filter(|id| *id != 0),
            client_id: row.client_id,
            why_held: row.why_held.as_deref().and_then(non_empty),
            source: StatusSource::OpenOrder,
            updated_at,
        }
    }

    /// Take every field this snapshot lacks from `other`.
    pub fn fill_missing(&mut self, other: &OrderStatusSnapshot) {
        fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(from);
            }
        }
        fill(&mut self.local_order_id, &other.local_order_id);
        fill(&mut self.status, &other.status);
        fill(&mut self.filled, &other.filled);
        fill(&mut self.remaining, &other.remaining);
        fill(&mut self.avg_fill_price, &other.avg_fill_price);
        fill(&mut self.last_fill_price, &other.last_fill_price);
        fill(&mut self.perm_id, &other.perm_id);
        fill(&mut self.client_id, &other.client_id);
        fill(&mut self.why_held, &other.why_held);
    }
}

#[derive(Default)]
struct Inner {
    local_to_broker: FxHashMap<String, i64>,
    broker_to_local: FxHashMap<i64, String>,
    /// Local ids claimed by a submit that has no broker id yet.
    reserved: FxHashSet<String>,
    snapshots: FxHashMap<i64, OrderStatusSnapshot>,
    last_poll: Option<Instant>,
}

impl Inner {
    fn local_for(&self, broker_order_id: i64) -> Option<&String> {
        self.broker_to_local.get(&broker_order_id)
    }
}

/// Identity map plus status store.
#[derive(Default)]
pub struct OrderTracker {
    inner: Mutex<Inner>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `local_order_id` for one submit. False when it is already
    /// mapped or claimed by a submit still in progress.
    pub fn reserve_local(&self, local_order_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.local_to_broker.contains_key(local_order_id) {
            return false;
        }
        inner.reserved.insert(local_order_id.to_string())
    }

    /// Drop an unused claim. A no-op once the id is registered.
    pub fn release_local(&self, local_order_id: &str) {
        self.inner.lock().reserved.remove(local_order_id);
    }

    /// Map a local id to the broker id it is about to be placed under and
    /// record the initial `PendingSubmit` snapshot. Refuses a local id that
    /// is already mapped.
    pub fn register_submit(&self, local_order_id: &str, broker_order_id: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.local_to_broker.contains_key(local_order_id) {
            return false;
        }
        inner.reserved.remove(local_order_id);
        inner
            .local_to_broker
            .insert(local_order_id.to_string(), broker_order_id);
        inner
            .broker_to_local
            .insert(broker_order_id, local_order_id.to_string());
        inner.snapshots.insert(
            broker_order_id,
            OrderStatusSnapshot::submitted(local_order_id, broker_order_id, now_ms()),
        );
        true
    }

    pub fn broker_id(&self, local_order_id: &str) -> Option<i64> {
        self.inner.lock().local_to_broker.get(local_order_id).copied()
    }

    pub fn is_known_local(&self, local_order_id: &str) -> bool {
        self.inner.lock().local_to_broker.contains_key(local_order_id)
    }

    /// Apply a pushed status update. Orders without a local mapping are ignored.
    pub fn apply_event(&self, event: &OrderStatusEvent) -> bool {
        self.apply_event_at(event, now_ms())
    }

    pub fn apply_event_at(&self, event: &OrderStatusEvent, updated_at: i64) -> bool {
        let mut inner = self.inner.lock();
        let Some(local) = inner.local_for(event.order_id).cloned() else {
            return false;
        };
        let mut snapshot = OrderStatusSnapshot::from_event(event, updated_at);
        snapshot.local_order_id = Some(local);
        if let Some(existing) = inner.snapshots.get(&event.order_id) {
            snapshot.fill_missing(existing);
        }
        inner.snapshots.insert(event.order_id, snapshot);
        true
    }

    /// Apply the rows of one open-orders poll taken at `polled_at`.
    pub fn apply_poll(&self, rows: &[OpenOrderRow], polled_at: i64) -> usize {
        let mut inner = self.inner.lock();
        let mut applied = 0;
        for row in rows {
            let Some(local) = inner.local_for(row.order_id).cloned() else {
                continue;
            };
            let mut polled = OrderStatusSnapshot::from_open_order(row, polled_at);
            polled.local_order_id = Some(local);
            let merged = match inner.snapshots.get(&row.order_id) {
                Some(existing)
                    if existing.source == StatusSource::Event
                        && existing.updated_at >= polled.updated_at =>
                {
                    let mut kept = existing.clone();
                    kept.fill_missing(&polled);
                    kept
                }
                Some(existing) => {
                    polled.fill_missing(existing);
                    polled
                }
                None => polled,
            };
            inner.snapshots.insert(row.order_id, merged);
            applied += 1;
        }
        applied
    }

    /// Mark a submission the broker refused.
    pub fn mark_rejected(&self, broker_order_id: i64, reason: &str) {
        let mut inner = self.inner.lock();
        if let Some(snapshot) = inner.snapshots.get_mut(&broker_order_id) {
            snapshot.status = Some(REJECTED.to_string());
            snapshot.why_held = non_empty(reason);
            snapshot.updated_at = now_ms();
        }
    }

    pub fn snapshot(&self, broker_order_id: i64) -> Option<OrderStatusSnapshot> {
        self.inner.lock().snapshots.get(&broker_order_id).cloned()
    }

    /// Best-known snapshot per local id, in request order. Unmapped ids are
    /// omitted.
    pub fn best_known(&self, local_order_ids: &[String]) -> Vec<OrderStatusSnapshot> {
        let inner = self.inner.lock();
        local_order_ids
            .iter()
            .filter_map(|local| inner.local_to_broker.get(local))
            .filter_map(|broker| inner.snapshots.get(broker).cloned())
            .collect()
    }

    pub fn poll_due(&self, min_interval: Duration) -> bool {
        self.inner
            .lock()
            .last_poll
            .is_none_or(|at| at.elapsed() >= min_interval)
    }

    pub fn mark_polled(&self) {
        self.inner.lock().last_poll = Some(Instant::now());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().local_to_broker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
