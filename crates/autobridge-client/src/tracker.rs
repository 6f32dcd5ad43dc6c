//! Pending-request table.
//!
//! Every in-flight request owns a oneshot sender; callers hold a
//! [`PendingResponse`], a shared future over the receiving end, so any
//! number of coalesced callers observe the identical outcome. Each request
//! settles exactly once: the entry is removed under the table lock and only
//! the remover sends.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use autobridge_core::protocol::AutomationResponse;
use autobridge_core::{BridgeError, RequestId};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::policy::{CoalescePolicy, CompletionPolicy};

/// Outcome delivered to callers.
pub type RequestResult = Result<AutomationResponse, BridgeError>;

/// Future that resolves with a request's outcome. Clones share it.
pub type PendingResponse = Shared<BoxFuture<'static, RequestResult>>;

type SettleHook = Arc<dyn Fn() + Send + Sync>;

/// Where a pending request is in the two-phase completion protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStage {
    /// No response yet.
    AwaitingInitial,
    /// Initial response stored, waiting for the completion event.
    AwaitingEvent,
}

/// Snapshot of a pending request.
#[derive(Clone, Debug)]
pub struct PendingRequestInfo {
    /// Request id.
    pub request_id: RequestId,
    /// Requested action.
    pub action: String,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// Whether a completion event is required.
    pub wait_for_event: bool,
    /// Current stage.
    pub stage: RequestStage,
    /// Initial response, once received.
    pub initial_response: Option<AutomationResponse>,
}

struct Entry {
    action: String,
    created_at: DateTime<Utc>,
    wait_for_event: bool,
    stage: RequestStage,
    initial_response: Option<AutomationResponse>,
    coalesce_key: Option<String>,
    tx: oneshot::Sender<RequestResult>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<RequestId, Entry>,
    coalesced: HashMap<String, (RequestId, PendingResponse)>,
}

impl Table {
    fn remove(&mut self, id: &RequestId) -> Option<Entry> {
        let entry = self.pending.remove(id)?;
        if let Some(key) = &entry.coalesce_key {
            if self.coalesced.get(key).is_some_and(|(owner, _)| owner == id) {
                let _ = self.coalesced.remove(key);
            }
        }
        Some(entry)
    }
}

struct Inner {
    table: Mutex<Table>,
    max_pending: usize,
    completion: CompletionPolicy,
    coalesce: CoalescePolicy,
    on_settle: Mutex<Option<SettleHook>>,
}

/// Handle to the pending-request table. Clones share the table.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<Inner>,
}

impl RequestTracker {
    /// Create an empty tracker.
    pub fn new(max_pending: usize, completion: CompletionPolicy, coalesce: CoalescePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                max_pending: max_pending.max(1),
                completion,
                coalesce,
                on_settle: Mutex::new(None),
            }),
        }
    }

    /// Run `hook` after every settlement, with no tracker lock held.
    pub fn set_settle_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_settle.lock() = Some(Arc::new(hook));
    }

    /// Register a request and start its timeout.
    ///
    /// With a coalesce key the request also becomes the coalescing target for
    /// that key until it settles. Must be called within a tokio runtime.
    pub fn create_request(
        &self,
        action: &str,
        timeout: Duration,
        coalesce_key: Option<String>,
    ) -> (RequestId, PendingResponse) {
        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        let response: PendingResponse = async move {
            rx.await.unwrap_or(Err(BridgeError::Stopped))
        }
        .boxed()
        .shared();

        let wait_for_event = self.inner.completion.requires_event(action);
        let mut table = self.inner.table.lock();
        // Spawned under the lock so the timer cannot observe the table
        // before the entry exists.
        let timer = self.spawn_timer(id.clone(), action, timeout, |action, timeout_ms| {
            BridgeError::RequestTimeout { action, timeout_ms }
        });
        if let Some(key) = &coalesce_key {
            let _ = table
                .coalesced
                .insert(key.clone(), (id.clone(), response.clone()));
        }
        let _ = table.pending.insert(
            id.clone(),
            Entry {
                action: action.to_owned(),
                created_at: Utc::now(),
                wait_for_event,
                stage: RequestStage::AwaitingInitial,
                initial_response: None,
                coalesce_key,
                tx,
                timer: Some(timer),
            },
        );
        debug!(request_id = %id, action, wait_for_event, pending = table.pending.len(), "request created");
        (id, response)
    }

    fn spawn_timer(
        &self,
        id: RequestId,
        action: &str,
        timeout: Duration,
        make_error: impl FnOnce(String, u64) -> BridgeError + Send + 'static,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let action = action.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            #[allow(clippy::cast_possible_truncation)]
            let timeout_ms = timeout.as_millis() as u64;
            let tracker = RequestTracker { inner };
            if tracker.reject_request(&id, make_error(action.clone(), timeout_ms)) {
                warn!(request_id = %id, action = %action, timeout_ms, "request timed out");
            }
        })
    }

    /// Resolve a request. Returns `false` if it was already settled.
    pub fn resolve_request(&self, id: &RequestId, response: AutomationResponse) -> bool {
        self.settle(id, Ok(response))
    }

    /// Reject a request. Returns `false` if it was already settled.
    pub fn reject_request(&self, id: &RequestId, error: BridgeError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: &RequestId, outcome: RequestResult) -> bool {
        let Some(entry) = self.inner.table.lock().remove(id) else {
            debug!(request_id = %id, "request already settled");
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        let _ = entry.tx.send(outcome);
        self.notify_settled();
        true
    }

    /// Reject every pending request. Returns how many were rejected.
    pub fn reject_all(&self, error: &BridgeError) -> usize {
        let entries: Vec<Entry> = {
            let mut table = self.inner.table.lock();
            table.coalesced.clear();
            table.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(error.clone()));
        }
        if count > 0 {
            debug!(count, code = error.code(), "rejected all pending requests");
            self.notify_settled();
        }
        count
    }

    fn notify_settled(&self) {
        let hook = self.inner.on_settle.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Store the initial response and start waiting for the completion event.
    ///
    /// Replaces the request timeout with `event_timeout`. Returns `false` if
    /// the request is not pending or already past its initial response.
    pub fn await_completion_event(
        &self,
        id: &RequestId,
        initial: AutomationResponse,
        event_timeout: Duration,
    ) -> bool {
        let mut table = self.inner.table.lock();
        let Some(entry) = table.pending.get_mut(id) else {
            return false;
        };
        if entry.stage != RequestStage::AwaitingInitial {
            return false;
        }
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.stage = RequestStage::AwaitingEvent;
        entry.initial_response = Some(initial);
        let action = entry.action.clone();
        let timer = self.spawn_timer(id.clone(), &action, event_timeout, |action, timeout_ms| {
            BridgeError::EventTimeout { action, timeout_ms }
        });
        // Still pending: the lock has been held since the lookup.
        if let Some(entry) = table.pending.get_mut(id) {
            entry.timer = Some(timer);
        }
        debug!(request_id = %id, action = %action, ?event_timeout, "awaiting completion event");
        true
    }

    /// Snapshot of a pending request.
    pub fn get_pending_request(&self, id: &RequestId) -> Option<PendingRequestInfo> {
        let table = self.inner.table.lock();
        table.pending.get(id).map(|e| PendingRequestInfo {
            request_id: id.clone(),
            action: e.action.clone(),
            created_at: e.created_at,
            wait_for_event: e.wait_for_event,
            stage: e.stage,
            initial_response: e.initial_response.clone(),
        })
    }

    /// Stage of a pending request.
    pub fn stage(&self, id: &RequestId) -> Option<RequestStage> {
        self.inner.table.lock().pending.get(id).map(|e| e.stage)
    }

    /// Number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.inner.table.lock().pending.len()
    }

    /// Concurrency limit.
    pub fn max_pending_requests(&self) -> usize {
        self.inner.max_pending
    }

    /// Whether another request can go on the wire.
    pub fn has_capacity(&self) -> bool {
        self.pending_count() < self.inner.max_pending
    }

    /// Coalesce key for a request, if its action is eligible.
    pub fn create_coalesce_key(&self, action: &str, payload: &Value) -> Option<String> {
        self.inner.coalesce.key(action, payload)
    }

    /// In-flight response for `key`.
    pub fn get_coalesced_request(&self, key: &str) -> Option<PendingResponse> {
        self.inner
            .table
            .lock()
            .coalesced
            .get(key)
            .map(|(_, response)| response.clone())
    }

    /// Make `id` the coalescing target for `key`.
    ///
    /// Returns `false` if `id` is no longer pending.
    pub fn set_coalesced_request(
        &self,
        key: &str,
        id: &RequestId,
        response: PendingResponse,
    ) -> bool {
        let mut table = self.inner.table.lock();
        let Some(entry) = table.pending.get_mut(id) else {
            return false;
        };
        entry.coalesce_key = Some(key.to_owned());
        let _ = table
            .coalesced
            .insert(key.to_owned(), (id.clone(), response));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use autobridge_settings::CompletionRule;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker(max_pending: usize) -> RequestTracker {
        RequestTracker::new(
            max_pending,
            CompletionPolicy::new(
                [CompletionRule::new("save_asset", "saved")],
                Duration::from_secs(120),
            ),
            CoalescePolicy::new(["list_assets".to_string()]),
        )
    }

    fn response(id: &RequestId, success: bool) -> AutomationResponse {
        AutomationResponse {
            request_id: id.clone(),
            success,
            message: Some("ok".into()),
            error: None,
            result: Some(json!({"n": 1})),
            action: None,
        }
    }

    const LONG: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn resolve_delivers_response() {
        let tracker = tracker(4);
        let (id, pending) = tracker.create_request("list_assets", LONG, None);
        assert_eq!(tracker.pending_count(), 1);

        assert!(tracker.resolve_request(&id, response(&id, true)));
        let out = pending.await.unwrap();
        assert!(out.success);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn settling_twice_is_a_no_op() {
        let tracker = tracker(4);
        let (id, pending) = tracker.create_request("list_assets", LONG, None);

        assert!(tracker.resolve_request(&id, response(&id, true)));
        assert!(!tracker.resolve_request(&id, response(&id, false)));
        assert!(!tracker.reject_request(&id, BridgeError::Stopped));
        assert!(pending.await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_removes() {
        let tracker = tracker(4);
        let (id, pending) = tracker.create_request("list_assets", Duration::from_millis(250), None);

        let err = pending.await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::RequestTimeout {
                action: "list_assets".into(),
                timeout_ms: 250
            }
        );
        assert!(tracker.get_pending_request(&id).is_none());
        assert!(!tracker.resolve_request(&id, response(&id, true)));
    }

    #[tokio::test]
    async fn reject_all_rejects_everything() {
        let tracker = tracker(4);
        let (_, a) = tracker.create_request("list_assets", LONG, None);
        let (_, b) = tracker.create_request("save_asset", LONG, None);

        let err = BridgeError::disconnected("closed");
        assert_eq!(tracker.reject_all(&err), 2);
        assert_eq!(a.await.unwrap_err(), err);
        assert_eq!(b.await.unwrap_err(), err);
        assert_eq!(tracker.reject_all(&err), 0);
    }

    #[tokio::test]
    async fn wait_for_event_comes_from_table() {
        let tracker = tracker(4);
        let (save, _) = tracker.create_request("save_asset", LONG, None);
        let (list, _) = tracker.create_request("list_assets", LONG, None);
        assert!(tracker.get_pending_request(&save).unwrap().wait_for_event);
        assert!(!tracker.get_pending_request(&list).unwrap().wait_for_event);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_event_wait_replaces_request_timeout() {
        let tracker = tracker(4);
        let (id, pending) = tracker.create_request("save_asset", Duration::from_millis(100), None);

        assert!(tracker.await_completion_event(&id, response(&id, true), Duration::from_millis(500)));
        assert!(!tracker.await_completion_event(&id, response(&id, true), Duration::from_millis(500)));
        assert_eq!(tracker.stage(&id), Some(RequestStage::AwaitingEvent));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tracker.get_pending_request(&id).is_some());

        let err = pending.await.unwrap_err();
        assert_matches!(err, BridgeError::EventTimeout { timeout_ms: 500, .. });
    }

    #[tokio::test]
    async fn capacity_accounting() {
        let tracker = tracker(2);
        assert_eq!(tracker.max_pending_requests(), 2);
        let (a, _) = tracker.create_request("list_assets", LONG, None);
        let _ = tracker.create_request("list_assets", LONG, None);
        assert!(!tracker.has_capacity());
        let _ = tracker.reject_request(&a, BridgeError::Stopped);
        assert!(tracker.has_capacity());
    }

    #[tokio::test]
    async fn coalesced_callers_share_outcome() {
        let tracker = tracker(4);
        let key = tracker
            .create_coalesce_key("list_assets", &json!({"path": "/Game"}))
            .unwrap();
        let (id, first) = tracker.create_request("list_assets", LONG, Some(key.clone()));
        let second = tracker.get_coalesced_request(&key).unwrap();
        assert_eq!(tracker.pending_count(), 1);

        assert!(tracker.resolve_request(&id, response(&id, true)));
        assert_eq!(first.await, second.await);
        assert!(tracker.get_coalesced_request(&key).is_none());
    }

    #[tokio::test]
    async fn coalesce_entry_removed_on_rejection() {
        let tracker = tracker(4);
        let key = "list_assets:{}".to_string();
        let (id, _) = tracker.create_request("list_assets", LONG, Some(key.clone()));
        let _ = tracker.reject_request(&id, BridgeError::Stopped);
        assert!(tracker.get_coalesced_request(&key).is_none());
    }

    #[tokio::test]
    async fn set_coalesced_request_requires_pending() {
        let tracker = tracker(4);
        let (id, pending) = tracker.create_request("list_assets", LONG, None);
        assert!(tracker.set_coalesced_request("k", &id, pending.clone()));
        assert!(tracker.get_coalesced_request("k").is_some());
        let _ = tracker.resolve_request(&id, response(&id, true));
        assert!(tracker.get_coalesced_request("k").is_none());
        assert!(!tracker.set_coalesced_request("k", &id, pending));
    }

    #[tokio::test]
    async fn settle_hook_runs_per_settlement() {
        let tracker = tracker(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        tracker.set_settle_hook(move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });

        let (a, _) = tracker.create_request("list_assets", LONG, None);
        let _ = tracker.create_request("list_assets", LONG, None);
        let _ = tracker.resolve_request(&a, response(&a, true));
        let _ = tracker.resolve_request(&a, response(&a, true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let _ = tracker.reject_all(&BridgeError::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn settle_hook_may_reenter_tracker() {
        let tracker = tracker(4);
        let inner = tracker.clone();
        tracker.set_settle_hook(move || {
            let _ = inner.pending_count();
        });
        let (id, _) = tracker.create_request("list_assets", LONG, None);
        assert!(tracker.resolve_request(&id, response(&id, true)));
    }
}
