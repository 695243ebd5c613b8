//! Envelope capture
//!
//! Outgoing requests from the page under test are intercepted in the
//! browser and fed into a per-test [`CaptureRegistry`]. Only requests whose
//! URL matches the ingestion endpoint pattern are buffered at all; anything
//! else is ignored at the door. Waits are indexed and bounded: a wait that
//! cannot be satisfied before its deadline fails the test with an error
//! naming what was awaited, and a captured request that fails to decode is
//! always a hard error, never a silent skip -- envelope shape is exactly
//! what is under test.
//!
//! Ordering precondition: establish the wait *before* triggering the page
//! action that produces the awaited request. Registering afterwards races
//! the browser and is the classic source of flaky envelope tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use probelab_envelope::{Envelope, IngestMatcher, ItemType};

use crate::error::{HarnessError, HarnessResult};

/// An intercepted outgoing HTTP request, immutable once captured.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl CapturedRequest {
    /// Decode the request body as an envelope.
    pub fn envelope(&self) -> HarnessResult<Envelope> {
        Envelope::parse(&self.body).map_err(HarnessError::from)
    }
}

/// Filter over decoded envelopes, with a human-readable description used
/// in timeout errors.
#[derive(Clone)]
pub struct EnvelopeFilter {
    description: String,
    first_item: Option<Vec<ItemType>>,
    predicate: Option<Arc<dyn Fn(&Envelope) -> bool + Send + Sync>>,
}

impl EnvelopeFilter {
    /// Matches every decodable envelope.
    pub fn any() -> Self {
        Self {
            description: "any envelope".to_string(),
            first_item: None,
            predicate: None,
        }
    }

    /// Matches envelopes whose *first* item has the given type (the
    /// conventional coarse routing key of an envelope).
    pub fn of_type(ty: ItemType) -> Self {
        Self {
            description: format!("first item '{}'", ty),
            first_item: Some(vec![ty]),
            predicate: None,
        }
    }

    pub fn of_types(types: Vec<ItemType>) -> Self {
        let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        Self {
            description: format!("first item one of {:?}", names),
            first_item: Some(types),
            predicate: None,
        }
    }

    /// Matches envelopes containing an item of the given type anywhere.
    pub fn containing(ty: ItemType) -> Self {
        let description = format!("envelope containing '{}'", ty);
        Self::any().describe(description).with_predicate(move |env| env.item_of_type(&ty).is_some())
    }

    /// Matches error events: an `event` item whose payload carries no
    /// `type` field (transactions and other event kinds declare one).
    pub fn error_event() -> Self {
        Self::of_type(ItemType::Event)
            .describe("error event")
            .with_predicate(|env| {
                env.item_of_type(&ItemType::Event)
                    .and_then(|item| item.json())
                    .map(|payload| payload.get("type").is_none())
                    .unwrap_or(false)
            })
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a predicate over the decoded envelope. Combined with any type
    /// restriction; both must hold.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(types) = &self.first_item {
            match envelope.event_type() {
                Some(ty) if types.contains(ty) => {}
                _ => return false,
            }
        }
        if let Some(predicate) = &self.predicate {
            return predicate(envelope);
        }
        true
    }
}

impl std::fmt::Debug for EnvelopeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeFilter")
            .field("description", &self.description)
            .field("first_item", &self.first_item)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

struct Inner {
    matcher: IngestMatcher,
    requests: Mutex<Vec<CapturedRequest>>,
    wake: broadcast::Sender<()>,
}

/// Per-test interception registry. Cloning shares the underlying state;
/// the test context owns the canonical handle and tears it down with the
/// test.
#[derive(Clone)]
pub struct CaptureRegistry {
    inner: Arc<Inner>,
}

impl CaptureRegistry {
    pub fn new(matcher: IngestMatcher) -> Self {
        let (wake, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                matcher,
                requests: Mutex::new(Vec::new()),
                wake,
            }),
        }
    }

    pub fn matcher(&self) -> &IngestMatcher {
        &self.inner.matcher
    }

    /// Ingest an intercepted request. Requests that do not match the
    /// ingestion endpoint pattern are dropped here, never buffered.
    /// Returns whether the request was kept.
    pub fn record(&self, request: CapturedRequest) -> bool {
        if !self.inner.matcher.matches(&request.url) {
            trace!(url = %request.url, "ignoring non-ingest request");
            return false;
        }
        debug!(url = %request.url, bytes = request.body.len(), "captured envelope request");
        self.inner.requests.lock().push(request);
        let _ = self.inner.wake.send(());
        true
    }

    /// All captured requests so far, in arrival order.
    pub fn snapshot(&self) -> Vec<CapturedRequest> {
        self.inner.requests.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Suspend until the `index`-th (0-based) captured envelope matching
    /// `filter` exists, or fail with a timeout error naming the filter and
    /// index. Establish the wait before triggering the page action that
    /// produces the request.
    pub async fn wait_for_envelope(
        &self,
        filter: &EnvelopeFilter,
        index: usize,
        timeout: Duration,
    ) -> HarnessResult<CapturedRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            // Subscribe before scanning so a record() between the scan and
            // the await still wakes this task.
            let mut wake = self.inner.wake.subscribe();

            if let Some(request) = self.find_match(filter, index)? {
                return Ok(request);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::WaitTimeout {
                    what: filter.description().to_string(),
                    index,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            // Wake on the next capture or re-check at the deadline.
            let _ = tokio::time::timeout(deadline - now, wake.recv()).await;
        }
    }

    /// First matching envelope request within the default index 0.
    pub async fn wait_for_first(
        &self,
        filter: &EnvelopeFilter,
        timeout: Duration,
    ) -> HarnessResult<CapturedRequest> {
        self.wait_for_envelope(filter, 0, timeout).await
    }

    /// Wait for an error event envelope.
    pub async fn wait_for_error(&self, timeout: Duration) -> HarnessResult<CapturedRequest> {
        self.wait_for_first(&EnvelopeFilter::error_event(), timeout).await
    }

    /// Wait for a transaction envelope.
    pub async fn wait_for_transaction(&self, timeout: Duration) -> HarnessResult<CapturedRequest> {
        self.wait_for_first(&EnvelopeFilter::of_type(ItemType::Transaction), timeout)
            .await
    }

    /// Wait for a session envelope and return the session payload.
    pub async fn wait_for_session(&self, timeout: Duration) -> HarnessResult<serde_json::Value> {
        let filter = EnvelopeFilter::of_type(ItemType::Session)
            .describe("session with init flag")
            .with_predicate(|env| {
                env.item_of_type(&ItemType::Session)
                    .and_then(|item| item.json())
                    .map(|payload| payload.get("init").map(|v| v.is_boolean()).unwrap_or(false)
                        && payload.get("started").is_some())
                    .unwrap_or(false)
            });
        let request = self.wait_for_first(&filter, timeout).await?;
        let envelope = request.envelope()?;
        let payload = envelope
            .item_of_type(&ItemType::Session)
            .and_then(|item| item.json())
            .cloned()
            .ok_or_else(|| HarnessError::Driver("session item vanished after match".to_string()))?;
        Ok(payload)
    }

    /// Wait for a client report envelope.
    pub async fn wait_for_client_report(&self, timeout: Duration) -> HarnessResult<CapturedRequest> {
        let filter = EnvelopeFilter::any()
            .describe("client report with discarded_events")
            .with_predicate(|env| {
                env.item_of_type(&ItemType::ClientReport)
                    .and_then(|item| item.json())
                    .map(|payload| payload.get("discarded_events").map(|v| v.is_array() || v.is_object()).unwrap_or(false))
                    .unwrap_or(false)
            });
        self.wait_for_first(&filter, timeout).await
    }

    /// Wait for the replay envelope carrying the given segment id.
    /// Segments are indexed sequentially from 0, one envelope each.
    pub async fn wait_for_replay_segment(
        &self,
        segment: u64,
        timeout: Duration,
    ) -> HarnessResult<CapturedRequest> {
        let filter = EnvelopeFilter::any()
            .describe(format!("replay segment {}", segment))
            .with_predicate(move |env| {
                env.item_of_type(&ItemType::ReplayEvent)
                    .and_then(|item| item.json())
                    .and_then(|payload| payload.get("segment_id").and_then(|v| v.as_u64()))
                    .map(|id| id == segment)
                    .unwrap_or(false)
            });
        self.wait_for_first(&filter, timeout).await
    }

    /// Count envelopes whose first item is one of `types` arriving within
    /// `window` from now. Resolves with the count at window end rather
    /// than failing, so tests can assert on exact counts including zero.
    pub async fn count_envelopes(
        &self,
        types: &[ItemType],
        window: Duration,
    ) -> HarnessResult<usize> {
        let already = self.len();
        tokio::time::sleep(window).await;

        let requests = self.snapshot();
        let mut count = 0;
        for request in requests.iter().skip(already) {
            let envelope = request.envelope()?;
            if let Some(ty) = envelope.event_type() {
                if types.contains(ty) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn find_match(
        &self,
        filter: &EnvelopeFilter,
        index: usize,
    ) -> HarnessResult<Option<CapturedRequest>> {
        let requests = self.inner.requests.lock();
        let mut seen = 0;
        for request in requests.iter() {
            // Decode failure on a buffered (matching) request is a hard
            // failure: malformed envelopes are what these tests exist to
            // catch.
            let envelope = request.envelope()?;
            if filter.matches(&envelope) {
                if seen == index {
                    return Ok(Some(request.clone()));
                }
                seen += 1;
            }
        }
        Ok(None)
    }
}

impl Default for CaptureRegistry {
    fn default() -> Self {
        Self::new(IngestMatcher::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probelab_envelope::{Envelope, EnvelopeHeader};
    use serde_json::json;

    fn ingest_request(body: Vec<u8>) -> CapturedRequest {
        CapturedRequest {
            url: "https://dsn.ingest.example.io/api/1337/envelope/".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: Bytes::from(body),
        }
    }

    fn error_envelope(message: &str) -> Vec<u8> {
        let mut envelope = Envelope::new(EnvelopeHeader::default());
        envelope
            .push_json_item(ItemType::Event, json!({ "message": message }))
            .unwrap();
        envelope.serialize().unwrap()
    }

    fn transaction_envelope(name: &str) -> Vec<u8> {
        let mut envelope = Envelope::new(EnvelopeHeader::default());
        envelope
            .push_json_item(
                ItemType::Transaction,
                json!({ "type": "transaction", "transaction": name }),
            )
            .unwrap();
        envelope.serialize().unwrap()
    }

    #[test]
    fn non_matching_urls_are_never_buffered() {
        let registry = CaptureRegistry::default();
        let kept = registry.record(CapturedRequest {
            url: "https://cdn.example.com/app.js".to_string(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
        });
        assert!(!kept);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn wait_returns_the_requested_index_not_a_later_one() {
        let registry = CaptureRegistry::default();
        registry.record(ingest_request(error_envelope("first")));
        registry.record(ingest_request(transaction_envelope("tx")));
        registry.record(ingest_request(error_envelope("second")));

        let request = registry
            .wait_for_envelope(&EnvelopeFilter::error_event(), 1, Duration::from_millis(200))
            .await
            .unwrap();
        let envelope = request.envelope().unwrap();
        assert_eq!(
            envelope.items[0].json().unwrap()["message"],
            json!("second")
        );
    }

    #[tokio::test]
    async fn wait_established_before_the_request_arrives_is_woken() {
        let registry = CaptureRegistry::default();
        let waiter = registry.clone();

        let handle = tokio::spawn(async move {
            waiter
                .wait_for_error(Duration::from_millis(2000))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.record(ingest_request(error_envelope("late")));

        let request = handle.await.unwrap().unwrap();
        assert!(request.url.contains("/envelope/"));
    }

    #[tokio::test]
    async fn timeout_error_names_the_filter_and_index() {
        let registry = CaptureRegistry::default();
        let err = registry
            .wait_for_envelope(
                &EnvelopeFilter::of_type(ItemType::Transaction),
                3,
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();

        match err {
            HarnessError::WaitTimeout { what, index, .. } => {
                assert!(what.contains("transaction"), "{}", what);
                assert_eq!(index, 3);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_decode_error_not_a_timeout() {
        let registry = CaptureRegistry::default();
        registry.record(ingest_request(b"{}\n{\"type\":\"event\",\"length\":999}\nxx".to_vec()));

        let err = registry
            .wait_for_error(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Decode(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn session_wait_returns_the_session_payload() {
        let registry = CaptureRegistry::default();
        let mut envelope = Envelope::new(EnvelopeHeader::default());
        envelope
            .push_json_item(
                ItemType::Session,
                json!({ "sid": "s1", "init": true, "started": "2024-05-01T00:00:00Z", "status": "ok" }),
            )
            .unwrap();
        registry.record(ingest_request(envelope.serialize().unwrap()));

        let session = registry
            .wait_for_session(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(session["init"], json!(true));
        assert_eq!(session["status"], json!("ok"));
    }

    #[tokio::test]
    async fn replay_segments_are_waited_by_id() {
        let registry = CaptureRegistry::default();
        for segment in 0..2u64 {
            let mut envelope = Envelope::new(EnvelopeHeader::default());
            envelope
                .push_json_item(
                    ItemType::ReplayEvent,
                    json!({ "type": "replay_event", "segment_id": segment }),
                )
                .unwrap();
            envelope.push_binary_item(
                ItemType::ReplayRecording,
                Bytes::from_static(&[1, 2, 3]),
                None,
            );
            registry.record(ingest_request(envelope.serialize().unwrap()));
        }

        let request = registry
            .wait_for_replay_segment(1, Duration::from_millis(200))
            .await
            .unwrap();
        let envelope = request.envelope().unwrap();
        assert_eq!(
            envelope.item_of_type(&ItemType::ReplayEvent).unwrap().json().unwrap()["segment_id"],
            json!(1)
        );
    }

    #[tokio::test]
    async fn count_envelopes_counts_only_arrivals_inside_the_window() {
        let registry = CaptureRegistry::default();
        registry.record(ingest_request(error_envelope("before")));

        let counter = registry.clone();
        let handle = tokio::spawn(async move {
            counter
                .count_envelopes(&[ItemType::Event], Duration::from_millis(120))
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.record(ingest_request(error_envelope("during")));
        registry.record(ingest_request(transaction_envelope("ignored-type")));

        let count = handle.await.unwrap().unwrap();
        assert_eq!(count, 1);
    }
}
