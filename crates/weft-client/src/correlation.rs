//! Pending-request bookkeeping: response matching, deadlines, replay order.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use weft_core::envelope::{RequestEnvelope, ResponseEnvelope};
use weft_core::errors::{ClientError, Result};

/// Outcome delivered to the caller that issued a request.
pub type CallReply = oneshot::Sender<Result<ResponseEnvelope>>;

/// One in-flight or queued request awaiting its response.
pub struct PendingRequest {
    envelope: RequestEnvelope,
    reply: CallReply,
    deadline: Instant,
}

impl PendingRequest {
    pub fn new(envelope: RequestEnvelope, reply: CallReply, deadline: Instant) -> Self {
        Self { envelope, reply, deadline }
    }
}

/// Pending requests keyed by kind, then by id.
///
/// Ids come from one monotonically increasing session counter, so the
/// ascending id order inside a kind is that kind's submission order. Every
/// removal consumes the reply sender, which is what makes delivery
/// exactly-once: a request that has been resolved cannot be resolved again.
#[derive(Default)]
pub struct CorrelationTable {
    queues: HashMap<String, BTreeMap<u64, PendingRequest>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(BTreeMap::is_empty)
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.queues.get(kind).is_some_and(|q| !q.is_empty())
    }

    pub fn contains(&self, kind: &str, id: u64) -> bool {
        self.queues.get(kind).is_some_and(|q| q.contains_key(&id))
    }

    /// Registers a request under its (kind, id) identity.
    pub fn register(&mut self, pending: PendingRequest) {
        let kind = pending.envelope.request_type.clone();
        let id = pending.envelope.request_id;
        let prior = self.queues.entry(kind).or_default().insert(id, pending);
        debug_assert!(prior.is_none(), "request id reused while pending");
    }

    /// Removes the matching entry and delivers `outcome` to its caller.
    /// Returns false when nothing matched (a stale or unsolicited response).
    pub fn resolve(&mut self, kind: &str, id: u64, outcome: Result<ResponseEnvelope>) -> bool {
        let Some(queue) = self.queues.get_mut(kind) else {
            return false;
        };
        let Some(pending) = queue.remove(&id) else {
            return false;
        };
        if queue.is_empty() {
            self.queues.remove(kind);
        }
        // The caller may have dropped its receiver; that is its loss.
        let _ = pending.reply.send(outcome);
        true
    }

    /// Fails every pending request of `kind` as superseded by request `by`.
    /// Returns how many were cancelled.
    pub fn cancel_kind(&mut self, kind: &str, by: u64) -> usize {
        let Some(queue) = self.queues.remove(kind) else {
            return 0;
        };
        let count = queue.len();
        for (id, pending) in queue {
            let err = ClientError::Superseded { kind: kind.to_string(), id, by };
            let _ = pending.reply.send(Err(err));
        }
        count
    }

    /// Fails everything with a clone of `err`. Returns how many were drained.
    pub fn drain(&mut self, err: &ClientError) -> usize {
        let mut count = 0;
        for (_, queue) in self.queues.drain() {
            for (_, pending) in queue {
                let _ = pending.reply.send(Err(err.clone()));
                count += 1;
            }
        }
        count
    }

    /// Fails every request whose deadline has passed. Returns how many expired.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        for (kind, queue) in &self.queues {
            for (id, pending) in queue {
                if pending.deadline <= now {
                    expired.push((kind.clone(), *id));
                }
            }
        }
        for (kind, id) in &expired {
            debug!(kind = %kind, id, "request deadline passed");
            let err = ClientError::TimedOut { kind: kind.clone(), id: *id };
            self.resolve(kind, *id, Err(err));
        }
        expired.len()
    }

    /// Earliest deadline across all pending requests, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .values()
            .flat_map(|q| q.values().map(|p| p.deadline))
            .min()
    }

    /// Kinds currently holding pending requests.
    pub fn kinds(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Ids of a kind in submission order.
    pub fn ids_in_order(&self, kind: &str) -> Vec<u64> {
        self.queues
            .get(kind)
            .map(|q| q.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Serialized frame for a pending request, for (re)transmission.
    pub fn request_json(&self, kind: &str, id: u64) -> Option<String> {
        let pending = self.queues.get(kind)?.get(&id)?;
        pending.envelope.to_json().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::time::Duration;
    use tokio::sync::oneshot::error::TryRecvError;

    fn entry(
        kind: &str,
        id: u64,
        deadline: Instant,
    ) -> (PendingRequest, oneshot::Receiver<Result<ResponseEnvelope>>) {
        let (tx, rx) = oneshot::channel();
        let envelope = RequestEnvelope::new(kind, id, Map::new());
        (PendingRequest::new(envelope, tx, deadline), rx)
    }

    fn ok_response(kind: &str, id: u64) -> ResponseEnvelope {
        let raw = format!(r#"{{"requestType":"{kind}","requestId":{id},"statusCode":200}}"#);
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn resolve_delivers_once_and_removes() {
        let mut table = CorrelationTable::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let (pending, mut rx) = entry("searchSymptom", 1, deadline);
        table.register(pending);
        assert_eq!(table.len(), 1);

        assert!(table.resolve("searchSymptom", 1, Ok(ok_response("searchSymptom", 1))));
        assert!(table.is_empty());
        assert!(rx.try_recv().unwrap().is_ok());

        // A second response for the same identity is stale.
        assert!(!table.resolve("searchSymptom", 1, Ok(ok_response("searchSymptom", 1))));
    }

    #[tokio::test]
    async fn resolve_misses_unknown_identity() {
        let mut table = CorrelationTable::new();
        assert!(!table.resolve("searchSymptom", 42, Ok(ok_response("searchSymptom", 42))));
    }

    #[tokio::test]
    async fn cancel_kind_supersedes_all_of_that_kind() {
        let mut table = CorrelationTable::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let (first, mut rx1) = entry("analyzeAnswers", 1, deadline);
        let (second, mut rx2) = entry("analyzeAnswers", 2, deadline);
        let (other, mut rx3) = entry("searchSymptom", 3, deadline);
        table.register(first);
        table.register(second);
        table.register(other);

        assert_eq!(table.cancel_kind("analyzeAnswers", 7), 2);

        let err = rx1.try_recv().unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Request (analyzeAnswers:1) cancelled by new request: 7"
        );
        let err = rx2.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Superseded { id: 2, by: 7, .. }));

        // The other kind is untouched.
        assert!(matches!(rx3.try_recv(), Err(TryRecvError::Empty)));
        assert!(table.has_kind("searchSymptom"));
        assert!(!table.has_kind("analyzeAnswers"));
    }

    #[tokio::test]
    async fn drain_fails_everything_with_given_error() {
        let mut table = CorrelationTable::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let (a, mut rx_a) = entry("searchSymptom", 1, deadline);
        let (b, mut rx_b) = entry("analyzeAnswers", 2, deadline);
        table.register(a);
        table.register(b);

        assert_eq!(table.drain(&ClientError::Closing), 2);
        assert!(table.is_empty());
        assert_eq!(rx_a.try_recv().unwrap().unwrap_err().to_string(), "Closing connection");
        assert_eq!(rx_b.try_recv().unwrap().unwrap_err().to_string(), "Closing connection");
    }

    #[tokio::test(start_paused = true)]
    async fn expire_due_fails_only_past_deadlines() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let (due, mut rx_due) = entry("searchSymptom", 1, now + Duration::from_millis(50));
        let (later, mut rx_later) = entry("searchSymptom", 2, now + Duration::from_secs(5));
        table.register(due);
        table.register(later);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(50)));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(table.expire_due(Instant::now()), 1);

        let err = rx_due.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, ClientError::TimedOut { id: 1, .. }));
        assert_eq!(err.to_string(), "Request timed out: 1, searchSymptom");
        assert!(matches!(rx_later.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn ids_in_order_follows_submission_order() {
        let mut table = CorrelationTable::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        for id in [2, 5, 9] {
            let (pending, _rx) = entry("analyzeAnswers", id, deadline);
            table.register(pending);
        }
        assert_eq!(table.ids_in_order("analyzeAnswers"), vec![2, 5, 9]);
        assert!(table.ids_in_order("searchSymptom").is_empty());
    }

    #[tokio::test]
    async fn request_json_serializes_stored_envelope() {
        let mut table = CorrelationTable::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut payload = Map::new();
        payload.insert("term".into(), serde_json::json!("fever"));
        let (tx, _rx) = oneshot::channel();
        table.register(PendingRequest::new(
            RequestEnvelope::new("searchSymptom", 4, payload),
            tx,
            deadline,
        ));

        let json = table.request_json("searchSymptom", 4).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["requestType"], "searchSymptom");
        assert_eq!(value["requestId"], 4);
        assert_eq!(value["term"], "fever");
        assert!(table.request_json("searchSymptom", 99).is_none());
    }
}
