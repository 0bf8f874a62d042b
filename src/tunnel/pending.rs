//! Pending calls: correlation ID → waiting caller.
//!
//! Each entry owns only completion handles (oneshot/mpsc senders), never a
//! reference back to the router. Resolution and removal happen together under
//! the table lock, so whichever path removes an entry (terminal response,
//! deadline, session loss) is the only one that produces its outcome.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::protocol::{Headers, ResponseEnvelope};

/// How far ahead of the next expected `seq` a chunk may arrive before the
/// call is failed.
pub const REORDER_WINDOW: u64 = 64;

/// Why a pending call ended without a complete response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    /// Deadline elapsed before the terminal chunk arrived.
    #[error("deadline elapsed")]
    Timeout,
    /// The session carrying the call went away.
    #[error("session lost: {0}")]
    SessionLost(String),
    /// The agent flagged a tunnel-side failure after the head was delivered.
    #[error("upstream failure: {0}")]
    Upstream(String),
}

/// Status line and headers of a relayed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
    /// Tunnel-side failure reported by the agent's forwarder, if any.
    pub tunnel_error: Option<String>,
}

/// A fully buffered relayed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub tunnel_error: Option<String>,
}

pub type BufferedOutcome = Result<HttpResponse, CallFailure>;
pub type HeadOutcome = Result<ResponseHead, CallFailure>;
pub type BodyChunk = Result<Bytes, CallFailure>;

/// Result of handing a response chunk to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No call with that correlation ID (already resolved, timed out, or never existed).
    Unknown,
    /// A chunk with that sequence number was already seen.
    Duplicate,
    /// Accepted; the call is still open.
    Accepted,
    /// The terminal chunk completed the call and removed it.
    Completed,
    /// The chunk was too far ahead of the stream; the call was failed and removed.
    OutOfWindow,
}

enum CallSink {
    Buffered {
        tx: oneshot::Sender<BufferedOutcome>,
        head: Option<ResponseHead>,
        body: Vec<u8>,
    },
    Streaming {
        head_tx: Option<oneshot::Sender<HeadOutcome>>,
        body_tx: mpsc::UnboundedSender<BodyChunk>,
    },
}

impl CallSink {
    /// Apply one in-order chunk. Returns `false` once the caller has gone away.
    fn accept(&mut self, chunk: ResponseEnvelope) -> bool {
        match self {
            Self::Buffered { head, body, .. } => {
                match head {
                    None => {
                        *head = Some(ResponseHead {
                            status: chunk.status,
                            headers: chunk.headers,
                            tunnel_error: chunk.error,
                        });
                    }
                    Some(h) => {
                        if h.tunnel_error.is_none() {
                            h.tunnel_error = chunk.error;
                        }
                    }
                }
                body.extend_from_slice(&chunk.body);
                true
            }
            Self::Streaming { head_tx, body_tx } => {
                if let Some(tx) = head_tx.take() {
                    let head = ResponseHead {
                        status: chunk.status,
                        headers: chunk.headers,
                        tunnel_error: chunk.error.clone(),
                    };
                    if tx.send(Ok(head)).is_err() {
                        return false;
                    }
                    if !chunk.body.is_empty() && body_tx.send(Ok(Bytes::from(chunk.body))).is_err() {
                        return false;
                    }
                    return true;
                }
                if !chunk.body.is_empty() && body_tx.send(Ok(Bytes::from(chunk.body))).is_err() {
                    return false;
                }
                if let Some(err) = chunk.error {
                    return body_tx.send(Err(CallFailure::Upstream(err))).is_ok();
                }
                true
            }
        }
    }

    /// The terminal chunk has been applied.
    fn complete(self) {
        match self {
            Self::Buffered { tx, head, body } => {
                let head = head.unwrap_or(ResponseHead {
                    status: 502,
                    headers: Vec::new(),
                    tunnel_error: Some("response ended without a head".into()),
                });
                let _ = tx.send(Ok(HttpResponse {
                    status: head.status,
                    headers: head.headers,
                    body,
                    tunnel_error: head.tunnel_error,
                }));
            }
            // Dropping the body sender ends the caller's stream.
            Self::Streaming { .. } => {}
        }
    }

    fn fail(self, failure: CallFailure) {
        match self {
            Self::Buffered { tx, .. } => {
                let _ = tx.send(Err(failure));
            }
            Self::Streaming { head_tx, body_tx } => match head_tx {
                Some(tx) => {
                    let _ = tx.send(Err(failure));
                }
                None => {
                    let _ = body_tx.send(Err(failure));
                }
            },
        }
    }
}

struct PendingCall {
    deadline: Instant,
    /// Streaming calls push their deadline out by this much on every chunk.
    idle: Option<Duration>,
    next_seq: u64,
    /// Chunks that arrived ahead of `next_seq`.
    held: BTreeMap<u64, ResponseEnvelope>,
    sink: CallSink,
}

/// Per-session table of calls awaiting responses.
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, correlation_id: String, deadline: Instant, idle: Option<Duration>, sink: CallSink) {
        self.lock().insert(
            correlation_id,
            PendingCall {
                deadline,
                idle,
                next_seq: 0,
                held: BTreeMap::new(),
                sink,
            },
        );
    }

    /// Register a call that resolves once with the whole response.
    pub fn register_buffered(
        &self,
        correlation_id: String,
        deadline: Instant,
    ) -> oneshot::Receiver<BufferedOutcome> {
        let (tx, rx) = oneshot::channel();
        let sink = CallSink::Buffered {
            tx,
            head: None,
            body: Vec::new(),
        };
        self.insert(correlation_id, deadline, None, sink);
        rx
    }

    /// Register a call that resolves its head once, then streams body chunks
    /// in order. The deadline is `idle` from now and moves forward whenever
    /// the stream advances.
    pub fn register_streaming(
        &self,
        correlation_id: String,
        idle: Duration,
    ) -> (
        oneshot::Receiver<HeadOutcome>,
        mpsc::UnboundedReceiver<BodyChunk>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let sink = CallSink::Streaming {
            head_tx: Some(head_tx),
            body_tx,
        };
        self.insert(correlation_id, Instant::now() + idle, Some(idle), sink);
        (head_rx, body_rx)
    }

    /// Hand a response chunk to its call, re-ordering by `seq`.
    pub fn deliver(&self, chunk: ResponseEnvelope) -> Delivery {
        let mut calls = self.lock();
        let Entry::Occupied(mut entry) = calls.entry(chunk.correlation_id.clone()) else {
            return Delivery::Unknown;
        };
        let call = entry.get_mut();
        if chunk.seq < call.next_seq || call.held.contains_key(&chunk.seq) {
            return Delivery::Duplicate;
        }
        if chunk.seq - call.next_seq >= REORDER_WINDOW {
            let reason = format!("chunk seq {} too far ahead of {}", chunk.seq, call.next_seq);
            entry.remove().sink.fail(CallFailure::Upstream(reason));
            return Delivery::OutOfWindow;
        }
        call.held.insert(chunk.seq, chunk);

        let start = call.next_seq;
        let mut finished = false;
        while let Some(next) = call.held.remove(&call.next_seq) {
            call.next_seq += 1;
            let is_final = next.is_final;
            if !call.sink.accept(next) || is_final {
                finished = true;
                break;
            }
        }
        // Only in-order progress keeps a stream alive.
        if let (Some(idle), true) = (call.idle, call.next_seq > start) {
            call.deadline = Instant::now() + idle;
        }

        if finished {
            entry.remove().sink.complete();
            Delivery::Completed
        } else {
            Delivery::Accepted
        }
    }

    /// Fail one call. Returns `false` if it had already been resolved.
    pub fn fail(&self, correlation_id: &str, failure: CallFailure) -> bool {
        let removed = self.lock().remove(correlation_id);
        match removed {
            Some(call) => {
                call.sink.fail(failure);
                true
            }
            None => false,
        }
    }

    /// Fail every call whose deadline is at or before `now` with
    /// [`CallFailure::Timeout`]. Returns the expired correlation IDs.
    pub fn expire(&self, now: Instant) -> Vec<String> {
        let mut calls = self.lock();
        let expired: Vec<String> = calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(call) = calls.remove(id) {
                call.sink.fail(CallFailure::Timeout);
            }
        }
        expired
    }

    /// Fail every outstanding call. Returns how many there were.
    pub fn drain(&self, failure: &CallFailure) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            call.sink.fail(failure.clone());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
