//! FIFO request queue with a single in-flight slot.
//!
//! The protocol has no correlation ids: responses match requests purely by
//! order, so at most one request may ever be outstanding. The dispatcher
//! enforces that by refusing to hand out a payload while the in-flight
//! slot is occupied, and by pairing each arriving envelope with that slot.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::envelope::{Envelope, EnvelopeError};
use crate::bridge::protocol::{RenderReply, RenderTimings};

/// Why a request failed. `Worker` carries an application error the worker
/// itself reported; everything else is channel or lifecycle machinery.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("worker crashed")]
    WorkerCrashed,
    #[error("worker error: {0}")]
    Worker(String),
    #[error("invalid response format: missing metadata separator")]
    InvalidResponse,
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
    #[error("request write failed: {0}")]
    WriteFailed(String),
    #[error("could not encode request: {0}")]
    InvalidRequest(String),
    #[error("host is shutting down")]
    ShuttingDown,
    #[error("host channel closed")]
    ChannelClosed,
}

impl From<EnvelopeError> for RequestError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::MissingSeparator => RequestError::InvalidResponse,
            EnvelopeError::MalformedMetadata(message) => RequestError::MalformedMetadata(message),
        }
    }
}

/// Completion channel for one request. The variant is the request's kind:
/// renders resolve to timings plus geometry, commands to the JSON result.
pub(crate) enum ReplyTo {
    Render(oneshot::Sender<Result<RenderReply, RequestError>>),
    Command(oneshot::Sender<Result<Value, RequestError>>),
}

impl ReplyTo {
    fn reject(self, err: RequestError) {
        match self {
            ReplyTo::Render(tx) => {
                let _ = tx.send(Err(err));
            }
            ReplyTo::Command(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// One caller request, queued or in flight.
pub(crate) struct PendingRequest {
    payload: Bytes,
    reply: ReplyTo,
    submitted_at: Instant,
}

impl PendingRequest {
    pub(crate) fn render(
        payload: Bytes,
        reply: oneshot::Sender<Result<RenderReply, RequestError>>,
    ) -> Self {
        Self { payload, reply: ReplyTo::Render(reply), submitted_at: Instant::now() }
    }

    pub(crate) fn command(
        payload: Bytes,
        reply: oneshot::Sender<Result<Value, RequestError>>,
    ) -> Self {
        Self { payload, reply: ReplyTo::Command(reply), submitted_at: Instant::now() }
    }
}

struct InFlight {
    reply: ReplyTo,
    dispatched_at: Instant,
}

pub(crate) struct Dispatcher {
    queue: VecDeque<PendingRequest>,
    in_flight: Option<InFlight>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self { queue: VecDeque::new(), in_flight: None }
    }

    pub(crate) fn enqueue(&mut self, request: PendingRequest) {
        self.queue.push_back(request);
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Pop the next request for writing and mark it in flight. `None` while
    /// one is already outstanding or the queue is empty.
    pub(crate) fn start_next(&mut self) -> Option<Bytes> {
        if self.in_flight.is_some() {
            return None;
        }
        let PendingRequest { payload, reply, submitted_at } = self.queue.pop_front()?;
        tracing::debug!(
            queued_for = ?submitted_at.elapsed(),
            queue_depth = self.queue.len(),
            "Dispatching request"
        );
        self.in_flight = Some(InFlight { reply, dispatched_at: Instant::now() });
        Some(payload)
    }

    /// Resolve the in-flight request with a decoded envelope.
    pub(crate) fn resolve(&mut self, envelope: Envelope) {
        let Some(in_flight) = self.in_flight.take() else {
            // Order is the only correlation we have, so an uninvited frame
            // is worth shouting about.
            tracing::warn!("Envelope arrived with no request in flight, dropping");
            return;
        };
        tracing::debug!(took = ?in_flight.dispatched_at.elapsed(), "Request resolved");

        if let Some(message) = envelope.error() {
            in_flight.reply.reject(RequestError::Worker(message.to_string()));
            return;
        }
        match in_flight.reply {
            ReplyTo::Render(tx) => {
                let timings = match parse_timings(&envelope.meta) {
                    Ok(timings) => timings,
                    Err(e) => {
                        let _ = tx.send(Err(RequestError::MalformedMetadata(e)));
                        return;
                    }
                };
                let _ = tx.send(Ok(RenderReply { timings, geometry: envelope.data }));
            }
            ReplyTo::Command(tx) => {
                if !envelope.data.is_empty() {
                    tracing::debug!(
                        trailer_bytes = envelope.data.len(),
                        "Ignoring binary trailer on command response"
                    );
                }
                let _ = tx.send(Ok(envelope.meta));
            }
        }
    }

    /// Reject the in-flight request, leaving the queue untouched. Returns
    /// false when nothing was in flight.
    pub(crate) fn reject_in_flight(&mut self, err: RequestError) -> bool {
        match self.in_flight.take() {
            Some(in_flight) => {
                in_flight.reply.reject(err);
                true
            }
            None => false,
        }
    }

    /// Reject the in-flight request and everything queued behind it.
    pub(crate) fn reject_all(&mut self, err: &RequestError) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.reply.reject(err.clone());
        }
        for request in self.queue.drain(..) {
            request.reply.reject(err.clone());
        }
    }
}

fn parse_timings(meta: &Value) -> Result<RenderTimings, String> {
    match meta.get("timings") {
        Some(timings) => serde_json::from_value(timings.clone()).map_err(|e| e.to_string()),
        None => Ok(RenderTimings::default()),
    }
}
