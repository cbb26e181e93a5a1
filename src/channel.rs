//! Outbound event channel with readiness gating.
//!
//! Before the transport reports ready, `session.update` frames are queued
//! and flushed in order exactly once when it opens; every other frame is
//! best-effort and dropped with a warning. All traffic is logged under the
//! `realtime_gate::frames` target.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::protocol::{ClientEvent, ServerEvent, encode_frame};
use crate::transport::FrameSink;

/// Tracing target for the frame log.
pub const FRAME_LOG_TARGET: &str = "realtime_gate::frames";

/// What happened to an outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the transport.
    Sent,
    /// Held until the channel is ready.
    Queued,
    /// Discarded (channel not ready, closed, or write failed).
    Dropped,
}

/// Outbound half of a realtime session.
pub struct EventChannel {
    sink: Option<Box<dyn FrameSink>>,
    ready: bool,
    pending: VecDeque<ClientEvent>,
}

impl EventChannel {
    /// Wrap a transport sink. The channel starts not ready.
    #[must_use]
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            sink: Some(sink),
            ready: false,
            pending: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Number of session-configuration frames waiting for readiness.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send an event, or queue it if it is a session update and the channel
    /// is not ready yet.
    pub fn send(&mut self, event: ClientEvent) -> SendOutcome {
        if self.sink.is_none() {
            warn!(target: FRAME_LOG_TARGET, direction = "out", kind = event.kind(), "channel released, dropping frame");
            return SendOutcome::Dropped;
        }
        if !self.ready {
            if event.is_session_update() {
                debug!(target: FRAME_LOG_TARGET, direction = "out", kind = event.kind(), "queued until channel ready");
                self.pending.push_back(event);
                return SendOutcome::Queued;
            }
            warn!(target: FRAME_LOG_TARGET, direction = "out", kind = event.kind(), "channel not ready, dropping frame");
            return SendOutcome::Dropped;
        }
        self.write(&event)
    }

    /// Mark the channel ready and flush queued frames in FIFO order.
    ///
    /// Returns the number of frames flushed. Calling it again is a no-op.
    pub fn mark_ready(&mut self) -> usize {
        if self.ready || self.sink.is_none() {
            return 0;
        }
        self.ready = true;
        let mut flushed = 0;
        while let Some(event) = self.pending.pop_front() {
            if self.write(&event) == SendOutcome::Sent {
                flushed += 1;
            }
        }
        flushed
    }

    /// Record an inbound frame in the frame log.
    pub fn log_inbound(&self, event: &ServerEvent, raw_len: usize) {
        debug!(target: FRAME_LOG_TARGET, direction = "in", kind = event.kind(), bytes = raw_len, "frame received");
    }

    /// Take the transport back for release. Pending frames are discarded.
    pub fn release(&mut self) -> Option<Box<dyn FrameSink>> {
        self.ready = false;
        self.pending.clear();
        self.sink.take()
    }

    fn write(&mut self, event: &ClientEvent) -> SendOutcome {
        let Some(sink) = self.sink.as_mut() else {
            return SendOutcome::Dropped;
        };
        let frame = match encode_frame(event) {
            Ok(f) => f,
            Err(e) => {
                warn!(target: FRAME_LOG_TARGET, direction = "out", kind = event.kind(), "encode failed: {e}");
                return SendOutcome::Dropped;
            }
        };
        let bytes = frame.len();
        match sink.send_text(frame) {
            Ok(()) => {
                debug!(target: FRAME_LOG_TARGET, direction = "out", kind = event.kind(), bytes, "frame sent");
                SendOutcome::Sent
            }
            Err(e) => {
                warn!(target: FRAME_LOG_TARGET, direction = "out", kind = event.kind(), "send failed: {e}");
                SendOutcome::Dropped
            }
        }
    }
}
