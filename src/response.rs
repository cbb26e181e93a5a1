//! Response lifecycle tracking and cancellation.
//!
//! The remote model may start a response at any time (autonomous
//! turn-taking runs asynchronously to local control frames). The tracker
//! remembers the id of the response that actually started so cancellation
//! always targets that id, never a guessed or stale one.

use tracing::{debug, info};

use crate::channel::EventChannel;
use crate::protocol::ClientEvent;

/// Lifecycle state of the model's current response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseState {
    NoActiveResponse,
    ResponseActive(String),
}

/// What the tracker did with a `response.created` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatedDisposition {
    /// A response this client asked for.
    Local,
    /// An autonomous response that is allowed to play.
    Tracked,
    /// An autonomous response that was cancelled immediately.
    Cancelled,
}

/// Tracks the active response id and outstanding local requests.
#[derive(Debug)]
pub struct ResponseTracker {
    state: ResponseState,
    /// `response.create` frames sent but not yet acknowledged by a
    /// `response.created`.
    local_requests: usize,
    /// The active response was requested by this client.
    active_local: bool,
    /// One-shot: cancel the next autonomous response.
    suppress_next: bool,
}

impl Default for ResponseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ResponseState::NoActiveResponse,
            local_requests: 0,
            active_local: false,
            suppress_next: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> &ResponseState {
        &self.state
    }

    /// Id of the active response, if any.
    #[must_use]
    pub fn active_id(&self) -> Option<&str> {
        match &self.state {
            ResponseState::ResponseActive(id) => Some(id),
            ResponseState::NoActiveResponse => None,
        }
    }

    /// Whether the active response was requested by this client.
    #[must_use]
    pub fn active_is_local(&self) -> bool {
        self.active_local && self.active_id().is_some()
    }

    /// Record that a `response.create` was sent by this client.
    pub fn note_local_request(&mut self) {
        self.local_requests += 1;
    }

    /// The server refused a local `response.create`; no `response.created`
    /// will follow for it.
    pub fn on_request_rejected(&mut self) {
        if self.local_requests == 0 {
            debug!("rejected response request with none outstanding");
            return;
        }
        self.local_requests -= 1;
    }

    /// Arm the one-shot suppression of the next autonomous response.
    pub fn suppress_next(&mut self) {
        self.suppress_next = true;
    }

    /// Disarm the one-shot suppression.
    pub fn clear_suppression(&mut self) {
        self.suppress_next = false;
    }

    #[must_use]
    pub fn is_suppressing(&self) -> bool {
        self.suppress_next
    }

    /// Handle `response.created(id)`.
    ///
    /// `suppress` is the caller's standing suppression intent (e.g. capture
    /// in progress); it is combined with the one-shot flag.
    pub fn on_created(
        &mut self,
        channel: &mut EventChannel,
        id: &str,
        suppress: bool,
    ) -> CreatedDisposition {
        if id.is_empty() {
            debug!("response.created without id, ignoring");
            return CreatedDisposition::Tracked;
        }

        if self.local_requests > 0 {
            self.local_requests -= 1;
            self.activate(id, true);
            return CreatedDisposition::Local;
        }

        if suppress || self.suppress_next {
            self.suppress_next = false;
            info!("cancelling unsolicited response {id}");
            self.activate(id, false);
            self.cancel(channel, Some(id));
            return CreatedDisposition::Cancelled;
        }

        self.activate(id, false);
        CreatedDisposition::Tracked
    }

    fn activate(&mut self, id: &str, local: bool) {
        self.state = ResponseState::ResponseActive(id.to_owned());
        self.active_local = local;
    }

    /// Handle `response.done(id)`. Only clears a matching active id.
    pub fn on_done(&mut self, id: &str) {
        if self.active_id() == Some(id) {
            self.state = ResponseState::NoActiveResponse;
            self.active_local = false;
        } else {
            debug!("response.done for inactive response {id}, ignoring");
        }
    }

    /// Cancel `id`, or the active response when `id` is `None`.
    ///
    /// The local state moves to [`ResponseState::NoActiveResponse`] without
    /// waiting for the server. Returns the id that was cancelled.
    pub fn cancel(&mut self, channel: &mut EventChannel, id: Option<&str>) -> Option<String> {
        let target = match id {
            Some(id) => id.to_owned(),
            None => self.active_id()?.to_owned(),
        };
        channel.send(ClientEvent::cancel(target.clone()));
        self.state = ResponseState::NoActiveResponse;
        self.active_local = false;
        Some(target)
    }

    /// Cancel the active response only if the server started it on its own.
    /// Local speech (acknowledgements, action replies) is left playing.
    pub fn cancel_autonomous(&mut self, channel: &mut EventChannel) -> Option<String> {
        if self.active_is_local() {
            return None;
        }
        self.cancel(channel, None)
    }

    /// Forget everything (session teardown).
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
