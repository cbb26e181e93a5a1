//! Realtime gate: voice-activated command capture over a realtime model
//! session.
//!
//! The crate sits between an always-listening realtime speech model and
//! the user. It keeps the model from answering recognizer noise, lets a
//! spoken trigger phrase switch the session into a capture mode, and hands
//! the text spoken between the trigger and stop phrases to an external
//! HTTP action whose reply the model then speaks verbatim.
//!
//! # Architecture
//!
//! Inbound frames flow through independent components owned by one
//! [`SessionOrchestrator`]:
//! - **Event channel** (`channel`): readiness-gated outbound frames
//! - **Response tracker** (`response`): active response id and cancellation
//! - **Turn detection** (`turn`): override and restore of autonomous replies
//! - **Capture** (`capture`): trigger/stop phrase state machine
//! - **Action bridge** (`action`): bearer-authenticated HTTP submission
//!
//! [`run_session`] drives the orchestrator over a [`transport`] connection.

pub mod action;
pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod response;
pub mod runtime;
pub mod session;
pub mod token;
pub mod transport;
pub mod turn;

pub use action::ActionBridge;
pub use capture::{CaptureEvent, CaptureMachine, CaptureMode};
pub use config::GateConfig;
pub use error::{GateError, Result};
pub use runtime::run_session;
pub use session::{SessionOrchestrator, SessionState, Submission};
pub use transport::{FrameSink, MemorySink, TransportEvent};
