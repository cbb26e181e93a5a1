//! Async driver for a [`SessionOrchestrator`].
//!
//! One loop owns the orchestrator and feeds it transport events, action
//! completions, capture-timeout ticks and the external stop signal, one at
//! a time. Action submissions run on spawned tasks and report back over a
//! channel; a task whose session has stopped drops its result.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::action::ActionBridge;
use crate::error::{GateError, Result};
use crate::session::{SessionOrchestrator, Submission};
use crate::transport::{FrameSink, TransportEvent};

/// How often an open capture cycle is checked against its timeout.
const EXPIRY_TICK: Duration = Duration::from_millis(500);

const COMPLETION_CAPACITY: usize = 16;

/// Result of one action submission, tagged with its session generation.
#[derive(Debug)]
struct Completion {
    generation: u64,
    result: Option<String>,
}

/// Run a session over `sink` until `cancel` fires or the transport closes.
///
/// # Errors
///
/// Returns [`GateError::Session`] if the orchestrator already has a live
/// session, or [`GateError::Transport`] if the transport closes before a
/// stop was requested.
pub async fn run_session(
    orchestrator: &mut SessionOrchestrator,
    sink: Box<dyn FrameSink>,
    mut events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    orchestrator.connect(sink)?;

    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(COMPLETION_CAPACITY);
    let mut expiry = tokio::time::interval(EXPIRY_TICK);
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("stop requested");
                orchestrator.stop();
                return Ok(());
            }
            event = events.recv() => {
                let reason = match event {
                    Some(TransportEvent::Open) => {
                        orchestrator.on_channel_open();
                        continue;
                    }
                    Some(TransportEvent::Frame(text)) => {
                        if let Some(submission) = orchestrator.handle_frame(&text) {
                            spawn_submission(orchestrator.bridge().clone(), submission, done_tx.clone());
                        }
                        continue;
                    }
                    Some(TransportEvent::Closed { reason }) => reason,
                    None => "transport event stream ended".to_owned(),
                };
                orchestrator.on_transport_closed(&reason);
                return Err(GateError::Transport(reason));
            }
            Some(done) = done_rx.recv() => {
                orchestrator.complete_action(done.generation, done.result);
            }
            _ = expiry.tick() => {
                orchestrator.expire_capture(Instant::now());
            }
        }
    }
}

/// Execute a submission off the session loop.
fn spawn_submission(
    bridge: ActionBridge,
    submission: Submission,
    done_tx: mpsc::Sender<Completion>,
) {
    let Submission {
        generation,
        text,
        liveness,
    } = submission;

    tokio::spawn(async move {
        let result = tokio::select! {
            () = liveness.cancelled() => {
                info!(generation, "session stopped, abandoning action");
                return;
            }
            result = bridge.submit(&text) => result,
        };
        if liveness.is_cancelled() {
            info!(generation, "session stopped before action result arrived, dropping it");
            return;
        }
        if done_tx.send(Completion { generation, result }).await.is_err() {
            debug!("session loop gone, action result dropped");
        }
    });
}
