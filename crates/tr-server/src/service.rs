//! Agent-facing service
//!
//! [`AgentService`] is the single entry point for everything the capture
//! agent and the observers do: ingesting flow reports, tracking container
//! snapshots and liveness, and feeding the long-lived command stream. The
//! transport layer turns frames into calls on it; the GUI side holds the
//! same handle to push settings and subscribe to events.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tr_core::config::ServerConfig;
use tr_core::time::current_time_millis;
use tr_core::{ContainersState, Flow, SessionError};
use tr_protocol::{Command, ContainerRecord, FlowFragment, Message, MessageType, REPLY_SUCCESS};

use crate::correlator::FlowCorrelator;
use crate::events::{EventSink, ObserverEvent};
use crate::session::{Session, StreamState};

/// Errors ending a command stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Session-level failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The first message on the stream was not the handshake
    #[error("Expected handshake, got {0:?}")]
    UnexpectedMessage(MessageType),
}

/// Acknowledgement for unary agent calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: String,
}

impl Reply {
    pub fn success() -> Self {
        Self {
            status: REPLY_SUCCESS.to_string(),
        }
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        Message::Reply {
            status: reply.status,
        }
    }
}

/// Shared service handle
#[derive(Debug)]
pub struct AgentService {
    flows: FlowCorrelator,
    session: Arc<Session>,
    events: EventSink,
}

impl AgentService {
    /// Create a service publishing to `events`
    pub fn new(session: Arc<Session>, events: EventSink) -> Self {
        Self {
            flows: FlowCorrelator::new(),
            session,
            events,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            Arc::new(Session::new(config.command_backlog_warn)),
            EventSink::new(config.observer_capacity),
        )
    }

    /// Ingest a batch of flow fragments from the agent
    pub fn report_flows(&self, fragments: Vec<FlowFragment>) -> Reply {
        let received = fragments.len();
        let changed = self.flows.ingest_batch(fragments);

        tracing::debug!(
            "Flow report: {} fragments, {} flows changed",
            received,
            changed.len()
        );

        if !changed.is_empty() {
            self.events.publish(ObserverEvent::FlowsChanged(changed));
        }
        Reply::success()
    }

    /// The agent announced it has started
    pub fn report_agent_started(&self) -> Reply {
        tracing::info!("Agent started");
        Reply::success()
    }

    /// Ingest a container snapshot; doubles as the agent heartbeat
    pub fn report_containers(&self, containers: Vec<ContainerRecord>) -> Reply {
        let state = ContainersState::from(containers);
        tracing::trace!("Container report with {} containers", state.len());

        let became_running = self.session.record_heartbeat(current_time_millis());
        self.events.publish(ObserverEvent::ContainersObserved(state));

        if became_running {
            tracing::info!("Agent is running");
            self.events.publish(ObserverEvent::AgentRunningChanged(true));
        }
        Reply::success()
    }

    /// Serve one command stream.
    ///
    /// Waits for the agent's handshake on `inbound`, attaches a fresh queue
    /// to the session and forwards its commands to `outbound` until the
    /// session stops (returns `Ok`) or the peer goes away (also `Ok`, the
    /// session falls back to disconnected). A stream closed before the
    /// handshake leaves the session as it was.
    pub async fn open_command_stream(
        &self,
        mut inbound: mpsc::Receiver<Message>,
        outbound: mpsc::Sender<Command>,
    ) -> Result<(), ServiceError> {
        let mut pending = PendingHandshake::begin(&self.session);
        if pending.prior == StreamState::Closed {
            pending.disarm();
            return Err(SessionError::Closed.into());
        }

        match inbound.recv().await {
            Some(Message::NoOp) => pending.disarm(),
            Some(other) => {
                tracing::warn!("Command stream opened without handshake");
                return Err(ServiceError::UnexpectedMessage(other.message_type()));
            }
            None => {
                tracing::warn!("Command stream closed before handshake");
                return Err(SessionError::MissingHandshake.into());
            }
        }

        let mut queue = self.session.attach_stream()?;
        let generation = queue.generation();
        tracing::info!("Command stream {} attached", generation);

        loop {
            tokio::select! {
                command = queue.recv() => {
                    let Some(command) = command else {
                        tracing::info!("Command stream {} terminated by shutdown", generation);
                        return Ok(());
                    };
                    tracing::debug!("Sending {} to stream {}", command.type_name(), generation);
                    if outbound.send(command).await.is_err() {
                        break;
                    }
                }
                _ = outbound.closed() => break,
            }
        }

        tracing::info!("Command stream {} closed by peer", generation);
        self.session.detach_stream(generation);
        Ok(())
    }

    /// Replace the intercept allow-list
    pub fn update_settings(&self, container_ids: Vec<String>) {
        tracing::info!("Intercepting {} containers", container_ids.len());
        self.session.set_settings(container_ids);
    }

    /// Register an observer
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.events.subscribe()
    }

    /// Event sink shared with the heartbeat monitor
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Snapshot of all captured flows
    pub fn flows(&self) -> Vec<Flow> {
        self.flows.snapshot()
    }

    pub fn correlator(&self) -> &FlowCorrelator {
        &self.flows
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Stop the session and release every command stream consumer
    pub fn shutdown(&self) {
        let terminated = self.session.stop();
        tracing::info!("Agent service stopped ({} command streams released)", terminated);
    }
}

/// Rolls back a handshake that never completed, including when the
/// stream future is dropped while waiting for it
struct PendingHandshake<'a> {
    session: &'a Session,
    prior: StreamState,
    armed: bool,
}

impl<'a> PendingHandshake<'a> {
    fn begin(session: &'a Session) -> Self {
        Self {
            prior: session.begin_handshake(),
            session,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingHandshake<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.abort_handshake(self.prior);
        }
    }
}
