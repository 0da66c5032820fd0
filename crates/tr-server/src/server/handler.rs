//! Per-connection frame handling
//!
//! Each call from the agent uses its own stream id on the shared TCP
//! connection. Unary reports carry one message and are answered with one
//! `Reply` on the same id. A command stream starts with `OpenCommandStream`,
//! must be confirmed by a `NoOp` from the agent, and then carries `Command`
//! frames until either side sends `StreamEnd`. Failures are reported with an
//! `Error` frame on the offending stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tr_core::SessionError;
use tr_protocol::{Command, ErrorCode, Frame, FrameCodec, Message, StreamId};

use crate::service::{AgentService, ServiceError};

/// Frames buffered towards the socket writer
const OUTBOUND_BUFFER: usize = 256;

/// Commands buffered between the session queue and the socket
const COMMAND_BUFFER: usize = 32;

/// Open command stream on this connection
struct CommandStreamEntry {
    /// Delivers the first client message; taken once used
    handshake: Option<mpsc::Sender<Message>>,
    /// Ends forwarding, which detaches the stream from the session
    cancel: CancellationToken,
}

/// Handler for a single agent connection
pub struct ConnectionHandler {
    service: Arc<AgentService>,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(service: Arc<AgentService>, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            service,
            peer_addr,
            cancel,
        }
    }

    /// Serve the connection until the peer disconnects or the server stops
    pub async fn run(self, socket: TcpStream) -> Result<()> {
        let (mut sink, mut frames) = Framed::new(socket, FrameCodec::new()).split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                sink.send(frame).await?;
            }
            sink.close().await
        });

        let mut streams: HashMap<StreamId, CommandStreamEntry> = HashMap::new();
        let mut tasks: JoinSet<StreamId> = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", self.peer_addr);
                    break Ok(());
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(stream_id) => {
                            streams.remove(&stream_id);
                        }
                        Err(e) => tracing::error!("Command stream task failed: {}", e),
                    }
                }

                frame = frames.next() => match frame {
                    None => break Ok(()),
                    Some(Err(e)) => {
                        send_frame(&out_tx, StreamId::new(0), error_message(ErrorCode::InvalidMessage, &e)).await;
                        break Err(e).context("Failed to decode frame");
                    }
                    Some(Ok(frame)) => {
                        self.dispatch(frame, &out_tx, &mut streams, &mut tasks).await;
                    }
                }
            }
        };

        for entry in streams.values() {
            entry.cancel.cancel();
        }
        streams.clear();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Command stream task failed: {}", e);
            }
        }

        drop(out_tx);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Writer for {} ended with error: {}", self.peer_addr, e),
            Err(e) => tracing::error!("Writer task for {} failed: {}", self.peer_addr, e),
        }

        result
    }

    async fn dispatch(
        &self,
        frame: Frame,
        out_tx: &mpsc::Sender<Frame>,
        streams: &mut HashMap<StreamId, CommandStreamEntry>,
        tasks: &mut JoinSet<StreamId>,
    ) {
        let Frame { stream_id, message } = frame;
        tracing::trace!("{} from {} on {}", message_name(&message), self.peer_addr, stream_id);

        // The first client message on a command stream is its handshake,
        // whatever it turns out to be
        if !matches!(message, Message::StreamEnd) {
            if let Some(handshake) = streams.get_mut(&stream_id).and_then(|e| e.handshake.take()) {
                let _ = handshake.send(message).await;
                return;
            }
        }

        match message {
            Message::FlowsObserved { flows } => {
                let reply = self.service.report_flows(flows);
                send_frame(out_tx, stream_id, reply.into()).await;
            }
            Message::AgentStarted => {
                let reply = self.service.report_agent_started();
                send_frame(out_tx, stream_id, reply.into()).await;
            }
            Message::ContainersObserved { containers } => {
                let reply = self.service.report_containers(containers);
                send_frame(out_tx, stream_id, reply.into()).await;
            }
            Message::OpenCommandStream => {
                if streams.contains_key(&stream_id) {
                    let message = format!("{} already carries a command stream", stream_id);
                    send_frame(out_tx, stream_id, error_message(ErrorCode::InvalidMessage, message)).await;
                    return;
                }
                let entry = self.spawn_command_stream(stream_id, out_tx.clone(), tasks);
                streams.insert(stream_id, entry);
            }
            Message::NoOp if streams.contains_key(&stream_id) => {
                tracing::trace!("Ignoring repeated handshake on {}", stream_id);
            }
            Message::StreamEnd => {
                if let Some(entry) = streams.get_mut(&stream_id) {
                    tracing::debug!("Agent ended {}", stream_id);
                    entry.handshake.take();
                    entry.cancel.cancel();
                }
            }
            other => {
                tracing::warn!(
                    "Unexpected {} from {} on {}",
                    message_name(&other),
                    self.peer_addr,
                    stream_id
                );
                let message = format!("{} is not valid here", message_name(&other));
                send_frame(out_tx, stream_id, error_message(ErrorCode::InvalidMessage, message)).await;
            }
        }
    }

    /// Run the service side of a command stream on its own task
    fn spawn_command_stream(
        &self,
        stream_id: StreamId,
        out_tx: mpsc::Sender<Frame>,
        tasks: &mut JoinSet<StreamId>,
    ) -> CommandStreamEntry {
        let (handshake_tx, handshake_rx) = mpsc::channel(1);
        let (command_tx, mut command_rx) = mpsc::channel::<Command>(COMMAND_BUFFER);
        let cancel = self.cancel.child_token();
        let service = Arc::clone(&self.service);

        let forward_cancel = cancel.clone();
        let forward_tx = out_tx.clone();
        let forward = async move {
            loop {
                tokio::select! {
                    _ = forward_cancel.cancelled() => break,
                    command = command_rx.recv() => match command {
                        Some(command) => {
                            let frame = Frame::new(stream_id, Message::Command(command));
                            if forward_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        };

        tasks.spawn(async move {
            let (result, ()) = tokio::join!(
                service.open_command_stream(handshake_rx, command_tx),
                forward
            );

            let last = match result {
                Ok(()) => Message::StreamEnd,
                Err(e) => {
                    tracing::warn!("Command stream on {} failed: {}", stream_id, e);
                    error_message(error_code(&e), &e)
                }
            };
            send_frame(&out_tx, stream_id, last).await;
            stream_id
        });

        CommandStreamEntry {
            handshake: Some(handshake_tx),
            cancel,
        }
    }
}

fn error_code(error: &ServiceError) -> ErrorCode {
    match error {
        ServiceError::Session(SessionError::Closed) => ErrorCode::Unavailable,
        ServiceError::Session(SessionError::MissingHandshake) | ServiceError::UnexpectedMessage(_) => {
            ErrorCode::ProtocolViolation
        }
    }
}

fn error_message(code: ErrorCode, message: impl ToString) -> Message {
    Message::Error {
        code,
        message: message.to_string(),
    }
}

fn message_name(message: &Message) -> String {
    format!("{:?}", message.message_type())
}

async fn send_frame(out_tx: &mpsc::Sender<Frame>, stream_id: StreamId, message: Message) -> bool {
    if out_tx.send(Frame::new(stream_id, message)).await.is_err() {
        tracing::debug!("Connection writer gone; dropping frame for {}", stream_id);
        return false;
    }
    true
}
