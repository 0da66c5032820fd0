//! Agent-side client
//!
//! Speaks the agent end of the protocol: unary reports and the command
//! stream. Used by the `trayce-send` tool and by the integration tests to
//! stand in for the capture agent.

mod backoff;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tr_core::config::BackoffConfig;
use tr_protocol::{
    Command, ContainerRecord, ErrorCode, FlowFragment, Frame, FrameCodec, Message, MessageType,
    StreamId,
};

pub use backoff::ReconnectSchedule;

/// Frames buffered towards the socket writer
const CHANNEL_CAPACITY: usize = 64;

/// Messages buffered per open call
const CALL_CAPACITY: usize = 32;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the server
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection went away
    #[error("Connection closed")]
    Disconnected,

    /// The server answered with an error frame
    #[error("Server error ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },

    /// The server answered with a message that does not fit the call
    #[error("Unexpected {0:?} from server")]
    UnexpectedMessage(MessageType),
}

type Calls = Arc<Mutex<HashMap<StreamId, mpsc::Sender<Message>>>>;

fn lock(calls: &Calls) -> MutexGuard<'_, HashMap<StreamId, mpsc::Sender<Message>>> {
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection to the agent server
pub struct AgentClient {
    out_tx: mpsc::Sender<Frame>,
    calls: Calls,
    next_stream: AtomicU32,
    cancel: CancellationToken,
}

impl AgentClient {
    /// Connect to the server at `addr`
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }
        tracing::debug!("Connected to {}", addr);

        let (mut sink, mut frames) = Framed::new(socket, FrameCodec::new()).split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let calls: Calls = Arc::default();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(frame).await {
                            tracing::warn!("Failed to send frame: {}", e);
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        let reader_calls = Arc::clone(&calls);
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = frames.next() => match frame {
                        Some(Ok(frame)) => route(&reader_calls, frame).await,
                        Some(Err(e)) => {
                            tracing::warn!("Failed to decode frame from server: {}", e);
                            break;
                        }
                        None => {
                            tracing::debug!("Server closed the connection");
                            break;
                        }
                    }
                }
            }
            // wakes every pending call with Disconnected
            lock(&reader_calls).clear();
        });

        Ok(Self {
            out_tx,
            calls,
            next_stream: AtomicU32::new(1),
            cancel,
        })
    }

    /// Connect, retrying with exponential backoff.
    ///
    /// Gives up after `max_attempts` attempts; `None` retries forever.
    pub async fn connect_with_backoff(
        addr: &str,
        config: &BackoffConfig,
        max_attempts: Option<u32>,
    ) -> Result<Self, ClientError> {
        let mut schedule = ReconnectSchedule::new(config, max_attempts);

        loop {
            let e = match Self::connect(addr).await {
                Ok(client) => return Ok(client),
                Err(e) => e,
            };
            let Some(delay) = schedule.failed() else {
                tracing::warn!("Giving up after {} connection attempts", schedule.attempts());
                return Err(e);
            };
            tracing::warn!(
                "Connection attempt {} failed: {}; retrying in {:?}",
                schedule.attempts(),
                e,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Report a batch of flow fragments
    pub async fn send_flows(&self, flows: Vec<FlowFragment>) -> Result<String, ClientError> {
        self.call(Message::FlowsObserved { flows }).await
    }

    /// Announce that the agent has started
    pub async fn send_agent_started(&self) -> Result<String, ClientError> {
        self.call(Message::AgentStarted).await
    }

    /// Report the observed containers
    pub async fn send_containers(
        &self,
        containers: Vec<ContainerRecord>,
    ) -> Result<String, ClientError> {
        self.call(Message::ContainersObserved { containers }).await
    }

    /// Open the command stream and send its handshake
    pub async fn open_command_stream(&self) -> Result<CommandStream, ClientError> {
        let stream = self.begin_command_stream().await?;
        stream.handshake().await?;
        Ok(stream)
    }

    /// Open the command stream without sending the handshake
    pub async fn begin_command_stream(&self) -> Result<CommandStream, ClientError> {
        let (stream_id, rx) = self.register();
        send(&self.out_tx, stream_id, Message::OpenCommandStream).await?;

        Ok(CommandStream {
            stream_id,
            rx,
            out_tx: self.out_tx.clone(),
            calls: Arc::clone(&self.calls),
            finished: false,
        })
    }

    async fn call(&self, message: Message) -> Result<String, ClientError> {
        let (stream_id, mut rx) = self.register();
        let result = match send(&self.out_tx, stream_id, message).await {
            Ok(()) => rx.recv().await.ok_or(ClientError::Disconnected),
            Err(e) => Err(e),
        };
        lock(&self.calls).remove(&stream_id);

        match result? {
            Message::Reply { status } => Ok(status),
            Message::Error { code, message } => Err(ClientError::Server { code, message }),
            other => Err(ClientError::UnexpectedMessage(other.message_type())),
        }
    }

    fn register(&self) -> (StreamId, mpsc::Receiver<Message>) {
        let stream_id = StreamId::new(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(CALL_CAPACITY);
        lock(&self.calls).insert(stream_id, tx);
        (stream_id, rx)
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Agent end of the command stream
pub struct CommandStream {
    stream_id: StreamId,
    rx: mpsc::Receiver<Message>,
    out_tx: mpsc::Sender<Frame>,
    calls: Calls,
    finished: bool,
}

impl CommandStream {
    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    /// Send the handshake that activates the stream
    pub async fn handshake(&self) -> Result<(), ClientError> {
        send(&self.out_tx, self.stream_id, Message::NoOp).await
    }

    /// Wait for the next command.
    ///
    /// Returns `Ok(None)` once the server ends the stream.
    pub async fn next_command(&mut self) -> Result<Option<Command>, ClientError> {
        if self.finished {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(Message::Command(command)) => Ok(Some(command)),
            Some(Message::StreamEnd) => {
                self.finished = true;
                Ok(None)
            }
            Some(Message::Error { code, message }) => {
                self.finished = true;
                Err(ClientError::Server { code, message })
            }
            Some(other) => Err(ClientError::UnexpectedMessage(other.message_type())),
            None => {
                self.finished = true;
                Err(ClientError::Disconnected)
            }
        }
    }

    /// End the stream from the agent side.
    ///
    /// The server answers with `StreamEnd`, or an `Error` if the stream was
    /// never activated; both remain readable through `next_command`.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        send(&self.out_tx, self.stream_id, Message::StreamEnd).await
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        lock(&self.calls).remove(&self.stream_id);
    }
}

async fn send(out_tx: &mpsc::Sender<Frame>, stream_id: StreamId, message: Message) -> Result<(), ClientError> {
    out_tx
        .send(Frame::new(stream_id, message))
        .await
        .map_err(|_| ClientError::Disconnected)
}

/// Hand an inbound frame to the call waiting on its stream
async fn route(calls: &Calls, frame: Frame) {
    let target = lock(calls).get(&frame.stream_id).cloned();
    match target {
        Some(tx) => {
            if tx.send(frame.message).await.is_err() {
                lock(calls).remove(&frame.stream_id);
            }
        }
        None => {
            tracing::debug!(
                "Discarding {:?} for unknown {}",
                frame.message.message_type(),
                frame.stream_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = AgentClient::connect(&addr).await.err().unwrap();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_connect_with_backoff_gives_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = BackoffConfig {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let result = AgentClient::connect_with_backoff(&addr, &config, Some(3)).await;
        assert!(matches!(result, Err(ClientError::Connect { .. })));
    }
}
