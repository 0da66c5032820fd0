//! tr-server: Agent session engine for Trayce
//!
//! The server accepts the capture agent's connection, correlates the HTTP
//! traffic it reports into flows, tracks which containers exist and whether
//! the agent is alive, and streams intercept settings back to the agent.
//! Observers such as the GUI subscribe to [`ObserverEvent`]s.

pub mod client;
pub mod correlator;
pub mod events;
pub mod heartbeat;
pub mod server;
pub mod service;
pub mod session;

pub use correlator::{FlowCorrelator, IngestOutcome};
pub use events::{EventSink, ObserverEvent};
pub use heartbeat::HeartbeatMonitor;
pub use server::AgentServer;
pub use service::{AgentService, Reply, ServiceError};
pub use session::{CommandReceiver, Session, StreamState};
