//! Agent transport server

mod handler;
mod listener;

pub use handler::ConnectionHandler;
pub use listener::AgentServer;
