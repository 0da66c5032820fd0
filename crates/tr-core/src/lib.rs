//! tr-core: Core model and configuration for the Trayce server
//!
//! This crate provides the flow and container model, the HTTP message
//! parser used to render captured traffic, and the configuration and error
//! types shared by the server components.

pub mod config;
pub mod error;
pub mod flow;
pub mod http;
pub mod net;
pub mod time;
pub mod types;

pub use error::{ConfigError, HttpParseError, SessionError};
pub use flow::Flow;
pub use http::{HttpRequest, HttpResponse};
pub use types::{Container, ContainersState};
