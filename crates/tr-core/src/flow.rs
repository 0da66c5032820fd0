//! Flow records
//!
//! A [`Flow`] is one request/response exchange reconstructed from the
//! fragments the agent reports. The raw bytes are always kept; the parsed
//! views are rebuilt whenever a raw buffer changes and stay `None` when the
//! bytes do not parse as HTTP.

use bytes::Bytes;
use serde::Serialize;
use tr_protocol::FlowFragment;

use crate::http::{HttpRequest, HttpResponse};
use crate::time::current_time_millis;

/// One logical request/response exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flow {
    /// 1-based position in the order flows were received
    pub seq: u64,
    /// Correlation key assigned by the agent
    pub id: String,
    pub local_addr: String,
    pub remote_addr: String,
    pub l4_protocol: String,
    pub l7_protocol: String,
    /// When the request half arrived (ms since epoch)
    pub received_at: u64,
    request_raw: Bytes,
    response_raw: Bytes,
    request: Option<HttpRequest>,
    response: Option<HttpResponse>,
}

impl Flow {
    /// Create a flow from the first fragment seen for an exchange
    pub fn from_fragment(seq: u64, fragment: FlowFragment) -> Self {
        let FlowFragment {
            uuid,
            local_addr,
            remote_addr,
            l4_protocol,
            l7_protocol,
            request,
            response,
        } = fragment;

        let mut flow = Self {
            seq,
            id: uuid,
            local_addr,
            remote_addr,
            l4_protocol,
            l7_protocol,
            received_at: current_time_millis(),
            request_raw: Bytes::new(),
            response_raw: Bytes::new(),
            request: None,
            response: None,
        };
        flow.set_request(request);
        flow.set_response(response);
        flow
    }

    /// Replace the raw request and rebuild the parsed view
    pub fn set_request(&mut self, raw: Bytes) {
        self.request = if raw.is_empty() {
            None
        } else {
            match HttpRequest::from_raw(&raw) {
                Ok(request) => Some(request),
                Err(e) => {
                    tracing::debug!(flow = %self.id, error = %e, "Request is not renderable");
                    None
                }
            }
        };
        self.request_raw = raw;
    }

    /// Replace the raw response and rebuild the parsed view
    pub fn set_response(&mut self, raw: Bytes) {
        self.response = if raw.is_empty() {
            None
        } else {
            match HttpResponse::from_raw(&raw) {
                Ok(response) => Some(response),
                Err(e) => {
                    tracing::debug!(flow = %self.id, error = %e, "Response is not renderable");
                    None
                }
            }
        };
        self.response_raw = raw;
    }

    pub fn request_raw(&self) -> &Bytes {
        &self.request_raw
    }

    pub fn response_raw(&self) -> &Bytes {
        &self.response_raw
    }

    /// Parsed request, if the raw bytes were valid HTTP
    pub fn request(&self) -> Option<&HttpRequest> {
        self.request.as_ref()
    }

    /// Parsed response, if the raw bytes were valid HTTP
    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    pub fn has_request(&self) -> bool {
        !self.request_raw.is_empty()
    }

    /// Whether a response has been attached
    pub fn has_response(&self) -> bool {
        !self.response_raw.is_empty()
    }

    /// Host the request was sent to, or the remote address
    pub fn destination(&self) -> String {
        self.request
            .as_ref()
            .and_then(|r| r.host())
            .unwrap_or(self.remote_addr.as_str())
            .to_string()
    }

    /// Request method, or empty if the request is not parsed
    pub fn operation(&self) -> String {
        self.request
            .as_ref()
            .map(|r| r.method.clone())
            .unwrap_or_default()
    }

    /// Request path, or empty if the request is not parsed
    pub fn path(&self) -> String {
        self.request
            .as_ref()
            .map(|r| r.path.clone())
            .unwrap_or_default()
    }

    /// Response status code, or empty while no parsed response exists
    pub fn response_status(&self) -> String {
        self.response
            .as_ref()
            .map(|r| r.status.to_string())
            .unwrap_or_default()
    }
}
