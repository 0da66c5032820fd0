//! Request/response correlation
//!
//! The agent reports each half of an exchange as its own fragment, keyed by
//! a correlation id. Request fragments always open a new [`Flow`]; response
//! fragments are attached to the first flow with the same key that is still
//! waiting for its response. A key may be reused by later exchanges on the
//! same connection, so matching only ever considers unanswered flows.
//!
//! Responses with no waiting request are dropped rather than stored, which
//! keeps unmatched traffic from accumulating. Flows are never evicted and the
//! response lookup is a linear scan, so memory and match cost grow with the
//! number of flows captured in one process lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tr_core::Flow;
use tr_protocol::FlowFragment;

/// Result of ingesting one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A request opened a new flow
    Appended(Flow),
    /// A response completed an existing flow
    Attached(Flow),
    /// A response had no waiting request
    Dropped,
    /// The fragment carried no bytes
    Ignored,
}

impl IngestOutcome {
    /// The flow that changed, if any
    pub fn changed_flow(self) -> Option<Flow> {
        match self {
            IngestOutcome::Appended(flow) | IngestOutcome::Attached(flow) => Some(flow),
            IngestOutcome::Dropped | IngestOutcome::Ignored => None,
        }
    }
}

/// Ordered collection of flows with a single writer
#[derive(Debug, Default)]
pub struct FlowCorrelator {
    flows: Mutex<Vec<Flow>>,
    dropped_responses: AtomicU64,
}

impl FlowCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Flow>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ingest one fragment
    pub fn ingest(&self, fragment: FlowFragment) -> IngestOutcome {
        if !fragment.has_request() && !fragment.has_response() {
            return IngestOutcome::Ignored;
        }

        let mut flows = self.lock();

        if fragment.has_request() {
            let seq = flows.len() as u64 + 1;
            let flow = Flow::from_fragment(seq, fragment);
            tracing::debug!(flow = %flow.id, seq, "Added request flow");
            flows.push(flow.clone());
            return IngestOutcome::Appended(flow);
        }

        match flows
            .iter_mut()
            .find(|f| f.id == fragment.uuid && !f.has_response())
        {
            Some(flow) => {
                flow.set_response(fragment.response);
                tracing::debug!(flow = %flow.id, seq = flow.seq, "Matched response to request");
                IngestOutcome::Attached(flow.clone())
            }
            None => {
                let dropped = self.dropped_responses.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    flow = %fragment.uuid,
                    dropped,
                    "No waiting request for response; dropped"
                );
                IngestOutcome::Dropped
            }
        }
    }

    /// Ingest a batch, returning the flows that changed in arrival order
    pub fn ingest_batch(&self, fragments: impl IntoIterator<Item = FlowFragment>) -> Vec<Flow> {
        fragments
            .into_iter()
            .filter_map(|fragment| self.ingest(fragment).changed_flow())
            .collect()
    }

    /// Copy of all flows in insertion order
    pub fn snapshot(&self) -> Vec<Flow> {
        self.lock().clone()
    }

    /// Flow at a 1-based position
    pub fn get(&self, seq: u64) -> Option<Flow> {
        let index = usize::try_from(seq.checked_sub(1)?).ok()?;
        self.lock().get(index).cloned()
    }

    /// Number of flows
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Responses discarded because no request was waiting
    pub fn dropped_responses(&self) -> u64 {
        self.dropped_responses.load(Ordering::Relaxed)
    }
}
