//! Agent session state
//!
//! One [`Session`] exists per server process. It owns the intercept
//! settings, the command queues of every stream handed out, the stream
//! state machine and the agent liveness flag. All of it sits behind one
//! lock, so reconnects, settings updates, heartbeats and shutdown observe
//! each other's effects atomically.
//!
//! Stream lifecycle:
//!
//! ```text
//! Disconnected -> AwaitingFirstMessage -> Streaming -> Disconnected
//!                                                \--> Closed (stop)
//! ```

mod queue;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tr_core::time::millis_between;
use tr_core::SessionError;
use tr_protocol::{Command, Settings};

use queue::{command_queue, QueueHandle};

pub use queue::CommandReceiver;

/// Command stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No command stream open
    Disconnected,
    /// Stream opened, waiting for the agent's handshake
    AwaitingFirstMessage,
    /// Commands flow to the agent
    Streaming,
    /// Session stopped; no further streams
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    state: StreamState,
    settings: Settings,
    /// Queue of the newest stream
    current: Option<QueueHandle>,
    /// Queues replaced by a reconnect whose consumers may still be draining
    superseded: Vec<QueueHandle>,
    next_generation: u64,
    /// Streams between `begin_handshake` and attach or abort
    pending_handshakes: usize,
    last_heartbeat: Option<u64>,
    running: bool,
}

/// Shared agent session
#[derive(Debug)]
pub struct Session {
    inner: Mutex<SessionInner>,
    backlog_warn: usize,
}

impl Session {
    /// Create a session; queues warn once `backlog_warn` commands pile up
    pub fn new(backlog_warn: usize) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: StreamState::Disconnected,
                settings: Settings::default(),
                current: None,
                superseded: Vec::new(),
                next_generation: 1,
                pending_handshakes: 0,
                last_heartbeat: None,
                running: false,
            }),
            backlog_warn,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current stream state
    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    /// Note a stream waiting for its handshake, returning the prior state.
    ///
    /// Only a disconnected session moves to `AwaitingFirstMessage`; a live
    /// stream keeps the session `Streaming` until the newcomer attaches.
    pub fn begin_handshake(&self) -> StreamState {
        let mut inner = self.lock();
        let prior = inner.state;
        if prior == StreamState::Closed {
            return prior;
        }
        inner.pending_handshakes += 1;
        if prior == StreamState::Disconnected {
            inner.state = StreamState::AwaitingFirstMessage;
        }
        prior
    }

    /// Undo [`begin_handshake`](Self::begin_handshake) after a failed handshake.
    ///
    /// `prior` is only restored while it still holds: a `Streaming` prior
    /// whose consumer has since gone leaves the session `Disconnected`, and
    /// other pending handshakes keep it `AwaitingFirstMessage`.
    pub fn abort_handshake(&self, prior: StreamState) {
        let mut inner = self.lock();
        inner.pending_handshakes = inner.pending_handshakes.saturating_sub(1);
        if inner.state != StreamState::AwaitingFirstMessage || inner.pending_handshakes > 0 {
            return;
        }

        let live = inner.current.as_ref().is_some_and(|q| !q.is_closed());
        inner.state = match prior {
            StreamState::Streaming if live => StreamState::Streaming,
            _ => StreamState::Disconnected,
        };
    }

    /// Attach a new command stream.
    ///
    /// Creates a fresh queue, makes it current and enqueues the latest
    /// settings onto it before any other command can be pushed, so the agent
    /// always starts from the current allow-list.
    pub fn attach_stream(&self) -> Result<CommandReceiver, SessionError> {
        let mut inner = self.lock();
        if inner.state == StreamState::Closed {
            return Err(SessionError::Closed);
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let (handle, receiver) = command_queue(generation, self.backlog_warn);
        handle.push(Command::SetSettings(inner.settings.clone()));

        if let Some(previous) = inner.current.replace(handle) {
            tracing::debug!(
                "Stream generation {} supersedes generation {}",
                generation,
                previous.generation()
            );
            inner.superseded.push(previous);
        }
        inner.superseded.retain(|q| !q.is_closed());
        inner.pending_handshakes = inner.pending_handshakes.saturating_sub(1);
        inner.state = StreamState::Streaming;

        Ok(receiver)
    }

    /// Note that the consumer of stream `generation` is gone
    pub fn detach_stream(&self, generation: u64) {
        let mut inner = self.lock();
        let is_current = inner
            .current
            .as_ref()
            .is_some_and(|q| q.generation() == generation);

        if is_current && inner.state == StreamState::Streaming {
            inner.state = StreamState::Disconnected;
        }
        inner.superseded.retain(|q| !q.is_closed());
    }

    /// Replace the allow-list and push it to the current stream
    pub fn set_settings(&self, container_ids: Vec<String>) {
        let mut inner = self.lock();
        inner.settings = Settings::new(container_ids);

        let command = Command::SetSettings(inner.settings.clone());
        let delivered = inner
            .current
            .as_ref()
            .is_some_and(|queue| queue.push(command));
        if !delivered {
            tracing::debug!("No command stream attached; settings go out on the next stream");
        }
    }

    /// Current allow-list
    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    /// Close the session and wake every command stream consumer.
    ///
    /// Idempotent. Returns the number of queues terminated by this call.
    pub fn stop(&self) -> usize {
        let mut inner = self.lock();
        if inner.state == StreamState::Closed {
            return 0;
        }
        inner.state = StreamState::Closed;

        let mut terminated = 0;
        if let Some(current) = inner.current.take() {
            let pending = current.depth();
            if pending > 0 {
                tracing::debug!(
                    "Stream generation {} stopped with {} undelivered commands",
                    current.generation(),
                    pending
                );
            }
            current.terminate();
            terminated += 1;
        }
        for queue in inner.superseded.drain(..) {
            queue.terminate();
            terminated += 1;
        }
        terminated
    }

    /// Record evidence that the agent is alive.
    ///
    /// Returns true if the agent was not considered running before.
    pub fn record_heartbeat(&self, now_ms: u64) -> bool {
        let mut inner = self.lock();
        inner.last_heartbeat = Some(now_ms);
        let became_running = !inner.running;
        inner.running = true;
        became_running
    }

    /// Expire the agent if its last heartbeat is older than `timeout`.
    ///
    /// Returns true if this call flipped the agent to not running.
    pub fn check_heartbeat(&self, now_ms: u64, timeout: Duration) -> bool {
        let mut inner = self.lock();
        if !inner.running {
            return false;
        }

        let expired = match inner.last_heartbeat {
            Some(last) => millis_between(last, now_ms) > timeout.as_millis() as u64,
            None => false,
        };
        if expired {
            inner.running = false;
            inner.last_heartbeat = None;
        }
        expired
    }

    /// Whether the agent is considered running
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Time of the last heartbeat in milliseconds since the epoch
    pub fn last_heartbeat(&self) -> Option<u64> {
        self.lock().last_heartbeat
    }

    /// Queues that a stop would still have to terminate
    pub fn live_queues(&self) -> usize {
        let inner = self.lock();
        inner.current.iter().count() + inner.superseded.len()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn set(values: &[&str]) -> Command {
        Command::SetSettings(Settings::new(ids(values)))
    }

    #[test]
    fn test_initial_state() {
        let session = Session::default();
        assert_eq!(session.state(), StreamState::Disconnected);
        assert!(!session.is_running());
        assert!(session.settings().container_ids.is_empty());
        assert_eq!(session.live_queues(), 0);
    }

    #[tokio::test]
    async fn test_attach_resyncs_settings() {
        let session = Session::default();
        session.set_settings(ids(&["abc"]));

        let mut rx = session.attach_stream().unwrap();
        assert_eq!(session.state(), StreamState::Streaming);
        assert_eq!(rx.recv().await, Some(set(&["abc"])));
    }

    #[tokio::test]
    async fn test_reconnect_sends_latest_settings_first() {
        let session = Session::default();

        let first = session.attach_stream().unwrap();
        session.set_settings(ids(&["a"]));
        session.set_settings(ids(&["a", "b"]));
        drop(first);
        session.detach_stream(1);
        assert_eq!(session.state(), StreamState::Disconnected);

        let mut second = session.attach_stream().unwrap();
        assert_eq!(second.generation(), 2);
        assert_eq!(second.recv().await, Some(set(&["a", "b"])));
    }

    #[tokio::test]
    async fn test_settings_go_to_newest_stream() {
        let session = Session::default();

        let mut old = session.attach_stream().unwrap();
        let mut new = session.attach_stream().unwrap();
        session.set_settings(ids(&["x"]));

        assert_eq!(old.recv().await, Some(set(&[])));
        assert_eq!(new.recv().await, Some(set(&[])));
        assert_eq!(new.recv().await, Some(set(&["x"])));
        assert_eq!(old.pending(), 0);
    }

    #[test]
    fn test_detach_of_superseded_stream_keeps_streaming() {
        let session = Session::default();
        let _old = session.attach_stream().unwrap();
        let _new = session.attach_stream().unwrap();

        session.detach_stream(1);
        assert_eq!(session.state(), StreamState::Streaming);
    }

    #[test]
    fn test_closed_superseded_queues_are_pruned() {
        let session = Session::default();
        let first = session.attach_stream().unwrap();
        let _second = session.attach_stream().unwrap();
        assert_eq!(session.live_queues(), 2);

        drop(first);
        session.detach_stream(1);
        assert_eq!(session.live_queues(), 1);
    }

    #[test]
    fn test_handshake_abort_restores_prior_state() {
        let session = Session::default();

        let prior = session.begin_handshake();
        assert_eq!(prior, StreamState::Disconnected);
        assert_eq!(session.state(), StreamState::AwaitingFirstMessage);

        session.abort_handshake(prior);
        assert_eq!(session.state(), StreamState::Disconnected);
    }

    #[test]
    fn test_handshake_abort_while_streaming() {
        let session = Session::default();
        let _rx = session.attach_stream().unwrap();

        let prior = session.begin_handshake();
        session.abort_handshake(prior);
        assert_eq!(session.state(), StreamState::Streaming);
    }

    #[test]
    fn test_handshake_while_streaming_keeps_state() {
        let session = Session::default();
        let _rx = session.attach_stream().unwrap();

        assert_eq!(session.begin_handshake(), StreamState::Streaming);
        assert_eq!(session.state(), StreamState::Streaming);
    }

    #[test]
    fn test_abort_after_live_stream_left_is_disconnected() {
        let session = Session::default();
        let first = session.attach_stream().unwrap();

        let prior = session.begin_handshake();
        assert_eq!(prior, StreamState::Streaming);

        // the live stream's agent goes away while the newcomer waits
        drop(first);
        session.detach_stream(1);
        assert_eq!(session.state(), StreamState::Disconnected);

        session.abort_handshake(prior);
        assert_eq!(session.state(), StreamState::Disconnected);
    }

    #[test]
    fn test_stale_streaming_prior_is_not_restored() {
        let session = Session::default();
        let first = session.attach_stream().unwrap();
        let stale = session.begin_handshake();

        drop(first);
        session.detach_stream(1);
        let fresh = session.begin_handshake();
        assert_eq!(fresh, StreamState::Disconnected);
        assert_eq!(session.state(), StreamState::AwaitingFirstMessage);

        // the newer handshake is still pending
        session.abort_handshake(stale);
        assert_eq!(session.state(), StreamState::AwaitingFirstMessage);

        session.abort_handshake(fresh);
        assert_eq!(session.state(), StreamState::Disconnected);
    }

    #[test]
    fn test_attach_settles_pending_handshake() {
        let session = Session::default();
        session.begin_handshake();
        let _rx = session.attach_stream().unwrap();

        // a second stream that then fails leaves the first one streaming
        let prior = session.begin_handshake();
        session.abort_handshake(prior);
        assert_eq!(session.state(), StreamState::Streaming);
    }

    #[tokio::test]
    async fn test_stop_terminates_every_queue() {
        let session = Arc::new(Session::default());
        let mut old = session.attach_stream().unwrap();
        let mut new = session.attach_stream().unwrap();

        // drain the resync commands so both consumers block
        old.recv().await;
        new.recv().await;

        let waiters = [old, new].map(|mut rx| tokio::spawn(async move { rx.recv().await }));
        tokio::task::yield_now().await;

        assert_eq!(session.stop(), 2);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
        assert_eq!(session.state(), StreamState::Closed);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let session = Session::default();
        let _rx = session.attach_stream().unwrap();

        assert_eq!(session.stop(), 1);
        assert_eq!(session.stop(), 0);
        assert_eq!(session.live_queues(), 0);
    }

    #[test]
    fn test_attach_after_stop_fails() {
        let session = Session::default();
        session.stop();

        assert_eq!(session.attach_stream().unwrap_err(), SessionError::Closed);
        assert_eq!(session.begin_handshake(), StreamState::Closed);
        assert_eq!(session.state(), StreamState::Closed);
    }

    #[test]
    fn test_settings_recorded_after_stop() {
        let session = Session::default();
        session.stop();
        session.set_settings(ids(&["a"]));
        assert_eq!(session.settings(), Settings::new(ids(&["a"])));
    }

    #[test]
    fn test_heartbeat_marks_running_once() {
        let session = Session::default();

        assert!(session.record_heartbeat(1_000));
        assert!(!session.record_heartbeat(1_100));
        assert!(session.is_running());
        assert_eq!(session.last_heartbeat(), Some(1_100));
    }

    #[test]
    fn test_heartbeat_expiry() {
        let session = Session::default();
        let timeout = Duration::from_secs(1);

        session.record_heartbeat(10_000);
        assert!(!session.check_heartbeat(10_900, timeout));
        assert!(!session.check_heartbeat(11_000, timeout));
        assert!(session.is_running());

        assert!(session.check_heartbeat(11_500, timeout));
        assert!(!session.is_running());
        assert_eq!(session.last_heartbeat(), None);

        // already expired; no second transition
        assert!(!session.check_heartbeat(12_000, timeout));
    }

    #[test]
    fn test_check_without_heartbeat_is_noop() {
        let session = Session::default();
        assert!(!session.check_heartbeat(50_000, Duration::from_secs(1)));
        assert!(!session.is_running());
    }
}
