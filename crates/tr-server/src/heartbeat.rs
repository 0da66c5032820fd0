//! Agent liveness monitoring
//!
//! The agent reports its container list roughly every second; each report
//! counts as a heartbeat. A background task checks the age of the last
//! heartbeat on a fixed interval and flips the agent to not running once it
//! goes stale.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tr_core::config::ServerConfig;
use tr_core::time::current_time_millis;

use crate::events::{EventSink, ObserverEvent};
use crate::session::Session;

/// Shortest check interval the monitor will tick at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically expires a silent agent
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    /// Check interval
    pub interval: Duration,
    /// Maximum heartbeat age
    pub timeout: Duration,
}

impl HeartbeatMonitor {
    /// Create a new monitor; `interval` is raised to at least 1 ms
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            timeout,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.heartbeat_interval, config.heartbeat_timeout)
    }

    /// Run one check at `now_ms`; returns true if the agent was expired
    pub fn check(&self, session: &Session, events: &EventSink, now_ms: u64) -> bool {
        if !session.check_heartbeat(now_ms, self.timeout) {
            return false;
        }
        tracing::info!("Agent heartbeat older than {:?}; agent not running", self.timeout);
        events.publish(ObserverEvent::AgentRunningChanged(false));
        true
    }

    /// Start the monitoring task
    pub fn spawn_monitor(
        &self,
        session: Arc<Session>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(
                "Heartbeat monitor started (interval: {:?}, timeout: {:?})",
                monitor.interval,
                monitor.timeout
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.check(&session, &events, current_time_millis());
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("Heartbeat monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}
