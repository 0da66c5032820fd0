//! Per-stream outbound command queues
//!
//! Each command stream gets its own queue. The session keeps the sending
//! half of every queue it has handed out so that shutdown can push a
//! terminator into all of them, including queues that a reconnect has
//! already superseded but whose consumer is still draining.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tr_protocol::Command;

/// Item carried by a command queue
#[derive(Debug)]
enum QueueItem {
    Command(Command),
    /// Ends the consumer without closing the channel
    Terminate,
}

/// Create a queue for stream `generation`
pub(crate) fn command_queue(generation: u64, warn_at: usize) -> (QueueHandle, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));

    let handle = QueueHandle {
        generation,
        tx,
        depth: Arc::clone(&depth),
        warn_at,
    };
    let receiver = CommandReceiver {
        generation,
        rx,
        depth,
        terminated: false,
    };
    (handle, receiver)
}

/// Sending half retained by the session
#[derive(Debug)]
pub(crate) struct QueueHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<QueueItem>,
    depth: Arc<AtomicUsize>,
    warn_at: usize,
}

impl QueueHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueue a command; returns false if the consumer is gone
    pub(crate) fn push(&self, command: Command) -> bool {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;

        if self.tx.send(QueueItem::Command(command)).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        if self.warn_at > 0 && depth >= self.warn_at && depth % self.warn_at == 0 {
            tracing::warn!(
                "Command queue for stream generation {} has {} undelivered commands",
                self.generation,
                depth
            );
        }
        true
    }

    /// Wake the consumer and tell it to stop
    pub(crate) fn terminate(&self) {
        let _ = self.tx.send(QueueItem::Terminate);
    }

    /// Whether the consumer has dropped its receiver
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Receiving half handed to a command stream consumer
#[derive(Debug)]
pub struct CommandReceiver {
    generation: u64,
    rx: mpsc::UnboundedReceiver<QueueItem>,
    depth: Arc<AtomicUsize>,
    terminated: bool,
}

impl CommandReceiver {
    /// Stream generation this queue belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the next command.
    ///
    /// Returns `None` once the session has terminated the queue. Cancel safe.
    pub async fn recv(&mut self) -> Option<Command> {
        if self.terminated {
            return None;
        }

        match self.rx.recv().await {
            Some(QueueItem::Command(command)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Some(command)
            }
            Some(QueueItem::Terminate) | None => {
                self.terminated = true;
                None
            }
        }
    }

    /// Commands waiting in the queue
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tr_protocol::Settings;

    fn set(ids: &[&str]) -> Command {
        Command::SetSettings(Settings::new(ids.iter().map(|s| s.to_string()).collect()))
    }

    #[tokio::test]
    async fn test_commands_delivered_in_order() {
        let (handle, mut rx) = command_queue(1, 0);

        assert!(handle.push(set(&["a"])));
        assert!(handle.push(set(&["b"])));
        assert_eq!(rx.pending(), 2);

        assert_eq!(rx.recv().await, Some(set(&["a"])));
        assert_eq!(rx.recv().await, Some(set(&["b"])));
        assert_eq!(rx.pending(), 0);
    }

    #[tokio::test]
    async fn test_terminate_ends_consumer() {
        let (handle, mut rx) = command_queue(1, 0);

        handle.push(set(&["a"]));
        handle.terminate();
        handle.push(set(&["late"]));

        assert_eq!(rx.recv().await, Some(set(&["a"])));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_terminate_wakes_blocked_consumer() {
        let (handle, mut rx) = command_queue(1, 0);

        let consumer = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        handle.terminate();

        assert_eq!(consumer.await.unwrap(), None);
    }

    #[test]
    fn test_push_after_consumer_dropped() {
        let (handle, rx) = command_queue(1, 0);
        drop(rx);

        assert!(handle.is_closed());
        assert!(!handle.push(set(&["a"])));
        assert_eq!(handle.depth(), 0);
    }

    #[test]
    fn test_backlog_is_tracked() {
        let (handle, _rx) = command_queue(7, 2);
        for _ in 0..5 {
            assert!(handle.push(set(&["a"])));
        }
        assert_eq!(handle.depth(), 5);
        assert_eq!(handle.generation(), 7);
    }
}
