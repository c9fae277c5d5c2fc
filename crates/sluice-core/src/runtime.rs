//! The process-wide context handle.
//!
//! Everything that would otherwise be a global (stream registry, retry
//! queue, shutdown signal) lives behind one cheaply clonable [`Runtime`]
//! threaded through constructors.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::message::Message;
use crate::stream::StreamRegistry;
use crate::SluiceError;

/// Default retry queue capacity.
pub const DEFAULT_RETRY_CAPACITY: usize = 8192;

struct RuntimeInner {
    registry: StreamRegistry,
    retry_tx: mpsc::Sender<Message>,
    retry_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(retry_capacity: usize) -> Self {
        let (retry_tx, retry_rx) = mpsc::channel(retry_capacity.max(1));
        Self {
            inner: Arc::new(RuntimeInner {
                registry: StreamRegistry::new(),
                retry_tx,
                retry_rx: Mutex::new(Some(retry_rx)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.inner.registry
    }

    /// Post a message onto the retry queue (multi-producer side, used by
    /// sinks on drop-timeout). Non-blocking: when the queue is full the
    /// message goes to the floor with a warning, matching the queue's
    /// role as a best-effort back-flow channel.
    pub fn retry(&self, msg: Message) -> Result<()> {
        match self.inner.retry_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("retry queue full, dropping message");
                metrics::counter!("retry_dropped", 1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SluiceError::ChannelClosed("retry queue").into())
            }
        }
    }

    /// Take the single consumer side of the retry queue. Only the
    /// loopback consumer calls this; the second caller gets `None`.
    pub fn take_retry_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner
            .retry_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Process-wide shutdown signal. Consumer run states derive their
    /// local tokens from this.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Request an orderly process shutdown (profiler end-of-run, fatal
    /// worker panic).
    pub fn request_shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamId;

    #[tokio::test]
    async fn retry_queue_is_single_consumer() {
        let runtime = Runtime::new(4);
        assert!(runtime.take_retry_receiver().is_some());
        assert!(runtime.take_retry_receiver().is_none());
    }

    #[tokio::test]
    async fn retry_round_trips_messages() {
        let runtime = Runtime::new(4);
        let mut rx = runtime.take_retry_receiver().unwrap();
        runtime
            .retry(Message::new("x", StreamId::from_name("s")))
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload.as_ref(), b"x");
    }
}
