//! Consumer lifecycle: traits, control protocol and worker accounting.
//!
//! Every source plugin implements [`Source`] and is driven the same way:
//! the daemon hands it a [`Dispatcher`] for output, a [`ControlSlot`] for
//! lifecycle commands and a cancellation token, then waits on the run
//! future. `run` must return only once every worker the consumer spawned
//! has completed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::dispatch::Dispatcher;

/// Commands understood by every consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Shut down: close sources, drain pending frames, finish workers.
    Stop,
    /// Re-open rotated resources (file consumer on SIGHUP); a no-op for
    /// consumers without a roll callback.
    Roll,
}

/// Base identification shared by sources and filters.
pub trait Plugin {
    fn name(&self) -> &str;
}

/// A source plugin. `run` is the whole lifecycle: set up, spawn workers,
/// serve control commands, tear down.
#[async_trait]
pub trait Source: Plugin + Send {
    async fn run(
        &mut self,
        out: Dispatcher,
        ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Sender side of a consumer's single-slot control channel. A newer
/// command overwrites an unseen one, except that a pending Stop is never
/// replaced: Stop always wins.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Arc<watch::Sender<Option<Control>>>,
}

/// Receiver side, owned by the consumer.
pub struct ControlSlot {
    rx: watch::Receiver<Option<Control>>,
}

pub fn control_channel() -> (ControlHandle, ControlSlot) {
    let (tx, rx) = watch::channel(None);
    (ControlHandle { tx: Arc::new(tx) }, ControlSlot { rx })
}

impl ControlHandle {
    pub fn signal(&self, cmd: Control) {
        if *self.tx.borrow() == Some(Control::Stop) {
            return;
        }
        let _ = self.tx.send(Some(cmd));
    }
}

impl ControlSlot {
    /// Wait for the next command. A dropped handle counts as Stop.
    pub async fn recv(&mut self) -> Control {
        loop {
            if self.rx.changed().await.is_err() {
                return Control::Stop;
            }
            if let Some(cmd) = *self.rx.borrow_and_update() {
                return cmd;
            }
        }
    }
}

/// Per-consumer run state: the worker tracker, the consumer-local
/// cancellation token (a child of the process token) and the paused flag.
/// Clones share all of it, so accept loops can hand the state to the
/// workers they spawn.
#[derive(Clone)]
pub struct RunState {
    name: String,
    process: CancellationToken,
    cancel: CancellationToken,
    workers: TaskTracker,
    paused: Arc<AtomicBool>,
}

impl RunState {
    pub fn new(name: &str, process: &CancellationToken) -> Self {
        Self {
            name: name.to_string(),
            process: process.clone(),
            cancel: process.child_token(),
            workers: TaskTracker::new(),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Consumer-local done signal, checked between loop iterations.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn paused_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    /// Spawn a worker on this consumer's tracker. A worker panic is
    /// contained: it is logged, counted and converted into a process-wide
    /// shutdown request instead of aborting the process. Errors returned
    /// while shutdown is already in progress are suppressed.
    pub fn spawn_worker<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.workers.spawn(fut);
        let consumer = self.name.clone();
        let cancel = self.cancel.clone();
        let process = self.process.clone();
        self.workers.spawn(async move {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if !cancel.is_cancelled() {
                        error!(consumer = %consumer, worker = label, error = ?err, "worker failed");
                    }
                }
                Err(join) if join.is_panic() => {
                    metrics::counter!("worker_panics", 1, "consumer" => consumer.clone());
                    error!(consumer = %consumer, worker = label, "worker panicked, requesting shutdown");
                    process.cancel();
                }
                Err(_) => {}
            }
        });
    }

    /// Wait until every spawned worker has finished.
    pub async fn wait_workers(&self) {
        self.workers.close();
        self.workers.wait().await;
    }

    /// Serve control commands until Stop (or cancellation). Roll invokes
    /// `on_roll`; Stop cancels the consumer subtree and returns.
    pub async fn control_loop(&self, ctl: &mut ControlSlot, mut on_roll: impl FnMut()) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = ctl.recv() => match cmd {
                    Control::Stop => {
                        debug!(consumer = %self.name, "stop received");
                        self.cancel.cancel();
                        break;
                    }
                    Control::Roll => on_roll(),
                },
            }
        }
    }

    /// [`control_loop`](Self::control_loop) with a periodic tick, used by
    /// positioned consumers to flush offset files.
    pub async fn ticker_control_loop(
        &self,
        ctl: &mut ControlSlot,
        interval: Duration,
        mut on_tick: impl FnMut(),
        mut on_roll: impl FnMut(),
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => on_tick(),
                cmd = ctl.recv() => match cmd {
                    Control::Stop => {
                        debug!(consumer = %self.name, "stop received");
                        self.cancel.cancel();
                        break;
                    }
                    Control::Roll => on_roll(),
                },
            }
        }
    }
}
