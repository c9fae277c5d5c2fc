//! Debug sink: drains the router channel to stdout.

use anyhow::Result;
use sluice_core::{MessageRx, Runtime};
use tokio_util::sync::CancellationToken;

pub struct StdoutSink {
    runtime: Runtime,
}

impl StdoutSink {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    /// `stream<TAB>payload` per message, lossily decoded.
    pub async fn run(self, mut rx: MessageRx, cancel: CancellationToken) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain what producers already committed.
                    while let Ok(msg) = rx.try_recv() {
                        self.print(&msg);
                    }
                    return Ok(());
                }
                msg = rx.recv() => msg,
            };
            match msg {
                Some(msg) => self.print(&msg),
                None => return Ok(()),
            }
        }
    }

    fn print(&self, msg: &sluice_core::Message) {
        let stream = self.runtime.registry().describe(msg.stream);
        println!("{stream}\t{}", String::from_utf8_lossy(&msg.payload));
    }
}
