//! Console / named-pipe consumer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::{
    BufferedReader, ConsoleSpec, ControlSlot, Dispatcher, FrameError, Metadata, Plugin, RunState,
    Source,
};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reads stdin or a named pipe, frames records and enqueues them.
pub struct ConsoleSource {
    spec: ConsoleSpec,
}

impl ConsoleSource {
    pub fn try_new(spec: ConsoleSpec) -> Result<Self> {
        spec.framing.build()?;
        Ok(Self { spec })
    }

    async fn read_loop<R>(
        spec: ConsoleSpec,
        mut src: R,
        out: Dispatcher,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = BufferedReader::new(spec.framing.build()?, spec.framing.max_frame());
        let mut frames: Vec<Bytes> = Vec::new();

        loop {
            let mut on_frame = |f: &[u8]| frames.push(Bytes::copy_from_slice(f));
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_from(&mut src, &mut on_frame) => read,
            };
            match read {
                Ok(_) => {}
                Err(FrameError::Eof) => {
                    reader.flush(&mut |f| frames.push(Bytes::copy_from_slice(f)));
                    for frame in frames.drain(..) {
                        Self::enqueue(&spec, &out, frame).await?;
                    }
                    debug!(consumer = %spec.common.id, "input reached EOF");
                    if spec.exit_on_eof {
                        out.runtime().request_shutdown();
                    }
                    break;
                }
                Err(err) => return Err(err).context("console read"),
            }
            for frame in frames.drain(..) {
                Self::enqueue(&spec, &out, frame).await?;
            }
        }
        Ok(())
    }

    async fn enqueue(spec: &ConsoleSpec, out: &Dispatcher, frame: Bytes) -> Result<()> {
        if out.wants_metadata() {
            let mut meta = Metadata::new();
            let name = spec
                .pipe
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "stdin".to_string());
            meta.insert("pipename".into(), Bytes::from(name));
            out.enqueue_with_metadata(frame, meta).await
        } else {
            out.enqueue(frame).await
        }
    }
}

impl Plugin for ConsoleSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for ConsoleSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let spec = self.spec.clone();
        let worker_cancel = state.cancel_token();

        match &self.spec.pipe {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("open pipe {}", path.display()))?;
                info!(consumer = %self.name(), pipe = %path.display(), "reading named pipe");
                state.spawn_worker("pipe-read", Self::read_loop(spec, file, out, worker_cancel));
            }
            None => {
                info!(consumer = %self.name(), "reading stdin");
                state.spawn_worker(
                    "stdin-read",
                    Self::read_loop(spec, tokio::io::stdin(), out, worker_cancel),
                );
            }
        }

        state.control_loop(&mut ctl, || {}).await;
        state.wait_workers().await;
        Ok(())
    }
}
