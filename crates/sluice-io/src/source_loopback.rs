//! Loopback consumer: drains the process-wide retry queue and re-routes
//! each message through a configured stream remap table.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::stream::{self, StreamId};
use sluice_core::{ControlSlot, Dispatcher, LoopbackSpec, Message, Plugin, RunState, Source};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct LoopbackSource {
    spec: LoopbackSpec,
}

impl LoopbackSource {
    pub fn try_new(spec: LoopbackSpec) -> Result<Self> {
        Ok(Self { spec })
    }

    /// Resolve the configured name table to ids. The `*` entry is the
    /// fallback route and defaults to `_DROPPED_`.
    fn build_routes(&self, out: &Dispatcher) -> HashMap<StreamId, Vec<StreamId>> {
        let registry = out.runtime().registry();
        let mut routes: HashMap<StreamId, Vec<StreamId>> = HashMap::new();
        for (source, destinations) in &self.spec.routes {
            let source = registry.register(source);
            let destinations = destinations.iter().map(|d| registry.register(d)).collect();
            routes.insert(source, destinations);
        }
        routes
            .entry(stream::WILDCARD)
            .or_insert_with(|| vec![stream::DROPPED]);
        routes
    }
}

impl Plugin for LoopbackSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for LoopbackSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let routes = self.build_routes(&out);

        let Some(retry_rx) = out.runtime().take_retry_receiver() else {
            anyhow::bail!("retry queue already taken: only one loopback consumer may run");
        };
        info!(consumer = %self.name(), routes = routes.len(), "loopback consumer started");

        let worker = LoopbackWorker {
            out,
            routes,
            cancel: state.cancel_token(),
        };
        state.spawn_worker("retry-drain", worker.run(retry_rx));

        state.control_loop(&mut ctl, || {}).await;
        state.wait_workers().await;
        Ok(())
    }
}

struct LoopbackWorker {
    out: Dispatcher,
    routes: HashMap<StreamId, Vec<StreamId>>,
    cancel: CancellationToken,
}

impl LoopbackWorker {
    async fn run(self, mut retry_rx: mpsc::Receiver<Message>) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = retry_rx.recv() => next,
            };
            match next {
                Some(msg) => self.route(msg).await?,
                None => return Ok(()),
            }
        }
        // Drain whatever is still queued before going down.
        while let Ok(msg) = retry_rx.try_recv() {
            self.route(msg).await?;
        }
        Ok(())
    }

    async fn route(&self, mut msg: Message) -> Result<()> {
        let destinations = self
            .routes
            .get(&msg.stream)
            .or_else(|| self.routes.get(&stream::WILDCARD))
            .cloned()
            .unwrap_or_else(|| vec![stream::DROPPED]);
        debug!(
            from = %self.out.runtime().registry().describe(msg.stream),
            n = destinations.len(),
            "re-routing message"
        );
        metrics::counter!("messages_rerouted", 1);

        let (last, rest) = match destinations.split_last() {
            Some(parts) => parts,
            None => return Ok(()),
        };
        for destination in rest {
            let mut copy = msg.clone();
            copy.stream = *destination;
            self.out.enqueue_message(copy).await?;
        }
        msg.stream = *last;
        self.out.enqueue_message(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{control_channel, CommonSpec, Control, Runtime};
    use std::time::Duration;

    #[tokio::test]
    async fn routes_known_streams_and_falls_back_to_dropped() {
        let runtime = Runtime::new(16);
        let (tx, mut rx) = mpsc::channel(64);

        let mut routes = indexmap::IndexMap::new();
        routes.insert("myStream".to_string(), vec!["altStream".to_string()]);
        let spec = LoopbackSpec {
            common: CommonSpec {
                id: "retry".into(),
                streams: vec!["*".into()],
                set_metadata: false,
                filters: Vec::new(),
            },
            routes,
        };

        let out = Dispatcher::new(
            "retry",
            &["*".to_string()],
            Vec::new(),
            tx,
            runtime.clone(),
            false,
        );
        let cancel = runtime.shutdown_token();
        let (handle, ctl) = control_channel();
        let mut source = LoopbackSource::try_new(spec).unwrap();
        let task = tokio::spawn(async move { source.run(out, ctl, cancel).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Known stream goes to its configured destination.
        runtime
            .retry(Message::new("m1", StreamId::from_name("myStream")))
            .unwrap();
        let routed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.stream, StreamId::from_name("altStream"));
        assert_eq!(routed.payload.as_ref(), b"m1");

        // Unknown stream takes the wildcard route to _DROPPED_.
        runtime
            .retry(Message::new("m2", StreamId::from_name("unknownStream")))
            .unwrap();
        let dropped = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dropped.stream, stream::DROPPED);

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_loopback_is_rejected() {
        let runtime = Runtime::new(16);
        let _taken = runtime.take_retry_receiver().unwrap();

        let spec = LoopbackSpec {
            common: CommonSpec {
                id: "retry".into(),
                streams: vec!["*".into()],
                set_metadata: false,
                filters: Vec::new(),
            },
            routes: indexmap::IndexMap::new(),
        };
        let (tx, _rx) = mpsc::channel(8);
        let out = Dispatcher::new(
            "retry",
            &["*".to_string()],
            Vec::new(),
            tx,
            runtime.clone(),
            false,
        );
        let (_handle, ctl) = control_channel();
        let mut source = LoopbackSource::try_new(spec).unwrap();
        assert!(source
            .run(out, ctl, runtime.shutdown_token())
            .await
            .is_err());
    }
}
