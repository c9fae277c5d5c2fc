//! Message construction, filtering and stream fan-out.
//!
//! A [`Dispatcher`] is the enqueue half every consumer receives at run
//! time: it resolves the consumer's configured stream names once, applies
//! the consumer's filter chain to each message, and performs one bounded
//! send per destination stream. Sends block when the router channel is
//! full, which is the back-pressure contract.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::filter::{apply_chain, Filter, Verdict};
use crate::message::{Message, Metadata, ReplyTx, MAX_PAYLOAD};
use crate::runtime::Runtime;
use crate::stream::StreamId;
use crate::SluiceError;

/// Sender half of the router channel.
pub type MessageTx = mpsc::Sender<Message>;
/// Receiver half of the router channel.
pub type MessageRx = mpsc::Receiver<Message>;

/// Default router channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8192;

struct DispatchInner {
    consumer: String,
    streams: Vec<StreamId>,
    filters: Mutex<Vec<Box<dyn Filter>>>,
    router: MessageTx,
    runtime: Runtime,
    set_metadata: bool,
}

/// Cheap-clone handle shared by all workers of one consumer.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl Dispatcher {
    pub fn new(
        consumer: &str,
        stream_names: &[String],
        filters: Vec<Box<dyn Filter>>,
        router: MessageTx,
        runtime: Runtime,
        set_metadata: bool,
    ) -> Self {
        let streams = stream_names
            .iter()
            .map(|name| runtime.registry().register(name))
            .collect();
        Self {
            inner: Arc::new(DispatchInner {
                consumer: consumer.to_string(),
                streams,
                filters: Mutex::new(filters),
                router,
                runtime,
                set_metadata,
            }),
        }
    }

    /// Whether the consumer should attach source metadata to messages.
    pub fn wants_metadata(&self) -> bool {
        self.inner.set_metadata
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Stream ids this consumer is configured to post to.
    pub fn streams(&self) -> &[StreamId] {
        &self.inner.streams
    }

    /// Wrap `payload` in a message and route it to every configured
    /// stream. Blocks when the router channel is full.
    pub async fn enqueue(&self, payload: Bytes) -> Result<()> {
        self.enqueue_message(Message::new(payload, StreamId::INVALID))
            .await
    }

    pub async fn enqueue_with_metadata(&self, payload: Bytes, metadata: Metadata) -> Result<()> {
        self.enqueue_message(Message::new(payload, StreamId::INVALID).with_metadata(metadata))
            .await
    }

    pub async fn enqueue_with_reply(
        &self,
        payload: Bytes,
        metadata: Option<Metadata>,
        reply: ReplyTx,
    ) -> Result<()> {
        let mut msg = Message::new(payload, StreamId::INVALID).with_reply(reply);
        msg.metadata = metadata;
        self.enqueue_message(msg).await
    }

    /// Route an already-built message. When the message carries the
    /// invalid sentinel it is fanned out to the consumer's configured
    /// streams; a message with an explicit stream (loopback re-emission)
    /// goes only there.
    pub async fn enqueue_message(&self, mut msg: Message) -> Result<()> {
        if msg.payload.len() > MAX_PAYLOAD {
            warn!(
                consumer = %self.inner.consumer,
                len = msg.payload.len(),
                "dropping oversized payload"
            );
            return Ok(());
        }

        let explicit = msg.stream.is_valid();
        if !explicit {
            msg.stream = *self.inner.streams.first().unwrap_or(&crate::stream::DROPPED);
        }

        let verdict = {
            let mut filters = self.inner.filters.lock().unwrap_or_else(|e| e.into_inner());
            apply_chain(&mut filters, &mut msg)
        };

        match verdict {
            Verdict::Reject => return Ok(()),
            Verdict::Reroute(stream) => {
                msg.stream = stream;
                return self.send(msg).await;
            }
            Verdict::Accept => {}
        }

        metrics::counter!("messages_enqueued", 1, "consumer" => self.inner.consumer.clone());

        if explicit || self.inner.streams.len() <= 1 {
            return self.send(msg).await;
        }
        // Fan-out: one message per configured stream, cloned payloads are
        // cheap (shared byte buffers).
        for stream in &self.inner.streams[1..] {
            let mut copy = msg.clone();
            copy.stream = *stream;
            self.send(copy).await?;
        }
        self.send(msg).await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.inner
            .router
            .send(msg)
            .await
            .map_err(|_| SluiceError::ChannelClosed("router").into())
    }

    /// Hand a message back to the retry queue (sink-side drop path).
    pub fn re_enqueue(&self, msg: Message) -> Result<()> {
        self.inner.runtime.retry(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamId;

    struct RejectAll;
    impl Filter for RejectAll {
        fn name(&self) -> &str {
            "reject-all"
        }
        fn apply(&mut self, _msg: &mut Message) -> Verdict {
            Verdict::Reject
        }
    }

    fn dispatcher(
        streams: &[&str],
        filters: Vec<Box<dyn Filter>>,
        capacity: usize,
    ) -> (Dispatcher, MessageRx) {
        let runtime = Runtime::new(16);
        let (tx, rx) = mpsc::channel(capacity);
        let names: Vec<String> = streams.iter().map(|s| s.to_string()).collect();
        (
            Dispatcher::new("test", &names, filters, tx, runtime, false),
            rx,
        )
    }

    #[tokio::test]
    async fn enqueue_fans_out_to_all_streams() {
        let (out, mut rx) = dispatcher(&["a", "b"], Vec::new(), 8);
        out.enqueue(Bytes::from_static(b"x")).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let mut streams = vec![first.stream, second.stream];
        streams.sort();
        let mut expected = vec![StreamId::from_name("a"), StreamId::from_name("b")];
        expected.sort();
        assert_eq!(streams, expected);
        assert_eq!(first.payload, second.payload);
    }

    #[tokio::test]
    async fn rejected_messages_never_reach_the_router() {
        let (out, mut rx) = dispatcher(&["a"], vec![Box::new(RejectAll)], 8);
        out.enqueue(Bytes::from_static(b"x")).await.unwrap();
        drop(out);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn explicit_stream_bypasses_fan_out() {
        let (out, mut rx) = dispatcher(&["a", "b"], Vec::new(), 8);
        let msg = Message::new("y", StreamId::from_name("other"));
        out.enqueue_message(msg).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.stream, StreamId::from_name("other"));
        assert!(rx.try_recv().is_err());
    }
}
