//! The message value object carried through the pipeline.

use std::time::Instant;

use bytes::Bytes;
use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::stream::StreamId;

/// Largest payload a consumer may enqueue. Sizes are exchanged as signed
/// 32-bit values on several wire formats, so anything above this is a
/// framing bug, not data.
pub const MAX_PAYLOAD: usize = i32::MAX as usize;

/// Ordered key/value annotations attached to a message when the producing
/// consumer has `set_metadata` enabled (keys like `file`, `dir`, `topic`,
/// `hostname`, `pipename`). Insertion order is preserved.
pub type Metadata = IndexMap<String, Bytes>;

/// Back-channel to the client connection a message originated from.
///
/// Only the proxy consumer populates this. The sender does not keep the
/// client alive; writing to a client that has gone away simply fails.
pub type ReplyTx = mpsc::Sender<Bytes>;

/// The unit of transport between consumers, filters and the router.
///
/// A message carries exactly one stream at a time; routing decisions
/// (filter reroutes, loopback remaps) replace the stream rather than
/// accumulating destinations.
#[derive(Debug, Clone)]
pub struct Message {
    /// Owned payload bytes. Immutable once the message is enqueued.
    pub payload: Bytes,
    /// Logical channel this message currently belongs to.
    pub stream: StreamId,
    /// Optional ordered metadata, producer-populated.
    pub metadata: Option<Metadata>,
    /// Response handle back to the originating proxy client.
    pub reply: Option<ReplyTx>,
    /// Monotonic creation timestamp, assigned by the source.
    pub created: Instant,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, stream: StreamId) -> Self {
        Self {
            payload: payload.into(),
            stream,
            metadata: None,
            reply: None,
            created: Instant::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        debug_assert!(metadata.keys().all(|k| !k.is_empty()));
        self.metadata = Some(metadata);
        self
    }

    pub fn with_reply(mut self, reply: ReplyTx) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Metadata value lookup, `None` when no metadata is attached or the
    /// key is absent.
    pub fn meta(&self, key: &str) -> Option<&Bytes> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamId;

    #[test]
    fn metadata_preserves_insertion_order() {
        let mut meta = Metadata::new();
        meta.insert("file".into(), Bytes::from_static(b"app.log"));
        meta.insert("dir".into(), Bytes::from_static(b"/var/log"));
        let msg = Message::new("payload", StreamId::from_name("logs")).with_metadata(meta);

        let keys: Vec<&str> = msg
            .metadata
            .as_ref()
            .unwrap()
            .keys()
            .map(|k| k.as_str())
            .collect();
        assert_eq!(keys, vec!["file", "dir"]);
        assert_eq!(msg.meta("dir").unwrap().as_ref(), b"/var/log");
    }
}
