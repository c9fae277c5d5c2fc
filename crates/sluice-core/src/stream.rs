//! Stream identities and the name registry.
//!
//! Streams are named logical channels; everything past the consumer
//! compares 64-bit ids, while log output wants the human-readable name
//! back. The registry interns both directions and is effectively
//! read-only once configuration has run.

use std::collections::HashMap;
use std::sync::RwLock;

/// Numeric identity of a stream, the FNV-1a hash of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

impl StreamId {
    /// Sentinel for "no stream assigned yet". A message must never leave
    /// a consumer carrying this id.
    pub const INVALID: StreamId = StreamId(0);

    pub const fn from_name(name: &str) -> StreamId {
        let bytes = name.as_bytes();
        let mut hash = FNV_OFFSET;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
            i += 1;
        }
        StreamId(hash)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Matches every stream; consumers configured with `*` post here.
pub const WILDCARD_STREAM: &str = "*";
/// Fallback destination for messages nothing else claimed.
pub const DROPPED_STREAM: &str = "_DROPPED_";
/// The daemon's own log messages.
pub const INTERNAL_STREAM: &str = "_SLUICE_";
/// Messages handed back by sinks for another routing attempt.
pub const RETRY_STREAM: &str = "_RETRY_";

pub const WILDCARD: StreamId = StreamId::from_name(WILDCARD_STREAM);
pub const DROPPED: StreamId = StreamId::from_name(DROPPED_STREAM);
pub const INTERNAL: StreamId = StreamId::from_name(INTERNAL_STREAM);
pub const RETRY: StreamId = StreamId::from_name(RETRY_STREAM);

/// Name interning for stream ids.
pub struct StreamRegistry {
    names: RwLock<HashMap<StreamId, String>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        let registry = Self {
            names: RwLock::new(HashMap::new()),
        };
        for name in [WILDCARD_STREAM, DROPPED_STREAM, INTERNAL_STREAM, RETRY_STREAM] {
            registry.register(name);
        }
        registry
    }

    /// Intern `name`, returning its id. Idempotent.
    pub fn register(&self, name: &str) -> StreamId {
        let id = StreamId::from_name(name);
        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        names.entry(id).or_insert_with(|| name.to_string());
        id
    }

    /// The registered name for `id`, if any.
    pub fn name_of(&self, id: StreamId) -> Option<String> {
        let names = self.names.read().unwrap_or_else(|e| e.into_inner());
        names.get(&id).cloned()
    }

    /// Like [`name_of`](Self::name_of) but falls back to the hex id for
    /// log output on unregistered streams.
    pub fn describe(&self, id: StreamId) -> String {
        self.name_of(id)
            .unwrap_or_else(|| format!("<{:016x}>", id.raw()))
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
