//! The in-line filter contract.
//!
//! Filters run synchronously inside a consumer's enqueue call, in
//! configuration order, after the message is built and before it enters
//! the router. Because they run on the enqueueing task they observe
//! payloads exactly in source order.

use crate::message::Message;
use crate::stream::StreamId;

/// Outcome of applying one filter (or a whole chain) to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the message on unchanged.
    Accept,
    /// Discard the message.
    Reject,
    /// Discard from the configured streams and send to `0` instead.
    Reroute(StreamId),
}

/// One in-line predicate. Implementations may mutate per-filter state
/// (token buckets, sample counters) and may enrich the message's
/// metadata, but must not reorder or buffer messages.
pub trait Filter: Send {
    fn name(&self) -> &str;

    fn apply(&mut self, msg: &mut Message) -> Verdict;
}

/// Run `filters` over `msg` in order, short-circuiting on the first
/// non-accepting verdict.
pub fn apply_chain(filters: &mut [Box<dyn Filter>], msg: &mut Message) -> Verdict {
    for filter in filters.iter_mut() {
        match filter.apply(msg) {
            Verdict::Accept => continue,
            other => {
                metrics::counter!("messages_filtered", 1, "filter" => filter.name().to_string());
                return other;
            }
        }
    }
    Verdict::Accept
}
