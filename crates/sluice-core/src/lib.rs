//! # Sluice Core
//!
//! Foundational types for the Sluice ingestion daemon: the message model
//! and stream registry, the buffered record-framing engine, the consumer
//! lifecycle contract (control protocol, worker accounting, dispatch) and
//! the pipeline configuration specs.
//!
//! ## Key components
//!
//! - **Message model**: [`Message`] with payload, stream identity,
//!   ordered metadata and an optional reply handle.
//! - **Framing**: [`BufferedReader`] turns arbitrary byte streams into
//!   discrete records (delimiter, fixed-size, binary or ASCII length
//!   prefix) while tracking a persistable read offset.
//! - **Lifecycle**: [`Source`] plugins driven by a [`Dispatcher`], a
//!   single-slot stop-wins [`ControlHandle`] and a [`RunState`] that
//!   contains worker panics.
//! - **Configuration**: YAML specs as closed tagged unions; plugin
//!   instantiation dispatches on the enum, not on reflection.

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod filter;
pub mod message;
pub mod reader;
pub mod runtime;
pub mod stream;

pub use config::{
    CommonSpec, ConsoleSpec, ConsumerSpec, FileSpec, FilterSpec, FramingSpec, HttpSpec, KafkaSpec,
    KinesisSpec, LoopbackSpec, ObserveMode, OffsetStart, PcapSpec, PipelineConfig, ProfilerSpec,
    ProxySpec, SocketSpec, SyslogFormat, SyslogSpec,
};
pub use consumer::{control_channel, Control, ControlHandle, ControlSlot, Plugin, RunState, Source};
pub use dispatch::{Dispatcher, MessageRx, MessageTx, DEFAULT_CHANNEL_CAPACITY};
pub use filter::{apply_chain, Filter, Verdict};
pub use message::{Message, Metadata, ReplyTx, MAX_PAYLOAD};
pub use reader::{BufferedReader, FrameError, Framing, PrefixWidth};
pub use runtime::{Runtime, DEFAULT_RETRY_CAPACITY};
pub use stream::{StreamId, StreamRegistry};

/// Error conditions surfaced by the core pipeline plumbing.
#[derive(Debug, thiserror::Error)]
pub enum SluiceError {
    /// A channel between pipeline stages is unexpectedly closed,
    /// typically because the counterpart has already shut down.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Rejected configuration; fatal before the consumer starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
