//! # Sluice I/O - Consumer Implementations
//!
//! Every source plugin of the daemon lives here, one module per
//! transport, all built on the framing engine and lifecycle contract
//! from `sluice-core`.
//!
//! ## Consumers
//!
//! - **console**: stdin / named pipes
//! - **file**: tailing with glob support, rotation detection and
//!   persisted offsets
//! - **socket** / **proxy**: TCP, UDP and UNIX servers, optionally
//!   acknowledging (socket) or answering through per-message reply
//!   handles (proxy)
//! - **http**: HTTP(S) ingestion with BasicAuth
//! - **syslog**: RFC3164 / RFC5424 / RFC6587 servers
//! - **kafka** / **kinesis**: positioned partition/shard readers with
//!   offset sidecars
//! - **pcap_http**: passive HTTP request reconstruction from packet
//!   captures
//! - **profiler**: synthetic load generation
//! - **loopback**: retry-queue re-routing

use anyhow::Result;
use sluice_core::{ConsumerSpec, Source};

/// Listener address parsing
pub mod net;

/// Stdout debug sink
pub mod sink_stdout;

/// Console / named-pipe reader
pub mod source_console;

/// File scraper with rotation detection and offset persistence
pub mod source_file;

/// HTTP(S) ingestion endpoint
pub mod source_http;

/// Kafka topic consumer
pub mod source_kafka;

/// AWS Kinesis shard consumer
pub mod source_kinesis;

/// Retry-queue loopback router
pub mod source_loopback;

/// Passive HTTP capture reconstruction
pub mod source_pcap;

/// Synthetic load generator
pub mod source_profiler;

/// Bidirectional socket server
pub mod source_proxy;

/// Socket server (TCP/UDP/UNIX)
pub mod source_socket;

/// Syslog server
pub mod source_syslog;

/// TCP sequence reassembly
pub mod tcp_assembly;

/// Instantiate the consumer a spec describes. Configuration problems
/// (bad regexes, addresses, framing modes, missing credential files)
/// surface here, before anything runs.
pub fn create_consumer(spec: &ConsumerSpec) -> Result<Box<dyn Source>> {
    match spec {
        ConsumerSpec::Console(spec) => Ok(Box::new(source_console::ConsoleSource::try_new(
            spec.clone(),
        )?)),
        ConsumerSpec::File(spec) => Ok(Box::new(source_file::FileSource::try_new(spec.clone())?)),
        ConsumerSpec::Socket(spec) => Ok(Box::new(source_socket::SocketSource::try_new(
            spec.clone(),
        )?)),
        ConsumerSpec::Proxy(spec) => {
            Ok(Box::new(source_proxy::ProxySource::try_new(spec.clone())?))
        }
        ConsumerSpec::Http(spec) => Ok(Box::new(source_http::HttpSource::try_new(spec.clone())?)),
        ConsumerSpec::Syslog(spec) => Ok(Box::new(source_syslog::SyslogSource::try_new(
            spec.clone(),
        )?)),
        ConsumerSpec::PcapHttp(spec) => Ok(Box::new(source_pcap::PcapHttpSource::try_new(
            spec.clone(),
        )?)),
        ConsumerSpec::Kafka(spec) => {
            Ok(Box::new(source_kafka::KafkaSource::try_new(spec.clone())?))
        }
        ConsumerSpec::Kinesis(spec) => Ok(Box::new(source_kinesis::KinesisSource::try_new(
            spec.clone(),
        )?)),
        ConsumerSpec::Profiler(spec) => Ok(Box::new(source_profiler::ProfilerSource::try_new(
            spec.clone(),
        )?)),
        ConsumerSpec::Loopback(spec) => Ok(Box::new(source_loopback::LoopbackSource::try_new(
            spec.clone(),
        )?)),
    }
}
