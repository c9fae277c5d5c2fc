//! Pipeline configuration.
//!
//! One YAML document describes the daemon: a list of consumer specs, each
//! an internally tagged union carrying the common options (id, streams,
//! metadata flag, filter chain) plus plugin-specific options with their
//! defaults. Specs validate into runtime types (framing modes, offset
//! starts) before any consumer runs; a bad spec is fatal at startup.
//!
//! # Example
//!
//! ```yaml
//! name: "edge-ingest"
//! consumers:
//!   - type: file
//!     id: "app-log"
//!     streams: ["app"]
//!     path: "/var/log/app/*.log"
//!     offset_file: "/var/lib/sluice/app.offset"
//!   - type: socket
//!     id: "bulk"
//!     streams: ["bulk"]
//!     address: "tcp://0.0.0.0:5880"
//!     acknowledge: "OK"
//!     filters:
//!       - type: rate
//!         messages_per_sec: 1000
//! ```

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::reader::{Framing, PrefixWidth};
use crate::SluiceError;

/// Complete daemon specification loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Human-readable name of the pipeline.
    pub name: String,

    /// Consumer instances to run.
    pub consumers: Vec<ConsumerSpec>,
}

/// Options every consumer carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonSpec {
    /// Unique identifier for this consumer instance.
    pub id: String,

    /// Stream names every produced message is tagged with.
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,

    /// Attach source metadata (file, dir, topic, ...) to messages.
    #[serde(default)]
    pub set_metadata: bool,

    /// In-line filters applied inside enqueue, in order.
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

fn default_streams() -> Vec<String> {
    vec![crate::stream::WILDCARD_STREAM.to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConsumerSpec {
    #[serde(rename = "console")]
    Console(ConsoleSpec),
    #[serde(rename = "file")]
    File(FileSpec),
    #[serde(rename = "socket")]
    Socket(SocketSpec),
    #[serde(rename = "proxy")]
    Proxy(ProxySpec),
    #[serde(rename = "http")]
    Http(HttpSpec),
    #[serde(rename = "syslog")]
    Syslog(SyslogSpec),
    #[serde(rename = "pcap_http")]
    PcapHttp(PcapSpec),
    #[serde(rename = "kafka")]
    Kafka(KafkaSpec),
    #[serde(rename = "kinesis")]
    Kinesis(KinesisSpec),
    #[serde(rename = "profiler")]
    Profiler(ProfilerSpec),
    #[serde(rename = "loopback")]
    Loopback(LoopbackSpec),
}

impl ConsumerSpec {
    pub fn common(&self) -> &CommonSpec {
        match self {
            ConsumerSpec::Console(s) => &s.common,
            ConsumerSpec::File(s) => &s.common,
            ConsumerSpec::Socket(s) => &s.common,
            ConsumerSpec::Proxy(s) => &s.common,
            ConsumerSpec::Http(s) => &s.common,
            ConsumerSpec::Syslog(s) => &s.common,
            ConsumerSpec::PcapHttp(s) => &s.common,
            ConsumerSpec::Kafka(s) => &s.common,
            ConsumerSpec::Kinesis(s) => &s.common,
            ConsumerSpec::Profiler(s) => &s.common,
            ConsumerSpec::Loopback(s) => &s.common,
        }
    }
}

/// Record framing configuration shared by byte-oriented consumers.
///
/// `partitioner` selects the mode: `delimiter` (default), `fixed`,
/// `binary` / `binary_le` / `binary_be` (length prefix of `size` bytes,
/// 1/2/4/8; plain `binary` is little-endian) or `ascii` (textual length
/// prefix terminated by `delimiter`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingSpec {
    #[serde(default = "default_partitioner")]
    pub partitioner: String,

    /// Record delimiter; escape sequences `\n`, `\r`, `\t`, `\0` and
    /// `\\` are recognized.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Fixed record size, or the length-prefix width in bytes.
    #[serde(default = "default_size")]
    pub size: usize,

    /// Byte offset of the length prefix within a record header.
    #[serde(default)]
    pub offset: usize,

    /// Upper bound a length prefix may claim before the data is treated
    /// as invalid.
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,

    /// Keep the length prefix and leading offset bytes in the emitted
    /// record instead of stripping them (binary modes only).
    #[serde(default)]
    pub keep_header: bool,
}

fn default_partitioner() -> String {
    "delimiter".to_string()
}

fn default_delimiter() -> String {
    "\n".to_string()
}

fn default_size() -> usize {
    4
}

fn default_max_frame() -> usize {
    1 << 20
}

impl Default for FramingSpec {
    fn default() -> Self {
        Self {
            partitioner: default_partitioner(),
            delimiter: default_delimiter(),
            size: default_size(),
            offset: 0,
            max_frame: default_max_frame(),
            keep_header: false,
        }
    }
}

impl FramingSpec {
    /// Validate into a [`Framing`] mode.
    pub fn build(&self) -> Result<Framing, SluiceError> {
        let keep_header = self.keep_header;
        let delimiter = unescape(&self.delimiter);
        match self.partitioner.as_str() {
            "delimiter" => {
                if delimiter.is_empty() {
                    return Err(SluiceError::Config("empty delimiter".to_string()));
                }
                Ok(Framing::Delimiter { delimiter })
            }
            "fixed" => {
                if self.size == 0 {
                    return Err(SluiceError::Config("fixed record size is 0".to_string()));
                }
                Ok(Framing::FixedSize { size: self.size })
            }
            "binary" | "binary_le" | "binary_be" => {
                let width = PrefixWidth::from_bytes(self.size).ok_or_else(|| {
                    SluiceError::Config(format!(
                        "length prefix width {} not one of 1, 2, 4, 8",
                        self.size
                    ))
                })?;
                Ok(Framing::LengthPrefix {
                    width,
                    big_endian: self.partitioner == "binary_be",
                    offset: self.offset,
                    keep_header,
                })
            }
            "ascii" => {
                if delimiter.is_empty() {
                    return Err(SluiceError::Config("empty delimiter".to_string()));
                }
                Ok(Framing::AsciiPrefix {
                    delimiter,
                    offset: self.offset,
                })
            }
            other => Err(SluiceError::Config(format!("unknown partitioner {other:?}"))),
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

fn unescape(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.bytes();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match chars.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                out.push(other);
            }
            None => out.push(b'\\'),
        }
    }
    out
}

/// Where a positioned consumer starts without a stored offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetStart {
    Oldest,
    Newest,
}

impl Default for OffsetStart {
    fn default() -> Self {
        OffsetStart::Newest
    }
}

/// How the file consumer observes growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserveMode {
    Poll,
    Watch,
}

impl Default for ObserveMode {
    fn default() -> Self {
        ObserveMode::Poll
    }
}

/// Console / named-pipe reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    /// Path of a named pipe to read instead of stdin.
    #[serde(default)]
    pub pipe: Option<PathBuf>,

    #[serde(default)]
    pub framing: FramingSpec,

    /// Request process shutdown when the input reaches EOF.
    #[serde(default)]
    pub exit_on_eof: bool,
}

/// File scraper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    /// File path; `*` and `?` make it a glob re-evaluated periodically.
    pub path: String,

    #[serde(default)]
    pub framing: FramingSpec,

    #[serde(default)]
    pub default_offset: OffsetStart,

    /// Sidecar file persisting the read offset after every message.
    #[serde(default)]
    pub offset_file: Option<PathBuf>,

    #[serde(default)]
    pub observe: ObserveMode,

    #[serde(default = "default_polling_delay_ms")]
    pub polling_delay_ms: u64,

    #[serde(default = "default_dir_scan_interval_sec")]
    pub dir_scan_interval_sec: u64,

    #[serde(default = "default_retry_delay_sec")]
    pub retry_delay_sec: u64,

    /// Glob matches whose path matches this regex are skipped...
    #[serde(default)]
    pub blacklist: Option<String>,

    /// ...unless this regex matches too (whitelist wins).
    #[serde(default)]
    pub whitelist: Option<String>,
}

fn default_polling_delay_ms() -> u64 {
    100
}

fn default_dir_scan_interval_sec() -> u64 {
    10
}

fn default_retry_delay_sec() -> u64 {
    3
}

/// Socket server (TCP, UDP or UNIX).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    /// `[host]:port`, `tcp://...`, `udp://...` or `unix:///path`. Bare
    /// addresses are TCP when `acknowledge` is set, UDP otherwise.
    #[serde(default = "default_socket_address")]
    pub address: String,

    #[serde(default)]
    pub framing: FramingSpec,

    /// Response written after every accepted frame; enables TCP and the
    /// ack protocol. Failed frames get `"NOT " + acknowledge`.
    #[serde(default)]
    pub acknowledge: String,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_read_timeout_sec")]
    pub read_timeout_sec: u64,

    /// Octal file permissions for UNIX sockets.
    #[serde(default)]
    pub permissions: Option<String>,

    #[serde(default = "default_true")]
    pub remove_old_socket: bool,

    /// Concurrent client cap; 0 means unlimited. Excess connections are
    /// closed immediately.
    #[serde(default)]
    pub max_clients: usize,
}

fn default_socket_address() -> String {
    "udp://0.0.0.0:5880".to_string()
}

fn default_ack_timeout_ms() -> u64 {
    2000
}

fn default_read_timeout_sec() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

/// Bidirectional socket server; sinks may write responses back on the
/// originating connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    #[serde(default = "default_proxy_address")]
    pub address: String,

    #[serde(default)]
    pub framing: FramingSpec,

    #[serde(default = "default_read_timeout_sec")]
    pub read_timeout_sec: u64,

    #[serde(default)]
    pub max_clients: usize,
}

fn default_proxy_address() -> String {
    "tcp://0.0.0.0:5880".to_string()
}

/// HTTP(S) ingestion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    #[serde(default = "default_http_address")]
    pub address: String,

    /// Enqueue the whole serialized request; false enqueues the body
    /// only.
    #[serde(default = "default_true")]
    pub with_headers: bool,

    /// htpasswd file enabling BasicAuth (plain or `{SHA256}` entries).
    #[serde(default)]
    pub htpasswd: Option<PathBuf>,

    /// PEM certificate chain; TLS requires `private_key` too.
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

fn default_http_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Syslog record format, which also pins the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyslogFormat {
    #[serde(rename = "rfc3164")]
    Rfc3164,
    #[serde(rename = "rfc5424")]
    Rfc5424,
    #[serde(rename = "rfc6587")]
    Rfc6587,
}

impl Default for SyslogFormat {
    fn default() -> Self {
        SyslogFormat::Rfc3164
    }
}

/// Syslog server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyslogSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    #[serde(default = "default_syslog_address")]
    pub address: String,

    #[serde(default)]
    pub format: SyslogFormat,
}

fn default_syslog_address() -> String {
    "udp://0.0.0.0:514".to_string()
}

/// Passive HTTP request capture from a packet stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcapSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    /// libpcap savefile to read: a capture file, or a FIFO fed by
    /// `tcpdump -w -`.
    pub capture: PathBuf,

    /// Only reassemble flows towards this TCP port; 0 captures all.
    #[serde(default)]
    pub port: u16,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Verify TCP checksums (advisory: failures are logged, packets
    /// kept).
    #[serde(default)]
    pub validate_checksums: bool,
}

fn default_session_timeout_ms() -> u64 {
    3000
}

/// Kafka topic consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    #[serde(default = "default_brokers")]
    pub brokers: String,

    pub topic: String,

    /// Consumer group; when set the client library drives partition
    /// assignment and offset commits and the options below are unused.
    #[serde(default)]
    pub group_id: String,

    /// Read partitions round-robin from a single worker instead of one
    /// worker per partition.
    #[serde(default)]
    pub ordered: bool,

    /// `newest`, `oldest` or a numeric offset.
    #[serde(default = "default_kafka_offset")]
    pub default_offset: String,

    /// JSON sidecar persisting per-partition offsets.
    #[serde(default)]
    pub offset_file: Option<PathBuf>,

    #[serde(default = "default_offset_flush_sec")]
    pub offset_flush_sec: u64,

    #[serde(default = "default_kafka_retry_ms")]
    pub retry_delay_ms: u64,

    /// Extra librdkafka options passed through verbatim.
    #[serde(default)]
    pub options: IndexMap<String, String>,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_offset() -> String {
    "newest".to_string()
}

fn default_offset_flush_sec() -> u64 {
    5
}

fn default_kafka_retry_ms() -> u64 {
    2000
}

/// AWS Kinesis stream consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinesisSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    pub stream: String,

    #[serde(default)]
    pub region: Option<String>,

    /// Endpoint override for local stacks.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_records_per_query")]
    pub records_per_query: i32,

    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,

    #[serde(default = "default_kinesis_retry_sec")]
    pub retry_delay_sec: u64,

    #[serde(default)]
    pub default_offset: OffsetStart,

    /// JSON sidecar persisting per-shard sequence numbers.
    #[serde(default)]
    pub offset_file: Option<PathBuf>,

    #[serde(default = "default_offset_flush_sec")]
    pub offset_flush_sec: u64,

    /// Re-discover shards this often; 0 disables.
    #[serde(default)]
    pub check_new_shards_sec: u64,
}

fn default_records_per_query() -> i32 {
    100
}

fn default_idle_delay_ms() -> u64 {
    1000
}

fn default_kinesis_retry_sec() -> u64 {
    4
}

/// Synthetic load generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    /// Payload template; `%Ns`, `%Nd` and `%Nf` expand to N random
    /// characters, digits or float digits.
    #[serde(default = "default_profiler_message")]
    pub message: String,

    #[serde(default = "default_profiler_characters")]
    pub characters: String,

    #[serde(default = "default_profiler_templates")]
    pub templates: usize,

    #[serde(default = "default_profiler_runs")]
    pub runs: usize,

    #[serde(default = "default_profiler_batches")]
    pub batches: usize,

    #[serde(default)]
    pub delay_ms: u64,

    /// Keep the daemon alive after the run instead of requesting
    /// shutdown.
    #[serde(default)]
    pub keep_running: bool,
}

fn default_profiler_message() -> String {
    "%256s".to_string()
}

fn default_profiler_characters() -> String {
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ 0123456789".to_string()
}

fn default_profiler_templates() -> usize {
    10
}

fn default_profiler_runs() -> usize {
    10000
}

fn default_profiler_batches() -> usize {
    10
}

/// Retry-queue drain and re-route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackSpec {
    #[serde(flatten)]
    pub common: CommonSpec,

    /// Source stream name to destination streams. The `*` entry catches
    /// streams without their own route and defaults to `_DROPPED_`.
    #[serde(default)]
    pub routes: IndexMap<String, Vec<String>>,
}

/// Filter specification, one per chain entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FilterSpec {
    /// Always reject.
    #[serde(rename = "deny")]
    Deny,

    /// Stream-id allow/deny.
    #[serde(rename = "stream")]
    Stream {
        #[serde(default)]
        block: Vec<String>,
        #[serde(default)]
        only: Vec<String>,
    },

    /// Accept iff `expression` matches and `expression_not` does not.
    #[serde(rename = "regexp")]
    RegExp {
        #[serde(default)]
        expression: Option<String>,
        #[serde(default)]
        expression_not: Option<String>,
        /// Metadata key to match instead of the payload.
        #[serde(default)]
        apply_to: Option<String>,
    },

    /// JSON path/regex accept and reject maps. Paths are `/`-separated
    /// into nested objects and arrays.
    #[serde(rename = "json")]
    Json {
        #[serde(default)]
        reject: IndexMap<String, String>,
        #[serde(default)]
        accept: IndexMap<String, String>,
        #[serde(default)]
        apply_to: Option<String>,
    },

    /// Per-stream token bucket.
    #[serde(rename = "rate")]
    Rate {
        messages_per_sec: u64,
        #[serde(default)]
        ignore: Vec<String>,
        /// Reroute rejected messages here instead of discarding.
        #[serde(default)]
        drop_to: Option<String>,
    },

    /// First `rate_per_group` of every `group_size` messages pass.
    #[serde(rename = "sample")]
    Sample {
        #[serde(default = "default_sample_group")]
        group_size: u64,
        #[serde(default = "default_sample_rate")]
        rate_per_group: u64,
        #[serde(default)]
        ignore: Vec<String>,
    },

    /// Short-circuit OR over the children.
    #[serde(rename = "any")]
    Any { filters: Vec<FilterSpec> },
}

fn default_sample_group() -> u64 {
    1
}

fn default_sample_rate() -> u64 {
    1
}
