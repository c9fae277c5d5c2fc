//! Passive HTTP request capture.
//!
//! Packets come from a [`PacketSource`]; the shipped implementation reads
//! libpcap savefile streams (a capture file, or a FIFO fed by
//! `tcpdump -w -`) and decodes Ethernet/IPv4/TCP headers itself. Segments
//! are reassembled per session by [`crate::tcp_assembly`]; complete byte
//! runs are scanned for HTTP requests, which are re-serialized with
//! injected `X-Timestamp` and `X-Client-Ip` headers and enqueued.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use sluice_core::{ControlSlot, Dispatcher, PcapSpec, Plugin, RunState, Source};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tcp_assembly::{session_key, StreamBuffer};

/// One captured TCP segment, already stripped to the fields the
/// reassembler needs.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub ts_sec: u32,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub payload: Bytes,
}

/// Abstract packet feed; `None` means the capture ended.
#[async_trait]
pub trait PacketSource: Send {
    async fn next_packet(&mut self) -> Result<Option<CapturedPacket>>;
}

/// Passive HTTP request reconstructor.
pub struct PcapHttpSource {
    spec: PcapSpec,
}

impl PcapHttpSource {
    pub fn try_new(spec: PcapSpec) -> Result<Self> {
        Ok(Self { spec })
    }
}

impl Plugin for PcapHttpSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for PcapHttpSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);

        let file = tokio::fs::File::open(&self.spec.capture)
            .await
            .with_context(|| format!("open capture {}", self.spec.capture.display()))?;
        let source = SavefileSource::new(BufReader::new(file))
            .await?
            .with_checksum_validation(self.spec.validate_checksums);
        info!(
            consumer = %self.name(),
            capture = %self.spec.capture.display(),
            "reading packet capture"
        );

        let sessions = SessionTable {
            spec: self.spec.clone(),
            out,
            sessions: HashMap::new(),
        };
        state.spawn_worker("capture-read", sessions.run(source, state.cancel_token()));

        state.control_loop(&mut ctl, || {}).await;
        state.wait_workers().await;
        Ok(())
    }
}

struct Session {
    client: SocketAddr,
    buffer: StreamBuffer,
    pending: BytesMut,
    last_ts: u32,
    deadline: Instant,
}

struct SessionTable {
    spec: PcapSpec,
    out: Dispatcher,
    sessions: HashMap<u32, Session>,
}

impl SessionTable {
    async fn run(mut self, mut source: impl PacketSource, cancel: CancellationToken) -> Result<()> {
        let timeout = Duration::from_millis(self.spec.session_timeout_ms.max(1));
        let mut sweep = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sweep.tick() => self.expire_sessions(),
                packet = source.next_packet() => match packet {
                    Ok(Some(packet)) => self.handle_packet(packet, timeout).await?,
                    Ok(None) => {
                        debug!("capture ended");
                        // Sessions keep aging out until stop.
                        loop {
                            tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                _ = sweep.tick() => self.expire_sessions(),
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "capture read failed");
                        return Err(err);
                    }
                },
            }
        }
    }

    async fn handle_packet(&mut self, packet: CapturedPacket, timeout: Duration) -> Result<()> {
        // Only the request direction is reassembled.
        if self.spec.port != 0 && packet.dst.port() != self.spec.port {
            return Ok(());
        }

        let key = session_key(&packet.src, &packet.dst);
        let session = self.sessions.entry(key).or_insert_with(|| Session {
            client: packet.src,
            buffer: StreamBuffer::new(),
            pending: BytesMut::new(),
            last_ts: packet.ts_sec,
            deadline: Instant::now() + timeout,
        });
        session.deadline = Instant::now() + timeout;
        session.last_ts = packet.ts_sec;

        if packet.syn {
            session.buffer.start_at(packet.seq.wrapping_add(1));
        }
        if !packet.payload.is_empty() {
            session.buffer.insert(packet.seq, packet.payload);
        }

        if let Some(chunk) = session.buffer.take_complete() {
            session.pending.extend_from_slice(&chunk);
            let requests = extract_requests(
                &mut session.pending,
                session.last_ts,
                &session.client,
            );
            for request in requests {
                self.out.enqueue(request).await?;
            }
        }

        if packet.fin {
            self.sessions.remove(&key);
        }
        Ok(())
    }

    fn expire_sessions(&mut self) {
        let now = Instant::now();
        self.sessions.retain(|_, session| {
            if session.deadline > now {
                return true;
            }
            if !session.buffer.is_empty() || !session.pending.is_empty() {
                warn!(client = %session.client, "incomplete capture session discarded");
            }
            false
        });
    }
}

/// Parse every complete HTTP request at the front of `pending`,
/// re-serialized with the capture headers injected. Bytes past the last
/// complete request stay for continuation; garbage clears the buffer.
fn extract_requests(pending: &mut BytesMut, ts_sec: u32, client: &SocketAddr) -> Vec<Bytes> {
    let mut out = Vec::new();
    loop {
        let step = {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(pending.as_ref()) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let content_length = request
                        .headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                        .and_then(|h| std::str::from_utf8(h.value).ok())
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    let total = header_len + content_length;
                    if pending.len() < total {
                        None
                    } else {
                        let mut buf = Vec::with_capacity(total + 64);
                        buf.extend_from_slice(
                            format!(
                                "{} {} HTTP/1.{}\r\n",
                                request.method.unwrap_or("GET"),
                                request.path.unwrap_or("/"),
                                request.version.unwrap_or(1),
                            )
                            .as_bytes(),
                        );
                        for header in request.headers.iter() {
                            buf.extend_from_slice(header.name.as_bytes());
                            buf.extend_from_slice(b": ");
                            buf.extend_from_slice(header.value);
                            buf.extend_from_slice(b"\r\n");
                        }
                        buf.extend_from_slice(format!("X-Timestamp: {ts_sec}\r\n").as_bytes());
                        buf.extend_from_slice(
                            format!("X-Client-Ip: {}\r\n", client.ip()).as_bytes(),
                        );
                        buf.extend_from_slice(b"\r\n");
                        buf.extend_from_slice(&pending[header_len..total]);
                        Some((Bytes::from(buf), total))
                    }
                }
                Ok(httparse::Status::Partial) => None,
                Err(err) => {
                    debug!(error = %err, "unparseable http data in session, discarding");
                    pending.clear();
                    None
                }
            }
        };
        match step {
            Some((request, total)) => {
                pending.advance(total);
                out.push(request);
            }
            None => return out,
        }
    }
}

/// Libpcap savefile reader with in-tree Ethernet/IPv4/TCP decoding.
pub struct SavefileSource<R> {
    input: R,
    swapped: bool,
    link_type: u32,
    snaplen: u32,
    validate_checksums: bool,
}

const MAGIC: u32 = 0xa1b2_c3d4;
const MAGIC_NANO: u32 = 0xa1b2_3c4d;

/// Link types this reader understands.
const LINKTYPE_ETHERNET: u32 = 1;
const LINKTYPE_RAW: u32 = 101;
const LINKTYPE_LINUX_SLL: u32 = 113;

impl<R: AsyncRead + Unpin + Send> SavefileSource<R> {
    pub async fn new(mut input: R) -> Result<Self> {
        let mut header = [0u8; 24];
        input
            .read_exact(&mut header)
            .await
            .context("read pcap global header")?;
        let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let swapped = match magic {
            MAGIC | MAGIC_NANO => false,
            m if m.swap_bytes() == MAGIC || m.swap_bytes() == MAGIC_NANO => true,
            other => anyhow::bail!("not a pcap savefile (magic {other:#010x})"),
        };
        let read_u32 = |range: std::ops::Range<usize>| {
            let bytes: [u8; 4] = header[range].try_into().expect("4 bytes");
            if swapped {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            }
        };
        let snaplen = read_u32(16..20);
        let link_type = read_u32(20..24);
        if !matches!(
            link_type,
            LINKTYPE_ETHERNET | LINKTYPE_RAW | LINKTYPE_LINUX_SLL
        ) {
            anyhow::bail!("unsupported link type {link_type}");
        }
        Ok(Self {
            input,
            swapped,
            link_type,
            snaplen,
            validate_checksums: false,
        })
    }

    pub fn with_checksum_validation(mut self, enabled: bool) -> Self {
        self.validate_checksums = enabled;
        self
    }

    fn u32_at(&self, bytes: [u8; 4]) -> u32 {
        if self.swapped {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PacketSource for SavefileSource<R> {
    async fn next_packet(&mut self) -> Result<Option<CapturedPacket>> {
        loop {
            let mut record = [0u8; 16];
            match self.input.read_exact(&mut record).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(err) => return Err(err).context("read pcap record header"),
            }
            let ts_sec = self.u32_at(record[0..4].try_into().expect("4 bytes"));
            let incl_len = self.u32_at(record[8..12].try_into().expect("4 bytes"));
            if incl_len > self.snaplen.max(1 << 16) {
                anyhow::bail!("pcap record length {incl_len} exceeds snap length");
            }
            let mut data = vec![0u8; incl_len as usize];
            self.input
                .read_exact(&mut data)
                .await
                .context("read pcap record")?;

            if let Some(packet) =
                decode_tcp(self.link_type, ts_sec, &data, self.validate_checksums)
            {
                return Ok(Some(packet));
            }
            // Non-TCP traffic is skipped.
        }
    }
}

/// Decode link + IPv4 + TCP headers into a [`CapturedPacket`].
fn decode_tcp(link_type: u32, ts_sec: u32, data: &[u8], validate: bool) -> Option<CapturedPacket> {
    let ip = match link_type {
        LINKTYPE_ETHERNET => {
            if data.len() < 14 {
                return None;
            }
            let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
            let mut offset = 14;
            // 802.1Q tag
            if ethertype == 0x8100 && data.len() >= 18 {
                ethertype = u16::from_be_bytes([data[16], data[17]]);
                offset = 18;
            }
            if ethertype != 0x0800 {
                return None;
            }
            &data[offset..]
        }
        LINKTYPE_LINUX_SLL => {
            if data.len() < 16 || u16::from_be_bytes([data[14], data[15]]) != 0x0800 {
                return None;
            }
            &data[16..]
        }
        LINKTYPE_RAW => data,
        _ => return None,
    };

    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ip_header = ((ip[0] & 0x0f) as usize) * 4;
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if ip[9] != 6 || ip.len() < total_len || total_len < ip_header + 20 {
        return None;
    }
    let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    let tcp = &ip[ip_header..total_len];
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
    let tcp_header = ((tcp[12] >> 4) as usize) * 4;
    if tcp.len() < tcp_header {
        return None;
    }
    let flags = tcp[13];

    if validate && !checksum_ok(&ip[..ip_header], tcp) {
        // Advisory only: the packet is kept.
        debug!(%src_ip, %dst_ip, "tcp checksum mismatch");
    }

    Some(CapturedPacket {
        ts_sec,
        src: SocketAddr::new(IpAddr::V4(src_ip), src_port),
        dst: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
        seq,
        syn: flags & 0x02 != 0,
        fin: flags & 0x01 != 0,
        payload: Bytes::copy_from_slice(&tcp[tcp_header..]),
    })
}

/// TCP checksum over the IPv4 pseudo-header and the segment.
fn checksum_ok(ip_header: &[u8], tcp: &[u8]) -> bool {
    let mut sum: u32 = 0;
    let mut add16 = |hi: u8, lo: u8| sum += u16::from_be_bytes([hi, lo]) as u32;

    // Pseudo-header: src, dst, zero+protocol, tcp length.
    add16(ip_header[12], ip_header[13]);
    add16(ip_header[14], ip_header[15]);
    add16(ip_header[16], ip_header[17]);
    add16(ip_header[18], ip_header[19]);
    add16(0, 6);
    let len = tcp.len() as u16;
    add16((len >> 8) as u8, len as u8);

    let mut chunks = tcp.chunks_exact(2);
    for pair in &mut chunks {
        add16(pair[0], pair[1]);
    }
    if let [last] = chunks.remainder() {
        add16(*last, 0);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum == 0xffff
}
