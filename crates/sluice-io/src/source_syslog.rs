//! Syslog server consumer: RFC3164, RFC5424 and RFC6587 (octet-counted
//! 5424 over TCP). Parsed fields land in message metadata; the payload
//! is the log text itself.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::{
    BufferedReader, ControlSlot, Dispatcher, FrameError, Framing, Metadata, Plugin, RunState,
    Source, SyslogFormat, SyslogSpec,
};
use tokio::net::{TcpListener, UdpSocket, UnixDatagram, UnixListener};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::{parse_endpoint, Endpoint};

/// A parsed syslog record.
#[derive(Debug, Default, PartialEq)]
pub struct SyslogRecord {
    pub facility: u8,
    pub severity: u8,
    pub timestamp: Option<String>,
    pub hostname: Option<String>,
    pub appname: Option<String>,
    pub procid: Option<String>,
    pub msgid: Option<String>,
    pub structured: Vec<(String, String)>,
    pub message: String,
}

/// Syslog server.
pub struct SyslogSource {
    spec: SyslogSpec,
    endpoint: Endpoint,
}

impl SyslogSource {
    pub fn try_new(spec: SyslogSpec) -> Result<Self> {
        let endpoint = parse_endpoint(&spec.address, spec.format == SyslogFormat::Rfc6587)?;
        match (spec.format, &endpoint) {
            (SyslogFormat::Rfc3164, Endpoint::Tcp(_)) => {
                anyhow::bail!("rfc3164 listens on udp or unix datagram, not tcp")
            }
            (SyslogFormat::Rfc6587, Endpoint::Udp(_)) => {
                anyhow::bail!("rfc6587 is tcp framing, not udp")
            }
            _ => {}
        }
        Ok(Self { spec, endpoint })
    }

    fn framing(&self) -> Framing {
        match self.spec.format {
            SyslogFormat::Rfc6587 => Framing::AsciiPrefix {
                delimiter: b" ".to_vec(),
                offset: 0,
            },
            _ => Framing::Delimiter {
                delimiter: b"\n".to_vec(),
            },
        }
    }
}

impl Plugin for SyslogSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for SyslogSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let format = self.spec.format;

        match &self.endpoint {
            Endpoint::Udp(addr) => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .with_context(|| format!("bind udp {addr}"))?;
                info!(consumer = %self.name(), %addr, ?format, "syslog listening (udp)");
                let cancel = state.cancel_token();
                let out = out.clone();
                state.spawn_worker("udp-read", async move {
                    let mut buf = vec![0u8; 1 << 16];
                    loop {
                        let received = tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            r = socket.recv_from(&mut buf) => r,
                        };
                        match received {
                            Ok((n, _)) => deliver(&out, format, &buf[..n]).await?,
                            Err(err) => {
                                if cancel.is_cancelled() {
                                    return Ok(());
                                }
                                warn!(error = %err, "udp receive failed");
                            }
                        }
                    }
                });
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("bind tcp {addr}"))?;
                info!(consumer = %self.name(), %addr, ?format, "syslog listening (tcp)");
                let accept_state = state.clone();
                let framing = self.framing();
                let out = out.clone();
                state.spawn_worker("accept", async move {
                    let cancel = accept_state.cancel_token();
                    loop {
                        let accepted = tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            a = listener.accept() => a,
                        };
                        match accepted {
                            Ok((stream, peer)) => {
                                let out = out.clone();
                                let framing = framing.clone();
                                let client_cancel = cancel.child_token();
                                accept_state.spawn_worker("client", async move {
                                    client_loop(stream, framing, format, out, client_cancel, peer.to_string())
                                        .await
                                });
                            }
                            Err(err) => {
                                if cancel.is_cancelled() {
                                    return Ok(());
                                }
                                warn!(error = %err, "accept failed");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                });
            }
            Endpoint::Unix(path) => {
                let _ = std::fs::remove_file(path);
                if self.spec.format == SyslogFormat::Rfc6587 {
                    let listener = UnixListener::bind(path)
                        .with_context(|| format!("bind unix {}", path.display()))?;
                    info!(consumer = %self.name(), path = %path.display(), ?format, "syslog listening (unix stream)");
                    let accept_state = state.clone();
                    let framing = self.framing();
                    let out = out.clone();
                    state.spawn_worker("accept", async move {
                        let cancel = accept_state.cancel_token();
                        loop {
                            let accepted = tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                a = listener.accept() => a,
                            };
                            match accepted {
                                Ok((stream, _)) => {
                                    let out = out.clone();
                                    let framing = framing.clone();
                                    let client_cancel = cancel.child_token();
                                    accept_state.spawn_worker("client", async move {
                                        client_loop(
                                            stream,
                                            framing,
                                            format,
                                            out,
                                            client_cancel,
                                            "unix-client".to_string(),
                                        )
                                        .await
                                    });
                                }
                                Err(err) => {
                                    if cancel.is_cancelled() {
                                        return Ok(());
                                    }
                                    warn!(error = %err, "accept failed");
                                    tokio::time::sleep(Duration::from_millis(100)).await;
                                }
                            }
                        }
                    });
                } else {
                    let socket = UnixDatagram::bind(path)
                        .with_context(|| format!("bind unix dgram {}", path.display()))?;
                    info!(consumer = %self.name(), path = %path.display(), ?format, "syslog listening (unix dgram)");
                    let cancel = state.cancel_token();
                    let out = out.clone();
                    state.spawn_worker("unix-read", async move {
                        let mut buf = vec![0u8; 1 << 16];
                        loop {
                            let received = tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                r = socket.recv_from(&mut buf) => r,
                            };
                            match received {
                                Ok((n, _)) => deliver(&out, format, &buf[..n]).await?,
                                Err(err) => {
                                    if cancel.is_cancelled() {
                                        return Ok(());
                                    }
                                    warn!(error = %err, "unix receive failed");
                                }
                            }
                        }
                    });
                }
            }
        }

        state.control_loop(&mut ctl, || {}).await;
        state.wait_workers().await;
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

async fn client_loop<S>(
    mut stream: S,
    framing: Framing,
    format: SyslogFormat,
    out: Dispatcher,
    cancel: CancellationToken,
    peer: String,
) -> Result<()>
where
    S: AsyncRead + Unpin + Send,
{
    let mut reader = BufferedReader::new(framing, 1 << 20);
    let mut frames: Vec<Bytes> = Vec::new();
    loop {
        let mut on_frame = |f: &[u8]| frames.push(Bytes::copy_from_slice(f));
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = reader.read_from(&mut stream, &mut on_frame) => r,
        };
        match read {
            Ok(_) => {
                for frame in frames.drain(..) {
                    deliver(&out, format, &frame).await?;
                }
            }
            Err(FrameError::Eof) => {
                reader.flush(&mut |f| frames.push(Bytes::copy_from_slice(f)));
                for frame in frames.drain(..) {
                    deliver(&out, format, &frame).await?;
                }
                debug!(%peer, "syslog client disconnected");
                return Ok(());
            }
            Err(FrameError::DataInvalid(_)) if format == SyslogFormat::Rfc6587 => {
                // Non-transparent framing fallback: the sender is using
                // LF termination instead of octet counting.
                let pending = reader.discard_pending();
                debug!(%peer, pending, "octet count missing, falling back to LF framing");
                reader = BufferedReader::new(
                    Framing::Delimiter {
                        delimiter: b"\n".to_vec(),
                    },
                    1 << 20,
                );
            }
            Err(FrameError::DataInvalid(reason)) => {
                debug!(%peer, %reason, "invalid frame, closing syslog client");
                return Ok(());
            }
            Err(FrameError::Io(err)) => {
                if !cancel.is_cancelled() && err.kind() != std::io::ErrorKind::ConnectionReset {
                    debug!(%peer, error = %err, "syslog read failed");
                }
                return Ok(());
            }
        }
    }
}

/// Parse one record and enqueue it; parse failures drop the record.
async fn deliver(out: &Dispatcher, format: SyslogFormat, raw: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(());
    }
    let record = match format {
        SyslogFormat::Rfc3164 => parse_rfc3164(text),
        SyslogFormat::Rfc5424 | SyslogFormat::Rfc6587 => parse_rfc5424(text),
    };
    let record = match record {
        Ok(record) => record,
        Err(err) => {
            warn!(error = %err, "unparseable syslog record dropped");
            metrics::counter!("syslog_parse_errors", 1);
            return Ok(());
        }
    };

    let payload = Bytes::from(record.message.clone());
    if out.wants_metadata() {
        let mut meta = Metadata::new();
        meta.insert("facility".into(), Bytes::from(record.facility.to_string()));
        meta.insert("severity".into(), Bytes::from(record.severity.to_string()));
        if let Some(ts) = record.timestamp {
            meta.insert("timestamp".into(), Bytes::from(ts));
        }
        if let Some(host) = record.hostname {
            meta.insert("hostname".into(), Bytes::from(host));
        }
        if let Some(app) = record.appname {
            meta.insert("appname".into(), Bytes::from(app));
        }
        if let Some(procid) = record.procid {
            meta.insert("procid".into(), Bytes::from(procid));
        }
        if let Some(msgid) = record.msgid {
            meta.insert("msgid".into(), Bytes::from(msgid));
        }
        for (key, value) in record.structured {
            meta.insert(key, Bytes::from(value));
        }
        out.enqueue_with_metadata(payload, meta).await
    } else {
        out.enqueue(payload).await
    }
}

fn parse_pri(input: &str) -> Result<(u8, u8, &str)> {
    let rest = input
        .strip_prefix('<')
        .context("record does not start with <pri>")?;
    let end = rest.find('>').context("unterminated <pri>")?;
    let pri: u16 = rest[..end].parse().context("non-numeric <pri>")?;
    if pri > 191 {
        anyhow::bail!("pri {pri} out of range");
    }
    Ok(((pri / 8) as u8, (pri % 8) as u8, &rest[end + 1..]))
}

/// `<PRI>Mmm dd hh:mm:ss HOST TAG[PID]: MSG`
pub fn parse_rfc3164(input: &str) -> Result<SyslogRecord> {
    let (facility, severity, rest) = parse_pri(input)?;
    let mut record = SyslogRecord {
        facility,
        severity,
        ..SyslogRecord::default()
    };

    // Timestamp is fixed-width; tolerate records without one.
    let rest = if rest.len() >= 15 && looks_like_bsd_timestamp(&rest[..15]) {
        record.timestamp = Some(rest[..15].to_string());
        rest[15..].trim_start_matches(' ')
    } else {
        rest
    };

    let (hostname, rest) = match rest.split_once(' ') {
        Some((host, tail)) if record.timestamp.is_some() => (Some(host.to_string()), tail),
        _ => (None, rest),
    };
    record.hostname = hostname;

    // TAG ends at ':' or '['; both are optional in the wild.
    let colon = rest.find(": ");
    match colon {
        Some(pos) => {
            let tag = &rest[..pos];
            if let Some(bracket) = tag.find('[') {
                record.appname = Some(tag[..bracket].to_string());
                record.procid = Some(tag[bracket + 1..].trim_end_matches(']').to_string());
            } else if !tag.contains(' ') {
                record.appname = Some(tag.to_string());
            }
            record.message = if record.appname.is_some() {
                rest[pos + 2..].to_string()
            } else {
                rest.to_string()
            };
        }
        None => record.message = rest.to_string(),
    }
    Ok(record)
}

fn looks_like_bsd_timestamp(s: &str) -> bool {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let Some(month) = s.get(..3) else {
        return false;
    };
    if !MONTHS.contains(&month) {
        return false;
    }
    // "Mmm dd hh:mm:ss" with a space-padded day.
    let bytes = s.as_bytes();
    bytes[3] == b' '
        && bytes[6] == b' '
        && bytes[9] == b':'
        && bytes[12] == b':'
        && chrono::NaiveTime::parse_from_str(&s[7..], "%H:%M:%S").is_ok()
}

/// `<PRI>1 TIMESTAMP HOSTNAME APP-NAME PROCID MSGID SD [MSG]`
pub fn parse_rfc5424(input: &str) -> Result<SyslogRecord> {
    let (facility, severity, rest) = parse_pri(input)?;
    let mut record = SyslogRecord {
        facility,
        severity,
        ..SyslogRecord::default()
    };

    let (version, rest) = rest.split_once(' ').context("missing version")?;
    if version != "1" {
        anyhow::bail!("unsupported syslog version {version:?}");
    }

    let mut rest = rest;
    let mut fields: [Option<String>; 4] = Default::default();
    for slot in fields.iter_mut() {
        let (field, tail) = rest.split_once(' ').context("truncated header")?;
        *slot = (field != "-").then(|| field.to_string());
        rest = tail;
    }
    let [timestamp, hostname, appname, procid] = fields;
    record.timestamp = timestamp;
    record.hostname = hostname;
    record.appname = appname;
    record.procid = procid;

    // MSGID is the last header field; the message after SD is optional,
    // so a trailing field may have no space after it.
    let (msgid, tail) = match rest.split_once(' ') {
        Some(pair) => pair,
        None => anyhow::bail!("missing structured data"),
    };
    record.msgid = (msgid != "-").then(|| msgid.to_string());

    let (structured, message) = parse_structured_data(tail)?;
    record.structured = structured;
    record.message = message
        .strip_prefix(' ')
        .unwrap_or(message)
        .trim_start_matches('\u{feff}')
        .to_string();
    Ok(record)
}

/// Walk the STRUCTURED-DATA element: `-`, or one or more
/// `[id k="v" ...]` sections with `\"`, `\\` and `\]` escapes inside
/// values. Returns the flattened key/value pairs and the remaining text.
pub fn parse_structured_data(input: &str) -> Result<(Vec<(String, String)>, &str)> {
    if let Some(rest) = input.strip_prefix('-') {
        return Ok((Vec::new(), rest));
    }

    let mut pairs = Vec::new();
    let mut rest = input;
    while rest.starts_with('[') {
        let bytes = rest.as_bytes();
        let mut idx = 1;

        // SD-ID runs to the first space or closing bracket.
        let id_start = idx;
        while idx < bytes.len() && bytes[idx] != b' ' && bytes[idx] != b']' {
            idx += 1;
        }
        if idx >= bytes.len() {
            anyhow::bail!("unterminated structured data section");
        }
        let sd_id = &rest[id_start..idx];

        while bytes[idx] == b' ' {
            idx += 1;
            // key="value"
            let key_start = idx;
            while idx < bytes.len() && bytes[idx] != b'=' {
                idx += 1;
            }
            if idx + 1 >= bytes.len() || bytes[idx + 1] != b'"' {
                anyhow::bail!("malformed parameter in [{sd_id}]");
            }
            let key = &rest[key_start..idx];
            idx += 2;

            let mut value = String::new();
            loop {
                if idx >= bytes.len() {
                    anyhow::bail!("unterminated value in [{sd_id}]");
                }
                match bytes[idx] {
                    b'"' => break,
                    b'\\' if idx + 1 < bytes.len() => {
                        // Escapes cover ", \ and ]; anything else keeps
                        // the backslash verbatim.
                        let next = bytes[idx + 1];
                        if matches!(next, b'"' | b'\\' | b']') {
                            value.push(next as char);
                            idx += 2;
                        } else {
                            value.push('\\');
                            idx += 1;
                        }
                    }
                    _ => {
                        let ch = rest[idx..].chars().next().unwrap_or('\u{fffd}');
                        value.push(ch);
                        idx += ch.len_utf8();
                    }
                }
            }
            idx += 1;
            pairs.push((key.to_string(), value));
            if idx >= bytes.len() {
                anyhow::bail!("unterminated structured data section");
            }
        }
        if bytes[idx] != b']' {
            anyhow::bail!("unterminated structured data section");
        }
        rest = &rest[idx + 1..];
    }
    Ok((pairs, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3164_full_record() {
        let record =
            parse_rfc3164("<34>Oct 11 22:14:15 mymachine su[42]: 'su root' failed on /dev/pts/8")
                .unwrap();
        assert_eq!(record.facility, 4);
        assert_eq!(record.severity, 2);
        assert_eq!(record.timestamp.as_deref(), Some("Oct 11 22:14:15"));
        assert_eq!(record.hostname.as_deref(), Some("mymachine"));
        assert_eq!(record.appname.as_deref(), Some("su"));
        assert_eq!(record.procid.as_deref(), Some("42"));
        assert_eq!(record.message, "'su root' failed on /dev/pts/8");
    }

    #[test]
    fn rfc3164_without_timestamp_keeps_the_message() {
        let record = parse_rfc3164("<13>something went wrong").unwrap();
        assert_eq!(record.severity, 5);
        assert!(record.timestamp.is_none());
        assert_eq!(record.message, "something went wrong");
    }

    #[test]
    fn rfc5424_with_structured_data() {
        let record = parse_rfc5424(
            "<165>1 2003-10-11T22:14:15.003Z mymachine.example.com evntslog 1234 ID47 \
             [exampleSDID@32473 iut=\"3\" eventSource=\"Application\"][other@1 x=\"y\"] An application event",
        )
        .unwrap();
        assert_eq!(record.facility, 20);
        assert_eq!(record.severity, 5);
        assert_eq!(record.hostname.as_deref(), Some("mymachine.example.com"));
        assert_eq!(record.appname.as_deref(), Some("evntslog"));
        assert_eq!(record.procid.as_deref(), Some("1234"));
        assert_eq!(record.msgid.as_deref(), Some("ID47"));
        assert_eq!(
            record.structured,
            vec![
                ("iut".to_string(), "3".to_string()),
                ("eventSource".to_string(), "Application".to_string()),
                ("x".to_string(), "y".to_string()),
            ]
        );
        assert_eq!(record.message, "An application event");
    }

    #[test]
    fn rfc5424_nil_fields_and_no_message() {
        let record = parse_rfc5424("<34>1 - - - - - -").unwrap();
        assert!(record.timestamp.is_none());
        assert!(record.hostname.is_none());
        assert!(record.structured.is_empty());
        assert_eq!(record.message, "");
    }

    #[test]
    fn structured_data_escapes() {
        let (pairs, rest) =
            parse_structured_data("[x@1 quote=\"a \\\"b\\\"\" bracket=\"c\\]d\"] tail").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("quote".to_string(), "a \"b\"".to_string()),
                ("bracket".to_string(), "c]d".to_string()),
            ]
        );
        assert_eq!(rest, " tail");
    }

    #[test]
    fn malformed_records_error_out() {
        assert!(parse_rfc3164("no pri here").is_err());
        assert!(parse_rfc5424("<34>2 2003-10-11T22:14:15Z h a p m - msg").is_err());
        assert!(parse_structured_data("[broken").is_err());
        assert!(parse_pri("<999>x").is_err());
    }
}
