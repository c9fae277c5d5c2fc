//! Socket server consumer: TCP, UDP or UNIX, with an optional
//! acknowledge protocol on connection-oriented transports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::{
    BufferedReader, ControlSlot, Dispatcher, FrameError, Framing, Plugin, RunState, SocketSpec,
    Source,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket, UnixDatagram, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::{parse_endpoint, Endpoint};

/// Tracks one accepted connection so shutdown can close them all and the
/// client cap has something to count.
struct ClientEntry {
    id: u64,
    peer: String,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub(crate) struct ClientList {
    inner: Arc<Mutex<Vec<ClientEntry>>>,
    next_id: Arc<AtomicU64>,
    max: usize,
}

impl ClientList {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            max,
        }
    }

    /// Register a connection, or `None` when the cap is reached (the
    /// caller closes the connection).
    pub(crate) fn add(&self, peer: String, parent: &CancellationToken) -> Option<(u64, CancellationToken)> {
        let mut clients = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if self.max > 0 && clients.len() >= self.max {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        clients.push(ClientEntry {
            id,
            peer,
            cancel: cancel.clone(),
        });
        Some((id, cancel))
    }

    pub(crate) fn remove(&self, id: u64) {
        let mut clients = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        clients.retain(|c| c.id != id);
    }

    pub(crate) fn close_all(&self) {
        let clients = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for client in clients.iter() {
            debug!(peer = %client.peer, "closing client");
            client.cancel.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Ingress-only socket server.
pub struct SocketSource {
    spec: SocketSpec,
    endpoint: Endpoint,
}

impl SocketSource {
    pub fn try_new(spec: SocketSpec) -> Result<Self> {
        spec.framing.build()?;
        let endpoint = parse_endpoint(&spec.address, !spec.acknowledge.is_empty())?;
        if matches!(endpoint, Endpoint::Udp(_)) && !spec.acknowledge.is_empty() {
            anyhow::bail!("udp cannot acknowledge ({})", spec.address);
        }
        if let Some(perms) = &spec.permissions {
            u32::from_str_radix(perms, 8)
                .with_context(|| format!("socket permissions {perms:?} are not octal"))?;
        }
        Ok(Self { spec, endpoint })
    }
}

impl Plugin for SocketSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for SocketSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let clients = ClientList::new(self.spec.max_clients);
        let framing = self.spec.framing.build()?;

        match &self.endpoint {
            Endpoint::Udp(addr) => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .with_context(|| format!("bind udp {addr}"))?;
                info!(consumer = %self.name(), %addr, "listening (udp)");
                let loop_ = DatagramLoop {
                    spec: self.spec.clone(),
                    framing,
                    out,
                    cancel: state.cancel_token(),
                };
                state.spawn_worker("udp-read", loop_.run_udp(socket));
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("bind tcp {addr}"))?;
                info!(consumer = %self.name(), %addr, "listening (tcp)");
                let accept = AcceptLoop {
                    spec: self.spec.clone(),
                    framing,
                    out,
                    state: state.clone(),
                    clients: clients.clone(),
                };
                state.spawn_worker("accept", accept.run_tcp(listener));
            }
            Endpoint::Unix(path) => {
                if self.spec.remove_old_socket {
                    let _ = std::fs::remove_file(path);
                }
                if self.spec.acknowledge.is_empty() {
                    let socket = UnixDatagram::bind(path)
                        .with_context(|| format!("bind unix dgram {}", path.display()))?;
                    apply_permissions(path, self.spec.permissions.as_deref())?;
                    info!(consumer = %self.name(), path = %path.display(), "listening (unix dgram)");
                    let loop_ = DatagramLoop {
                        spec: self.spec.clone(),
                        framing,
                        out,
                        cancel: state.cancel_token(),
                    };
                    state.spawn_worker("unix-read", loop_.run_unix(socket));
                } else {
                    let listener = UnixListener::bind(path)
                        .with_context(|| format!("bind unix {}", path.display()))?;
                    apply_permissions(path, self.spec.permissions.as_deref())?;
                    info!(consumer = %self.name(), path = %path.display(), "listening (unix stream)");
                    let accept = AcceptLoop {
                        spec: self.spec.clone(),
                        framing,
                        out,
                        state: state.clone(),
                        clients: clients.clone(),
                    };
                    state.spawn_worker("accept", accept.run_unix(listener));
                }
            }
        }

        state.control_loop(&mut ctl, || {}).await;
        clients.close_all();
        state.wait_workers().await;
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

fn apply_permissions(path: &std::path::Path, perms: Option<&str>) -> Result<()> {
    #[cfg(unix)]
    if let Some(perms) = perms {
        use std::os::unix::fs::PermissionsExt;
        let mode = u32::from_str_radix(perms, 8).context("socket permissions")?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = (path, perms);
    Ok(())
}

/// Shared datagram read loop for UDP and UNIX datagram sockets.
struct DatagramLoop {
    spec: SocketSpec,
    framing: Framing,
    out: Dispatcher,
    cancel: CancellationToken,
}

impl DatagramLoop {
    async fn run_udp(self, socket: UdpSocket) -> Result<()> {
        let mut buf = vec![0u8; 1 << 16];
        let mut reader =
            BufferedReader::for_datagrams(self.framing.clone(), self.spec.framing.max_frame());
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = socket.recv_from(&mut buf) => r,
            };
            match received {
                Ok((n, _peer)) => self.handle_datagram(&mut reader, &buf[..n]).await?,
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    warn!(error = %err, "udp receive failed");
                }
            }
        }
    }

    async fn run_unix(self, socket: UnixDatagram) -> Result<()> {
        let mut buf = vec![0u8; 1 << 16];
        let mut reader =
            BufferedReader::for_datagrams(self.framing.clone(), self.spec.framing.max_frame());
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = socket.recv_from(&mut buf) => r,
            };
            match received {
                Ok((n, _peer)) => self.handle_datagram(&mut reader, &buf[..n]).await?,
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    warn!(error = %err, "unix receive failed");
                }
            }
        }
    }

    async fn handle_datagram(&self, reader: &mut BufferedReader, data: &[u8]) -> Result<()> {
        let mut frames: Vec<Bytes> = Vec::new();
        match reader.feed(data, &mut |f| frames.push(Bytes::copy_from_slice(f))) {
            Ok(_) => {}
            Err(FrameError::DataInvalid(reason)) => {
                // Datagram transports skip bad data and move on.
                let skipped = reader.discard_pending();
                warn!(skipped, %reason, "invalid frame in datagram, skipping");
            }
            Err(err) => return Err(err).context("datagram framing"),
        }
        for frame in frames {
            self.out.enqueue(frame).await?;
        }
        Ok(())
    }
}

/// Accept loop + per-client workers for connection-oriented transports.
struct AcceptLoop {
    spec: SocketSpec,
    framing: Framing,
    out: Dispatcher,
    state: RunState,
    clients: ClientList,
}

impl AcceptLoop {
    async fn run_tcp(self, listener: TcpListener) -> Result<()> {
        let cancel = self.state.cancel_token();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                a = listener.accept() => a,
            };
            match accepted {
                Ok((stream, peer)) => self.spawn_client(stream, peer.to_string()),
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn run_unix(self, listener: UnixListener) -> Result<()> {
        let cancel = self.state.cancel_token();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                a = listener.accept() => a,
            };
            match accepted {
                Ok((stream, _)) => self.spawn_client(stream, "unix-client".to_string()),
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn spawn_client<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some((id, cancel)) = self.clients.add(peer.clone(), &self.state.cancel_token()) else {
            warn!(%peer, max = self.spec.max_clients, "client limit reached, rejecting");
            drop(stream);
            return;
        };
        debug!(%peer, "client connected");
        let client = ClientWorker {
            spec: self.spec.clone(),
            framing: self.framing.clone(),
            out: self.out.clone(),
            cancel,
            peer,
        };
        let clients = self.clients.clone();
        self.state.spawn_worker("client", async move {
            let result = client.run(stream).await;
            clients.remove(id);
            result
        });
    }
}

struct ClientWorker {
    spec: SocketSpec,
    framing: Framing,
    out: Dispatcher,
    cancel: CancellationToken,
    peer: String,
}

impl ClientWorker {
    async fn run<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = BufferedReader::new(self.framing.clone(), self.spec.framing.max_frame());
        let read_timeout = Duration::from_secs(self.spec.read_timeout_sec.max(1));
        let mut frames: Vec<Bytes> = Vec::new();

        loop {
            let mut on_frame = |f: &[u8]| frames.push(Bytes::copy_from_slice(f));
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = tokio::time::timeout(
                    read_timeout,
                    reader.read_from(&mut stream, &mut on_frame),
                ) => r,
            };
            let read = match read {
                // Timeouts keep the connection; liveness is governed by
                // the consumer being active, not by idle clients.
                Err(_elapsed) => continue,
                Ok(read) => read,
            };
            match read {
                Ok(_) => {
                    for frame in frames.drain(..) {
                        self.out.enqueue(frame).await?;
                        self.write_ack(&mut stream, true).await;
                    }
                }
                Err(FrameError::Eof) => {
                    // Orderly close: a trailing unterminated record is
                    // still delivered.
                    reader.flush(&mut |f| frames.push(Bytes::copy_from_slice(f)));
                    for frame in frames.drain(..) {
                        self.out.enqueue(frame).await?;
                    }
                    debug!(peer = %self.peer, "client disconnected");
                    return Ok(());
                }
                Err(FrameError::DataInvalid(reason)) => {
                    debug!(peer = %self.peer, %reason, "invalid frame, closing client");
                    self.write_ack(&mut stream, false).await;
                    return Ok(());
                }
                Err(FrameError::Io(err)) => {
                    // Resets close silently; anything else during
                    // shutdown is expected noise.
                    if !self.cancel.is_cancelled()
                        && err.kind() != std::io::ErrorKind::ConnectionReset
                    {
                        debug!(peer = %self.peer, error = %err, "client read failed");
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn write_ack<S>(&self, stream: &mut S, success: bool)
    where
        S: AsyncWrite + Unpin + Send,
    {
        if self.spec.acknowledge.is_empty() {
            return;
        }
        let response = if success {
            self.spec.acknowledge.clone()
        } else {
            format!("NOT {}", self.spec.acknowledge)
        };
        let timeout = Duration::from_millis(self.spec.ack_timeout_ms.max(1));
        match tokio::time::timeout(timeout, stream.write_all(response.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(peer = %self.peer, error = %err, "ack write failed"),
            Err(_) => debug!(peer = %self.peer, "ack write timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{control_channel, CommonSpec, Control, FramingSpec, Runtime};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn spec(address: &str, acknowledge: &str) -> SocketSpec {
        SocketSpec {
            common: CommonSpec {
                id: "test-socket".into(),
                streams: vec!["bulk".into()],
                set_metadata: false,
                filters: Vec::new(),
            },
            address: address.into(),
            framing: FramingSpec::default(),
            acknowledge: acknowledge.into(),
            ack_timeout_ms: 500,
            read_timeout_sec: 1,
            permissions: None,
            remove_old_socket: true,
            max_clients: 0,
        }
    }

    async fn start(
        spec: SocketSpec,
    ) -> (
        sluice_core::MessageRx,
        sluice_core::ControlHandle,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let runtime = Runtime::new(16);
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let out = Dispatcher::new(
            "test-socket",
            &["bulk".to_string()],
            Vec::new(),
            tx,
            runtime.clone(),
            false,
        );
        let cancel = runtime.shutdown_token();
        let (handle, ctl) = control_channel();
        let mut source = SocketSource::try_new(spec).unwrap();
        let task = tokio::spawn(async move { source.run(out, ctl, cancel).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        (rx, handle, task)
    }

    #[tokio::test]
    async fn tcp_delimiter_framing_delivers_trailing_record_on_close() {
        let spec = spec("tcp://127.0.0.1:15880", "");
        let (mut rx, handle, task) = start(spec).await;

        let mut client = TcpStream::connect("127.0.0.1:15880").await.unwrap();
        client.write_all(b"a\nb\nc").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        for expected in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.payload.as_ref(), expected);
        }

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn acknowledge_follows_every_frame() {
        let spec = spec("127.0.0.1:15881", "OK");
        let (mut rx, handle, task) = start(spec).await;

        let mut client = TcpStream::connect("127.0.0.1:15881").await.unwrap();
        client.write_all(b"one\n").await.unwrap();
        let mut ack = [0u8; 2];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"OK");

        client.write_all(b"two\n").await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"OK");

        assert_eq!(rx.recv().await.unwrap().payload.as_ref(), b"one");
        assert_eq!(rx.recv().await.unwrap().payload.as_ref(), b"two");

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn binary_length_prefix_over_tcp() {
        let mut spec = spec("tcp://127.0.0.1:15882", "");
        spec.framing = FramingSpec {
            partitioner: "binary".into(),
            size: 4,
            ..FramingSpec::default()
        };
        let (mut rx, handle, task) = start(spec).await;

        let mut client = TcpStream::connect("127.0.0.1:15882").await.unwrap();
        client
            .write_all(b"\x05\x00\x00\x00HELLO\x03\x00\x00\x00abc")
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload.as_ref(), b"HELLO");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload.as_ref(), b"abc");

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_cap_rejects_excess_connections() {
        let clients = ClientList::new(1);
        let cancel = CancellationToken::new();
        let first = clients.add("a".into(), &cancel);
        assert!(first.is_some());
        assert!(clients.add("b".into(), &cancel).is_none());
        clients.remove(first.unwrap().0);
        assert_eq!(clients.len(), 0);
        assert!(clients.add("c".into(), &cancel).is_some());
    }
}
