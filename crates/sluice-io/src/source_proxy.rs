//! Bidirectional socket consumer: like the socket server, but every
//! message carries a reply handle so producers can write a response back
//! on the originating connection. Clients borrow the consumer, never the
//! reverse; the accept loop outlives every client it spawns.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::{
    BufferedReader, ControlSlot, Dispatcher, FrameError, Framing, Plugin, ProxySpec, RunState,
    Source,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::{parse_endpoint, Endpoint};
use crate::source_socket::ClientList;

/// Bidirectional socket server. UDP is unsupported: there is no
/// connection to write a response to.
pub struct ProxySource {
    spec: ProxySpec,
    endpoint: Endpoint,
}

impl ProxySource {
    pub fn try_new(spec: ProxySpec) -> Result<Self> {
        spec.framing.build()?;
        let endpoint = parse_endpoint(&spec.address, true)?;
        if matches!(endpoint, Endpoint::Udp(_)) {
            anyhow::bail!("proxy consumer cannot listen on udp ({})", spec.address);
        }
        Ok(Self { spec, endpoint })
    }
}

impl Plugin for ProxySource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for ProxySource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let clients = ClientList::new(self.spec.max_clients);
        let framing = self.spec.framing.build()?;

        let accept = ProxyAccept {
            spec: self.spec.clone(),
            framing,
            out,
            state: state.clone(),
            clients: clients.clone(),
        };
        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("bind tcp {addr}"))?;
                info!(consumer = %self.name(), %addr, "proxy listening (tcp)");
                state.spawn_worker("accept", accept.run_tcp(listener));
            }
            Endpoint::Unix(path) => {
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("bind unix {}", path.display()))?;
                info!(consumer = %self.name(), path = %path.display(), "proxy listening (unix)");
                state.spawn_worker("accept", accept.run_unix(listener));
            }
            Endpoint::Udp(_) => unreachable!("rejected in try_new"),
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

struct ProxyAccept {
    spec: ProxySpec,
    framing: Framing,
    out: Dispatcher,
    state: RunState,
    clients: ClientList,
}

impl ProxyAccept {
    async fn run_tcp(self, listener: TcpListener) -> Result<()> {
        let cancel = self.state.cancel_token();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                a = listener.accept() => a,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let (read, write) = stream.into_split();
                    self.spawn_client(read, write, peer.to_string());
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
    }

    async fn run_unix(self, listener: UnixListener) -> Result<()> {
        let cancel = self.state.cancel_token();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                a = listener.accept() => a,
            };
            match accepted {
                Ok((stream, _)) => {
                    let (read, write) = stream.into_split();
                    self.spawn_client(read, write, "unix-client".to_string());
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
    }

    fn spawn_client<R, W>(&self, read: R, write: W, peer: String)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some((id, cancel)) = self.clients.add(peer.clone(), &self.state.cancel_token()) else {
            warn!(%peer, max = self.spec.max_clients, "client limit reached, rejecting");
            return;
        };
        debug!(%peer, "proxy client connected");

        // Producers write into this; the writer task owns the send half
        // of the connection.
        let (reply_tx, reply_rx) = mpsc::channel::<Bytes>(64);

        let writer_cancel = cancel.clone();
        self.state.spawn_worker("proxy-write", async move {
            write_responses(write, reply_rx, writer_cancel).await
        });

        let reader = ProxyReader {
            spec: self.spec.clone(),
            framing: self.framing.clone(),
            out: self.out.clone(),
            cancel,
            peer,
            reply: reply_tx,
        };
        let clients = self.clients.clone();
        self.state.spawn_worker("proxy-read", async move {
            let result = reader.run(read).await;
            clients.remove(id);
            result
        });
    }
}

async fn write_responses<W>(
    mut write: W,
    mut replies: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = replies.recv() => r,
        };
        match next {
            Some(response) => {
                if let Err(err) = write.write_all(&response).await {
                    debug!(error = %err, "proxy response write failed");
                    return Ok(());
                }
            }
            // Reader gone and all pending messages released.
            None => return Ok(()),
        }
    }
}

struct ProxyReader {
    spec: ProxySpec,
    framing: Framing,
    out: Dispatcher,
    cancel: CancellationToken,
    peer: String,
    reply: mpsc::Sender<Bytes>,
}

impl ProxyReader {
    async fn run<R>(&self, mut read: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = BufferedReader::new(self.framing.clone(), self.spec.framing.max_frame());
        let read_timeout = Duration::from_secs(self.spec.read_timeout_sec.max(1));
        let mut frames: Vec<Bytes> = Vec::new();

        loop {
            let mut on_frame = |f: &[u8]| frames.push(Bytes::copy_from_slice(f));
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = tokio::time::timeout(
                    read_timeout,
                    reader.read_from(&mut read, &mut on_frame),
                ) => r,
            };
            let result = match result {
                Err(_elapsed) => continue,
                Ok(result) => result,
            };
            match result {
                Ok(_) => self.drain(&mut frames).await?,
                Err(FrameError::Eof) => {
                    reader.flush(&mut |f| frames.push(Bytes::copy_from_slice(f)));
                    self.drain(&mut frames).await?;
                    debug!(peer = %self.peer, "proxy client disconnected");
                    return Ok(());
                }
                Err(FrameError::DataInvalid(reason)) => {
                    debug!(peer = %self.peer, %reason, "invalid frame, closing proxy client");
                    return Ok(());
                }
                Err(FrameError::Io(err)) => {
                    if !self.cancel.is_cancelled()
                        && err.kind() != std::io::ErrorKind::ConnectionReset
                    {
                        debug!(peer = %self.peer, error = %err, "proxy read failed");
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn drain(&self, frames: &mut Vec<Bytes>) -> Result<()> {
        for frame in frames.drain(..) {
            self.out
                .enqueue_with_reply(frame, None, self.reply.clone())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{control_channel, CommonSpec, Control, FramingSpec, Runtime};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn messages_carry_a_working_reply_handle() {
        let spec = ProxySpec {
            common: CommonSpec {
                id: "test-proxy".into(),
                streams: vec!["proxy".into()],
                set_metadata: false,
                filters: Vec::new(),
            },
            address: "tcp://127.0.0.1:15890".into(),
            framing: FramingSpec::default(),
            read_timeout_sec: 1,
            max_clients: 0,
        };

        let runtime = Runtime::new(16);
        let (tx, mut rx) = mpsc::channel(64);
        let out = Dispatcher::new(
            "test-proxy",
            &["proxy".to_string()],
            Vec::new(),
            tx,
            runtime.clone(),
            false,
        );
        let cancel = runtime.shutdown_token();
        let (handle, ctl) = control_channel();
        let mut source = ProxySource::try_new(spec).unwrap();
        let task = tokio::spawn(async move { source.run(out, ctl, cancel).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut client = TcpStream::connect("127.0.0.1:15890").await.unwrap();
        client.write_all(b"ping\n").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload.as_ref(), b"ping");

        // A sink would respond through the reply handle.
        msg.reply
            .as_ref()
            .unwrap()
            .send(Bytes::from_static(b"pong\n"))
            .await
            .unwrap();
        let mut response = [0u8; 5];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"pong\n");

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[test]
    fn udp_addresses_are_rejected() {
        let spec = ProxySpec {
            common: CommonSpec {
                id: "p".into(),
                streams: vec!["*".into()],
                set_metadata: false,
                filters: Vec::new(),
            },
            address: "udp://0.0.0.0:5880".into(),
            framing: FramingSpec::default(),
            read_timeout_sec: 1,
            max_clients: 0,
        };
        assert!(ProxySource::try_new(spec).is_err());
    }
}
