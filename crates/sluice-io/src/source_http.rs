//! HTTP(S) ingestion endpoint: every request becomes one message, either
//! the full serialized request or the body alone.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use sha2::{Digest, Sha256};
use sluice_core::{ControlSlot, Dispatcher, HttpSpec, Plugin, RunState, Source};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::normalize_host;

/// One htpasswd entry: plain text or `{SHA256}` + base64 digest.
enum HtEntry {
    Plain(String),
    Sha256(Vec<u8>),
}

struct HttpCtx {
    out: Dispatcher,
    auth: Option<HashMap<String, HtEntry>>,
    with_headers: bool,
}

/// HTTP server consumer.
pub struct HttpSource {
    spec: HttpSpec,
    addr: SocketAddr,
    tls: Option<Arc<tokio_rustls::rustls::ServerConfig>>,
    auth: Option<HashMap<String, HtEntry>>,
}

impl HttpSource {
    pub fn try_new(spec: HttpSpec) -> Result<Self> {
        let addr: SocketAddr = normalize_host(&spec.address)?
            .parse()
            .with_context(|| format!("http address {:?}", spec.address))?;

        let auth = spec
            .htpasswd
            .as_deref()
            .map(load_htpasswd)
            .transpose()?;

        let tls = match (&spec.certificate, &spec.private_key) {
            (Some(cert), Some(key)) => Some(Arc::new(load_tls(cert, key)?)),
            (None, None) => None,
            _ => anyhow::bail!("certificate and private_key must be set together"),
        };

        Ok(Self {
            spec,
            addr,
            tls,
            auth,
        })
    }
}

impl Plugin for HttpSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let ctx = Arc::new(HttpCtx {
            out,
            auth: self.auth.take(),
            with_headers: self.spec.with_headers,
        });

        match &self.tls {
            None => {
                let server_cancel = state.cancel_token();
                let make_svc = make_service_fn(move |_conn| {
                    let ctx = ctx.clone();
                    async move {
                        Ok::<_, Infallible>(service_fn(move |req| handle(req, ctx.clone())))
                    }
                });
                let server = hyper::Server::try_bind(&self.addr)
                    .with_context(|| format!("bind http {}", self.addr))?
                    .serve(make_svc);
                info!(consumer = %self.name(), addr = %self.addr, "listening (http)");
                state.spawn_worker("http-serve", async move {
                    server
                        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                        .await
                        .context("http server")
                });
            }
            Some(config) => {
                let listener = TcpListener::bind(self.addr)
                    .await
                    .with_context(|| format!("bind https {}", self.addr))?;
                info!(consumer = %self.name(), addr = %self.addr, "listening (https)");
                let acceptor = TlsAcceptor::from(config.clone());
                let accept_state = state.clone();
                let accept_cancel = state.cancel_token();
                state.spawn_worker("https-accept", async move {
                    loop {
                        let accepted = tokio::select! {
                            _ = accept_cancel.cancelled() => return Ok(()),
                            a = listener.accept() => a,
                        };
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                if accept_cancel.is_cancelled() {
                                    return Ok(());
                                }
                                warn!(error = %err, "accept failed");
                                continue;
                            }
                        };
                        let acceptor = acceptor.clone();
                        let ctx = ctx.clone();
                        accept_state.spawn_worker("https-conn", async move {
                            let tls = match acceptor.accept(stream).await {
                                Ok(tls) => tls,
                                Err(err) => {
                                    debug!(%peer, error = %err, "tls handshake failed");
                                    return Ok(());
                                }
                            };
                            let service =
                                service_fn(move |req| handle(req, ctx.clone()));
                            if let Err(err) = hyper::server::conn::Http::new()
                                .serve_connection(tls, service)
                                .await
                            {
                                debug!(%peer, error = %err, "https connection failed");
                            }
                            Ok(())
                        });
                    }
                });
            }
        }

        state.control_loop(&mut ctl, || {}).await;
        state.wait_workers().await;
        Ok(())
    }
}

async fn handle(req: Request<Body>, ctx: Arc<HttpCtx>) -> Result<Response<Body>, Infallible> {
    if let Some(users) = &ctx.auth {
        if !authorized(&req, users) {
            let response = Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(WWW_AUTHENTICATE, "Basic realm=\"sluice\"")
                .body(Body::empty())
                .unwrap_or_default();
            return Ok(response);
        }
    }

    let payload = if ctx.with_headers {
        match serialize_request(req).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(status(StatusCode::BAD_REQUEST)),
        }
    } else {
        match hyper::body::to_bytes(req.into_body()).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(status(StatusCode::BAD_REQUEST)),
        }
    };

    match ctx.out.enqueue(payload).await {
        Ok(()) => Ok(status(StatusCode::OK)),
        Err(err) => {
            warn!(error = ?err, "http enqueue failed");
            Ok(status(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn status(code: StatusCode) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::empty())
        .unwrap_or_default()
}

fn authorized(req: &Request<Body>, users: &HashMap<String, HtEntry>) -> bool {
    use base64::Engine as _;

    let Some(value) = req.headers().get(AUTHORIZATION) else {
        return false;
    };
    let Some(encoded) = value.to_str().ok().and_then(|v| v.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = pair.split_once(':') else {
        return false;
    };
    match users.get(user) {
        Some(HtEntry::Plain(expected)) => expected == password,
        Some(HtEntry::Sha256(expected)) => {
            Sha256::digest(password.as_bytes()).as_slice() == expected.as_slice()
        }
        None => false,
    }
}

/// Re-serialize the request (request line, headers, body) into one
/// payload.
async fn serialize_request(req: Request<Body>) -> Result<Bytes> {
    let (parts, body) = req.into_parts();
    let body = hyper::body::to_bytes(body).await.context("read body")?;

    let mut out = Vec::with_capacity(256 + body.len());
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    out.extend_from_slice(format!("{} {} {:?}\r\n", parts.method, path, parts.version).as_bytes());
    for (name, value) in &parts.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&body);
    Ok(Bytes::from(out))
}

fn load_htpasswd(path: &Path) -> Result<HashMap<String, HtEntry>> {
    use base64::Engine as _;

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read htpasswd {}", path.display()))?;
    let mut users = HashMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (user, secret) = line
            .split_once(':')
            .with_context(|| format!("htpasswd line {} has no colon", lineno + 1))?;
        let entry = if let Some(digest) = secret.strip_prefix("{SHA256}") {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(digest)
                .with_context(|| format!("htpasswd line {}: bad base64", lineno + 1))?;
            HtEntry::Sha256(bytes)
        } else if secret.starts_with('{') || secret.starts_with("$apr1$") {
            anyhow::bail!(
                "htpasswd line {}: unsupported hash scheme (plain or {{SHA256}} only)",
                lineno + 1
            );
        } else {
            HtEntry::Plain(secret.to_string())
        };
        users.insert(user.to_string(), entry);
    }
    Ok(users)
}

fn load_tls(cert: &Path, key: &Path) -> Result<tokio_rustls::rustls::ServerConfig> {
    let certs = {
        let mut reader = std::io::BufReader::new(
            std::fs::File::open(cert).with_context(|| format!("open {}", cert.display()))?,
        );
        rustls_pemfile::certs(&mut reader)
            .collect::<std::io::Result<Vec<_>>>()
            .context("parse certificate")?
    };
    let key = {
        let mut reader = std::io::BufReader::new(
            std::fs::File::open(key).with_context(|| format!("open {}", key.display()))?,
        );
        rustls_pemfile::private_key(&mut reader)
            .context("parse private key")?
            .context("no private key in file")?
    };
    tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("tls config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{control_channel, CommonSpec, Control, Runtime};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn spec(address: &str, htpasswd: Option<std::path::PathBuf>, with_headers: bool) -> HttpSpec {
        HttpSpec {
            common: CommonSpec {
                id: "test-http".into(),
                streams: vec!["web".into()],
                set_metadata: false,
                filters: Vec::new(),
            },
            address: address.into(),
            with_headers,
            htpasswd,
            certificate: None,
            private_key: None,
        }
    }

    async fn start(
        spec: HttpSpec,
    ) -> (
        sluice_core::MessageRx,
        sluice_core::ControlHandle,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let runtime = Runtime::new(16);
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let out = Dispatcher::new(
            "test-http",
            &["web".to_string()],
            Vec::new(),
            tx,
            runtime.clone(),
            false,
        );
        let cancel = runtime.shutdown_token();
        let (handle, ctl) = control_channel();
        let mut source = HttpSource::try_new(spec).unwrap();
        let task = tokio::spawn(async move { source.run(out, ctl, cancel).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        (rx, handle, task)
    }

    async fn request(addr: &str, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn body_mode_enqueues_the_body_only() {
        let (mut rx, handle, task) = start(spec("127.0.0.1:19090", None, false)).await;

        let response = request(
            "127.0.0.1:19090",
            "POST /ingest HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload.as_ref(), b"hello");

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn header_mode_enqueues_the_whole_request() {
        let (mut rx, handle, task) = start(spec("127.0.0.1:19091", None, true)).await;

        let _ = request(
            "127.0.0.1:19091",
            "POST /ingest HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;

        let msg = rx.recv().await.unwrap();
        let text = String::from_utf8(msg.payload.to_vec()).unwrap();
        assert!(text.starts_with("POST /ingest HTTP/1.1\r\n"));
        assert!(text.contains("host: x"));
        assert!(text.ends_with("\r\n\r\nhello"));

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn basic_auth_gates_requests() {
        use base64::Engine as _;

        let dir = tempfile::tempdir().unwrap();
        let htpasswd = dir.path().join("htpasswd");
        let digest = base64::engine::general_purpose::STANDARD
            .encode(Sha256::digest(b"secret"));
        std::fs::write(&htpasswd, format!("alice:{{SHA256}}{digest}\nbob:plainpw\n")).unwrap();

        let (mut rx, handle, task) = start(spec("127.0.0.1:19092", Some(htpasswd), false)).await;

        let denied = request(
            "127.0.0.1:19092",
            "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\nConnection: close\r\n\r\nx",
        )
        .await;
        assert!(denied.starts_with("HTTP/1.1 401"));

        let credentials = base64::engine::general_purpose::STANDARD.encode("alice:secret");
        let allowed = request(
            "127.0.0.1:19092",
            &format!(
                "POST / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic {credentials}\r\nContent-Length: 1\r\nConnection: close\r\n\r\nx"
            ),
        )
        .await;
        assert!(allowed.starts_with("HTTP/1.1 200"));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload.as_ref(), b"x");

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }
}
