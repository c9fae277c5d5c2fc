//! End-to-end: consumers built from a YAML document, wired through a
//! dispatcher with a real filter chain, feeding the router channel.

use std::time::Duration;

use sluice_core::stream::{self, StreamId};
use sluice_core::{
    control_channel, Control, ControlHandle, Dispatcher, MessageRx, PipelineConfig, Runtime,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Build and spawn every consumer of a config, exactly like the daemon
/// does.
fn launch(
    yaml: &str,
    runtime: &Runtime,
    capacity: usize,
) -> (
    MessageRx,
    Vec<ControlHandle>,
    Vec<tokio::task::JoinHandle<anyhow::Result<()>>>,
) {
    let config: PipelineConfig = serde_yaml::from_str(yaml).expect("config parses");
    let (router_tx, router_rx) = tokio::sync::mpsc::channel(capacity);

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for spec in &config.consumers {
        let common = spec.common();
        let mut source = sluice_io::create_consumer(spec).expect("consumer builds");
        let filters = sluice_tx::create_chain(&common.filters, runtime).expect("filters build");
        let out = Dispatcher::new(
            &common.id,
            &common.streams,
            filters,
            router_tx.clone(),
            runtime.clone(),
            common.set_metadata,
        );
        let (handle, slot) = control_channel();
        handles.push(handle);
        let cancel = runtime.shutdown_token();
        tasks.push(tokio::spawn(
            async move { source.run(out, slot, cancel).await },
        ));
    }
    (router_rx, handles, tasks)
}

async fn recv(rx: &mut MessageRx) -> sluice_core::Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message in time")
        .expect("router open")
}

#[tokio::test]
async fn socket_with_rate_filter_reroutes_the_overflow() {
    let yaml = r#"
name: "it"
consumers:
  - type: socket
    id: "bulk"
    streams: ["bulk"]
    address: "tcp://127.0.0.1:16880"
    filters:
      - type: rate
        messages_per_sec: 2
        drop_to: "_DROPPED_"
"#;
    let runtime = Runtime::new(16);
    let (mut rx, handles, tasks) = launch(yaml, &runtime, 64);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect("127.0.0.1:16880").await.unwrap();
    client.write_all(b"a\nb\nc\nd\n").await.unwrap();
    client.shutdown().await.unwrap();

    let mut accepted = 0;
    let mut dropped = 0;
    for _ in 0..4 {
        let msg = recv(&mut rx).await;
        if msg.stream == StreamId::from_name("bulk") {
            accepted += 1;
        } else {
            assert_eq!(msg.stream, stream::DROPPED);
            dropped += 1;
        }
    }
    assert_eq!(accepted, 2);
    assert_eq!(dropped, 2);

    for handle in &handles {
        handle.signal(Control::Stop);
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn loopback_and_file_consumers_share_one_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, "first\n").unwrap();

    let yaml = format!(
        r#"
name: "it"
consumers:
  - type: file
    id: "app"
    streams: ["app"]
    path: "{}"
    default_offset: oldest
    polling_delay_ms: 10
  - type: loopback
    id: "retry"
    routes:
      app: ["app-replay"]
"#,
        log.display()
    );
    let runtime = Runtime::new(16);
    let (mut rx, handles, tasks) = launch(&yaml, &runtime, 64);

    let first = recv(&mut rx).await;
    assert_eq!(first.payload.as_ref(), b"first");
    assert_eq!(first.stream, StreamId::from_name("app"));

    // A sink hands the message back; the loopback consumer re-routes it.
    runtime.retry(first.clone()).unwrap();
    let replayed = recv(&mut rx).await;
    assert_eq!(replayed.payload.as_ref(), b"first");
    assert_eq!(replayed.stream, StreamId::from_name("app-replay"));

    // Unknown streams fall back to the wildcard route.
    runtime
        .retry(sluice_core::Message::new(
            "stray",
            StreamId::from_name("unknown"),
        ))
        .unwrap();
    let strayed = recv(&mut rx).await;
    assert_eq!(strayed.stream, stream::DROPPED);

    for handle in &handles {
        handle.signal(Control::Stop);
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn misconfigured_consumers_fail_before_running() {
    for yaml in [
        // Bad regex.
        r#"
name: "bad"
consumers:
  - type: file
    id: "f"
    path: "/tmp/x.log"
    whitelist: "(["
"#,
        // Proxy cannot listen on udp.
        r#"
name: "bad"
consumers:
  - type: proxy
    id: "p"
    address: "udp://0.0.0.0:1"
"#,
        // Unknown framing mode.
        r#"
name: "bad"
consumers:
  - type: socket
    id: "s"
    framing:
      partitioner: "zigzag"
"#,
    ] {
        let config: PipelineConfig = serde_yaml::from_str(yaml).expect("parses");
        let result = sluice_io::create_consumer(&config.consumers[0]);
        assert!(result.is_err(), "expected config rejection for {yaml}");
    }
}
