//! AWS Kinesis stream consumer: shard discovery, one worker per shard,
//! opaque sequence-number offsets in a JSON sidecar, optional background
//! re-discovery of new shards.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_kinesis::types::ShardIteratorType;
use aws_sdk_kinesis::Client;
use bytes::Bytes;
use sluice_core::{
    ControlSlot, Dispatcher, KinesisSpec, Metadata, OffsetStart, Plugin, RunState, Source,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shard id to the last enqueued sequence number.
type SequenceMap = Arc<RwLock<HashMap<String, String>>>;

pub struct KinesisSource {
    spec: KinesisSpec,
}

impl KinesisSource {
    pub fn try_new(spec: KinesisSpec) -> Result<Self> {
        if !(1..=10000).contains(&spec.records_per_query) {
            anyhow::bail!(
                "records_per_query {} outside 1..=10000",
                spec.records_per_query
            );
        }
        Ok(Self { spec })
    }

    async fn client(&self) -> Client {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &self.spec.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &self.spec.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        Client::new(&loader.load().await)
    }
}

impl Plugin for KinesisSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for KinesisSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let client = self.client().await;

        let sequences: SequenceMap = Arc::new(RwLock::new(
            self.spec
                .offset_file
                .as_deref()
                .map(load_sequences)
                .unwrap_or_default(),
        ));
        let known: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let shards = list_shards(&client, &self.spec.stream)
            .await
            .context("list shards")?;
        if shards.is_empty() {
            anyhow::bail!("stream {:?} has no shards", self.spec.stream);
        }
        info!(
            consumer = %self.name(),
            stream = %self.spec.stream,
            shards = shards.len(),
            "kinesis consumer started"
        );
        for shard in shards {
            spawn_shard_worker(
                &state,
                &known,
                ShardWorker {
                    spec: Arc::new(self.spec.clone()),
                    client: client.clone(),
                    out: out.clone(),
                    sequences: sequences.clone(),
                    cancel: state.cancel_token(),
                    shard,
                },
            );
        }

        if self.spec.check_new_shards_sec > 0 {
            let discover = ShardDiscovery {
                spec: Arc::new(self.spec.clone()),
                client: client.clone(),
                out: out.clone(),
                sequences: sequences.clone(),
                known: known.clone(),
                state: state.clone(),
            };
            state.spawn_worker("shard-discovery", discover.run());
        }

        let flush_sequences = sequences.clone();
        let flush_path = self.spec.offset_file.clone();
        let flush = move || {
            if let Some(path) = &flush_path {
                if let Err(err) = persist_sequences(path, &flush_sequences) {
                    warn!(offset_file = %path.display(), error = %err, "sequence flush failed");
                }
            }
        };
        state
            .ticker_control_loop(
                &mut ctl,
                Duration::from_secs(self.spec.offset_flush_sec.max(1)),
                flush.clone(),
                || {},
            )
            .await;
        state.wait_workers().await;
        flush();
        Ok(())
    }
}

fn spawn_shard_worker(state: &RunState, known: &Arc<Mutex<HashSet<String>>>, worker: ShardWorker) {
    let mut known_set = known.lock().unwrap_or_else(|e| e.into_inner());
    if !known_set.insert(worker.shard.clone()) {
        return;
    }
    drop(known_set);
    debug!(shard = %worker.shard, "shard worker starting");
    state.spawn_worker("shard-read", worker.run());
}

async fn list_shards(client: &Client, stream: &str) -> Result<Vec<String>> {
    let mut shards = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut request = client.list_shards();
        request = match token {
            Some(token) => request.next_token(token),
            None => request.stream_name(stream),
        };
        let response = request.send().await?;
        shards.extend(
            response
                .shards()
                .iter()
                .map(|s| s.shard_id().to_string()),
        );
        token = response.next_token().map(str::to_string);
        if token.is_none() {
            return Ok(shards);
        }
    }
}

/// Periodic re-description of the stream; unseen shards get workers.
struct ShardDiscovery {
    spec: Arc<KinesisSpec>,
    client: Client,
    out: Dispatcher,
    sequences: SequenceMap,
    known: Arc<Mutex<HashSet<String>>>,
    state: RunState,
}

impl ShardDiscovery {
    async fn run(self) -> Result<()> {
        let cancel = self.state.cancel_token();
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.spec.check_new_shards_sec.max(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            match list_shards(&self.client, &self.spec.stream).await {
                Ok(shards) => {
                    for shard in shards {
                        spawn_shard_worker(
                            &self.state,
                            &self.known,
                            ShardWorker {
                                spec: self.spec.clone(),
                                client: self.client.clone(),
                                out: self.out.clone(),
                                sequences: self.sequences.clone(),
                                cancel: self.state.cancel_token(),
                                shard,
                            },
                        );
                    }
                }
                Err(err) => warn!(error = %err, "shard discovery failed"),
            }
        }
    }
}

struct ShardWorker {
    spec: Arc<KinesisSpec>,
    client: Client,
    out: Dispatcher,
    sequences: SequenceMap,
    cancel: CancellationToken,
    shard: String,
}

impl ShardWorker {
    async fn run(self) -> Result<()> {
        let idle = Duration::from_millis(self.spec.idle_delay_ms.max(1));
        let retry = Duration::from_secs(self.spec.retry_delay_sec.max(1));

        let mut iterator = match self.acquire_iterator().await {
            Some(iterator) => iterator,
            None => return Ok(()),
        };

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = self
                    .client
                    .get_records()
                    .shard_iterator(&iterator)
                    .limit(self.spec.records_per_query)
                    .send() => r,
            };
            match response {
                Ok(output) => {
                    for record in output.records() {
                        let sequence = record.sequence_number().to_string();
                        self.enqueue(record.data().as_ref(), record.partition_key())
                            .await?;
                        self.sequences
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(self.shard.clone(), sequence);
                    }
                    match output.next_shard_iterator() {
                        Some(next) => {
                            let empty = output.records().is_empty();
                            iterator = next.to_string();
                            if empty {
                                self.sleep(idle).await;
                            }
                        }
                        // Shard closed by a reshard; the discovery
                        // ticker picks up its children.
                        None => {
                            info!(shard = %self.shard, "shard closed");
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    let expired = err
                        .as_service_error()
                        .map(|e| e.is_expired_iterator_exception())
                        .unwrap_or(false);
                    if expired {
                        debug!(shard = %self.shard, "iterator expired, re-acquiring");
                    } else {
                        warn!(shard = %self.shard, error = %err, "get_records failed");
                        self.sleep(retry).await;
                    }
                    iterator = match self.acquire_iterator().await {
                        Some(iterator) => iterator,
                        None => return Ok(()),
                    };
                }
            }
        }
    }

    /// Iterator from the stored sequence, or the configured default.
    /// Retries until cancelled.
    async fn acquire_iterator(&self) -> Option<String> {
        let retry = Duration::from_secs(self.spec.retry_delay_sec.max(1));
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let stored = self
                .sequences
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&self.shard)
                .cloned();
            let mut request = self
                .client
                .get_shard_iterator()
                .stream_name(&self.spec.stream)
                .shard_id(&self.shard);
            request = match (&stored, self.spec.default_offset) {
                (Some(sequence), _) => request
                    .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                    .starting_sequence_number(sequence),
                (None, OffsetStart::Oldest) => {
                    request.shard_iterator_type(ShardIteratorType::TrimHorizon)
                }
                (None, OffsetStart::Newest) => {
                    request.shard_iterator_type(ShardIteratorType::Latest)
                }
            };
            match request.send().await {
                Ok(output) => match output.shard_iterator() {
                    Some(iterator) => return Some(iterator.to_string()),
                    None => return None,
                },
                Err(err) => {
                    warn!(shard = %self.shard, error = %err, "get_shard_iterator failed");
                    self.sleep(retry).await;
                }
            }
        }
    }

    async fn enqueue(&self, data: &[u8], partition_key: &str) -> Result<()> {
        let payload = Bytes::copy_from_slice(data);
        if self.out.wants_metadata() {
            let mut meta = Metadata::new();
            meta.insert("shard".into(), Bytes::from(self.shard.clone()));
            meta.insert("key".into(), Bytes::from(partition_key.to_string()));
            self.out.enqueue_with_metadata(payload, meta).await
        } else {
            self.out.enqueue(payload).await
        }
    }

    async fn sleep(&self, d: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(d) => {}
        }
    }
}

/// `{ "<shard id>": "<sequence number>" }`.
fn load_sequences(path: &Path) -> HashMap<String, String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str(&text) {
        Ok(map) => map,
        Err(err) => {
            warn!(offset_file = %path.display(), error = %err, "unreadable offset file ignored");
            HashMap::new()
        }
    }
}

fn persist_sequences(path: &Path, sequences: &SequenceMap) -> Result<()> {
    let map = sequences.read().unwrap_or_else(|e| e.into_inner());
    let json = serde_json::to_string(&*map)?;
    drop(map);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_sidecar_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sequences.json");

        let sequences: SequenceMap = Arc::new(RwLock::new(HashMap::new()));
        sequences
            .write()
            .unwrap()
            .insert("shardId-000000000000".into(), "49590338271490256608".into());
        persist_sequences(&path, &sequences).unwrap();

        let loaded = load_sequences(&path);
        assert_eq!(
            loaded.get("shardId-000000000000").map(String::as_str),
            Some("49590338271490256608")
        );
    }

    #[test]
    fn junk_sequence_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sequences.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(load_sequences(&path).is_empty());
    }

    #[test]
    fn records_per_query_is_validated() {
        let spec = KinesisSpec {
            common: sluice_core::CommonSpec {
                id: "k".into(),
                streams: vec!["*".into()],
                set_metadata: false,
                filters: Vec::new(),
            },
            stream: "events".into(),
            region: None,
            endpoint: None,
            records_per_query: 0,
            idle_delay_ms: 1000,
            retry_delay_sec: 4,
            default_offset: OffsetStart::Newest,
            offset_file: None,
            offset_flush_sec: 5,
            check_new_shards_sec: 0,
        };
        assert!(KinesisSource::try_new(spec).is_err());
    }
}
