//! Kafka topic consumer.
//!
//! Two modes: with a `group_id` the client library drives partition
//! assignment and commits offsets; without one the consumer assigns every
//! partition itself, reads them ordered (single round-robin worker) or in
//! parallel (worker per partition) and persists a JSON offset sidecar.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Message as KafkaMessage, Offset, TopicPartitionList};
use sluice_core::{ControlSlot, Dispatcher, KafkaSpec, Metadata, Plugin, RunState, Source};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-partition cells holding the next offset to read. Workers update
/// their own cell under the read lock; only structural changes take the
/// write lock.
type OffsetMap = Arc<RwLock<HashMap<i32, AtomicI64>>>;

pub struct KafkaSource {
    spec: KafkaSpec,
}

impl KafkaSource {
    pub fn try_new(spec: KafkaSpec) -> Result<Self> {
        parse_default_offset(&spec.default_offset)?;
        Ok(Self { spec })
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.spec.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000");
        if self.spec.group_id.is_empty() {
            // Manual assignment still wants a group name for broker
            // bookkeeping, but never commits through it.
            config
                .set("group.id", format!("sluice-{}", self.spec.common.id))
                .set("enable.auto.commit", "false");
        } else {
            config
                .set("group.id", &self.spec.group_id)
                .set("enable.auto.commit", "true")
                .set("auto.commit.interval.ms", "5000");
        }
        match self.spec.default_offset.as_str() {
            "oldest" => config.set("auto.offset.reset", "earliest"),
            _ => config.set("auto.offset.reset", "latest"),
        };
        for (key, value) in &self.spec.options {
            config.set(key, value);
        }
        config
    }
}

impl Plugin for KafkaSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);

        if !self.spec.group_id.is_empty() {
            let consumer: StreamConsumer =
                self.client_config().create().context("kafka consumer")?;
            consumer
                .subscribe(&[&self.spec.topic])
                .context("kafka subscribe")?;
            info!(
                consumer = %self.name(),
                topic = %self.spec.topic,
                group = %self.spec.group_id,
                "kafka group consumer started"
            );

            let worker = GroupWorker {
                spec: self.spec.clone(),
                out,
                cancel: state.cancel_token(),
            };
            state.spawn_worker("group-read", worker.run(consumer));
            state.control_loop(&mut ctl, || {}).await;
            state.wait_workers().await;
            return Ok(());
        }

        // Manual assignment.
        let consumer: Arc<StreamConsumer> =
            Arc::new(self.client_config().create().context("kafka consumer")?);
        let metadata = consumer
            .fetch_metadata(Some(&self.spec.topic), METADATA_TIMEOUT)
            .context("kafka metadata")?;
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.spec.topic)
            .map(|t| t.partitions().iter().map(|p| p.id()).collect())
            .unwrap_or_default();
        if partitions.is_empty() {
            anyhow::bail!("topic {:?} has no partitions", self.spec.topic);
        }

        let offsets: OffsetMap = Arc::new(RwLock::new(HashMap::new()));
        let stored = self
            .spec
            .offset_file
            .as_deref()
            .map(load_offsets)
            .unwrap_or_default();
        let default = parse_default_offset(&self.spec.default_offset)?;

        let mut assignment = TopicPartitionList::new();
        {
            let mut cells = offsets.write().unwrap_or_else(|e| e.into_inner());
            for &partition in &partitions {
                let start = stored.get(&partition).copied();
                let offset = match start {
                    Some(next) => Offset::Offset(next),
                    None => default,
                };
                assignment
                    .add_partition_offset(&self.spec.topic, partition, offset)
                    .context("assign partition")?;
                cells.insert(partition, AtomicI64::new(start.unwrap_or(-1)));
            }
        }
        consumer.assign(&assignment).context("kafka assign")?;
        info!(
            consumer = %self.name(),
            topic = %self.spec.topic,
            partitions = partitions.len(),
            ordered = self.spec.ordered,
            "kafka consumer started"
        );

        let mut queues = Vec::new();
        for &partition in &partitions {
            let queue = consumer
                .split_partition_queue(&self.spec.topic, partition)
                .with_context(|| format!("split partition {partition}"))?;
            queues.push((partition, queue));
        }

        // The main queue must keep being driven for rebalances and
        // errors even though all records arrive on the split queues.
        let driver_cancel = state.cancel_token();
        let driver = consumer.clone();
        state.spawn_worker("driver", async move {
            loop {
                tokio::select! {
                    _ = driver_cancel.cancelled() => return Ok(()),
                    result = driver.recv() => {
                        if let Err(err) = result {
                            debug!(error = %err, "kafka event");
                        }
                    }
                }
            }
        });

        if self.spec.ordered {
            let worker = PartitionWorker {
                spec: self.spec.clone(),
                out,
                offsets: offsets.clone(),
                consumer: consumer.clone(),
                cancel: state.cancel_token(),
            };
            state.spawn_worker("ordered-read", worker.run_round_robin(queues));
        } else {
            for (partition, queue) in queues {
                let worker = PartitionWorker {
                    spec: self.spec.clone(),
                    out: out.clone(),
                    offsets: offsets.clone(),
                    consumer: consumer.clone(),
                    cancel: state.cancel_token(),
                };
                state.spawn_worker("partition-read", worker.run_single(partition, queue));
            }
        }

        let flush_offsets = offsets.clone();
        let flush_path = self.spec.offset_file.clone();
        let flush = move || {
            if let Some(path) = &flush_path {
                if let Err(err) = persist_offsets(path, &flush_offsets) {
                    warn!(offset_file = %path.display(), error = %err, "offset flush failed");
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

struct GroupWorker {
    spec: KafkaSpec,
    out: Dispatcher,
    cancel: CancellationToken,
}

impl GroupWorker {
    async fn run(self, consumer: StreamConsumer) -> Result<()> {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = consumer.recv() => r,
            };
            match received {
                Ok(message) => {
                    enqueue_record(
                        &self.out,
                        &self.spec.topic,
                        message.partition(),
                        message.key(),
                        message.payload().unwrap_or_default(),
                    )
                    .await?;
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    warn!(error = %err, "kafka receive failed");
                    tokio::time::sleep(Duration::from_millis(self.spec.retry_delay_ms.max(1)))
                        .await;
                }
            }
        }
    }
}

type PartitionQueue = rdkafka::consumer::stream_consumer::StreamPartitionQueue<
    rdkafka::consumer::DefaultConsumerContext,
>;

struct PartitionWorker {
    spec: KafkaSpec,
    out: Dispatcher,
    offsets: OffsetMap,
    consumer: Arc<StreamConsumer>,
    cancel: CancellationToken,
}

impl PartitionWorker {
    /// Parallel mode: one worker drains one partition sequentially.
    async fn run_single(self, partition: i32, queue: PartitionQueue) -> Result<()> {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = queue.recv() => r,
            };
            self.handle(partition, received).await?;
        }
    }

    /// Ordered mode: walk every partition round-robin, one record per
    /// iteration, yielding briefly when nothing is available.
    async fn run_round_robin(self, queues: Vec<(i32, PartitionQueue)>) -> Result<()> {
        let poll = Duration::from_millis(10);
        loop {
            let mut idle = true;
            for (partition, queue) in &queues {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                match tokio::time::timeout(poll, queue.recv()).await {
                    Ok(received) => {
                        idle = false;
                        self.handle(*partition, received).await?;
                    }
                    Err(_elapsed) => {}
                }
            }
            if idle {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }

    async fn handle(
        &self,
        partition: i32,
        received: rdkafka::error::KafkaResult<rdkafka::message::BorrowedMessage<'_>>,
    ) -> Result<()> {
        match received {
            Ok(message) => {
                enqueue_record(
                    &self.out,
                    &self.spec.topic,
                    partition,
                    message.key(),
                    message.payload().unwrap_or_default(),
                )
                .await?;
                let next = message.offset() + 1;
                let cells = self.offsets.read().unwrap_or_else(|e| e.into_inner());
                if let Some(cell) = cells.get(&partition) {
                    cell.store(next, Ordering::SeqCst);
                }
            }
            Err(err) => {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                if matches!(
                    err,
                    KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange)
                ) {
                    warn!(partition, "offset out of range, rewinding to oldest");
                    let _ = self.consumer.seek(
                        &self.spec.topic,
                        partition,
                        Offset::Beginning,
                        METADATA_TIMEOUT,
                    );
                    let cells = self.offsets.read().unwrap_or_else(|e| e.into_inner());
                    if let Some(cell) = cells.get(&partition) {
                        cell.store(-1, Ordering::SeqCst);
                    }
                } else {
                    warn!(partition, error = %err, "kafka partition read failed");
                }
                tokio::time::sleep(Duration::from_millis(self.spec.retry_delay_ms.max(1))).await;
            }
        }
        Ok(())
    }
}

async fn enqueue_record(
    out: &Dispatcher,
    topic: &str,
    partition: i32,
    key: Option<&[u8]>,
    payload: &[u8],
) -> Result<()> {
    let payload = Bytes::copy_from_slice(payload);
    if out.wants_metadata() {
        let mut meta = Metadata::new();
        meta.insert("topic".into(), Bytes::from(topic.to_string()));
        meta.insert("partition".into(), Bytes::from(partition.to_string()));
        if let Some(key) = key {
            meta.insert("key".into(), Bytes::copy_from_slice(key));
        }
        out.enqueue_with_metadata(payload, meta).await
    } else {
        out.enqueue(payload).await
    }
}

fn parse_default_offset(value: &str) -> Result<Offset> {
    match value {
        "newest" => Ok(Offset::End),
        "oldest" => Ok(Offset::Beginning),
        number => number
            .parse::<i64>()
            .map(Offset::Offset)
            .with_context(|| format!("default_offset {value:?} is not newest, oldest or a number")),
    }
}

/// `{ "<partition>": <next offset> }`; absent or unreadable files start
/// from the configured default.
fn load_offsets(path: &Path) -> HashMap<i32, i64> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, i64>>(&text) {
        Ok(map) => map
            .into_iter()
            .filter_map(|(partition, offset)| partition.parse().ok().map(|p| (p, offset)))
            .collect(),
        Err(err) => {
            warn!(offset_file = %path.display(), error = %err, "unreadable offset file ignored");
            HashMap::new()
        }
    }
}

fn persist_offsets(path: &Path, offsets: &OffsetMap) -> Result<()> {
    let cells = offsets.read().unwrap_or_else(|e| e.into_inner());
    let map: HashMap<String, i64> = cells
        .iter()
        .filter(|(_, cell)| cell.load(Ordering::SeqCst) >= 0)
        .map(|(partition, cell)| (partition.to_string(), cell.load(Ordering::SeqCst)))
        .collect();
    drop(cells);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_string(&map)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_offset_parses_names_and_numbers() {
        assert_eq!(parse_default_offset("newest").unwrap(), Offset::End);
        assert_eq!(parse_default_offset("oldest").unwrap(), Offset::Beginning);
        assert_eq!(parse_default_offset("42").unwrap(), Offset::Offset(42));
        assert!(parse_default_offset("sideways").is_err());
    }

    #[test]
    fn offset_sidecar_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let offsets: OffsetMap = Arc::new(RwLock::new(HashMap::new()));
        {
            let mut cells = offsets.write().unwrap();
            cells.insert(0, AtomicI64::new(41));
            cells.insert(3, AtomicI64::new(7));
            // Untouched partitions stay out of the file.
            cells.insert(5, AtomicI64::new(-1));
        }
        persist_offsets(&path, &offsets).unwrap();

        let loaded = load_offsets(&path);
        assert_eq!(loaded.get(&0), Some(&41));
        assert_eq!(loaded.get(&3), Some(&7));
        assert!(!loaded.contains_key(&5));
    }

    #[test]
    fn junk_offset_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert!(load_offsets(&path).is_empty());
        assert!(load_offsets(&dir.path().join("missing.json")).is_empty());
    }
}
