//! # Sluice Filters - In-line Message Predicates
//!
//! The filter chain runs synchronously inside a consumer's enqueue call,
//! between message construction and the router. Filters accept, reject
//! or reroute; rate and sample filters keep per-stream state, the rest
//! are pure predicates.
//!
//! ## Available filters
//!
//! - **deny**: always reject (a configured-off consumer)
//! - **stream**: stream-id block list / allow list
//! - **regexp**: payload or metadata-field regex with a negative guard
//! - **json**: regexes over values at paths inside a JSON payload
//! - **rate**: per-stream token bucket
//! - **sample**: first N of every M messages per stream
//! - **any**: short-circuit OR over child filters

use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::Regex;
use sluice_core::stream::StreamId;
use sluice_core::{Filter, FilterSpec, Message, Runtime, Verdict};
use tokio::time::Instant;
use tracing::debug;

/// Always rejects; configuring it turns a consumer into a sink-hole
/// without removing it from the pipeline.
pub struct DenyAll;

impl Filter for DenyAll {
    fn name(&self) -> &str {
        "deny"
    }

    fn apply(&mut self, _msg: &mut Message) -> Verdict {
        Verdict::Reject
    }
}

/// Stream-id allow/deny. A non-empty allow list wins over the block
/// list.
pub struct StreamFilter {
    block: Vec<StreamId>,
    only: Vec<StreamId>,
}

impl StreamFilter {
    pub fn new(block: Vec<StreamId>, only: Vec<StreamId>) -> Self {
        Self { block, only }
    }
}

impl Filter for StreamFilter {
    fn name(&self) -> &str {
        "stream"
    }

    fn apply(&mut self, msg: &mut Message) -> Verdict {
        if !self.only.is_empty() {
            return if self.only.contains(&msg.stream) {
                Verdict::Accept
            } else {
                Verdict::Reject
            };
        }
        if self.block.contains(&msg.stream) {
            Verdict::Reject
        } else {
            Verdict::Accept
        }
    }
}

/// Accept iff `expression` matches the target and `expression_not` does
/// not. The target is the payload, or one metadata value when
/// `apply_to` is set.
pub struct RegExpFilter {
    expression: Option<Regex>,
    expression_not: Option<Regex>,
    apply_to: Option<String>,
}

impl RegExpFilter {
    pub fn new(
        expression: Option<&str>,
        expression_not: Option<&str>,
        apply_to: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            expression: expression.map(Regex::new).transpose().context("expression")?,
            expression_not: expression_not
                .map(Regex::new)
                .transpose()
                .context("expression_not")?,
            apply_to,
        })
    }

    fn target<'a>(&self, msg: &'a Message) -> Option<&'a [u8]> {
        match &self.apply_to {
            Some(key) => msg.meta(key).map(|v| v.as_ref()),
            None => Some(msg.payload.as_ref()),
        }
    }
}

impl Filter for RegExpFilter {
    fn name(&self) -> &str {
        "regexp"
    }

    fn apply(&mut self, msg: &mut Message) -> Verdict {
        let Some(target) = self.target(msg) else {
            return Verdict::Reject;
        };
        let text = String::from_utf8_lossy(target);
        if let Some(expression) = &self.expression {
            if !expression.is_match(&text) {
                return Verdict::Reject;
            }
        }
        if let Some(expression_not) = &self.expression_not {
            if expression_not.is_match(&text) {
                return Verdict::Reject;
            }
        }
        Verdict::Accept
    }
}

/// Regexes over values inside a JSON payload. Any matching reject entry
/// vetoes; afterwards every accept entry must match. Paths are
/// `/`-separated and descend objects and arrays.
pub struct JsonFilter {
    reject: Vec<(String, Regex)>,
    accept: Vec<(String, Regex)>,
    apply_to: Option<String>,
}

impl JsonFilter {
    pub fn new(
        reject: Vec<(String, String)>,
        accept: Vec<(String, String)>,
        apply_to: Option<String>,
    ) -> Result<Self> {
        let compile = |pairs: Vec<(String, String)>| -> Result<Vec<(String, Regex)>> {
            pairs
                .into_iter()
                .map(|(path, pattern)| {
                    let regex = Regex::new(&pattern)
                        .with_context(|| format!("pattern for path {path:?}"))?;
                    Ok((path, regex))
                })
                .collect()
        };
        Ok(Self {
            reject: compile(reject)?,
            accept: compile(accept)?,
            apply_to,
        })
    }
}

/// Walk a `/`-separated path into nested objects and arrays.
fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for part in path.split('/') {
        current = match current {
            serde_json::Value::Object(map) => map.get(part)?,
            serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Regexes match against the bare string for strings and the JSON
/// rendering for everything else (`true`, `42`, ...).
fn json_value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Filter for JsonFilter {
    fn name(&self) -> &str {
        "json"
    }

    fn apply(&mut self, msg: &mut Message) -> Verdict {
        let data = match &self.apply_to {
            Some(key) => match msg.meta(key) {
                Some(value) => value.clone(),
                None => return Verdict::Reject,
            },
            None => msg.payload.clone(),
        };
        let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&data) else {
            return Verdict::Reject;
        };

        for (path, pattern) in &self.reject {
            if let Some(value) = json_path(&parsed, path) {
                if pattern.is_match(&json_value_text(value)) {
                    return Verdict::Reject;
                }
            }
        }
        for (path, pattern) in &self.accept {
            match json_path(&parsed, path) {
                Some(value) if pattern.is_match(&json_value_text(value)) => {}
                _ => return Verdict::Reject,
            }
        }
        Verdict::Accept
    }
}

struct Bucket {
    tokens: f64,
    refilled: Instant,
}

/// Token bucket per stream: up to `messages_per_sec` per stream per
/// second, refilling continuously. Streams on the ignore list bypass the
/// limit; rejected messages are discarded or rerouted to `drop_to`.
pub struct RateFilter {
    messages_per_sec: u64,
    ignore: Vec<StreamId>,
    drop_to: Option<StreamId>,
    buckets: HashMap<StreamId, Bucket>,
    runtime: Runtime,
}

impl RateFilter {
    pub fn new(
        messages_per_sec: u64,
        ignore: Vec<StreamId>,
        drop_to: Option<StreamId>,
        runtime: Runtime,
    ) -> Result<Self> {
        if messages_per_sec == 0 {
            anyhow::bail!("messages_per_sec must be positive");
        }
        Ok(Self {
            messages_per_sec,
            ignore,
            drop_to,
            buckets: HashMap::new(),
            runtime,
        })
    }
}

impl Filter for RateFilter {
    fn name(&self) -> &str {
        "rate"
    }

    fn apply(&mut self, msg: &mut Message) -> Verdict {
        if self.ignore.contains(&msg.stream) {
            return Verdict::Accept;
        }
        let capacity = self.messages_per_sec as f64;
        let now = Instant::now();
        let bucket = self.buckets.entry(msg.stream).or_insert(Bucket {
            tokens: capacity,
            refilled: now,
        });

        let elapsed = now.duration_since(bucket.refilled).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
        bucket.refilled = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Verdict::Accept;
        }

        let stream = self.runtime.registry().describe(msg.stream);
        debug!(%stream, "rate limit exceeded");
        metrics::counter!("rate_limited", 1, "stream" => stream);
        match self.drop_to {
            Some(target) => Verdict::Reroute(target),
            None => Verdict::Reject,
        }
    }
}

/// Accept the first `rate_per_group` of every `group_size` messages per
/// stream.
pub struct SampleFilter {
    group_size: u64,
    rate_per_group: u64,
    ignore: Vec<StreamId>,
    counters: HashMap<StreamId, u64>,
}

impl SampleFilter {
    pub fn new(group_size: u64, rate_per_group: u64, ignore: Vec<StreamId>) -> Result<Self> {
        if group_size == 0 {
            anyhow::bail!("group_size must be positive");
        }
        Ok(Self {
            group_size,
            rate_per_group,
            ignore,
            counters: HashMap::new(),
        })
    }
}

impl Filter for SampleFilter {
    fn name(&self) -> &str {
        "sample"
    }

    fn apply(&mut self, msg: &mut Message) -> Verdict {
        if self.ignore.contains(&msg.stream) {
            return Verdict::Accept;
        }
        let counter = self.counters.entry(msg.stream).or_insert(0);
        let position = *counter % self.group_size;
        *counter += 1;
        if position < self.rate_per_group {
            Verdict::Accept
        } else {
            Verdict::Reject
        }
    }
}

/// Short-circuit OR: accepts as soon as any child accepts; a child
/// reroute wins over plain rejection.
pub struct AnyFilter {
    filters: Vec<Box<dyn Filter>>,
}

impl AnyFilter {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }
}

impl Filter for AnyFilter {
    fn name(&self) -> &str {
        "any"
    }

    fn apply(&mut self, msg: &mut Message) -> Verdict {
        let mut reroute = None;
        for filter in self.filters.iter_mut() {
            match filter.apply(msg) {
                Verdict::Accept => return Verdict::Accept,
                Verdict::Reroute(target) => reroute.get_or_insert(target),
                Verdict::Reject => continue,
            };
        }
        match reroute {
            Some(target) => Verdict::Reroute(target),
            None => Verdict::Reject,
        }
    }
}

/// Build one filter from its spec. Stream names resolve through the
/// runtime's registry; bad regexes and parameters are configuration
/// errors.
pub fn create_filter(spec: &FilterSpec, runtime: &Runtime) -> Result<Box<dyn Filter>> {
    let resolve = |names: &[String]| -> Vec<StreamId> {
        names
            .iter()
            .map(|name| runtime.registry().register(name))
            .collect()
    };
    match spec {
        FilterSpec::Deny => Ok(Box::new(DenyAll)),
        FilterSpec::Stream { block, only } => {
            Ok(Box::new(StreamFilter::new(resolve(block), resolve(only))))
        }
        FilterSpec::RegExp {
            expression,
            expression_not,
            apply_to,
        } => Ok(Box::new(RegExpFilter::new(
            expression.as_deref(),
            expression_not.as_deref(),
            apply_to.clone(),
        )?)),
        FilterSpec::Json {
            reject,
            accept,
            apply_to,
        } => Ok(Box::new(JsonFilter::new(
            reject.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            accept.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            apply_to.clone(),
        )?)),
        FilterSpec::Rate {
            messages_per_sec,
            ignore,
            drop_to,
        } => Ok(Box::new(RateFilter::new(
            *messages_per_sec,
            resolve(ignore),
            drop_to.as_ref().map(|name| runtime.registry().register(name)),
            runtime.clone(),
        )?)),
        FilterSpec::Sample {
            group_size,
            rate_per_group,
            ignore,
        } => Ok(Box::new(SampleFilter::new(
            *group_size,
            *rate_per_group,
            resolve(ignore),
        )?)),
        FilterSpec::Any { filters } => {
            let children = filters
                .iter()
                .map(|child| create_filter(child, runtime))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(AnyFilter::new(children)))
        }
    }
}

/// Build a whole chain in configuration order.
pub fn create_chain(specs: &[FilterSpec], runtime: &Runtime) -> Result<Vec<Box<dyn Filter>>> {
    specs
        .iter()
        .map(|spec| create_filter(spec, runtime))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sluice_core::Metadata;

    fn msg(payload: &str, stream: &str) -> Message {
        Message::new(payload.to_string(), StreamId::from_name(stream))
    }

    #[test]
    fn deny_rejects_everything() {
        let mut filter = DenyAll;
        assert_eq!(filter.apply(&mut msg("x", "s")), Verdict::Reject);
    }

    #[test]
    fn stream_filter_allow_list_wins() {
        let mut filter = StreamFilter::new(
            vec![StreamId::from_name("a")],
            vec![StreamId::from_name("b")],
        );
        assert_eq!(filter.apply(&mut msg("x", "b")), Verdict::Accept);
        assert_eq!(filter.apply(&mut msg("x", "a")), Verdict::Reject);
        assert_eq!(filter.apply(&mut msg("x", "c")), Verdict::Reject);

        let mut block_only = StreamFilter::new(vec![StreamId::from_name("a")], Vec::new());
        assert_eq!(block_only.apply(&mut msg("x", "a")), Verdict::Reject);
        assert_eq!(block_only.apply(&mut msg("x", "c")), Verdict::Accept);
    }

    #[test]
    fn regexp_filter_positive_and_negative() {
        let mut filter = RegExpFilter::new(Some("^app"), Some("debug"), None).unwrap();
        assert_eq!(filter.apply(&mut msg("app: started", "s")), Verdict::Accept);
        assert_eq!(
            filter.apply(&mut msg("app: debug noise", "s")),
            Verdict::Reject
        );
        assert_eq!(filter.apply(&mut msg("kernel: oops", "s")), Verdict::Reject);
    }

    #[test]
    fn regexp_filter_on_metadata_key() {
        let mut filter = RegExpFilter::new(Some("\\.log$"), None, Some("file".into())).unwrap();
        let mut meta = Metadata::new();
        meta.insert("file".into(), Bytes::from_static(b"app.log"));
        let mut with_meta = msg("payload", "s").with_metadata(meta);
        assert_eq!(filter.apply(&mut with_meta), Verdict::Accept);
        // Missing key rejects.
        assert_eq!(filter.apply(&mut msg("payload", "s")), Verdict::Reject);
    }

    #[test]
    fn json_filter_accept_and_reject_maps() {
        let mut filter = JsonFilter::new(
            vec![("type".into(), "^log\\.".into())],
            vec![("data/active".into(), "true".into())],
            None,
        )
        .unwrap();

        assert_eq!(
            filter.apply(&mut msg(r#"{"type":"metric","data":{"active":true}}"#, "s")),
            Verdict::Accept
        );
        assert_eq!(
            filter.apply(&mut msg(r#"{"type":"log.info"}"#, "s")),
            Verdict::Reject
        );
        // Accept path missing.
        assert_eq!(
            filter.apply(&mut msg(r#"{"type":"metric"}"#, "s")),
            Verdict::Reject
        );
        // Unparseable payload.
        assert_eq!(filter.apply(&mut msg("not json", "s")), Verdict::Reject);
    }

    #[test]
    fn json_filter_array_paths() {
        let mut filter =
            JsonFilter::new(Vec::new(), vec![("items/0/id".into(), "^7$".into())], None).unwrap();
        assert_eq!(
            filter.apply(&mut msg(r#"{"items":[{"id":7}]}"#, "s")),
            Verdict::Accept
        );
        assert_eq!(
            filter.apply(&mut msg(r#"{"items":[{"id":8}]}"#, "s")),
            Verdict::Reject
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_filter_caps_per_stream_and_recovers() {
        let runtime = Runtime::new(4);
        let mut filter = RateFilter::new(100, Vec::new(), None, runtime).unwrap();

        let mut accepted = 0;
        for _ in 0..110 {
            if filter.apply(&mut msg("x", "s")) == Verdict::Accept {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 100);

        // Another stream has its own bucket.
        assert_eq!(filter.apply(&mut msg("x", "other")), Verdict::Accept);

        // After a second the bucket is full again.
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        let mut accepted = 0;
        for _ in 0..110 {
            if filter.apply(&mut msg("x", "s")) == Verdict::Accept {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_filter_reroutes_when_configured() {
        let runtime = Runtime::new(4);
        let dropped = StreamId::from_name("_DROPPED_");
        let mut filter = RateFilter::new(1, Vec::new(), Some(dropped), runtime).unwrap();
        assert_eq!(filter.apply(&mut msg("x", "s")), Verdict::Accept);
        assert_eq!(filter.apply(&mut msg("x", "s")), Verdict::Reroute(dropped));
    }

    #[test]
    fn sample_filter_takes_group_heads() {
        let mut filter = SampleFilter::new(5, 2, Vec::new()).unwrap();
        let verdicts: Vec<bool> = (0..10)
            .map(|_| filter.apply(&mut msg("x", "s")) == Verdict::Accept)
            .collect();
        assert_eq!(
            verdicts,
            vec![true, true, false, false, false, true, true, false, false, false]
        );
    }

    #[test]
    fn any_filter_short_circuits() {
        let mut filter = AnyFilter::new(vec![
            Box::new(DenyAll),
            Box::new(RegExpFilter::new(Some("^a"), None, None).unwrap()),
        ]);
        assert_eq!(filter.apply(&mut msg("abc", "s")), Verdict::Accept);
        assert_eq!(filter.apply(&mut msg("xyz", "s")), Verdict::Reject);
    }

    #[test]
    fn create_filter_builds_nested_chains() {
        let runtime = Runtime::new(4);
        let yaml = r#"
type: any
filters:
  - type: stream
    only: ["a"]
  - type: regexp
    expression: "^keep"
"#;
        let spec: FilterSpec = serde_yaml::from_str(yaml).unwrap();
        let mut filter = create_filter(&spec, &runtime).unwrap();
        assert_eq!(filter.apply(&mut msg("keep me", "b")), Verdict::Accept);
        assert_eq!(filter.apply(&mut msg("drop me", "b")), Verdict::Reject);
        assert_eq!(filter.apply(&mut msg("drop me", "a")), Verdict::Accept);
    }

    #[test]
    fn bad_regexes_are_config_errors() {
        let runtime = Runtime::new(4);
        let spec = FilterSpec::RegExp {
            expression: Some("([".into()),
            expression_not: None,
            apply_to: None,
        };
        assert!(create_filter(&spec, &runtime).is_err());
    }
}
