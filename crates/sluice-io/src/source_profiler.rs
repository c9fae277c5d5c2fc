//! Synthetic message generator for benchmarking the pipeline.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sluice_core::{ControlSlot, Dispatcher, Plugin, ProfilerSpec, RunState, Source};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ProfilerSource {
    spec: ProfilerSpec,
}

impl ProfilerSource {
    pub fn try_new(spec: ProfilerSpec) -> Result<Self> {
        if spec.characters.is_empty() {
            anyhow::bail!("profiler character set is empty");
        }
        if spec.templates == 0 || spec.runs == 0 || spec.batches == 0 {
            anyhow::bail!("profiler templates, runs and batches must be positive");
        }
        Ok(Self { spec })
    }
}

impl Plugin for ProfilerSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for ProfilerSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let spec = self.spec.clone();
        let worker_cancel = state.cancel_token();

        state.spawn_worker("generate", async move {
            let mut rng = StdRng::from_entropy();
            let templates: Vec<Bytes> = (0..spec.templates)
                .map(|_| Bytes::from(expand_template(&spec.message, &spec.characters, &mut rng)))
                .collect();
            info!(
                consumer = %spec.common.id,
                templates = templates.len(),
                runs = spec.runs,
                batches = spec.batches,
                "profiler starting"
            );

            let mut min_rate = f64::MAX;
            let mut max_rate: f64 = 0.0;
            let mut sent_total = 0usize;
            let started = Instant::now();

            'batches: for batch in 0..spec.batches {
                let batch_start = Instant::now();
                for _ in 0..spec.runs {
                    if worker_cancel.is_cancelled() {
                        break 'batches;
                    }
                    let template = &templates[rng.gen_range(0..templates.len())];
                    out.enqueue(template.clone()).await?;
                    sent_total += 1;
                    if spec.delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(spec.delay_ms)).await;
                    }
                }
                let elapsed = batch_start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    let rate = spec.runs as f64 / elapsed;
                    min_rate = min_rate.min(rate);
                    max_rate = max_rate.max(rate);
                    info!(batch, rate = format_args!("{rate:.0}"), "batch done");
                }
            }

            let elapsed = started.elapsed().as_secs_f64();
            let avg_rate = if elapsed > 0.0 {
                sent_total as f64 / elapsed
            } else {
                0.0
            };
            info!(
                total = sent_total,
                avg = format_args!("{avg_rate:.0}"),
                min = format_args!("{:.0}", if min_rate == f64::MAX { 0.0 } else { min_rate }),
                max = format_args!("{max_rate:.0}"),
                "profiler done (msg/sec)"
            );

            if !spec.keep_running && !worker_cancel.is_cancelled() {
                warn!("profiler run complete, requesting shutdown");
                out.runtime().request_shutdown();
            }
            Ok(())
        });

        state.control_loop(&mut ctl, || {}).await;
        state.wait_workers().await;
        Ok(())
    }
}

/// Expand a payload template: `%Ns` becomes N random characters from the
/// configured alphabet, `%Nd` N random digits and `%Nf` a float with N
/// fractional digits. Everything else is copied verbatim.
fn expand_template(template: &str, characters: &str, rng: &mut impl Rng) -> Vec<u8> {
    let alphabet: Vec<char> = characters.chars().collect();
    let mut out = Vec::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            let mut encoded = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
            continue;
        }
        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }
        match chars.next() {
            Some('s') => {
                for _ in 0..width.max(1) {
                    let mut encoded = [0u8; 4];
                    let c = alphabet[rng.gen_range(0..alphabet.len())];
                    out.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
                }
            }
            Some('d') => {
                for _ in 0..width.max(1) {
                    out.push(b'0' + rng.gen_range(0..10u8));
                }
            }
            Some('f') => {
                out.push(b'0' + rng.gen_range(0..10u8));
                out.push(b'.');
                for _ in 0..width.max(1) {
                    out.push(b'0' + rng.gen_range(0..10u8));
                }
            }
            Some(other) => {
                out.push(b'%');
                let mut encoded = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut encoded).as_bytes());
            }
            None => out.push(b'%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_expand_to_the_requested_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let out = expand_template("id=%4d msg=%8s val=%2f", "ab", &mut rng);
        let text = String::from_utf8(out).unwrap();

        let (id_part, rest) = text.split_once(' ').unwrap();
        let (msg_part, val_part) = rest.split_once(' ').unwrap();

        let id = id_part.strip_prefix("id=").unwrap();
        assert_eq!(id.len(), 4);
        assert!(id.chars().all(|c| c.is_ascii_digit()));

        let msg = msg_part.strip_prefix("msg=").unwrap();
        assert_eq!(msg.len(), 8);
        assert!(msg.chars().all(|c| c == 'a' || c == 'b'));

        let val = val_part.strip_prefix("val=").unwrap();
        let (int, frac) = val.split_once('.').unwrap();
        assert_eq!(int.len(), 1);
        assert_eq!(frac.len(), 2);
    }

    #[test]
    fn literal_text_passes_through() {
        let mut rng = StdRng::seed_from_u64(7);
        let out = expand_template("plain text 100%", "x", &mut rng);
        assert_eq!(out, b"plain text 100%");
    }
}
