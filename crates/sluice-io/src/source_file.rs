//! File scraper: tails files through rotation, symlink swaps and glob
//! churn, with optional offset persistence for at-least-once delivery
//! across restarts.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use sluice_core::{
    BufferedReader, ControlSlot, Dispatcher, FileSpec, FrameError, Metadata, ObserveMode,
    OffsetStart, Plugin, RunState, Source,
};
use tokio::io::AsyncSeekExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tails one file, or every match of a glob pattern.
pub struct FileSource {
    spec: Arc<FileSpec>,
    blacklist: Option<Regex>,
    whitelist: Option<Regex>,
}

impl FileSource {
    pub fn try_new(spec: FileSpec) -> Result<Self> {
        spec.framing.build()?;
        let blacklist = spec
            .blacklist
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("blacklist regex")?;
        let whitelist = spec
            .whitelist
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("whitelist regex")?;
        Ok(Self {
            spec: Arc::new(spec),
            blacklist,
            whitelist,
        })
    }

    fn accepts(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        // Whitelist wins when both are configured.
        if let Some(white) = &self.whitelist {
            return white.is_match(&text);
        }
        if let Some(black) = &self.blacklist {
            return !black.is_match(&text);
        }
        true
    }
}

impl Plugin for FileSource {
    fn name(&self) -> &str {
        &self.spec.common.id
    }
}

#[async_trait]
impl Source for FileSource {
    async fn run(
        &mut self,
        out: Dispatcher,
        mut ctl: ControlSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = RunState::new(self.name(), &cancel);
        let (roll_tx, roll_rx) = watch::channel(0u64);

        let is_glob = self.spec.path.contains(['*', '?']);
        if is_glob {
            let scanner = GlobScanner {
                spec: self.spec.clone(),
                blacklist: self.blacklist.clone(),
                whitelist: self.whitelist.clone(),
                active: Arc::new(Mutex::new(HashSet::new())),
                state: state.clone(),
                out: out.clone(),
                roll: roll_rx,
            };
            state.spawn_worker("dir-scan", scanner.run());
        } else {
            let worker = FileWorker::new(
                self.spec.clone(),
                PathBuf::from(&self.spec.path),
                false,
                out,
                &state,
                roll_rx,
            );
            state.spawn_worker("scrape", worker.run());
        }

        state
            .control_loop(&mut ctl, || {
                roll_tx.send_modify(|generation| *generation += 1);
            })
            .await;
        state.wait_workers().await;
        Ok(())
    }
}

/// Periodic glob re-evaluation; each new match gets its own worker that
/// ends when the file disappears.
struct GlobScanner {
    spec: Arc<FileSpec>,
    blacklist: Option<Regex>,
    whitelist: Option<Regex>,
    active: Arc<Mutex<HashSet<PathBuf>>>,
    state: RunState,
    out: Dispatcher,
    roll: watch::Receiver<u64>,
}

impl GlobScanner {
    fn accepts(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        if let Some(white) = &self.whitelist {
            return white.is_match(&text);
        }
        if let Some(black) = &self.blacklist {
            return !black.is_match(&text);
        }
        true
    }

    async fn run(self) -> Result<()> {
        let cancel = self.state.cancel_token();
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.spec.dir_scan_interval_sec.max(1)));
        loop {
            self.scan();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
        }
    }

    fn scan(&self) {
        let matches = match glob::glob(&self.spec.path) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(pattern = %self.spec.path, error = %err, "glob failed");
                return;
            }
        };
        for entry in matches.flatten() {
            if !self.accepts(&entry) {
                continue;
            }
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if !active.insert(entry.clone()) {
                continue;
            }
            drop(active);
            debug!(file = %entry.display(), "new glob match");
            let worker = FileWorker::new(
                self.spec.clone(),
                entry.clone(),
                true,
                self.out.clone(),
                &self.state,
                self.roll.clone(),
            );
            let active = self.active.clone();
            self.state.spawn_worker("scrape", async move {
                let result = worker.run().await;
                active
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&entry);
                result
            });
        }
    }
}

enum RotationCheck {
    /// Same file, nothing new.
    None,
    /// Inode changed or the file shrank below our offset.
    Rotated,
    /// Path no longer resolves.
    Missing,
}

/// One tailing loop over one path.
struct FileWorker {
    spec: Arc<FileSpec>,
    path: PathBuf,
    exit_when_missing: bool,
    out: Dispatcher,
    cancel: CancellationToken,
    paused: Arc<std::sync::atomic::AtomicBool>,
    roll: watch::Receiver<u64>,
    offset_path: Option<PathBuf>,
}

impl FileWorker {
    fn new(
        spec: Arc<FileSpec>,
        path: PathBuf,
        glob_mode: bool,
        out: Dispatcher,
        state: &RunState,
        roll: watch::Receiver<u64>,
    ) -> Self {
        let offset_path = spec
            .offset_file
            .as_ref()
            .map(|base| offset_path_for(base, &path, glob_mode));
        Self {
            spec,
            path,
            exit_when_missing: glob_mode,
            out,
            cancel: state.cancel_token(),
            paused: state.paused_flag(),
            roll,
            offset_path,
        }
    }

    async fn run(mut self) -> Result<()> {
        let framing = self.spec.framing.build()?;
        let mut reader = BufferedReader::new(framing, self.spec.framing.max_frame());
        let retry = Duration::from_secs(self.spec.retry_delay_sec.max(1));
        let poll = Duration::from_millis(self.spec.polling_delay_ms.max(1));

        // One watcher per worker; rotation shows up as rename/remove on
        // the parent directory. The watcher handle must stay alive for
        // events to flow.
        let mut observer = match self.spec.observe {
            ObserveMode::Watch => Some(watch_parent(&self.path)?),
            ObserveMode::Poll => None,
        };

        let mut first_open = true;
        let mut warned = false;
        let mut roll_seen = *self.roll.borrow();
        let mut frames: Vec<Bytes> = Vec::new();

        'open: while !self.cancel.is_cancelled() {
            let resolved = match tokio::fs::canonicalize(&self.path).await {
                Ok(p) => p,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    if self.exit_when_missing {
                        debug!(file = %self.path.display(), "file gone, worker done");
                        return Ok(());
                    }
                    self.warn_once(&mut warned, &format!("{err}"));
                    self.sleep(retry).await;
                    continue;
                }
                Err(err) => {
                    self.warn_once(&mut warned, &format!("{err}"));
                    self.sleep(retry).await;
                    continue;
                }
            };

            let mut file = match tokio::fs::File::open(&resolved).await {
                Ok(f) => f,
                Err(err) => {
                    self.warn_once(&mut warned, &format!("{err}"));
                    self.sleep(retry).await;
                    continue;
                }
            };
            let meta = match file.metadata().await {
                Ok(m) => m,
                Err(err) => {
                    self.warn_once(&mut warned, &format!("{err}"));
                    self.sleep(retry).await;
                    continue;
                }
            };
            let opened_id = file_id(&meta);

            let start = if first_open {
                self.initial_offset(meta.len())
            } else {
                0
            };
            first_open = false;
            if warned {
                info!(file = %self.path.display(), "file readable again");
                warned = false;
            }

            file.seek(SeekFrom::Start(start)).await.context("seek")?;
            reader.reset(start);
            self.persist(start);
            debug!(file = %resolved.display(), offset = start, "scraping");

            loop {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                let roll_now = *self.roll.borrow();
                if roll_now != roll_seen {
                    roll_seen = roll_now;
                    info!(file = %self.path.display(), "roll requested, reopening");
                    continue 'open;
                }
                if self.out_paused() {
                    self.sleep(poll).await;
                    continue;
                }

                let mut on_frame = |f: &[u8]| frames.push(Bytes::copy_from_slice(f));
                let read = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    read = reader.read_from(&mut file, &mut on_frame) => read,
                };
                match read {
                    Ok(_) => self.drain(&mut reader, &mut frames).await?,
                    Err(FrameError::Eof) => {
                        match self.check_rotation(opened_id, reader.offset()).await {
                            RotationCheck::Rotated => {
                                // Final scrape is done; emit any dangling
                                // tail and restart at the new file.
                                reader.flush(&mut |f| frames.push(Bytes::copy_from_slice(f)));
                                self.drain_without_offset(&mut frames).await?;
                                self.persist(0);
                                info!(file = %self.path.display(), "rotation detected");
                                continue 'open;
                            }
                            RotationCheck::Missing => {
                                if self.exit_when_missing {
                                    reader.flush(&mut |f| frames.push(Bytes::copy_from_slice(f)));
                                    self.drain_without_offset(&mut frames).await?;
                                    debug!(file = %self.path.display(), "file gone, worker done");
                                    return Ok(());
                                }
                                self.sleep(retry).await;
                                continue 'open;
                            }
                            RotationCheck::None => match &mut observer {
                                Some((_, rx)) => self.await_event(rx, poll).await,
                                None => self.sleep(poll).await,
                            },
                        }
                    }
                    Err(FrameError::DataInvalid(reason)) => {
                        let skipped = reader.discard_pending();
                        warn!(
                            file = %self.path.display(),
                            skipped,
                            %reason,
                            "invalid frame, skipping buffered data"
                        );
                        self.persist(reader.offset());
                    }
                    Err(FrameError::Io(err)) => {
                        self.warn_once(&mut warned, &format!("{err}"));
                        self.sleep(retry).await;
                        continue 'open;
                    }
                }
            }
        }
        Ok(())
    }

    fn initial_offset(&self, file_len: u64) -> u64 {
        if let Some(path) = &self.offset_path {
            if let Some(stored) = load_offset(path) {
                if stored <= file_len {
                    return stored;
                }
                // Truncated below the stored offset: start over.
                return 0;
            }
        }
        match self.spec.default_offset {
            OffsetStart::Oldest => 0,
            OffsetStart::Newest => file_len,
        }
    }

    async fn check_rotation(&self, opened_id: (u64, u64), offset: u64) -> RotationCheck {
        let resolved = match tokio::fs::canonicalize(&self.path).await {
            Ok(p) => p,
            Err(_) => return RotationCheck::Missing,
        };
        match tokio::fs::metadata(&resolved).await {
            Ok(meta) => {
                if file_id(&meta) != opened_id || meta.len() < offset {
                    RotationCheck::Rotated
                } else {
                    RotationCheck::None
                }
            }
            Err(_) => RotationCheck::Missing,
        }
    }

    /// Enqueue collected frames, persisting the read offset after each.
    async fn drain(&self, reader: &mut BufferedReader, frames: &mut Vec<Bytes>) -> Result<()> {
        let had_frames = !frames.is_empty();
        for frame in frames.drain(..) {
            self.enqueue(frame).await?;
        }
        if had_frames {
            self.persist(reader.offset());
        }
        Ok(())
    }

    async fn drain_without_offset(&self, frames: &mut Vec<Bytes>) -> Result<()> {
        for frame in frames.drain(..) {
            self.enqueue(frame).await?;
        }
        Ok(())
    }

    async fn enqueue(&self, frame: Bytes) -> Result<()> {
        if self.out.wants_metadata() {
            let mut meta = Metadata::new();
            if let Some(name) = self.path.file_name() {
                meta.insert("file".into(), Bytes::from(name.to_string_lossy().into_owned()));
            }
            if let Some(dir) = self.path.parent() {
                meta.insert("dir".into(), Bytes::from(dir.to_string_lossy().into_owned()));
            }
            self.out.enqueue_with_metadata(frame, meta).await
        } else {
            self.out.enqueue(frame).await
        }
    }

    fn persist(&self, offset: u64) {
        if let Some(path) = &self.offset_path {
            if let Err(err) = persist_offset(path, offset) {
                warn!(offset_file = %path.display(), error = %err, "offset write failed");
            }
        }
    }

    fn out_paused(&self) -> bool {
        self.paused.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn warn_once(&self, warned: &mut bool, err: &str) {
        if !*warned {
            warn!(file = %self.path.display(), error = %err, "file not readable, retrying");
            *warned = true;
        }
    }

    async fn sleep(&self, d: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(d) => {}
        }
    }

    async fn await_event(&self, rx: &mut mpsc::UnboundedReceiver<notify::Event>, fallback: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = rx.recv() => {}
            // Safety net so a lost event cannot stall the tail forever.
            _ = tokio::time::sleep(fallback.max(Duration::from_secs(1))) => {}
        }
    }
}

/// Watch the parent directory so renames and newly created files are
/// seen, not just writes to the open inode.
fn watch_parent(
    path: &Path,
) -> Result<(
    notify::RecommendedWatcher,
    mpsc::UnboundedReceiver<notify::Event>,
)> {
    use notify::{RecursiveMode, Watcher};

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn file_id(meta: &std::fs::Metadata) -> (u64, u64) {
    (0, meta.len())
}

fn offset_path_for(base: &Path, file: &Path, glob_mode: bool) -> PathBuf {
    if !glob_mode {
        return base.to_path_buf();
    }
    let stem: String = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    PathBuf::from(format!("{}.{stem}", base.display()))
}

fn load_offset(path: &Path) -> Option<u64> {
    let text = std::fs::read_to_string(path).ok()?;
    // Junk sidecars count as missing.
    text.trim().parse().ok()
}

fn persist_offset(path: &Path, offset: u64) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, offset.to_string())?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{control_channel, CommonSpec, Control, FramingSpec, Runtime};
    use std::time::Duration;
    use tokio::sync::mpsc as tokio_mpsc;

    fn spec(path: &str, offset_file: Option<PathBuf>) -> FileSpec {
        FileSpec {
            common: CommonSpec {
                id: "test-file".into(),
                streams: vec!["logs".into()],
                set_metadata: true,
                filters: Vec::new(),
            },
            path: path.into(),
            framing: FramingSpec::default(),
            default_offset: OffsetStart::Oldest,
            offset_file,
            observe: ObserveMode::Poll,
            polling_delay_ms: 10,
            dir_scan_interval_sec: 1,
            retry_delay_sec: 1,
            blacklist: None,
            whitelist: None,
        }
    }

    async fn recv_payload(rx: &mut sluice_core::MessageRx) -> String {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message in time")
            .expect("channel open");
        String::from_utf8(msg.payload.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn scrapes_tails_and_detects_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let offsets = dir.path().join("app.offset");
        std::fs::write(&log, "one\ntwo\n").unwrap();

        let runtime = Runtime::new(16);
        let (tx, mut rx) = tokio_mpsc::channel(64);
        let out = Dispatcher::new(
            "test-file",
            &["logs".to_string()],
            Vec::new(),
            tx,
            runtime.clone(),
            true,
        );
        let cancel = runtime.shutdown_token();
        let (handle, ctl) = control_channel();

        let mut source =
            FileSource::try_new(spec(log.to_str().unwrap(), Some(offsets.clone()))).unwrap();
        let task = tokio::spawn(async move { source.run(out, ctl, cancel).await });

        assert_eq!(recv_payload(&mut rx).await, "one");
        let msg2 = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg2.payload.as_ref(), b"two");
        assert_eq!(msg2.meta("file").unwrap().as_ref(), b"app.log");

        // Give the offset write a moment, then rotate.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(load_offset(&offsets), Some(8));

        std::fs::rename(&log, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&log, "three\n").unwrap();

        assert_eq!(recv_payload(&mut rx).await, "three");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(load_offset(&offsets), Some(6));

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resumes_from_persisted_offset() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let offsets = dir.path().join("app.offset");
        std::fs::write(&log, "one\ntwo\n").unwrap();
        persist_offset(&offsets, 4).unwrap();

        let runtime = Runtime::new(16);
        let (tx, mut rx) = tokio_mpsc::channel(64);
        let out = Dispatcher::new(
            "test-file",
            &["logs".to_string()],
            Vec::new(),
            tx,
            runtime.clone(),
            false,
        );
        let cancel = runtime.shutdown_token();
        let (handle, ctl) = control_channel();

        let mut source =
            FileSource::try_new(spec(log.to_str().unwrap(), Some(offsets))).unwrap();
        let task = tokio::spawn(async move { source.run(out, ctl, cancel).await });

        assert_eq!(recv_payload(&mut rx).await, "two");

        handle.signal(Control::Stop);
        task.await.unwrap().unwrap();
    }

    #[test]
    fn junk_offset_sidecar_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.offset");
        std::fs::write(&path, "not-a-number").unwrap();
        assert_eq!(load_offset(&path), None);
        persist_offset(&path, 42).unwrap();
        assert_eq!(load_offset(&path), Some(42));
    }

    #[test]
    fn whitelist_wins_over_blacklist() {
        let mut s = spec("/var/log/*.log", None);
        s.blacklist = Some(".*debug.*".into());
        s.whitelist = Some(".*debug.*".into());
        let source = FileSource::try_new(s).unwrap();
        assert!(source.accepts(Path::new("/var/log/debug.log")));
        assert!(!source.accepts(Path::new("/var/log/app.log")));
    }
}
