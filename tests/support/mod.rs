//! Shared helpers for integration tests: an in-memory corpus served through
//! [`ProtocolClient`], a settable free-space source, and engine config builders.

#![allow(dead_code)]

pub mod socket_guard;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use mirror_core::remote::ByteStream;
use mirror_core::{
    EngineConfig, FetchResponse, ProtocolClient, ProtocolError, RemoteEntry, SpaceProbe,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const GB: u64 = 1_000_000_000;
pub const MIB: u64 = 1024 * 1024;

/// Byte at absolute offset `i` of every synthetic file.
#[must_use]
pub fn content_byte(i: u64) -> u8 {
    (i % 251) as u8
}

/// Synthetic content for `[start, end)`.
#[must_use]
pub fn content_range(start: u64, end: u64) -> Vec<u8> {
    (start..end).map(content_byte).collect()
}

/// Asserts that `path` holds exactly `size` synthetic bytes.
pub fn assert_synthetic_file(path: &Path, size: u64) {
    use std::io::Read;

    let mut file = std::fs::File::open(path).unwrap_or_else(|e| panic!("open {}: {e}", path.display()));
    assert_eq!(file.metadata().unwrap().len(), size, "size of {}", path.display());

    let mut buf = vec![0u8; MIB as usize];
    let mut offset = 0u64;
    loop {
        let n = file.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        let expected = content_range(offset, offset + n as u64);
        assert!(buf[..n] == expected[..], "content mismatch in {} near byte {offset}", path.display());
        offset += n as u64;
    }
}

/// One scripted deviation for the next fetch of an item.
#[derive(Debug, Clone)]
pub enum Script {
    /// The fetch itself fails.
    Fail(ProtocolError),
    /// The body errors with a connection reset after this absolute offset.
    CutAt(u64),
    /// The body ends cleanly but early at this absolute offset.
    EndAt(u64),
    /// The body stops at this absolute offset, fires the token, and hangs.
    InterruptAt(u64, CancellationToken),
    /// The response never arrives.
    Stall,
    /// At this absolute offset the reported free space drops to `free` bytes; the body
    /// pauses long enough for the disk monitor to notice, then carries on.
    SqueezeAt {
        at: u64,
        space: Arc<SettableProbe>,
        free: u64,
        pause: Duration,
    },
}

/// In-memory corpus implementing [`ProtocolClient`].
#[derive(Debug)]
pub struct MockCorpus {
    files: Mutex<BTreeMap<String, u64>>,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    fetches: Mutex<Vec<(String, u64)>>,
    listings: AtomicUsize,
    ignore_ranges: AtomicBool,
    hide_sizes: AtomicBool,
    chunk_size: u64,
}

impl Default for MockCorpus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCorpus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            scripts: Mutex::new(HashMap::new()),
            fetches: Mutex::new(Vec::new()),
            listings: AtomicUsize::new(0),
            ignore_ranges: AtomicBool::new(false),
            hide_sizes: AtomicBool::new(false),
            chunk_size: 64 * 1024,
        }
    }

    /// Builder form of [`MockCorpus::add_file`].
    #[must_use]
    pub fn with_file(self, path: &str, size: u64) -> Self {
        self.add_file(path, size);
        self
    }

    pub fn add_file(&self, path: &str, size: u64) {
        self.files.lock().unwrap().insert(path.to_string(), size);
    }

    pub fn script(&self, path: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(script);
    }

    /// Serve full bodies from offset 0 regardless of the requested range.
    pub fn ignore_ranges(&self) {
        self.ignore_ranges.store(true, Ordering::SeqCst);
    }

    /// Omit sizes from directory listings.
    pub fn hide_sizes(&self) {
        self.hide_sizes.store(true, Ordering::SeqCst);
    }

    /// Every `(path, start_offset)` passed to `fetch`, in order.
    #[must_use]
    pub fn fetches(&self) -> Vec<(String, u64)> {
        self.fetches.lock().unwrap().clone()
    }

    /// Start offsets requested for one path.
    #[must_use]
    pub fn offsets_for(&self, path: &str) -> Vec<u64> {
        self.fetches()
            .into_iter()
            .filter(|(p, _)| p == path)
            .map(|(_, offset)| offset)
            .collect()
    }

    #[must_use]
    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    fn next_script(&self, path: &str) -> Option<Script> {
        self.scripts.lock().unwrap().get_mut(path)?.pop_front()
    }

    fn body(&self, path: &str, start: u64, size: u64, script: Option<Script>) -> ByteStream {
        let chunk_size = self.chunk_size;
        let path = path.to_string();
        let mut squeeze = None;
        let (stop_at, ending) = match script {
            Some(Script::CutAt(at)) => (at.min(size), Ending::Reset),
            Some(Script::EndAt(at)) => (at.min(size), Ending::Clean),
            Some(Script::InterruptAt(at, token)) => (at.min(size), Ending::Interrupt(token)),
            Some(Script::SqueezeAt {
                at,
                space,
                free,
                pause,
            }) => {
                squeeze = Some((at, space, free, pause));
                (size, Ending::Clean)
            }
            _ => (size, Ending::Clean),
        };

        stream::unfold((start, Some(ending), squeeze), move |(offset, ending, mut squeeze)| {
            let path = path.clone();
            async move {
                if squeeze.as_ref().is_some_and(|(at, ..)| offset >= *at)
                    && let Some((_, space, free, pause)) = squeeze.take()
                {
                    space.set(free);
                    tokio::time::sleep(pause).await;
                }
                if offset < stop_at {
                    let end = (offset + chunk_size).min(stop_at);
                    let chunk = Bytes::from(content_range(offset, end));
                    return Some((Ok(chunk), (end, ending, squeeze)));
                }
                match ending? {
                    Ending::Clean => None,
                    Ending::Reset => Some((
                        Err(ProtocolError::connection(path, "connection reset by peer")),
                        (offset, None, None),
                    )),
                    Ending::Interrupt(token) => {
                        token.cancel();
                        futures_util::future::pending::<()>().await;
                        None
                    }
                }
            }
        })
        .boxed()
    }
}

enum Ending {
    Clean,
    Reset,
    Interrupt(CancellationToken),
}

#[async_trait]
impl ProtocolClient for MockCorpus {
    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let prefix = format!("{}/", dir.trim_matches('/'));
        let hide_sizes = self.hide_sizes.load(Ordering::SeqCst);

        let files = self.files.lock().unwrap();
        let mut subdirs = BTreeSet::new();
        let mut entries = Vec::new();
        for (path, size) in files.iter() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((subdir, _)) => {
                    subdirs.insert(format!("{prefix}{subdir}"));
                }
                None => entries.push(RemoteEntry::file(path.clone(), (!hide_sizes).then_some(*size))),
            }
        }
        if entries.is_empty() && subdirs.is_empty() {
            return Err(ProtocolError::not_found(dir));
        }
        entries.extend(subdirs.into_iter().map(RemoteEntry::directory));
        Ok(entries)
    }

    async fn fetch(&self, path: &str, start_offset: u64) -> Result<FetchResponse, ProtocolError> {
        self.fetches
            .lock()
            .unwrap()
            .push((path.to_string(), start_offset));

        let script = self.next_script(path);
        match &script {
            Some(Script::Fail(error)) => return Err(error.clone()),
            Some(Script::Stall) => {
                futures_util::future::pending::<()>().await;
            }
            _ => {}
        }

        let size = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or_else(|| ProtocolError::not_found(path))?;

        let start = if self.ignore_ranges.load(Ordering::SeqCst) {
            0
        } else {
            start_offset.min(size)
        };
        Ok(FetchResponse {
            start_offset: start,
            total_size: Some(size),
            body: self.body(path, start, size, script),
        })
    }
}

/// [`SpaceProbe`] whose answer tests can change at any time.
#[derive(Debug)]
pub struct SettableProbe(AtomicU64);

impl SettableProbe {
    #[must_use]
    pub fn new(free_bytes: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(free_bytes)))
    }

    pub fn set(&self, free_bytes: u64) {
        self.0.store(free_bytes, Ordering::SeqCst);
    }
}

impl SpaceProbe for SettableProbe {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

/// Engine config rooted in `dir` with pacing disabled and fast checkpoints.
#[must_use]
pub fn test_config(dir: &TempDir, categories: &[&str]) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data_dir = dir.path().join("mirror");
    config.ledger.path = dir.path().join("state").join("download_progress.json");
    config.categories = categories.iter().map(|c| (*c).to_string()).collect();
    config.max_concurrent = 3;
    config.rate.initial_delay_secs = 0.0;
    config.rate.min_delay_secs = 0.0;
    config.rate.max_delay_secs = 0.0;
    config.disk.min_free_space_bytes = 50 * GB;
    config.disk.check_interval_secs = 1;
    config.progress_interval_bytes = 256 * 1024;
    config.transfer_timeout_secs = 5;
    config
}

/// Free-space source reporting plenty of space.
#[must_use]
pub fn roomy_probe() -> Arc<SettableProbe> {
    SettableProbe::new(500 * GB)
}
