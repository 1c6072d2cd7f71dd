//! Request persistence
//!
//! Records are kept under a `(zone, time, sequence)` key so that reading a
//! zone back always yields non-decreasing capture times, whatever order the
//! writes landed in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, VigilError};
use crate::models::{Protocol, RequestRecord};

/// Filter and paging for request listings
#[derive(Debug, Clone)]
pub struct RequestQuery {
    /// Only these protocols; empty means all
    pub protocols: Vec<Protocol>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub skip: usize,
    pub limit: usize,
    pub newest_first: bool,
}

impl Default for RequestQuery {
    fn default() -> Self {
        Self {
            protocols: Vec::new(),
            from: None,
            to: None,
            skip: 0,
            limit: 100,
            newest_first: false,
        }
    }
}

/// Append-only store of captured requests
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persists one record
    async fn append(&self, record: RequestRecord) -> Result<()>;

    /// Lists a zone's records in time order
    async fn query(&self, zone: &str, query: &RequestQuery) -> Result<Vec<RequestRecord>>;

    /// Fetches the first record of a zone captured at exactly `time`
    async fn get(&self, zone: &str, time: DateTime<Utc>) -> Result<Option<RequestRecord>>;
}

type RecordKey = (String, i64, u64);

/// Bounds on how many captured requests stay indexed
///
/// When a zone exceeds `max_per_zone` its oldest capture is evicted. When
/// the whole index exceeds `max_bytes` the earliest arrival goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_per_zone: usize,
    pub max_bytes: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_per_zone: 10_000,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Default)]
struct Index {
    records: BTreeMap<RecordKey, RequestRecord>,
    /// Arrival sequence to record key and its footprint
    arrivals: BTreeMap<u64, (RecordKey, usize)>,
    per_zone: HashMap<String, usize>,
    bytes: usize,
}

impl Index {
    fn remove(&mut self, key: &RecordKey) {
        if self.records.remove(key).is_none() {
            return;
        }
        if let Some((_, size)) = self.arrivals.remove(&key.2) {
            self.bytes = self.bytes.saturating_sub(size);
        }
        if let Some(count) = self.per_zone.get_mut(&key.0) {
            *count -= 1;
            if *count == 0 {
                self.per_zone.remove(&key.0);
            }
        }
    }

    fn oldest_in_zone(&self, zone: &str) -> Option<RecordKey> {
        self.records
            .range((zone.to_string(), i64::MIN, 0)..)
            .next()
            .map(|(key, _)| key.clone())
            .filter(|key| key.0 == zone)
    }
}

/// In-memory ordered request index
pub struct MemoryRequestStore {
    index: RwLock<Index>,
    sequence: AtomicU64,
    retention: Retention,
}

impl Default for MemoryRequestStore {
    fn default() -> Self {
        Self::with_retention(Retention::default())
    }
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Retention) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            sequence: AtomicU64::new(0),
            retention,
        }
    }

    fn insert(&self, record: RequestRecord, size: usize) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = (record.zone.clone(), record.time.timestamp_micros(), seq);
        let zone = record.zone.clone();

        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        index.records.insert(key.clone(), record);
        index.arrivals.insert(seq, (key, size));
        *index.per_zone.entry(zone.clone()).or_default() += 1;
        index.bytes += size;

        let mut evicted = 0usize;
        while index.per_zone.get(&zone).copied().unwrap_or(0) > self.retention.max_per_zone {
            let Some(oldest) = index.oldest_in_zone(&zone) else {
                break;
            };
            index.remove(&oldest);
            evicted += 1;
        }
        while index.bytes > self.retention.max_bytes && index.records.len() > 1 {
            let Some((_, (oldest, _))) = index.arrivals.first_key_value() else {
                break;
            };
            let oldest = oldest.clone();
            index.remove(&oldest);
            evicted += 1;
        }
        if evicted > 0 {
            debug!("Evicted {} request(s) past retention", evicted);
        }
    }

    pub fn len(&self) -> usize {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate serialized size of everything indexed
    pub fn footprint(&self) -> usize {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.bytes
    }

    fn select(&self, zone: &str, query: &RequestQuery) -> Vec<RequestRecord> {
        let from = query.from.map_or(i64::MIN, |t| t.timestamp_micros());
        let to = query.to.map_or(i64::MAX, |t| t.timestamp_micros());
        if from > to {
            return Vec::new();
        }

        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let range = index
            .records
            .range((zone.to_string(), from, 0)..=(zone.to_string(), to, u64::MAX))
            .map(|(_, r)| r)
            .filter(|r| query.protocols.is_empty() || query.protocols.contains(&r.protocol));

        let page: Vec<&RequestRecord> = if query.newest_first {
            range.rev().skip(query.skip).take(query.limit).collect()
        } else {
            range.skip(query.skip).take(query.limit).collect()
        };
        page.into_iter().cloned().collect()
    }

    fn find(&self, zone: &str, time: DateTime<Utc>) -> Option<RequestRecord> {
        let micros = time.timestamp_micros();
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index
            .records
            .range((zone.to_string(), micros, 0)..=(zone.to_string(), micros, u64::MAX))
            .next()
            .map(|(_, r)| r.clone())
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn append(&self, record: RequestRecord) -> Result<()> {
        let size = serde_json::to_vec(&record)?.len();
        self.insert(record, size);
        Ok(())
    }

    async fn query(&self, zone: &str, query: &RequestQuery) -> Result<Vec<RequestRecord>> {
        Ok(self.select(zone, query))
    }

    async fn get(&self, zone: &str, time: DateTime<Utc>) -> Result<Option<RequestRecord>> {
        Ok(self.find(zone, time))
    }
}

struct JsonlFile {
    file: tokio::fs::File,
    /// Length of the file up to its last complete line
    len: u64,
}

/// JSON-lines file with an in-memory index, reloaded on open
///
/// Evicted records stay in the file but are not indexed again on reload
/// beyond the same retention bounds.
pub struct JsonlRequestStore {
    path: PathBuf,
    file: Mutex<JsonlFile>,
    index: MemoryRequestStore,
}

impl JsonlRequestStore {
    /// Opens (or creates) the file with default retention
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, Retention::default()).await
    }

    /// Opens (or creates) the file and loads every readable record
    ///
    /// A trailing line without a newline is a torn write and is cut off.
    pub async fn open_with(path: impl AsRef<Path>, retention: Retention) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let index = MemoryRequestStore::with_retention(retention);

        let mut good_len = 0u64;
        match tokio::fs::read(&path).await {
            Ok(content) => {
                let complete = content
                    .iter()
                    .rposition(|b| *b == b'\n')
                    .map_or(0, |pos| pos + 1);
                good_len = complete as u64;
                if complete < content.len() {
                    warn!(
                        "Cutting {} byte(s) of torn write from {}",
                        content.len() - complete,
                        path.display()
                    );
                    let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(good_len).await?;
                }

                let mut skipped = 0usize;
                for line in content[..complete].split(|b| *b == b'\n') {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<RequestRecord>(line) {
                        Ok(record) => index.insert(record, line.len()),
                        Err(_) => skipped += 1,
                    }
                }
                if skipped > 0 {
                    warn!("Skipped {} unreadable line(s) in {}", skipped, path.display());
                }
                info!("Loaded {} request(s) from {}", index.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VigilError::IoError(e)),
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(JsonlFile {
                file,
                len: good_len,
            }),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records currently indexed
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

async fn write_line(file: &mut tokio::fs::File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}

#[async_trait]
impl RequestStore for JsonlRequestStore {
    async fn append(&self, record: RequestRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        {
            let mut guard = self.file.lock().await;
            let JsonlFile { file, len } = &mut *guard;
            if let Err(e) = write_line(file, &line).await {
                if let Err(cut) = file.set_len(*len).await {
                    warn!("Cannot cut torn write from {}: {}", self.path.display(), cut);
                }
                return Err(VigilError::StorageUnavailable(e.to_string()));
            }
            *len += line.len() as u64;
        }

        self.index.insert(record, line.len() - 1);
        Ok(())
    }

    async fn query(&self, zone: &str, query: &RequestQuery) -> Result<Vec<RequestRecord>> {
        Ok(self.index.select(zone, query))
    }

    async fn get(&self, zone: &str, time: DateTime<Utc>) -> Result<Option<RequestRecord>> {
        Ok(self.index.find(zone, time))
    }
}
