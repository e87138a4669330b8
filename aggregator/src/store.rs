// Event store
// Append-only log of pipeline events, held in memory and optionally
// persisted as JSON lines. The file write is the durability boundary.
//
// Numan Thabit 2025 Nov

use crate::errors::MetricsError;
use crate::model::{PipelineEvent, StoredEvent};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use std::io::SeekFrom;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Number of events a scan copies out per read-lock acquisition.
const SCAN_BATCH: usize = 256;

/// Optional restriction applied by `scan`.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub customer: Option<String>,
    pub app: Option<String>,
}

impl ScanFilter {
    pub fn customer(name: impl Into<String>) -> Self {
        Self {
            customer: Some(name.into()),
            app: None,
        }
    }

    fn matches(&self, stored: &StoredEvent) -> bool {
        self.customer
            .as_deref()
            .map_or(true, |c| c == stored.event.customer_name)
            && self
                .app
                .as_deref()
                .map_or(true, |a| a == stored.event.customer_app)
    }
}

struct LogWriter {
    path: PathBuf,
    file: File,
    fsync: bool,
    /// Bytes up to and including the last complete line.
    len: u64,
    /// A failed write may have left a partial line past `len`.
    torn: bool,
    #[cfg(test)]
    faults: WriteFaults,
}

/// Failures injected into the log writer by tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct WriteFaults {
    /// The next write stops after this many bytes and fails.
    pub torn_write: Option<usize>,
    /// Number of upcoming truncations that fail.
    pub failed_repairs: u32,
}

pub struct EventStore {
    events: RwLock<Vec<Arc<StoredEvent>>>,
    /// Serializes appends; holds the log file when persistence is enabled.
    writer: Mutex<Option<LogWriter>>,
    available: AtomicBool,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl EventStore {
    pub fn in_memory() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            writer: Mutex::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Open (or create) a JSON-lines log and replay it into memory.
    pub async fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }

        let mut events = Vec::new();
        let mut complete_len = 0u64;
        let mut torn_tail = false;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let file = File::open(&path)
                .await
                .with_context(|| format!("open event log {}", path.display()))?;
            let mut reader = BufReader::new(file);
            let mut buf = Vec::new();
            let mut line_no = 0usize;
            loop {
                buf.clear();
                let read = reader
                    .read_until(b'\n', &mut buf)
                    .await
                    .context("read event log")?;
                if read == 0 {
                    break;
                }
                if buf.last() != Some(&b'\n') {
                    // a line without its newline was never acknowledged
                    torn_tail = true;
                    break;
                }
                complete_len += read as u64;
                line_no += 1;
                let line = &buf[..read - 1];
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                match serde_json::from_slice::<StoredEvent>(line) {
                    Ok(mut stored) => {
                        // offsets are positional; re-derive them so a skipped line leaves no hole
                        stored.offset = events.len() as u64;
                        events.push(Arc::new(stored));
                    }
                    Err(err) => {
                        warn!(line = line_no, error = %err, path = %path.display(), "skipping unreadable log line");
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open event log for append {}", path.display()))?;
        if torn_tail {
            warn!(path = %path.display(), kept_bytes = complete_len, "truncating partial trailing log line");
            file.set_len(complete_len)
                .await
                .context("truncate partial log line")?;
        }

        info!(path = %path.display(), events = events.len(), "event log replayed");

        let writer = LogWriter {
            path,
            file,
            fsync,
            len: complete_len,
            torn: false,
            #[cfg(test)]
            faults: WriteFaults::default(),
        };
        Ok(Self {
            events: RwLock::new(events),
            writer: Mutex::new(Some(writer)),
            available: AtomicBool::new(true),
        })
    }

    /// Append an event and return its offset. The event becomes visible to
    /// readers only after the log write succeeded.
    pub async fn append(&self, event: PipelineEvent) -> Result<u64, MetricsError> {
        self.append_record(event).await.map(|stored| stored.offset)
    }

    /// Same as `append`, handing back the record as readers will see it.
    pub async fn append_record(
        &self,
        event: PipelineEvent,
    ) -> Result<Arc<StoredEvent>, MetricsError> {
        validate_identity(&event)?;

        let mut writer = self.writer.lock().await;
        let offset = self.events.read().await.len() as u64;
        let stored = StoredEvent {
            offset,
            ingested_at: Utc::now(),
            event,
        };

        if let Some(log) = writer.as_mut() {
            if let Err(err) = log.write(&stored).await {
                self.available.store(false, Ordering::Release);
                warn!(path = %log.path.display(), error = %err, "event log append failed");
                return Err(MetricsError::UpstreamUnavailable(format!(
                    "event log write failed: {err}"
                )));
            }
        }
        self.available.store(true, Ordering::Release);

        let stored = Arc::new(stored);
        self.events.write().await.push(Arc::clone(&stored));
        debug!(offset, "event appended");
        Ok(stored)
    }

    /// Lazy scan in ingestion order. Each call starts again from offset 0;
    /// events appended while the scan runs are picked up when it gets there.
    pub fn scan(&self, filter: ScanFilter) -> impl Stream<Item = Arc<StoredEvent>> + '_ {
        stream::unfold(0usize, move |next| async move {
            let batch: Vec<Arc<StoredEvent>> = {
                let events = self.events.read().await;
                if next >= events.len() {
                    return None;
                }
                let end = (next + SCAN_BATCH).min(events.len());
                events[next..end].to_vec()
            };
            let advanced = next + batch.len();
            Some((stream::iter(batch), advanced))
        })
        .flatten()
        .filter(move |stored| futures::future::ready(filter.matches(stored)))
    }

    pub async fn get_by_customer(&self, customer: &str, app: &str) -> Vec<Arc<StoredEvent>> {
        self.events
            .read()
            .await
            .iter()
            .filter(|s| s.event.customer_name == customer && s.event.customer_app == app)
            .cloned()
            .collect()
    }

    pub async fn get(&self, offset: u64) -> Option<Arc<StoredEvent>> {
        let index = usize::try_from(offset).ok()?;
        self.events.read().await.get(index).cloned()
    }

    pub async fn len(&self) -> u64 {
        self.events.read().await.len() as u64
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Newest-first page of events strictly below `before` (or from the end).
    pub async fn page_desc(
        &self,
        before: Option<u64>,
        limit: usize,
        filter: &ScanFilter,
    ) -> Vec<Arc<StoredEvent>> {
        let events = self.events.read().await;
        let end = before
            .and_then(|b| usize::try_from(b).ok())
            .map_or(events.len(), |b| b.min(events.len()));
        events[..end]
            .iter()
            .rev()
            .filter(|s| filter.matches(s))
            .take(limit)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn inject_write_faults(&self, faults: WriteFaults) {
        if let Some(log) = self.writer.lock().await.as_mut() {
            log.faults = faults;
        }
    }

    /// False after a failed log write, until an append succeeds again.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn ensure_available(&self) -> Result<(), MetricsError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(MetricsError::UpstreamUnavailable(
                "event log is unavailable; derived state may be stale".to_string(),
            ))
        }
    }
}

impl LogWriter {
    /// Write one line. A failed write is cut back to the last complete line
    /// before anything else is appended.
    async fn write(&mut self, stored: &StoredEvent) -> Result<()> {
        let mut line = serde_json::to_vec(stored).context("encode event")?;
        line.push(b'\n');
        if self.torn {
            self.repair().await?;
        }
        if let Err(err) = self.write_line(&line).await {
            self.torn = true;
            if let Err(repair_err) = self.repair().await {
                warn!(path = %self.path.display(), error = %repair_err, "partial log line left in place");
            }
            return Err(err);
        }
        self.len += line.len() as u64;
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        #[cfg(test)]
        if let Some(cut) = self.faults.torn_write.take() {
            self.file
                .write_all(&line[..cut.min(line.len())])
                .await
                .context("write event")?;
            self.file.flush().await.context("flush event log")?;
            anyhow::bail!("write interrupted after {cut} bytes");
        }
        self.file.write_all(line).await.context("write event")?;
        self.file.flush().await.context("flush event log")?;
        if self.fsync {
            self.file.sync_data().await.context("sync event log")?;
        }
        Ok(())
    }

    async fn repair(&mut self) -> Result<()> {
        #[cfg(test)]
        if self.faults.failed_repairs > 0 {
            self.faults.failed_repairs -= 1;
            anyhow::bail!("truncate refused");
        }
        self.file
            .set_len(self.len)
            .await
            .context("truncate event log")?;
        self.file
            .seek(SeekFrom::End(0))
            .await
            .context("seek event log")?;
        self.torn = false;
        debug!(path = %self.path.display(), len = self.len, "partial log line removed");
        Ok(())
    }
}

fn validate_identity(event: &PipelineEvent) -> Result<(), MetricsError> {
    for (field, value) in [
        ("requestId", &event.request_id),
        ("customerName", &event.customer_name),
        ("customerApp", &event.customer_app),
    ] {
        if value.trim().is_empty() {
            return Err(MetricsError::Validation(format!(
                "missing required field {field}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricField;
    use crate::test_utils::event;

    #[tokio::test]
    async fn append_assigns_sequential_offsets_and_keeps_duplicates() {
        let store = EventStore::in_memory();
        assert_eq!(store.append(event("r1", "custA", "app1")).await.unwrap(), 0);
        assert_eq!(store.append(event("r1", "custA", "app1")).await.unwrap(), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn append_rejects_blank_identity() {
        let store = EventStore::in_memory();
        let err = store.append(event("r1", "", "app1")).await.unwrap_err();
        assert!(matches!(err, MetricsError::Validation(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn scan_is_ordered_filtered_and_restartable() {
        let store = EventStore::in_memory();
        for i in 0..600 {
            let customer = if i % 3 == 0 { "custA" } else { "custB" };
            store
                .append(event(&format!("r{i}"), customer, "app1"))
                .await
                .unwrap();
        }

        let all: Vec<u64> = store
            .scan(ScanFilter::default())
            .map(|s| s.offset)
            .collect()
            .await;
        assert_eq!(all, (0..600).collect::<Vec<_>>());

        let only_a: Vec<_> = store.scan(ScanFilter::customer("custA")).collect().await;
        assert_eq!(only_a.len(), 200);
        assert!(only_a.iter().all(|s| s.event.customer_name == "custA"));

        let again = store.scan(ScanFilter::default()).count().await;
        assert_eq!(again, 600);
    }

    #[tokio::test]
    async fn get_by_customer_and_page_desc() {
        let store = EventStore::in_memory();
        store.append(event("r0", "custA", "app1")).await.unwrap();
        store.append(event("r1", "custA", "app2")).await.unwrap();
        store.append(event("r2", "custA", "app1")).await.unwrap();

        let rows = store.get_by_customer("custA", "app1").await;
        assert_eq!(
            rows.iter().map(|s| s.event.request_id.as_str()).collect::<Vec<_>>(),
            ["r0", "r2"]
        );

        let page = store.page_desc(None, 2, &ScanFilter::default()).await;
        assert_eq!(page.iter().map(|s| s.offset).collect::<Vec<_>>(), [2, 1]);
        let page = store.page_desc(Some(1), 2, &ScanFilter::default()).await;
        assert_eq!(page.iter().map(|s| s.offset).collect::<Vec<_>>(), [0]);
    }

    #[tokio::test]
    async fn log_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        {
            let store = EventStore::open(&path, true).await.unwrap();
            let mut e = event("r1", "custA", "app1");
            e.latency.nmt_latency_ms = MetricField::Measured(120.0);
            e.latency.tts_latency_ms = MetricField::Malformed("slow".into());
            store.append(e).await.unwrap();
            store.append(event("r2", "custB", "app1")).await.unwrap();
        }

        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"{not json}\n").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let reopened = EventStore::open(&path, false).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        let first = reopened.get(0).await.unwrap();
        assert_eq!(first.event.latency.nmt_latency_ms, MetricField::Measured(120.0));
        assert_eq!(
            first.event.latency.tts_latency_ms,
            MetricField::Malformed("slow".into())
        );
        assert_eq!(reopened.append(event("r3", "custA", "app1")).await.unwrap(), 2);
    }

    async fn request_ids(path: &Path) -> Vec<String> {
        let store = EventStore::open(path, false).await.unwrap();
        store
            .scan(ScanFilter::default())
            .map(|s| s.event.request_id.clone())
            .collect()
            .await
    }

    #[tokio::test]
    async fn torn_write_is_cut_before_the_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let store = EventStore::open(&path, false).await.unwrap();
        store.append(event("r1", "custA", "app1")).await.unwrap();

        store
            .inject_write_faults(WriteFaults {
                torn_write: Some(12),
                ..Default::default()
            })
            .await;
        let err = store.append(event("r2", "custA", "app1")).await.unwrap_err();
        assert!(matches!(err, MetricsError::UpstreamUnavailable(_)));
        assert!(err.is_retryable());
        assert!(!store.is_available());
        assert_eq!(store.len().await, 1);

        assert_eq!(store.append(event("r3", "custA", "app1")).await.unwrap(), 1);
        assert!(store.is_available());
        drop(store);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
        assert_eq!(request_ids(&path).await, ["r1", "r3"]);
    }

    #[tokio::test]
    async fn stays_unavailable_until_the_log_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let store = EventStore::open(&path, false).await.unwrap();

        store
            .inject_write_faults(WriteFaults {
                torn_write: Some(5),
                failed_repairs: 2,
            })
            .await;
        assert!(store.append(event("r1", "custA", "app1")).await.is_err());
        // the repair before this write fails too, so nothing is written
        assert!(store.append(event("r2", "custA", "app1")).await.is_err());
        assert!(!store.is_available());
        assert!(matches!(
            store.ensure_available(),
            Err(MetricsError::UpstreamUnavailable(_))
        ));

        assert_eq!(store.append(event("r3", "custA", "app1")).await.unwrap(), 0);
        assert!(store.is_available());
        drop(store);
        assert_eq!(request_ids(&path).await, ["r3"]);
    }

    #[tokio::test]
    async fn unterminated_trailing_line_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let store = EventStore::open(&path, false).await.unwrap();
            store.append(event("r1", "custA", "app1")).await.unwrap();
            store.append(event("r2", "custA", "app1")).await.unwrap();
        }
        // drop the final newline: the second line is complete JSON but unacknowledged
        let len = std::fs::metadata(&path).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 1)
            .unwrap();

        let store = EventStore::open(&path, false).await.unwrap();
        assert_eq!(store.len().await, 1);
        store.append(event("r3", "custA", "app1")).await.unwrap();
        drop(store);
        assert_eq!(request_ids(&path).await, ["r1", "r3"]);
    }
}
