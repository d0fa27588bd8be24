use super::metadata::{PartitionMetadata, METADATA_FILE_NAME};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<F> Clock for F
where
    F: Fn() -> DateTime<Utc> + Send + Sync,
{
    fn now(&self) -> DateTime<Utc> {
        self()
    }
}

/// What one sweep did, per partition directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Expired and removed.
    pub deleted: Vec<PathBuf>,
    /// Not yet expired.
    pub kept: Vec<PathBuf>,
    /// No readable metadata; never expires.
    pub skipped: Vec<PathBuf>,
    /// Expired, but removal failed.
    pub failed: Vec<PathBuf>,
}

/// Deletes partitions whose credential has expired.
///
/// Partitions live at `<cache_dir>/data/<partition>` and
/// `<cache_dir>/temp/<partition>`; each half is judged by its own metadata
/// file.
pub struct Pruner {
    cache_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl Pruner {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(cache_dir, Arc::new(SystemClock))
    }

    pub fn with_clock(cache_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            clock,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// One pass over both partition roots. Problems with a single partition
    /// are logged and never stop the sweep.
    pub async fn sweep(&self) -> PruneReport {
        let mut report = PruneReport::default();
        let now = self.clock.now();
        for root in ["data", "temp"] {
            let base = self.cache_dir.join(root);
            let mut entries = match tokio::fs::read_dir(&base).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %base.display(), error = %e, "Failed to list cache partitions");
                    continue;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %base.display(), error = %e, "Failed to list cache partitions");
                        break;
                    }
                };
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    judge(entry.path(), now, &mut report).await;
                }
            }
        }
        report
    }

    /// Sweep every `interval`, starting one interval from now.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                debug!(
                    deleted = report.deleted.len(),
                    kept = report.kept.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "Cache prune sweep finished"
                );
            }
        })
    }
}

async fn judge(partition: PathBuf, now: DateTime<Utc>, report: &mut PruneReport) {
    let metadata_path = partition.join(METADATA_FILE_NAME);
    let raw = match tokio::fs::read(&metadata_path).await {
        Ok(raw) => raw,
        Err(_) => {
            report.skipped.push(partition);
            return;
        }
    };
    let metadata: PartitionMetadata = match serde_json::from_slice(&raw) {
        Ok(metadata) => metadata,
        Err(e) => {
            error!(filepath = %metadata_path.display(), error = %e, "Failed to deserialize metadata file");
            report.skipped.push(partition);
            return;
        }
    };
    if metadata.expires_at > now {
        debug!(path = %partition.display(), expires_at = %metadata.expires_at, "Cache partition not expired");
        report.kept.push(partition);
        return;
    }

    info!(path = %partition.display(), expires_at = %metadata.expires_at, "Cleaning up expired cache partition");
    match tokio::fs::remove_dir_all(&partition).await {
        Ok(()) => report.deleted.push(partition),
        Err(e) => {
            error!(path = %partition.display(), error = %e, "Failed to delete expired cache partition");
            report.failed.push(partition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed(at: DateTime<Utc>) -> Arc<dyn Clock> {
        Arc::new(move || at)
    }

    fn partition(root: &Path, half: &str, name: &str, expires_at: Option<DateTime<Utc>>) -> PathBuf {
        let dir = root.join(half).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("entry"), b"cached").unwrap();
        if let Some(expires_at) = expires_at {
            PartitionMetadata::new(expires_at).write_to(&[dir.as_path()]).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let expired = partition(root.path(), "data", "old", Some(now - chrono::Duration::hours(1)));
        let expired_temp = partition(root.path(), "temp", "old", Some(now - chrono::Duration::hours(1)));
        let exactly_now = partition(root.path(), "data", "edge", Some(now));
        let fresh = partition(root.path(), "data", "new", Some(now + chrono::Duration::hours(1)));
        let forever = partition(root.path(), "data", "pat", None);

        let report = Pruner::with_clock(root.path(), fixed(now)).sweep().await;

        assert!(!expired.exists());
        assert!(!expired_temp.exists());
        assert!(!exactly_now.exists());
        assert!(fresh.exists());
        assert!(forever.exists());
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.kept, vec![fresh]);
        assert_eq!(report.skipped, vec![forever]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let dir = partition(root.path(), "data", "broken", None);
        std::fs::write(dir.join(METADATA_FILE_NAME), b"{\"expires_at\": 42}").unwrap();
        std::fs::write(root.path().join("data").join("stray-file"), b"").unwrap();

        let report = Pruner::with_clock(root.path(), fixed(Utc::now())).sweep().await;
        assert!(dir.exists());
        assert_eq!(report.skipped, vec![dir]);
    }

    #[tokio::test]
    async fn test_missing_roots_are_tolerated() {
        let root = tempfile::tempdir().unwrap();
        let report = Pruner::new(root.path().join("nowhere")).sweep().await;
        assert_eq!(report, PruneReport::default());
    }

    #[tokio::test]
    async fn test_spawned_pruner_waits_one_interval() {
        let root = tempfile::tempdir().unwrap();
        let expired = partition(root.path(), "data", "old", Some(Utc::now() - chrono::Duration::days(1)));

        let handle = Arc::new(Pruner::new(root.path())).spawn(Duration::from_millis(300));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(expired.exists());

        for _ in 0..100 {
            if !expired.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!expired.exists());
        handle.abort();
    }
}
