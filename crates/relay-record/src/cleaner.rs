//! Segment cleaner.
//!
//! Periodically scans every configured record path, re-parses segment
//! timestamps from file names, and unlinks segments older than the
//! configured retention. The first sweep runs immediately on start.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{NowFn, RecordFormat};
use crate::path_template;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One record path to keep clean.
#[derive(Debug, Clone)]
pub struct CleanerEntry {
    /// Path template without extension.
    pub record_path: String,
    pub format: RecordFormat,
    pub delete_after: Duration,
}

pub struct Cleaner {
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Cleaner {
    pub fn new(entries: Vec<CleanerEntry>, now_fn: NowFn) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                for entry in &entries {
                    sweep_entry(entry, (now_fn)());
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
            }
        });

        Self {
            cancel,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn sweep_entry(entry: &CleanerEntry, now: DateTime<Utc>) {
    let base_dir = path_template::common_dir(&entry.record_path);
    if base_dir.is_empty() {
        return;
    }

    let name_template = path_template::base_name_template(&entry.record_path);
    let extension = entry.format.extension();
    let threshold = now
        - chrono::Duration::from_std(entry.delete_after).unwrap_or_else(|_| chrono::Duration::zero());

    sweep_dir(Path::new(&base_dir), name_template, extension, threshold);
}

fn sweep_dir(dir: &Path, name_template: &str, extension: &str, threshold: DateTime<Utc>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.is_dir() {
            sweep_dir(&path, name_template, extension, threshold);
            continue;
        }

        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Some(base) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(ts) = path_template::parse_base_name(name_template, base) else {
            continue;
        };

        if ts < threshold {
            debug!("removing expired segment {}", path.display());
            if let Err(err) = std::fs::remove_file(&path) {
                warn!("unable to remove {}: {}", path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[tokio::test]
    async fn expired_segments_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = format!("{}/%path/%Y-%m-%d_%H-%M-%S-%f", dir.path().display());

        std::fs::create_dir(dir.path().join("mypath")).unwrap();
        let old = dir.path().join("mypath/2008-05-20_22-15-25-000125.mp4");
        let fresh = dir.path().join("mypath/2009-05-20_22-15-25-000427.mp4");
        std::fs::write(&old, [1]).unwrap();
        std::fs::write(&fresh, [1]).unwrap();

        let now = Utc.with_ymd_and_hms(2009, 5, 20, 22, 15, 25).unwrap()
            + chrono::Duration::microseconds(427);
        let cleaner = Cleaner::new(
            vec![CleanerEntry {
                record_path,
                format: RecordFormat::Fmp4,
                delete_after: Duration::from_secs(10),
            }],
            Arc::new(move || now),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        cleaner.close().await;

        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn foreign_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = format!("{}/%path/%Y-%m-%d_%H-%M-%S-%f", dir.path().display());

        std::fs::create_dir(dir.path().join("mypath")).unwrap();
        let note = dir.path().join("mypath/readme.txt");
        let odd = dir.path().join("mypath/not-a-timestamp.mp4");
        std::fs::write(&note, [1]).unwrap();
        std::fs::write(&odd, [1]).unwrap();

        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let cleaner = Cleaner::new(
            vec![CleanerEntry {
                record_path,
                format: RecordFormat::Fmp4,
                delete_after: Duration::from_secs(10),
            }],
            Arc::new(move || now),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        cleaner.close().await;

        assert!(note.exists());
        assert!(odd.exists());
    }
}
