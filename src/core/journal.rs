//! Append-only run journal.
//!
//! One JSONL file per run at `index/journal/<run_id>.jsonl`. The journal is
//! operational history; manifests remain the record of what was captured,
//! so journal writes from the engine are best-effort.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::StorageLayout;
use crate::domain::{JournalEvent, JournalEventType, RunId, RunSummary};
use crate::error::{Result, VaultError};

/// File-based journal using JSONL format
#[derive(Debug, Clone)]
pub struct Journal {
    /// index/journal
    dir: PathBuf,

    /// Serializes appends from this process so lines never interleave
    write_lock: Arc<Mutex<()>>,
}

impl Journal {
    pub fn open(layout: &StorageLayout) -> Result<Self> {
        let dir = layout.journal_dir();
        std::fs::create_dir_all(&dir).map_err(|e| VaultError::storage(&dir, e))?;
        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Path of a run's journal file
    pub fn path(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append an event to its run's journal
    pub async fn append(&self, event: &JournalEvent) -> Result<()> {
        let path = self.path(&event.run_id);
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| VaultError::storage(&path, e))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| VaultError::storage(&path, e))?;
        file.flush().await.map_err(|e| VaultError::storage(&path, e))?;

        Ok(())
    }

    /// Replay a run's events in order. A torn trailing line left by a crash
    /// is skipped with a warning.
    pub async fn replay(&self, run_id: &RunId) -> Result<Vec<JournalEvent>> {
        let path = self.path(run_id);

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::storage(&path, e)),
        };

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| VaultError::storage(&path, e))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unparsable journal line"),
            }
        }

        Ok(events)
    }

    /// Summary reconstructed from the journal
    pub async fn summary(&self, run_id: &RunId) -> Result<RunSummary> {
        let events = self.replay(run_id).await?;
        Ok(RunSummary::from_events(run_id.clone(), &events))
    }

    /// Find events matching a predicate
    pub async fn find_events<F>(&self, run_id: &RunId, predicate: F) -> Result<Vec<JournalEvent>>
    where
        F: Fn(&JournalEvent) -> bool,
    {
        let events = self.replay(run_id).await?;
        Ok(events.into_iter().filter(predicate).collect())
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(
        &self,
        run_id: &RunId,
        event_type: JournalEventType,
    ) -> Result<Option<JournalEvent>> {
        let events = self.replay(run_id).await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Runs that have a journal, sorted
    pub async fn list_runs(&self) -> Result<Vec<RunId>> {
        let mut runs = Vec::new();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(VaultError::storage(&self.dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VaultError::storage(&self.dir, e))?
        {
            if let Some(run_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".jsonl"))
                .and_then(|stem| RunId::new(stem).ok())
            {
                runs.push(run_id);
            }
        }

        runs.sort();
        Ok(runs)
    }

    /// Delete a run's journal. Retention only.
    pub async fn remove(&self, run_id: &RunId) -> Result<()> {
        let path = self.path(run_id);
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::storage(&path, e)),
        }
    }
}
