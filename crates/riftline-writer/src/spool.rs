//! Local-disk JSON spool the writer falls back to while the circuit is open.

use std::path::{Path, PathBuf};

use riftline_types::Event;
use uuid::Uuid;

/// Errors reading or writing spool chunks.
#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    /// The underlying filesystem operation failed.
    #[error("spool io error: {0}")]
    Io(#[from] std::io::Error),
    /// A chunk file could not be deserialized.
    #[error("spool chunk corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, SpoolError>;

/// A directory of JSON-encoded event chunks, written when the Analytics
/// Store is unreachable and replayed once it recovers.
pub struct SpoolStore {
    dir: PathBuf,
}

impl SpoolStore {
    /// Point a spool at `dir`, creating it if absent.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Write `events` to a new chunk file and return its path.
    pub async fn write_chunk(&self, events: &[Event]) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec(events)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }

    /// List spooled chunk files, oldest first by filesystem modification time.
    pub async fn list_chunks(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let modified = entry.metadata().await?.modified()?;
                chunks.push((modified, path));
            }
        }
        chunks.sort_by_key(|(modified, _)| *modified);
        Ok(chunks.into_iter().map(|(_, path)| path).collect())
    }

    /// Read and deserialize a chunk file.
    pub async fn read_chunk(&self, path: &Path) -> Result<Vec<Event>> {
        let body = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Delete a chunk file after it has been successfully reinserted.
    pub async fn remove_chunk(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use riftline_types::{EventType, Payload};

    fn event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            match_id: "m1".to_string(),
            map_id: "de_dust2".to_string(),
            round_no: 1,
            ts_event: Utc::now(),
            ts_ingest: Utc::now(),
            event_type: EventType::Kill,
            source: "test".to_string(),
            seq_no: 1,
            payload: Payload::Opaque(serde_json::json!({})),
            trace_id: None,
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn round_trips_a_chunk_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolStore::new(dir.path()).await.unwrap();
        let events = vec![event(), event()];
        let path = spool.write_chunk(&events).await.unwrap();

        let chunks = spool.list_chunks().await.unwrap();
        assert_eq!(chunks, vec![path.clone()]);

        let read_back = spool.read_chunk(&path).await.unwrap();
        assert_eq!(read_back.len(), 2);

        spool.remove_chunk(&path).await.unwrap();
        assert!(spool.list_chunks().await.unwrap().is_empty());
    }
}
