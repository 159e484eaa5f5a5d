//! Event stores
//!
//! One append-only log per run. Sequence numbers start at 1 and are assigned
//! on append; scan returns events in ascending seq order.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use flame_core::{FlameError, FlameResult, RunEvent, RunId, Seq, SequencedEvent};

/// Durable home of run event logs
pub trait EventStore: Send + Sync + 'static {
    /// Append one event to a run's log, returning it with its assigned seq
    fn append(&self, run_id: &RunId, event: RunEvent, at: DateTime<Utc>)
        -> FlameResult<SequencedEvent>;

    /// Events with `seq >= from`, ascending
    fn scan(&self, run_id: &RunId, from: Seq) -> FlameResult<Vec<SequencedEvent>>;

    /// Last assigned seq, 0 for an unknown run
    fn head(&self, run_id: &RunId) -> FlameResult<Seq>;

    /// Every run with at least one event
    fn run_ids(&self) -> FlameResult<Vec<RunId>>;
}

// ============================================================================
// IN-MEMORY
// ============================================================================

/// In-memory event store
#[derive(Default)]
pub struct MemoryEventStore {
    logs: RwLock<HashMap<RunId, Vec<SequencedEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        MemoryEventStore::default()
    }

    fn next_seq(log: &[SequencedEvent]) -> Seq {
        log.last().map(|e| e.seq + 1).unwrap_or(1)
    }

    /// Insert an already-sequenced event, enforcing contiguity
    fn insert(&self, event: SequencedEvent) -> FlameResult<()> {
        let mut logs = self.logs.write();
        let log = logs.entry(event.run_id.clone()).or_default();
        let expected = Self::next_seq(log);
        if event.seq != expected {
            return Err(FlameError::Storage(format!(
                "run {} expected seq {expected}, found {}",
                event.run_id, event.seq
            )));
        }
        log.push(event);
        Ok(())
    }
}

impl EventStore for MemoryEventStore {
    fn append(
        &self,
        run_id: &RunId,
        event: RunEvent,
        at: DateTime<Utc>,
    ) -> FlameResult<SequencedEvent> {
        let mut logs = self.logs.write();
        let log = logs.entry(run_id.clone()).or_default();
        let sequenced = SequencedEvent {
            run_id: run_id.clone(),
            seq: Self::next_seq(log),
            at,
            event,
        };
        log.push(sequenced.clone());
        Ok(sequenced)
    }

    fn scan(&self, run_id: &RunId, from: Seq) -> FlameResult<Vec<SequencedEvent>> {
        let logs = self.logs.read();
        Ok(logs
            .get(run_id)
            .map(|log| log.iter().filter(|e| e.seq >= from).cloned().collect())
            .unwrap_or_default())
    }

    fn head(&self, run_id: &RunId) -> FlameResult<Seq> {
        let logs = self.logs.read();
        Ok(logs
            .get(run_id)
            .and_then(|log| log.last())
            .map(|e| e.seq)
            .unwrap_or(0))
    }

    fn run_ids(&self) -> FlameResult<Vec<RunId>> {
        let mut ids: Vec<RunId> = self.logs.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ============================================================================
// JOURNAL
// ============================================================================

/// Append-only JSON-lines journal.
///
/// Every append is written, flushed and synced before it is acknowledged, so
/// a recorded failure reason survives a coordinator crash. Reads are served
/// from an in-memory index rebuilt on open.
pub struct JournalEventStore {
    path: PathBuf,
    file: Mutex<File>,
    index: MemoryEventStore,
}

impl JournalEventStore {
    /// Open (or create) a journal and replay it
    pub fn open(path: impl AsRef<Path>) -> FlameResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut content = String::new();
        (&file).read_to_string(&mut content)?;

        let index = MemoryEventStore::new();
        let mut replayed = 0usize;
        let mut offset = 0usize;
        for (n, line) in content.split_inclusive('\n').enumerate() {
            // A final line without its newline is an append that was never acknowledged.
            if !line.ends_with('\n') {
                tracing::warn!(path = %path.display(), bytes = line.len(), "truncating torn journal tail");
                file.set_len(offset as u64)?;
                break;
            }
            offset += line.len();
            if line.trim().is_empty() {
                continue;
            }
            let event: SequencedEvent = serde_json::from_str(line).map_err(|e| {
                FlameError::Storage(format!("{} line {}: {e}", path.display(), n + 1))
            })?;
            index.insert(event)?;
            replayed += 1;
        }
        tracing::debug!(path = %path.display(), events = replayed, "journal replayed");

        Ok(JournalEventStore {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventStore for JournalEventStore {
    fn append(
        &self,
        run_id: &RunId,
        event: RunEvent,
        at: DateTime<Utc>,
    ) -> FlameResult<SequencedEvent> {
        let mut file = self.file.lock();
        let sequenced = SequencedEvent {
            run_id: run_id.clone(),
            seq: self.index.head(run_id)? + 1,
            at,
            event,
        };
        let mut line = serde_json::to_vec(&sequenced)
            .map_err(|e| FlameError::Storage(e.to_string()))?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        file.sync_data()?;
        self.index.insert(sequenced.clone())?;
        Ok(sequenced)
    }

    fn scan(&self, run_id: &RunId, from: Seq) -> FlameResult<Vec<SequencedEvent>> {
        self.index.scan(run_id, from)
    }

    fn head(&self, run_id: &RunId) -> FlameResult<Seq> {
        self.index.head(run_id)
    }

    fn run_ids(&self) -> FlameResult<Vec<RunId>> {
        self.index.run_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled() -> RunEvent {
        RunEvent::RunCancelled
    }

    #[test]
    fn test_memory_seq_starts_at_one() {
        let store = MemoryEventStore::new();
        let run = RunId::new("r");
        assert_eq!(store.head(&run).unwrap(), 0);
        assert_eq!(store.append(&run, cancelled(), Utc::now()).unwrap().seq, 1);
        assert_eq!(store.append(&run, cancelled(), Utc::now()).unwrap().seq, 2);
        assert_eq!(store.scan(&run, 2).unwrap().len(), 1);
        assert!(store.scan(&RunId::new("other"), 1).unwrap().is_empty());
    }

    #[test]
    fn test_journal_replays_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let run = RunId::new("r");

        {
            let store = JournalEventStore::open(&path).unwrap();
            store.append(&run, cancelled(), Utc::now()).unwrap();
            store
                .append(&RunId::new("s"), cancelled(), Utc::now())
                .unwrap();
            store.append(&run, cancelled(), Utc::now()).unwrap();
        }

        let store = JournalEventStore::open(&path).unwrap();
        assert_eq!(store.head(&run).unwrap(), 2);
        assert_eq!(store.run_ids().unwrap(), vec![RunId::new("r"), RunId::new("s")]);
        assert_eq!(store.append(&run, cancelled(), Utc::now()).unwrap().seq, 3);
    }

    #[test]
    fn test_journal_ignores_torn_tail_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        {
            let store = JournalEventStore::open(&path).unwrap();
            store
                .append(&RunId::new("r"), cancelled(), Utc::now())
                .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"run_id\":\"r\",\"se").unwrap();
        drop(file);

        let store = JournalEventStore::open(&path).unwrap();
        assert_eq!(store.head(&RunId::new("r")).unwrap(), 1);
        store
            .append(&RunId::new("r"), cancelled(), Utc::now())
            .unwrap();
        drop(store);
        let store = JournalEventStore::open(&path).unwrap();
        assert_eq!(store.head(&RunId::new("r")).unwrap(), 2);

        std::fs::write(&path, "garbage\n{}\n").unwrap();
        assert!(matches!(
            JournalEventStore::open(&path),
            Err(FlameError::Storage(_))
        ));
    }
}
