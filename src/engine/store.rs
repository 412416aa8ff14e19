use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::Event;
use crate::wal::{LogFile, Wal};

use super::EngineError;

/// Durable home of the event stream. The engine's in-memory state is a
/// projection of whatever was appended here.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Returns once the event is durable. On error nothing may be applied.
    async fn append(&self, event: &Event) -> Result<(), EngineError>;

    /// Replace the stored stream with `events`, which recreate the current state.
    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError>;

    async fn appends_since_compact(&self) -> u64;
}

// ── File-backed log with group commit ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Write-ahead log owned by a background writer task.
///
/// The writer blocks for the first append, then drains every append already
/// queued and commits them all with a single fsync.
pub struct WalLog {
    tx: mpsc::Sender<WalCommand>,
}

impl WalLog {
    /// Replay `path`, then start the writer. Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Wal::replay(path)?;
        if replay.discarded_tail {
            warn!(path = %path.display(), valid_len = replay.valid_len, "discarded torn tail of event log");
        }
        let wal = Wal::open_at(path, replay.valid_len)?;
        Ok((Self::spawn(wal), replay.events))
    }

    /// Start the writer task over an already opened log.
    pub fn spawn<F: LogFile + Send + 'static>(wal: Wal<F>) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    async fn request<T>(&self, cmd: WalCommand, rx: oneshot::Receiver<T>) -> Result<T, EngineError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))
    }
}

#[async_trait]
impl EventLog for WalLog {
    async fn append(&self, event: &Event) -> Result<(), EngineError> {
        let (response, rx) = oneshot::channel();
        let cmd = WalCommand::Append { event: event.clone(), response };
        self.request(cmd, rx)
            .await?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::Compact { events, response }, rx)
            .await?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::AppendsSinceCompact { response }, rx)
            .await
            .unwrap_or(0)
    }
}

async fn writer_loop<F: LogFile>(mut wal: Wal<F>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_other(&mut wal, other);
                continue;
            }
        };
        let mut batch: Pending = vec![(event, response)];
        let mut deferred = None;

        // Batch window: everything already queued rides on this fsync.
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = wal.append_batch(batch.iter().map(|(event, _)| event));
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_other(&mut wal, cmd);
        }
    }
}

fn handle_other<F: LogFile>(wal: &mut Wal<F>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by writer_loop"),
    }
}

// ── In-process log ─────────────────────────────────────────────────

/// Keeps events in memory. Used for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryLog {
    events: Mutex<Vec<Event>>,
    appends_since_compact: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored stream.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, event: &Event) -> Result<(), EngineError> {
        self.events
            .lock()
            .map_err(|_| EngineError::Storage("memory log poisoned".into()))?
            .push(event.clone());
        self.appends_since_compact.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        *self
            .events
            .lock()
            .map_err(|_| EngineError::Storage("memory log poisoned".into()))? = events;
        self.appends_since_compact.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::court_a;
    use crate::wal::FlakyFile;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("courtbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn wal_log_group_commit_survives_reopen() {
        let path = tmp_path("group_commit.wal");
        let resource = court_a();
        {
            let (log, replayed) = WalLog::open(&path).unwrap();
            assert!(replayed.is_empty());
            let log = std::sync::Arc::new(log);
            let mut handles = Vec::new();
            for _ in 0..50 {
                let log = log.clone();
                let rid = resource.id;
                handles.push(tokio::spawn(async move {
                    log.append(&Event::BlackoutRemoved { id: Ulid::new(), resource_id: rid })
                        .await
                }));
            }
            for h in handles {
                h.await.unwrap().unwrap();
            }
            assert_eq!(log.appends_since_compact().await, 50);
        }

        let replayed = Wal::replay(&path).unwrap().events;
        assert_eq!(replayed.len(), 50);
    }

    #[tokio::test]
    async fn wal_log_compact_resets_counter() {
        let path = tmp_path("compact_counter.wal");
        let (log, _) = WalLog::open(&path).unwrap();
        let created = Event::ResourceCreated { resource: court_a() };
        log.append(&created).await.unwrap();
        log.append(&created).await.unwrap();
        assert_eq!(log.appends_since_compact().await, 2);

        log.compact(vec![created.clone()]).await.unwrap();
        assert_eq!(log.appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().events, vec![created]);
    }

    #[tokio::test]
    async fn failed_batch_never_reaches_the_log() {
        let file = FlakyFile::default();
        let log = WalLog::spawn(Wal::with_file(file.clone(), Path::new("flaky.wal"), 0));
        let rid = Ulid::new();
        let kept = Event::BlackoutRemoved { id: Ulid::new(), resource_id: rid };
        let refused = Event::BlackoutRemoved { id: Ulid::new(), resource_id: rid };
        let later = Event::BlackoutRemoved { id: Ulid::new(), resource_id: rid };

        log.append(&kept).await.unwrap();
        file.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(log.append(&refused).await, Err(EngineError::Storage(_))));
        file.fail_writes.store(false, Ordering::SeqCst);
        log.append(&later).await.unwrap();

        // What a restart would replay: the refused event is gone.
        let replay = Wal::replay_from(&file.contents()[..]).unwrap();
        assert_eq!(replay.events, vec![kept, later]);
        assert_eq!(log.appends_since_compact().await, 2);
    }

    #[tokio::test]
    async fn reopen_after_torn_tail_keeps_new_appends() {
        let path = tmp_path("reopen_torn.wal");
        let created = Event::ResourceCreated { resource: court_a() };
        {
            let (log, _) = WalLog::open(&path).unwrap();
            log.append(&created).await.unwrap();
        }
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0]).unwrap();
        }

        let later = Event::ResourceCreated { resource: court_a() };
        {
            let (log, replayed) = WalLog::open(&path).unwrap();
            assert_eq!(replayed, vec![created.clone()]);
            log.append(&later).await.unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, vec![created, later]);
    }

    #[tokio::test]
    async fn memory_log_appends_and_compacts() {
        let log = MemoryLog::new();
        let created = Event::ResourceCreated { resource: court_a() };
        log.append(&created).await.unwrap();
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.appends_since_compact().await, 1);

        log.compact(Vec::new()).await.unwrap();
        assert!(log.events().is_empty());
        assert_eq!(log.appends_since_compact().await, 0);
    }
}
