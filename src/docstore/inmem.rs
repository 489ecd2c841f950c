use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::*;

#[derive(Default, Serialize, Deserialize)]
struct State {
    documents: HashMap<DocPath, Document>,
    /// Last server timestamp handed out, in microseconds.
    #[serde(default)]
    clock_micros: i64,
}

/// Process-local document store. Optionally mirrored to a JSON snapshot that
/// is rewritten after every commit and reloaded on start-up.
#[derive(Clone, Default)]
pub struct InMemDocStore {
    state: Arc<RwLock<State>>,
    snapshot_path: Option<Arc<PathBuf>>,
    /// Serializes snapshot writers; whoever holds it writes the newest state.
    persist_lock: Arc<Mutex<()>>,
}

impl InMemDocStore {
    /// Ephemeral store; nothing touches the filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Self::load_state_from(&path);
        Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: Some(Arc::new(path)),
            persist_lock: Arc::default(),
        }
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.read_state()?.documents.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    fn load_state_from(path: &Path) -> State {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                Ok(s) => {
                    info!(path = %path.display(), documents = s.documents.len(), "loaded snapshot");
                    s
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable snapshot, starting empty");
                    State::default()
                }
            },
            Err(e) => {
                info!(path = %path.display(), error = %e, "no snapshot, starting empty");
                State::default()
            }
        }
    }

    fn persist(&self) {
        let Some(path) = self.snapshot_path.as_deref() else { return };
        let Ok(_guard) = self.persist_lock.lock() else {
            warn!("snapshot lock poisoned, skipping write");
            return;
        };
        // read under the persist lock so a slower writer never lands an older state
        let bytes = match self.read_state().map(|s| serde_json::to_vec_pretty(&*s)) {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to serialize snapshot");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read state for snapshot");
                return;
            }
        };
        if let Err(e) = Self::write_atomically(path, &bytes) {
            warn!(path = %path.display(), error = %e, "failed to write snapshot");
        }
    }

    /// Writes a sibling temp file and renames it over `path`, so readers see
    /// either the old snapshot or the new one.
    fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)
    }

    fn read_state(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| StoreError::Backend("state lock poisoned".into()))
    }

    fn write_state(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| StoreError::Backend("state lock poisoned".into()))
    }

    /// Strictly increasing per store, so creation order survives ties in the
    /// wall clock.
    fn server_now(state: &mut State) -> DateTime<Utc> {
        let micros = Utc::now().timestamp_micros().max(state.clock_micros + 1);
        state.clock_micros = micros;
        DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl DocumentStore for InMemDocStore {
    async fn get(&self, path: &DocPath) -> StoreResult<Option<Document>> {
        Ok(self.read_state()?.documents.get(path).cloned())
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        let s = self.read_state()?;
        Ok(s.documents.values().filter(|d| query.matches(d)).cloned().collect())
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<Vec<Document>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let written = {
            let mut s = self.write_state()?;
            let now = Self::server_now(&mut s);
            let mut staged: HashMap<DocPath, Document> = HashMap::new();
            let mut written = Vec::with_capacity(batch.writes().len());
            for write in batch.writes() {
                let path = write.path();
                let current = staged.get(path).or_else(|| s.documents.get(path));
                let next = apply_write(current, write, now)?;
                written.push(next.clone());
                staged.insert(path.clone(), next);
            }
            s.documents.extend(staged);
            written
        };
        self.persist();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comments() -> CollectionPath {
        CollectionPath::root("comments")
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_trace() {
        let store = InMemDocStore::new();
        let parent = comments().doc("missing");
        let reply = parent.collection("replies").new_doc();
        let batch = WriteBatch::new()
            .create(reply.clone(), vec![FieldOp::set("userComment", "hi")])
            .update(parent, Precondition::Exists, vec![FieldOp::increment("replies", 1)]);

        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get(&reply).await.unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn server_timestamps_strictly_increase() {
        let store = InMemDocStore::new();
        let mut last = None;
        for _ in 0..50 {
            let written = store
                .commit(WriteBatch::new().create(comments().new_doc(), vec![FieldOp::server_timestamp("timing")]))
                .await
                .unwrap();
            let ts = written[0].create_time;
            if let Some(prev) = last {
                assert!(ts > prev);
            }
            last = Some(ts);
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let doc = comments().doc("c1");
        {
            let store = InMemDocStore::with_snapshot(&path);
            store
                .commit(WriteBatch::new().create(doc.clone(), vec![FieldOp::set("movieId", "603")]))
                .await
                .unwrap();
        }
        let reopened = InMemDocStore::with_snapshot(&path);
        let loaded = reopened.get(&doc).await.unwrap().unwrap();
        assert_eq!(loaded.fields["movieId"], json!("603"));
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_leave_a_complete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = InMemDocStore::with_snapshot(&path);

        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let text = "x".repeat(i * 64);
                store
                    .commit(WriteBatch::new().create(comments().new_doc(), vec![FieldOp::set("userComment", text)]))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let bytes = std::fs::read(&path).unwrap();
        let on_disk: State = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(on_disk.documents.len(), 32);
        assert_eq!(InMemDocStore::with_snapshot(&path).len().unwrap(), 32);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = InMemDocStore::with_snapshot(&path);
        assert!(store.is_empty().unwrap());
    }
}
