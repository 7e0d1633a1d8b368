//! Session persistence.
//!
//! A [`SessionStore`] keeps the live chat history in memory and mirrors every
//! change into a single named slot of a [`SlotStorage`]. Persistence is best
//! effort: read and write failures are logged and swallowed, the in-memory copy
//! stays authoritative for this process. Changes made to the slot by another
//! process are picked up by [`SessionStore::spawn_watcher`] and replace the
//! local history wholesale.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::message::{rebase_exhausted_ids, Session};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A key-value store of string slots.
pub trait SlotStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

// Distinguishes temp files of concurrent writers within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One `<key>.json` file per slot inside a directory.
#[derive(Debug, Clone)]
pub struct FileSlotStorage {
    dir: PathBuf,
}

impl FileSlotStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn slot_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl SlotStorage for FileSlotStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.slot_path(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.slot_path(key)?;
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        // Readers in other processes must never observe a half-written slot.
        let tmp = self.dir.join(format!(
            ".{}.json.{}-{}.tmp",
            key,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, value).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.slot_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// Process-local slots. Share one instance between stores to simulate
/// several processes on the same storage.
#[derive(Debug, Default)]
pub struct MemorySlotStorage {
    slots: Mutex<HashMap<String, String>>,
}

impl MemorySlotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.slots
            .lock()
            .map_err(|_| StoreError::Unavailable("memory storage lock poisoned".to_string()))
    }
}

impl SlotStorage for MemorySlotStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.slots()?.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.slots()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.slots()?.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(Session) + Send + Sync>;

pub struct SessionStore {
    storage: Arc<dyn SlotStorage>,
    key: String,
    current: Mutex<Session>,
    /// Raw slot content as last read or written by this process.
    last_seen: Mutex<Option<String>>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

// Locks here only guard plain data, so a poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionStore {
    /// Opens the store and hydrates the in-memory session from the slot.
    pub fn open(storage: Arc<dyn SlotStorage>, key: impl Into<String>) -> Self {
        let store = Self {
            storage,
            key: key.into(),
            current: Mutex::new(Session::new()),
            last_seen: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        };
        let (raw, session) = store.read_slot();
        info!(key = %store.key, messages = session.len(), "Session hydrated");
        *lock(&store.last_seen) = raw;
        *lock(&store.current) = session;
        store
    }

    pub fn in_memory(key: impl Into<String>) -> Self {
        Self::open(Arc::new(MemorySlotStorage::new()), key)
    }

    /// Reads the persisted session. Absent, unreadable or malformed content
    /// yields an empty session. Does not touch the live session, so a change
    /// seen here is still reported by the next [`Self::poll_external_change`].
    pub fn load(&self) -> Session {
        self.read_slot().1
    }

    fn read_slot(&self) -> (Option<String>, Session) {
        match self.storage.read(&self.key) {
            Ok(raw) => {
                let session = raw.as_deref().map(parse_session).unwrap_or_default();
                (raw, session)
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Error reading session slot");
                (None, Session::new())
            }
        }
    }

    /// Overwrites the slot with `session`. Failures are logged, never returned.
    pub fn save(&self, session: &Session) {
        let json = match serde_json::to_string(session) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Error serializing session");
                return;
            }
        };
        let mut last_seen = lock(&self.last_seen);
        match self.storage.write(&self.key, &json) {
            Ok(()) => *last_seen = Some(json),
            Err(e) => warn!(key = %self.key, error = %e, "Error writing session slot"),
        }
    }

    /// The live in-memory session.
    pub fn current(&self) -> Session {
        lock(&self.current).clone()
    }

    /// Replaces the live session and persists it.
    pub fn set_session(&self, session: Session) {
        let mut current = lock(&self.current);
        self.save(&session);
        *current = session;
    }

    /// Applies `f` to the live session, persists and returns the result.
    pub fn update_session<F>(&self, f: F) -> Session
    where
        F: FnOnce(Session) -> Session,
    {
        let mut current = lock(&self.current);
        let next = f(current.clone());
        self.save(&next);
        *current = next.clone();
        next
    }

    /// Registers a callback for changes written to the slot by someone else.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Checks the slot for content this process did not write. On a change the
    /// live session is replaced and every subscriber is notified.
    #[instrument(skip(self), fields(key = %self.key))]
    pub fn poll_external_change(&self) -> bool {
        let session = {
            // Same lock order as set_session: current, then last_seen.
            let mut current = lock(&self.current);
            let mut last_seen = lock(&self.last_seen);
            let raw = match self.storage.read(&self.key) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(error = %e, "Skipping sync poll, slot unreadable");
                    return false;
                }
            };
            if raw == *last_seen {
                return false;
            }
            let session = raw.as_deref().map(parse_session).unwrap_or_default();
            *last_seen = raw;
            *current = session.clone();
            session
        };

        info!(messages = session.len(), "Session replaced by external change");
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(session.clone());
        }
        true
    }

    /// Polls the slot every `period` until the store is dropped.
    pub fn spawn_watcher(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => {
                        store.poll_external_change();
                    }
                    None => break,
                }
            }
            debug!("Session watcher stopped");
        })
    }
}

fn parse_session(raw: &str) -> Session {
    match serde_json::from_str::<Session>(raw) {
        Ok(mut session) => {
            rebase_exhausted_ids(&mut session);
            session
        }
        Err(e) => {
            warn!(error = %e, "Error parsing persisted session, starting empty");
            Session::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Sender};
    use std::sync::atomic::AtomicUsize;

    fn user(id: i64, text: &str) -> Message {
        Message {
            id,
            sender: Sender::User,
            text: text.to_string(),
        }
    }

    struct BrokenStorage;

    impl SlotStorage for BrokenStorage {
        fn read(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("no storage here".to_string()))
        }
        fn write(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("quota exceeded".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("no storage here".to_string()))
        }
    }

    #[test]
    fn test_load_after_save_round_trips() {
        let store = SessionStore::in_memory("chat");
        let session = vec![user(1, "a"), user(2, "b\n\nc")];
        store.save(&session);
        assert_eq!(store.load(), session);
    }

    #[test]
    fn test_load_malformed_is_empty() {
        let storage = Arc::new(MemorySlotStorage::new());
        storage.write("chat", "{not json").unwrap();
        let store = SessionStore::open(storage, "chat");
        assert!(store.load().is_empty());
        assert!(store.current().is_empty());
    }

    #[test]
    fn test_wrong_shape_is_empty() {
        let storage = Arc::new(MemorySlotStorage::new());
        storage
            .write("chat", r#"[{"id":1,"sender":"robot","text":"x"}]"#)
            .unwrap();
        let store = SessionStore::open(storage, "chat");
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_broken_storage_never_fails_caller() {
        let store = SessionStore::open(Arc::new(BrokenStorage), "chat");
        assert!(store.load().is_empty());
        store.set_session(vec![user(1, "still here")]);
        assert_eq!(store.current(), vec![user(1, "still here")]);
    }

    #[test]
    fn test_update_session_persists() {
        let store = SessionStore::in_memory("chat");
        let updated = store.update_session(|mut s| {
            s.push(user(1, "hello"));
            s
        });
        assert_eq!(updated.len(), 1);
        assert_eq!(store.load(), updated);
        assert_eq!(store.current(), updated);
    }

    #[test]
    fn test_own_writes_are_not_external_changes() {
        let store = SessionStore::in_memory("chat");
        store.set_session(vec![user(1, "mine")]);
        assert!(!store.poll_external_change());
    }

    #[test]
    fn test_external_write_replaces_and_notifies() {
        let storage = Arc::new(MemorySlotStorage::new());
        let ours = SessionStore::open(storage.clone(), "chat");
        let theirs = SessionStore::open(storage, "chat");
        ours.set_session(vec![user(1, "ours")]);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        ours.subscribe(move |session| {
            assert_eq!(session, vec![user(5, "theirs")]);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        theirs.set_session(vec![user(5, "theirs")]);
        assert!(ours.poll_external_change());
        assert_eq!(ours.current(), vec![user(5, "theirs")]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!ours.poll_external_change());
    }

    #[test]
    fn test_external_removal_hydrates_empty() {
        let storage = Arc::new(MemorySlotStorage::new());
        let store = SessionStore::open(storage.clone(), "chat");
        store.set_session(vec![user(1, "x")]);
        storage.remove("chat").unwrap();
        assert!(store.poll_external_change());
        assert!(store.current().is_empty());
    }

    #[test]
    fn test_load_does_not_swallow_external_change() {
        let storage = Arc::new(MemorySlotStorage::new());
        let ours = SessionStore::open(storage.clone(), "chat");
        storage
            .write("chat", r#"[{"id":5,"sender":"user","text":"elsewhere"}]"#)
            .unwrap();

        assert_eq!(ours.load(), vec![user(5, "elsewhere")]);
        assert!(ours.current().is_empty());
        assert!(ours.poll_external_change());
        assert_eq!(ours.current(), vec![user(5, "elsewhere")]);
    }

    #[test]
    fn test_hydrating_max_id_keeps_ids_growing() {
        let storage = Arc::new(MemorySlotStorage::new());
        storage
            .write(
                "chat",
                &format!(
                    r#"[{{"id":1,"sender":"user","text":"a"}},{{"id":{},"sender":"ai","text":"b"}}]"#,
                    i64::MAX
                ),
            )
            .unwrap();
        let store = SessionStore::open(storage, "chat");
        let session = store.update_session(|mut s| {
            let next = Message::new(&s, Sender::User, "c");
            s.push(next);
            s
        });
        let texts: Vec<&str> = session.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["a", "b", "c"]);
        assert!(session.windows(2).all(|w| w[1].id > w[0].id));
    }

    #[test]
    fn test_concurrent_file_writers_in_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileSlotStorage::new(dir.path()));
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let storage = storage.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        storage.write("chat", &format!("[{}]", i * 100 + j)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        let raw = storage.read("chat").unwrap().unwrap();
        assert!(serde_json::from_str::<Vec<i64>>(&raw).is_ok());
    }

    #[test]
    fn test_unsubscribe() {
        let storage = Arc::new(MemorySlotStorage::new());
        let store = SessionStore::open(storage.clone(), "chat");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        storage.write("chat", "[]").unwrap();
        assert!(store.poll_external_change());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_file_keys() {
        let storage = FileSlotStorage::new("/tmp/unused");
        assert!(matches!(storage.slot_path("../etc"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(storage.slot_path(""), Err(StoreError::InvalidKey(_))));
        assert!(storage.slot_path("mindfulChatMessages").is_ok());
    }
}
