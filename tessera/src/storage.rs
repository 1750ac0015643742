//! The shared same-origin storage substrate
//!
//! Every tab of the same origin shares one durable storage area with no
//! locks, no transactions, and no ordering guarantees between writers. A
//! write is visible to other tabs both as state (via [`SharedStorage::get`])
//! and as a change notification (via [`SharedStorage::subscribe`]); the
//! coordination protocol rides on the notifications while treating the
//! stored state as the only truth.
//!
//! Two implementations are provided: [`MemoryStorage`] for tabs hosted in
//! one process (and for tests), and [`FileStorage`] for independent
//! processes sharing a directory on one machine.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Well-known keys owned by the session subsystem
pub mod keys {
    /// The current access token string
    pub const ACCESS_TOKEN: &str = "access_token";
    /// The current refresh token string
    pub const REFRESH_TOKEN: &str = "refresh_token";
    /// The signed-in user's profile snippet
    pub const USER_DATA: &str = "user_data";
    /// The transient cross-tab coordination pulse
    pub const SESSION_SYNC: &str = "session_sync";
    /// The last-alive liveness timestamp
    pub const SESSION_TIMESTAMP: &str = "session_timestamp";
}

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The identity of a single tab
///
/// Storage change events carry the writer's identity so that a tab can
/// ignore its own writes, mirroring the browser rule that storage events
/// only fire in *other* tabs of the origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(u64);

impl TabId {
    /// Allocates an identity that is unique across tabs and processes
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let serial = COUNTER.fetch_add(1, Ordering::Relaxed);
        TabId((u64::from(std::process::id()) << 32) | (serial & 0xFFFF_FFFF))
    }
}

/// A change observed in the shared storage area
#[derive(Clone, Debug)]
pub struct StorageEvent {
    /// The key that changed
    pub key: String,
    /// The new value, or `None` if the key was removed
    pub value: Option<String>,
    /// The tab that performed the write, when attributable
    ///
    /// Removals observed indirectly (for example by the file sweeper) carry
    /// no writer.
    pub writer: Option<TabId>,
}

/// An error interacting with a storage area
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing medium failed
    #[error("storage backend failed")]
    Io(#[from] std::io::Error),
    /// A stored value could not be encoded or decoded
    #[error("stored value could not be encoded or decoded")]
    Codec(#[from] serde_json::Error),
}

/// A storage area shared by every tab of the origin
///
/// Implementations are multi-writer with no read-then-write atomicity; any
/// value read may be stale the instant after reading.
#[async_trait]
pub trait SharedStorage: Send + Sync {
    /// Reads the current value under `key`
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes `value` under `key`, attributed to `writer`
    async fn set(&self, writer: TabId, key: &str, value: String) -> Result<(), StorageError>;

    /// Removes `key`, attributed to `writer`
    async fn remove(&self, writer: TabId, key: &str) -> Result<(), StorageError>;

    /// Subscribes to change notifications
    ///
    /// Delivery is best-effort: a subscriber that lags far enough behind
    /// loses events, so consumers must reconcile against stored state
    /// rather than relying on notifications alone.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// An in-process shared storage area
///
/// Models one origin's storage for any number of tab tasks hosted in the
/// same process. This is also the substrate the test suite runs on.
#[derive(Debug)]
pub struct MemoryStorage {
    values: std::sync::Mutex<std::collections::HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryStorage {
    /// Constructs an empty storage area
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            values: std::sync::Mutex::new(std::collections::HashMap::new()),
            events,
        }
    }

    fn publish(&self, event: StorageEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, writer: TabId, key: &str, value: String) -> Result<(), StorageError> {
        self.lock().insert(key.to_owned(), value.clone());
        self.publish(StorageEvent {
            key: key.to_owned(),
            value: Some(value),
            writer: Some(writer),
        });
        Ok(())
    }

    async fn remove(&self, writer: TabId, key: &str) -> Result<(), StorageError> {
        let removed = self.lock().remove(key);
        if removed.is_some() {
            self.publish(StorageEvent {
                key: key.to_owned(),
                value: None,
                writer: Some(writer),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

/// A per-tab storage area that dies with the tab
///
/// Never shared and never watched; the ephemeral persistence tier lives
/// here.
#[derive(Debug, Default)]
pub struct EphemeralStorage {
    values: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl EphemeralStorage {
    /// Constructs an empty area
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads the current value under `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Writes `value` under `key`
    pub fn set(&self, key: &str, value: String) {
        self.lock().insert(key.to_owned(), value);
    }

    /// Removes `key`
    pub fn remove(&self, key: &str) {
        self.lock().remove(key);
    }
}

#[cfg(feature = "file")]
pub use file::FileStorage;

#[cfg(feature = "file")]
mod file {
    use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

    use serde::{Deserialize, Serialize};
    use tokio::fs::OpenOptions;
    use tokio::sync::broadcast;

    use super::{SharedStorage, StorageError, StorageEvent, TabId, EVENT_CHANNEL_CAPACITY};

    #[derive(Serialize, Deserialize)]
    struct Envelope {
        writer: TabId,
        value: String,
    }

    /// A durable storage area backed by a directory of one file per key
    ///
    /// Independent processes sharing the directory observe each other's
    /// writes through a periodic sweep that diffs the directory contents and
    /// publishes change events. The sweep interval bounds how stale another
    /// process's view can be.
    #[derive(Debug)]
    pub struct FileStorage {
        dir: PathBuf,
        events: broadcast::Sender<StorageEvent>,
        // last contents observed per key, so the sweeper only reports diffs
        seen: tokio::sync::Mutex<HashMap<String, String>>,
    }

    impl FileStorage {
        /// Opens (creating if needed) the storage directory and starts the
        /// change sweeper
        ///
        /// # Errors
        ///
        /// Returns an error if the directory cannot be created or read.
        pub async fn open(
            dir: impl Into<PathBuf>,
            sweep_interval: Duration,
        ) -> Result<Arc<Self>, StorageError> {
            let dir = dir.into();
            tokio::fs::create_dir_all(&dir).await?;

            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            let storage = Arc::new(Self {
                dir,
                events,
                seen: tokio::sync::Mutex::new(HashMap::new()),
            });

            // prime the snapshot so pre-existing keys are not reported as
            // fresh writes
            storage.sweep(false).await?;

            let weak = Arc::downgrade(&storage);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(storage) = weak.upgrade() else { break };
                    if let Err(error) = storage.sweep(true).await {
                        tracing::warn!(
                            error = (&error as &dyn std::error::Error),
                            "storage sweep failed"
                        );
                    }
                }
                tracing::trace!("storage dropped, sweeper exiting");
            });

            Ok(storage)
        }

        fn path_for(&self, key: &str) -> PathBuf {
            self.dir.join(format!("{key}.json"))
        }

        async fn read_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
            match tokio::fs::read_to_string(self.path_for(key)).await {
                Ok(raw) => Ok(Some(raw)),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(error) => Err(error.into()),
            }
        }

        async fn write_raw(&self, key: &str, raw: &str) -> Result<(), StorageError> {
            use tokio::io::AsyncWriteExt;

            let mut file_opts = OpenOptions::new();
            file_opts.create(true).truncate(true).write(true);

            #[cfg(unix)]
            file_opts.mode(0o600);

            let mut file = file_opts.open(self.path_for(key)).await?;
            file.write_all(raw.as_bytes()).await?;
            Ok(())
        }

        /// Diffs the directory against the last observed snapshot,
        /// publishing one event per changed key when `emit` is set
        async fn sweep(&self, emit: bool) -> Result<(), StorageError> {
            let mut current = HashMap::new();
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(key) = name.strip_suffix(".json") else { continue };
                match tokio::fs::read_to_string(entry.path()).await {
                    Ok(raw) => {
                        current.insert(key.to_owned(), raw);
                    }
                    // deleted between listing and reading; the next sweep
                    // will report it
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                }
            }

            let mut seen = self.seen.lock().await;
            if emit {
                for (key, raw) in &current {
                    if seen.get(key) != Some(raw) {
                        let event = match serde_json::from_str::<Envelope>(raw) {
                            Ok(envelope) => StorageEvent {
                                key: key.clone(),
                                value: Some(envelope.value),
                                writer: Some(envelope.writer),
                            },
                            Err(error) => {
                                tracing::warn!(
                                    key = %key,
                                    error = (&error as &dyn std::error::Error),
                                    "ignoring unreadable storage entry"
                                );
                                continue;
                            }
                        };
                        let _ = self.events.send(event);
                    }
                }
                for key in seen.keys() {
                    if !current.contains_key(key) {
                        let _ = self.events.send(StorageEvent {
                            key: key.clone(),
                            value: None,
                            writer: None,
                        });
                    }
                }
            }
            *seen = current;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl SharedStorage for FileStorage {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            match self.read_raw(key).await? {
                Some(raw) => {
                    let envelope: Envelope = serde_json::from_str(&raw)?;
                    Ok(Some(envelope.value))
                }
                None => Ok(None),
            }
        }

        async fn set(&self, writer: TabId, key: &str, value: String) -> Result<(), StorageError> {
            let raw = serde_json::to_string(&Envelope {
                writer,
                value: value.clone(),
            })?;
            self.write_raw(key, &raw).await?;
            // record our own write so the sweeper does not re-report it
            self.seen.lock().await.insert(key.to_owned(), raw);
            let _ = self.events.send(StorageEvent {
                key: key.to_owned(),
                value: Some(value),
                writer: Some(writer),
            });
            Ok(())
        }

        async fn remove(&self, writer: TabId, key: &str) -> Result<(), StorageError> {
            match tokio::fs::remove_file(self.path_for(key)).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(error) => return Err(error.into()),
            }
            self.seen.lock().await.remove(key);
            let _ = self.events.send(StorageEvent {
                key: key.to_owned(),
                value: None,
                writer: Some(writer),
            });
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
            self.events.subscribe()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        let tab = TabId::next();

        storage
            .set(tab, keys::ACCESS_TOKEN, "abc".into())
            .await
            .unwrap();
        assert_eq!(
            storage.get(keys::ACCESS_TOKEN).await.unwrap(),
            Some("abc".into())
        );

        storage.remove(tab, keys::ACCESS_TOKEN).await.unwrap();
        assert_eq!(storage.get(keys::ACCESS_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn events_carry_the_writer() {
        let storage = MemoryStorage::new();
        let mut events = storage.subscribe();
        let tab = TabId::next();

        storage.set(tab, keys::SESSION_SYNC, "ping".into()).await.unwrap();
        storage.remove(tab, keys::SESSION_SYNC).await.unwrap();

        let write = events.recv().await.unwrap();
        assert_eq!(write.key, keys::SESSION_SYNC);
        assert_eq!(write.value.as_deref(), Some("ping"));
        assert_eq!(write.writer, Some(tab));

        let removal = events.recv().await.unwrap();
        assert_eq!(removal.value, None);
    }

    #[tokio::test]
    async fn removing_an_absent_key_is_silent() {
        let storage = MemoryStorage::new();
        let mut events = storage.subscribe();

        storage.remove(TabId::next(), "nothing").await.unwrap();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn tab_ids_are_unique_within_a_process() {
        let a = TabId::next();
        let b = TabId::next();
        assert_ne!(a, b);
    }

    #[cfg(feature = "file")]
    mod file {
        use super::super::*;
        use std::time::Duration;

        fn scratch_dir(name: &str) -> std::path::PathBuf {
            let dir = std::env::temp_dir().join(format!(
                "tessera-storage-{name}-{}",
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&dir);
            dir
        }

        #[tokio::test]
        async fn file_storage_round_trips() {
            let storage = FileStorage::open(scratch_dir("roundtrip"), Duration::from_millis(20))
                .await
                .unwrap();
            let tab = TabId::next();

            storage
                .set(tab, keys::REFRESH_TOKEN, "r-1".into())
                .await
                .unwrap();
            assert_eq!(
                storage.get(keys::REFRESH_TOKEN).await.unwrap(),
                Some("r-1".into())
            );

            storage.remove(tab, keys::REFRESH_TOKEN).await.unwrap();
            assert_eq!(storage.get(keys::REFRESH_TOKEN).await.unwrap(), None);
        }

        #[tokio::test]
        async fn sweeper_reports_foreign_writes() {
            let dir = scratch_dir("foreign");
            let ours = FileStorage::open(dir.clone(), Duration::from_millis(10))
                .await
                .unwrap();
            let theirs = FileStorage::open(dir, Duration::from_secs(3600))
                .await
                .unwrap();

            let mut events = ours.subscribe();
            let foreign_tab = TabId::next();
            theirs
                .set(foreign_tab, keys::SESSION_SYNC, "hello".into())
                .await
                .unwrap();

            let observed = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("sweeper never reported the foreign write")
                .unwrap();
            assert_eq!(observed.key, keys::SESSION_SYNC);
            assert_eq!(observed.value.as_deref(), Some("hello"));
            assert_eq!(observed.writer, Some(foreign_tab));
        }
    }
}
