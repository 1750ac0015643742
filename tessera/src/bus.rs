//! Cross-tab coordination over the shared storage channel
//!
//! A coordination message is a pulse, not a record: it is written under the
//! well-known `session_sync` key and deleted again a few tens of
//! milliseconds later, so the *write notification* is the signal. Authorship
//! is at-most-once per logical event, but delivery to any given tab is
//! zero-or-more: a sleeping tab, a tab opened mid-pulse, or a lagging
//! subscriber may never see it. Consumers therefore reconcile against the
//! durable state instead of trusting a message.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tessera_clock::{Clock, System, UnixMillis};
use tokio::sync::broadcast;

use crate::{
    claims::Role,
    storage::{keys, SharedStorage, StorageError, StorageEvent, TabId},
    Subject,
};

/// The kind of authentication event being announced
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// A tab completed a login
    Login,
    /// A tab logged the session out
    Logout,
    /// A tab renewed the access token
    TokenRefresh,
}

/// Identity details carried alongside a `login` pulse
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// The subject that signed in
    pub subject: Subject,
    /// Their primary role
    pub role: Role,
    /// Any further roles granted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Role>,
}

/// A short-lived cross-tab signal
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinationMessage {
    /// What happened
    pub action: SyncAction,
    /// When the author emitted it
    pub emitted_at: UnixMillis,
    /// Who authored it
    pub tab: TabId,
    /// Identity details, for `login` pulses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SyncPayload>,
}

/// Broadcasts and receives coordination pulses for one tab
pub struct CrossTabBus<C = System> {
    storage: Arc<dyn SharedStorage>,
    tab: TabId,
    pulse_ttl: Duration,
    clock: C,
}

impl<C> std::fmt::Debug for CrossTabBus<C>
where
    C: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CrossTabBus")
            .field("tab", &self.tab)
            .field("pulse_ttl", &self.pulse_ttl)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl CrossTabBus<System> {
    /// Constructs a bus for `tab` over the origin's shared storage
    pub fn new(storage: Arc<dyn SharedStorage>, tab: TabId, pulse_ttl: Duration) -> Self {
        Self::with_clock(storage, tab, pulse_ttl, System)
    }
}

impl<C: Clock> CrossTabBus<C> {
    /// Constructs a bus using the provided clock for pulse timestamps
    pub fn with_clock(
        storage: Arc<dyn SharedStorage>,
        tab: TabId,
        pulse_ttl: Duration,
        clock: C,
    ) -> Self {
        Self {
            storage,
            tab,
            pulse_ttl,
            clock,
        }
    }

    /// Announces an authentication event to the other tabs
    ///
    /// The pulse is deleted again after the configured TTL; failure to
    /// delete only leaves a stale value that no consumer reads as state.
    ///
    /// # Errors
    ///
    /// Returns an error if the pulse cannot be written at all.
    pub async fn broadcast(
        &self,
        action: SyncAction,
        payload: Option<SyncPayload>,
    ) -> Result<(), StorageError> {
        let message = CoordinationMessage {
            action,
            emitted_at: self.clock.now(),
            tab: self.tab,
            payload,
        };
        let raw = serde_json::to_string(&message)?;

        tracing::trace!(?action, "emitting coordination pulse");
        self.storage.set(self.tab, keys::SESSION_SYNC, raw).await?;

        let storage = Arc::clone(&self.storage);
        let tab = self.tab;
        let ttl = self.pulse_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Err(error) = storage.remove(tab, keys::SESSION_SYNC).await {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "failed to retire coordination pulse"
                );
            }
        });

        Ok(())
    }

    /// Subscribes to pulses authored by other tabs
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            events: self.storage.subscribe(),
            own_tab: self.tab,
        }
    }

    /// The identity of the tab this bus speaks for
    pub fn tab(&self) -> TabId {
        self.tab
    }
}

/// A stream of coordination messages from other tabs
#[derive(Debug)]
pub struct BusSubscription {
    events: broadcast::Receiver<StorageEvent>,
    own_tab: TabId,
}

impl BusSubscription {
    /// Waits for the next foreign coordination message
    ///
    /// Returns `None` once the storage area is gone. Lagged notifications
    /// are skipped with a warning; the protocol already assumes lossy
    /// delivery.
    pub async fn recv(&mut self) -> Option<CoordinationMessage> {
        use tokio::sync::broadcast::error::RecvError;

        loop {
            let event = match self.events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "coordination subscriber lagged; pulses lost");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };

            if event.key != keys::SESSION_SYNC {
                continue;
            }
            // the retirement of a pulse is not a signal
            let Some(raw) = event.value else { continue };
            if event.writer == Some(self.own_tab) {
                continue;
            }

            match serde_json::from_str::<CoordinationMessage>(&raw) {
                Ok(message) if message.tab == self.own_tab => continue,
                Ok(message) => return Some(message),
                Err(error) => {
                    tracing::warn!(
                        error = (&error as &dyn std::error::Error),
                        "ignoring unparseable coordination pulse"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn shared() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::new())
    }

    fn payload() -> SyncPayload {
        SyncPayload {
            subject: Subject::from_static("doctor-3"),
            role: Role::Doctor,
            roles: vec![Role::Doctor, Role::Operator],
        }
    }

    #[tokio::test]
    async fn pulses_reach_other_tabs_but_not_the_author() {
        let storage = shared();
        let author = CrossTabBus::new(storage.clone(), TabId::next(), Duration::from_millis(50));
        let observer = CrossTabBus::new(storage, TabId::next(), Duration::from_millis(50));

        let mut own = author.subscribe();
        let mut foreign = observer.subscribe();

        author
            .broadcast(SyncAction::Login, Some(payload()))
            .await
            .unwrap();

        let heard = tokio::time::timeout(Duration::from_secs(1), foreign.recv())
            .await
            .expect("observer never heard the pulse")
            .unwrap();
        assert_eq!(heard.action, SyncAction::Login);
        assert_eq!(heard.tab, author.tab());
        assert_eq!(heard.payload, Some(payload()));

        // the author's own subscription stays quiet
        let silence = tokio::time::timeout(Duration::from_millis(100), own.recv()).await;
        assert!(silence.is_err());
    }

    #[tokio::test]
    async fn pulses_are_retired_from_storage() {
        let storage = shared();
        let bus = CrossTabBus::new(storage.clone(), TabId::next(), Duration::from_millis(10));

        bus.broadcast(SyncAction::Logout, None).await.unwrap();
        assert!(storage.get(keys::SESSION_SYNC).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(storage.get(keys::SESSION_SYNC).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retirement_and_garbage_are_not_delivered() {
        let storage = shared();
        let us = CrossTabBus::new(storage.clone(), TabId::next(), Duration::from_millis(50));
        let mut sub = us.subscribe();

        let foreign_tab = TabId::next();
        storage
            .set(foreign_tab, keys::SESSION_SYNC, "not json".into())
            .await
            .unwrap();
        storage.remove(foreign_tab, keys::SESSION_SYNC).await.unwrap();

        // neither the garbage nor the removal surfaces as a message
        let silence = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(silence.is_err());
    }

    #[tokio::test]
    async fn unrelated_keys_are_ignored() {
        let storage = shared();
        let bus = CrossTabBus::new(storage.clone(), TabId::next(), Duration::from_millis(50));
        let mut sub = bus.subscribe();

        storage
            .set(TabId::next(), keys::SESSION_TIMESTAMP, "123".into())
            .await
            .unwrap();

        let silence = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(silence.is_err());
    }
}
