//! Tiered persistence of the credential pair
//!
//! The store is the single source of truth any tab consults at startup and
//! whenever a coordination message demands reconciliation. It owns the
//! `access_token`, `refresh_token` and `user_data` keys in both tiers, plus
//! the durable liveness timestamp. No other component knows which tier a
//! session lives in.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_clock::{Clock, System, UnixMillis};

use crate::{
    storage::{keys, EphemeralStorage, SharedStorage, StorageError, TabId},
    AccessToken, RefreshToken, Subject,
};

/// Where a session's credentials live
///
/// Chosen once at login from the "remember me" flag and fixed for the life
/// of the session. Both halves of the pair always live in the same tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistenceTier {
    /// Survives restarts and is shared by all tabs of the origin
    Durable,
    /// Private to this tab and gone when it closes
    Ephemeral,
}

/// The credential pair issued by the authority
///
/// Replaced wholesale on every renewal, never mutated in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// The short-lived access token
    pub access_token: AccessToken,
    /// The long-lived refresh token
    pub refresh_token: RefreshToken,
}

/// The profile snippet stored alongside the pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    /// The signed-in subject
    pub subject: Subject,
    /// The name shown in the application chrome
    pub display_name: String,
}

/// Tiered storage for the credential pair and its companions
pub struct TokenStore<C = System> {
    durable: Arc<dyn SharedStorage>,
    ephemeral: EphemeralStorage,
    tab: TabId,
    clock: C,
}

impl<C> std::fmt::Debug for TokenStore<C>
where
    C: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("tab", &self.tab)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl TokenStore<System> {
    /// Constructs a store over the origin's durable storage area
    pub fn new(durable: Arc<dyn SharedStorage>, tab: TabId) -> Self {
        Self::with_clock(durable, tab, System)
    }
}

impl<C: Clock> TokenStore<C> {
    /// Constructs a store using the given clock for liveness timestamps
    pub fn with_clock(durable: Arc<dyn SharedStorage>, tab: TabId, clock: C) -> Self {
        Self {
            durable,
            ephemeral: EphemeralStorage::new(),
            tab,
            clock,
        }
    }

    /// Persists a freshly issued pair into `tier`
    ///
    /// Any prior pair is fully cleared first, in both tiers, so toggling
    /// "remember me" can never strand half a session in the other tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable backend fails; the ephemeral tier
    /// cannot fail.
    pub async fn persist(
        &self,
        pair: &TokenPair,
        user: &UserData,
        tier: PersistenceTier,
    ) -> Result<(), StorageError> {
        self.clear().await?;

        match tier {
            PersistenceTier::Durable => {
                self.set_durable(keys::ACCESS_TOKEN, pair.access_token.as_str().to_owned())
                    .await?;
                self.set_durable(keys::REFRESH_TOKEN, pair.refresh_token.as_str().to_owned())
                    .await?;
                self.set_durable(keys::USER_DATA, serde_json::to_string(user)?)
                    .await?;
            }
            PersistenceTier::Ephemeral => {
                self.ephemeral
                    .set(keys::ACCESS_TOKEN, pair.access_token.as_str().to_owned());
                self.ephemeral
                    .set(keys::REFRESH_TOKEN, pair.refresh_token.as_str().to_owned());
                self.ephemeral
                    .set(keys::USER_DATA, serde_json::to_string(user)?);
            }
        }

        self.touch().await
    }

    /// Reads the pair from the given tier only
    ///
    /// A half-present pair is reported as absent; a session missing either
    /// half is unusable and must not look signed-in.
    pub async fn read_tier(
        &self,
        tier: PersistenceTier,
    ) -> Result<Option<TokenPair>, StorageError> {
        let (access, refresh) = match tier {
            PersistenceTier::Durable => (
                self.durable.get(keys::ACCESS_TOKEN).await?,
                self.durable.get(keys::REFRESH_TOKEN).await?,
            ),
            PersistenceTier::Ephemeral => (
                self.ephemeral.get(keys::ACCESS_TOKEN),
                self.ephemeral.get(keys::REFRESH_TOKEN),
            ),
        };

        match (access, refresh) {
            (Some(access), Some(refresh)) => Ok(Some(TokenPair {
                access_token: AccessToken::from(access),
                refresh_token: RefreshToken::from(refresh),
            })),
            _ => Ok(None),
        }
    }

    /// Reads whichever pair is present, durable tier first
    ///
    /// Durable-first lets a tab discover a session created by another tab
    /// while still honoring a tab-private session when no durable one
    /// exists.
    pub async fn read(&self) -> Result<Option<(TokenPair, PersistenceTier)>, StorageError> {
        if let Some(pair) = self.read_tier(PersistenceTier::Durable).await? {
            return Ok(Some((pair, PersistenceTier::Durable)));
        }
        if let Some(pair) = self.read_tier(PersistenceTier::Ephemeral).await? {
            return Ok(Some((pair, PersistenceTier::Ephemeral)));
        }
        Ok(None)
    }

    /// The tier currently holding a pair, if any
    pub async fn current_tier(&self) -> Result<Option<PersistenceTier>, StorageError> {
        Ok(self.read().await?.map(|(_, tier)| tier))
    }

    /// Reads the stored profile snippet from whichever tier holds it
    pub async fn user_data(&self) -> Result<Option<UserData>, StorageError> {
        let raw = match self.durable.get(keys::USER_DATA).await? {
            Some(raw) => Some(raw),
            None => self.ephemeral.get(keys::USER_DATA),
        };
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Removes every key this subsystem owns, in both tiers
    ///
    /// Partial clears are a correctness bug: a half-cleared session still
    /// decodes locally while the server rejects it. The liveness timestamp
    /// goes too.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.clear_ephemeral();
        for key in [keys::ACCESS_TOKEN, keys::REFRESH_TOKEN, keys::USER_DATA] {
            self.durable.remove(self.tab, key).await?;
        }
        self.durable.remove(self.tab, keys::SESSION_TIMESTAMP).await
    }

    /// Removes only the tab-private artifacts, leaving the durable tier
    /// untouched
    ///
    /// Used when a durable session from another tab supersedes this tab's
    /// ephemeral one; the newer durable credentials must survive.
    pub fn clear_ephemeral(&self) {
        for key in [keys::ACCESS_TOKEN, keys::REFRESH_TOKEN, keys::USER_DATA] {
            self.ephemeral.remove(key);
        }
    }

    /// Refreshes the durable last-alive marker
    pub async fn touch(&self) -> Result<(), StorageError> {
        self.set_durable(keys::SESSION_TIMESTAMP, self.clock.now().0.to_string())
            .await
    }

    /// Reads the last-alive marker, if a parseable one exists
    ///
    /// A liveness hint only; it says nothing about token validity.
    pub async fn last_alive(&self) -> Result<Option<UnixMillis>, StorageError> {
        Ok(self
            .durable
            .get(keys::SESSION_TIMESTAMP)
            .await?
            .and_then(|raw| raw.parse().ok())
            .map(UnixMillis))
    }

    async fn set_durable(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.durable.set(self.tab, key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn pair(n: u32) -> TokenPair {
        TokenPair {
            access_token: AccessToken::from(format!("access-{n}")),
            refresh_token: RefreshToken::from(format!("refresh-{n}")),
        }
    }

    fn user() -> UserData {
        UserData {
            subject: Subject::from_static("patient-9"),
            display_name: "Pat Doe".into(),
        }
    }

    fn store() -> TokenStore {
        TokenStore::new(Arc::new(MemoryStorage::new()), TabId::next())
    }

    #[tokio::test]
    async fn persist_then_read_returns_the_same_pair() {
        let store = store();

        store
            .persist(&pair(1), &user(), PersistenceTier::Durable)
            .await
            .unwrap();

        let (read, tier) = store.read().await.unwrap().unwrap();
        assert_eq!(read, pair(1));
        assert_eq!(tier, PersistenceTier::Durable);
        assert_eq!(store.user_data().await.unwrap(), Some(user()));
        assert!(store.last_alive().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_leaves_no_residue_in_either_tier() {
        let store = store();
        store
            .persist(&pair(1), &user(), PersistenceTier::Ephemeral)
            .await
            .unwrap();

        store.clear().await.unwrap();

        assert!(store.read().await.unwrap().is_none());
        assert!(store.user_data().await.unwrap().is_none());
        assert!(store.last_alive().await.unwrap().is_none());
        assert!(store
            .read_tier(PersistenceTier::Durable)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .read_tier(PersistenceTier::Ephemeral)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn tier_switch_never_strands_the_old_pair() {
        let store = store();

        store
            .persist(&pair(1), &user(), PersistenceTier::Durable)
            .await
            .unwrap();
        store
            .persist(&pair(2), &user(), PersistenceTier::Ephemeral)
            .await
            .unwrap();

        assert!(store
            .read_tier(PersistenceTier::Durable)
            .await
            .unwrap()
            .is_none());
        let (read, tier) = store.read().await.unwrap().unwrap();
        assert_eq!(read, pair(2));
        assert_eq!(tier, PersistenceTier::Ephemeral);
    }

    #[tokio::test]
    async fn durable_tier_shadows_ephemeral_on_read() {
        let durable_area: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        let ours = TokenStore::new(durable_area.clone(), TabId::next());
        let theirs = TokenStore::new(durable_area, TabId::next());

        // our tab-private session
        ours.persist(&pair(1), &user(), PersistenceTier::Ephemeral)
            .await
            .unwrap();
        // another tab signs in durably afterwards
        theirs
            .persist(&pair(2), &user(), PersistenceTier::Durable)
            .await
            .unwrap();

        let (read, tier) = ours.read().await.unwrap().unwrap();
        assert_eq!(read, pair(2));
        assert_eq!(tier, PersistenceTier::Durable);
    }

    #[tokio::test]
    async fn a_half_present_pair_reads_as_absent() {
        let area: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        let tab = TabId::next();
        let store = TokenStore::new(area.clone(), tab);

        area.set(tab, keys::ACCESS_TOKEN, "lonely".into())
            .await
            .unwrap();

        assert!(store.read().await.unwrap().is_none());
        assert!(store.current_tier().await.unwrap().is_none());
    }
}
