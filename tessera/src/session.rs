//! The session facade
//!
//! Composes the store, scheduler, bus and resolver into the one surface the
//! rest of the application talks to. Each tab owns exactly one `Session`;
//! the handle is cheap to clone and all clones speak for the same tab.
//!
//! The facade owns three background concerns, all spawned tasks holding
//! only weak references back to the session:
//!
//! - the *driver*, which sleeps until the scheduler's armed deadline and
//!   performs the refresh round-trip;
//! - the *listener*, which feeds foreign coordination pulses through the
//!   conflict resolver;
//! - the *heartbeat*, which refreshes the durable liveness marker while a
//!   session is active.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tessera_clock::{Clock, DurationMillis, System, UnixMillis};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::{
    authority::{dto::LoginRequest, AuthorityFailure, TokenAuthority},
    backoff::{BackoffConfig, RetryBackoff},
    bus::{CoordinationMessage, CrossTabBus, SyncAction, SyncPayload},
    claims::{self, Claims, ClaimsError},
    resolver::{self, LocalView, Resolution, StoreView},
    scheduler::RefreshScheduler,
    storage::{SharedStorage, StorageError, TabId},
    store::{PersistenceTier, TokenPair, TokenStore, UserData},
    AccessToken, Password,
};

/// How often a sleeping driver re-checks the wall clock
///
/// Timers do not advance while the host is suspended; re-checking in
/// bounded chunks keeps the wake-from-suspend lag to half this interval on
/// average.
const WAKE_CHECK: DurationMillis = DurationMillis(30_000);

/// Tunables for a tab's session machinery
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Safety margin before expiry at which renewal is attempted
    pub lead_time: DurationMillis,
    /// How often the liveness marker is refreshed while signed in
    pub heartbeat_interval: Duration,
    /// How long a coordination pulse stays in storage before retirement
    pub pulse_ttl: Duration,
    /// Retry pacing for transient refresh failures
    pub backoff: BackoffConfig,
}

impl Default for SessionConfig {
    /// Default configuration
    ///
    /// A two-minute refresh lead, a thirty-second heartbeat, and a 50 ms
    /// pulse lifetime.
    fn default() -> Self {
        Self {
            lead_time: DurationMillis(120_000),
            heartbeat_interval: Duration::from_secs(30),
            pulse_ttl: Duration::from_millis(50),
            backoff: BackoffConfig::default(),
        }
    }
}

/// A tab's authentication state
///
/// There is no "authenticated without claims": if the access token is gone
/// or unreadable, the tab is anonymous.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Nobody is signed in on this tab
    Anonymous,
    /// A session is active
    Authenticated {
        /// Claims decoded from the current access token
        claims: Claims,
        /// The tier the session lives in
        tier: PersistenceTier,
    },
}

impl SessionState {
    /// Whether a session is active
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// The active session's claims, if any
    pub fn claims(&self) -> Option<&Claims> {
        match self {
            Self::Authenticated { claims, .. } => Some(claims),
            Self::Anonymous => None,
        }
    }

    /// The active session's tier, if any
    pub fn tier(&self) -> Option<PersistenceTier> {
        match self {
            Self::Authenticated { tier, .. } => Some(*tier),
            Self::Anonymous => None,
        }
    }
}

/// A user-facing event the UI must react to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionNotice {
    /// The session could not be renewed; show "session expired, please
    /// sign in again" and navigate to login
    SessionExpired,
    /// A durable login in another tab superseded this tab's private
    /// session; navigate to login
    SupersededByLogin,
}

/// An error completing a login
#[derive(Debug, Error)]
pub enum LoginError<E: std::error::Error + 'static> {
    /// The authority rejected the credentials
    #[error("the authority rejected the credentials")]
    Rejected(#[source] E),
    /// The authority could not be reached
    #[error("the authority could not be reached")]
    Unavailable(#[source] E),
    /// The authority issued a token this client cannot read
    #[error("the authority issued an unreadable token")]
    MalformedGrant(#[from] ClaimsError),
    /// The session could not be persisted
    #[error("the session could not be persisted")]
    Storage(#[from] StorageError),
}

/// The per-tab session manager
///
/// Created with [`Session::start`], which reconciles against whatever the
/// store already holds: a live session is resumed, an expired one gets
/// exactly one silent refresh attempt, and otherwise the tab comes up
/// anonymous.
pub struct Session<A, C = System> {
    inner: Arc<Inner<A, C>>,
}

impl<A, C> Clone for Session<A, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, C> std::fmt::Debug for Session<A, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tab", &self.inner.tab)
            .finish_non_exhaustive()
    }
}

struct Inner<A, C> {
    config: SessionConfig,
    authority: A,
    store: TokenStore<C>,
    bus: CrossTabBus<C>,
    scheduler: Mutex<RefreshScheduler<C>>,
    backoff: Mutex<RetryBackoff>,
    driver: Mutex<Option<JoinHandle<()>>>,
    housekeeping: Mutex<Vec<JoinHandle<()>>>,
    state: watch::Sender<SessionState>,
    notices: broadcast::Sender<SessionNotice>,
    clock: C,
    tab: TabId,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<A> Session<A, System>
where
    A: TokenAuthority + 'static,
{
    /// Starts a session manager for this tab over the origin's durable
    /// storage
    ///
    /// # Errors
    ///
    /// Returns an error if the startup reconciliation cannot read the
    /// store.
    pub async fn start(
        config: SessionConfig,
        authority: A,
        durable: Arc<dyn SharedStorage>,
    ) -> Result<Self, StorageError> {
        Self::start_with_clock(config, authority, durable, System).await
    }
}

impl<A, C> Session<A, C>
where
    A: TokenAuthority + 'static,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Starts a session manager using the provided clock
    ///
    /// # Errors
    ///
    /// Returns an error if the startup reconciliation cannot read the
    /// store.
    pub async fn start_with_clock(
        config: SessionConfig,
        authority: A,
        durable: Arc<dyn SharedStorage>,
        clock: C,
    ) -> Result<Self, StorageError> {
        let tab = TabId::next();
        let store = TokenStore::with_clock(Arc::clone(&durable), tab, clock.clone());
        let bus = CrossTabBus::with_clock(durable, tab, config.pulse_ttl, clock.clone());
        let (state, _) = watch::channel(SessionState::Anonymous);
        let (notices, _) = broadcast::channel(8);

        let inner = Arc::new(Inner {
            scheduler: Mutex::new(RefreshScheduler::with_clock(config.lead_time, clock.clone())),
            backoff: Mutex::new(RetryBackoff::new(config.backoff)),
            driver: Mutex::new(None),
            housekeeping: Mutex::new(Vec::new()),
            config,
            authority,
            store,
            bus,
            state,
            notices,
            clock,
            tab,
        });

        inner.reconcile_startup().await?;

        let mut subscription = inner.bus.subscribe();
        let weak = Arc::downgrade(&inner);
        let listener = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_message(message).await;
            }
        });

        let weak = Arc::downgrade(&inner);
        let heartbeat_interval = inner.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.state.borrow().is_authenticated() {
                    if let Err(error) = inner.store.touch().await {
                        tracing::warn!(
                            error = (&error as &dyn std::error::Error),
                            "failed to refresh liveness marker"
                        );
                    }
                }
            }
        });

        relock(&inner.housekeeping).extend([listener, heartbeat]);

        Ok(Self { inner })
    }

    /// Exchanges credentials for a session
    ///
    /// `remember_me` picks the persistence tier once, for the life of the
    /// session. On success the session is persisted, the refresh timer is
    /// armed, and a `login` pulse is emitted for the other tabs.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority rejects the credentials, cannot
    /// be reached, or the session cannot be persisted. The tab is left
    /// signed out in every error case.
    pub async fn login(
        &self,
        email: impl Into<String>,
        password: Password,
        remember_me: bool,
    ) -> Result<(), LoginError<A::Error>> {
        let request = LoginRequest {
            email: email.into(),
            password,
        };
        let grant = self.inner.authority.login(&request).await.map_err(|error| {
            if error.is_rejection() {
                LoginError::Rejected(error)
            } else {
                LoginError::Unavailable(error)
            }
        })?;

        let pair = TokenPair {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
        };
        let claims = claims::decode(&pair.access_token)?;
        let tier = if remember_me {
            PersistenceTier::Durable
        } else {
            PersistenceTier::Ephemeral
        };

        // tear down whatever session this tab previously had
        self.inner.retire_driver();
        relock(&self.inner.scheduler).cancel();
        relock(&self.inner.backoff).reset();

        let user = UserData {
            subject: grant.subject.clone(),
            display_name: grant
                .display_name
                .unwrap_or_else(|| grant.subject.as_str().to_owned()),
        };
        self.inner.store.persist(&pair, &user, tier).await?;
        self.inner.install_session(claims, tier);

        let payload = SyncPayload {
            subject: grant.subject,
            role: grant.role,
            roles: grant.roles,
        };
        if let Err(error) = self
            .inner
            .bus
            .broadcast(SyncAction::Login, Some(payload))
            .await
        {
            // delivery is best-effort by protocol; peers reconcile from
            // the store
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "failed to emit login pulse"
            );
        }

        tracing::info!(?tier, "login complete");
        Ok(())
    }

    /// Signs the tab out
    ///
    /// Always, in order: cancel the refresh timer, clear the store, emit
    /// the `logout` pulse, flip the local state. The local tab is fully
    /// signed out even if the pulse is never delivered anywhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be fully cleared; the local
    /// state is flipped to anonymous regardless.
    pub async fn logout(&self) -> Result<(), StorageError> {
        self.inner.retire_driver();
        relock(&self.inner.scheduler).cancel();

        let cleared = self.inner.store.clear().await;

        if let Err(error) = self.inner.bus.broadcast(SyncAction::Logout, None).await {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "failed to emit logout pulse"
            );
        }

        self.inner.state.send_replace(SessionState::Anonymous);
        tracing::info!("logout complete");
        cleared
    }

    /// Whether a session is currently active on this tab
    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    /// The active session's claims, if any
    pub fn current_claims(&self) -> Option<Claims> {
        self.inner.state.borrow().claims().cloned()
    }

    /// The current access token, for attaching to outgoing requests
    pub async fn access_token(&self) -> Option<AccessToken> {
        match self.inner.store.read().await {
            Ok(Some((pair, _))) => Some(pair.access_token),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "failed to read access token"
                );
                None
            }
        }
    }

    /// Subscribes to the authentication-state stream
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to user-facing session notices
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.inner.notices.subscribe()
    }

    /// Stops all background machinery for tab teardown
    ///
    /// Stored state is left untouched; a durable session remains available
    /// to other tabs and future startups.
    pub fn shutdown(&self) {
        self.inner.retire_driver();
        relock(&self.inner.scheduler).cancel();
        for handle in relock(&self.inner.housekeeping).drain(..) {
            handle.abort();
        }
    }
}

impl<A, C> Drop for Inner<A, C> {
    fn drop(&mut self) {
        if let Some(handle) = relock(&self.driver).take() {
            handle.abort();
        }
        for handle in relock(&self.housekeeping).drain(..) {
            handle.abort();
        }
    }
}

impl<A, C> Inner<A, C>
where
    A: TokenAuthority + 'static,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Applies whatever the store already holds at tab startup
    async fn reconcile_startup(self: &Arc<Self>) -> Result<(), StorageError> {
        let Some((pair, tier)) = self.store.read().await? else {
            tracing::trace!("no persisted session found at startup");
            return Ok(());
        };

        match claims::decode(&pair.access_token) {
            Ok(claims) if !claims.is_expired_by(&self.clock) => {
                tracing::debug!(subject = %claims.subject(), "resuming persisted session");
                self.install_session(claims, tier);
                Ok(())
            }
            _ => self.silent_startup_refresh(pair, tier).await,
        }
    }

    /// Exactly one silent refresh attempt for a persisted-but-expired
    /// session before the tab declares itself anonymous
    async fn silent_startup_refresh(
        self: &Arc<Self>,
        pair: TokenPair,
        tier: PersistenceTier,
    ) -> Result<(), StorageError> {
        tracing::debug!("persisted token expired, attempting silent refresh");
        match self.authority.refresh(&pair.refresh_token).await {
            Ok(grant) => {
                let renewed = TokenPair {
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token,
                };
                let Ok(claims) = claims::decode(&renewed.access_token) else {
                    tracing::error!("authority issued an unreadable token, staying signed out");
                    return Ok(());
                };
                let user = match self.store.user_data().await {
                    Ok(Some(user)) => user,
                    _ => UserData {
                        subject: claims.subject().clone(),
                        display_name: claims.subject().as_str().to_owned(),
                    },
                };
                self.store.persist(&renewed, &user, tier).await?;
                tracing::info!(subject = %claims.subject(), "silent refresh recovered the session");
                self.install_session(claims, tier);
                Ok(())
            }
            Err(error) if error.is_rejection() => {
                tracing::info!("stored refresh token rejected, discarding session");
                // only discard what we actually tried; a racing login may
                // already have written fresh credentials
                if let Some((current, _)) = self.store.read().await? {
                    if current.refresh_token == pair.refresh_token {
                        self.store.clear().await?;
                    }
                }
                Ok(())
            }
            Err(error) => {
                // transient: the stale pair stays put for a later tab or
                // action to retry
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "silent refresh failed, starting signed out"
                );
                Ok(())
            }
        }
    }

    /// Arms the scheduler, (re)spawns the driver, and publishes the state
    fn install_session(self: &Arc<Self>, claims: Claims, tier: PersistenceTier) {
        relock(&self.scheduler).arm(claims.expires_at());
        self.spawn_driver();
        self.state
            .send_replace(SessionState::Authenticated { claims, tier });
    }

    /// Spawns the task that sleeps until the armed deadline and fires,
    /// replacing (and aborting) any previous driver
    fn spawn_driver(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let clock = self.clock.clone();

        let handle = tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(inner) = weak.upgrade() else { break };
                    let deadline = relock(&inner.scheduler).next_deadline();
                    deadline
                };
                let Some(deadline) = deadline else { break };

                wait_until(&clock, deadline).await;

                let Some(inner) = weak.upgrade() else { break };
                let fire = {
                    let mut scheduler = relock(&inner.scheduler);
                    match scheduler.next_deadline() {
                        // the deadline may have moved while we slept
                        Some(current) if clock.now() >= current => scheduler.begin_fire(),
                        Some(_) => false,
                        None => break,
                    }
                };
                if fire {
                    inner.fire_refresh().await;
                }
            }
            tracing::trace!("refresh driver exiting");
        });

        if let Some(previous) = relock(&self.driver).replace(handle) {
            previous.abort();
        }
    }

    fn retire_driver(&self) {
        if let Some(handle) = relock(&self.driver).take() {
            handle.abort();
        }
    }

    /// One refresh round-trip and its bookkeeping
    async fn fire_refresh(self: &Arc<Self>) {
        let (pair, tier) = match self.store.read().await {
            Ok(Some(current)) => current,
            Ok(None) => {
                // cleared while we slept: a logout whose pulse we missed
                tracing::debug!("no credentials at fire time, standing down");
                relock(&self.scheduler).finish_idle();
                if self.state.borrow().is_authenticated() {
                    self.state.send_replace(SessionState::Anonymous);
                }
                return;
            }
            Err(error) => {
                let delay = relock(&self.backoff).advance();
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    delay_ms = delay.as_millis() as u64,
                    "could not read credentials, will retry"
                );
                relock(&self.scheduler).finish_retry(delay.into());
                return;
            }
        };

        let used = pair.refresh_token.clone();
        tracing::debug!("requesting token refresh");

        match self.authority.refresh(&used).await {
            Ok(grant) => {
                // an in-flight refresh is never cancelled; instead its
                // result is discarded if the pair changed under it. The
                // comparison is against the token, not a signed-in flag,
                // so a newer legitimate refresh is never clobbered.
                let still_current = matches!(
                    self.store.read().await,
                    Ok(Some((current, _))) if current.refresh_token == used
                );
                if !still_current {
                    tracing::debug!("session changed during refresh, discarding result");
                    relock(&self.scheduler).finish_idle();
                    return;
                }

                let renewed = TokenPair {
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token,
                };
                let claims = match claims::decode(&renewed.access_token) {
                    Ok(claims) => claims,
                    Err(error) => {
                        tracing::error!(
                            error = (&error as &dyn std::error::Error),
                            "authority issued an unreadable token, ending session"
                        );
                        self.expire_session().await;
                        return;
                    }
                };

                let user = match self.store.user_data().await {
                    Ok(Some(user)) => user,
                    _ => UserData {
                        subject: claims.subject().clone(),
                        display_name: claims.subject().as_str().to_owned(),
                    },
                };
                if let Err(error) = self.store.persist(&renewed, &user, tier).await {
                    let delay = relock(&self.backoff).advance();
                    tracing::warn!(
                        error = (&error as &dyn std::error::Error),
                        delay_ms = delay.as_millis() as u64,
                        "could not persist renewed credentials, will retry"
                    );
                    relock(&self.scheduler).finish_retry(delay.into());
                    return;
                }

                relock(&self.backoff).reset();
                relock(&self.scheduler).finish_rearm(claims.expires_at());
                let payload = SyncPayload {
                    subject: claims.subject().clone(),
                    role: claims.role(),
                    roles: vec![claims.role()],
                };
                self.state.send_replace(SessionState::Authenticated {
                    claims,
                    tier,
                });
                if let Err(error) = self
                    .bus
                    .broadcast(SyncAction::TokenRefresh, Some(payload))
                    .await
                {
                    tracing::warn!(
                        error = (&error as &dyn std::error::Error),
                        "failed to emit token_refresh pulse"
                    );
                }
                tracing::info!("access token renewed");
            }
            Err(error) if error.is_rejection() => {
                tracing::info!("refresh token rejected by authority, ending session");
                self.expire_session().await;
            }
            Err(error) => {
                let delay = relock(&self.backoff).advance();
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    delay_ms = delay.as_millis() as u64,
                    "transient refresh failure, will retry"
                );
                relock(&self.scheduler).finish_retry(delay.into());
            }
        }
    }

    /// The one unrecoverable path: the authority confirmed the credentials
    /// are dead
    async fn expire_session(self: &Arc<Self>) {
        relock(&self.scheduler).cancel();
        if let Err(error) = self.store.clear().await {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "could not fully clear the session store"
            );
        }
        if let Err(error) = self.bus.broadcast(SyncAction::Logout, None).await {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "failed to emit logout pulse"
            );
        }
        self.state.send_replace(SessionState::Anonymous);
        let _ = self.notices.send(SessionNotice::SessionExpired);
    }

    /// Feeds a foreign pulse through the resolver and applies the decision
    async fn handle_message(self: &Arc<Self>, message: CoordinationMessage) {
        let local = {
            let state = self.state.borrow();
            LocalView {
                authenticated: state.is_authenticated(),
                tier: state.tier(),
                subject: state.claims().map(|claims| claims.subject().clone()),
            }
        };
        // the store is re-read on every pulse; the payload is only a hint
        let store_view = self.durable_view().await;
        let resolution = resolver::resolve(&local, &message, &store_view);
        tracing::debug!(action = ?message.action, ?resolution, "resolved coordination pulse");

        match resolution {
            Resolution::Ignore => {}
            Resolution::AdoptDurable | Resolution::Rearm => {
                let Some(claims) = store_view.durable else { return };
                relock(&self.backoff).reset();
                self.install_session(claims, PersistenceTier::Durable);
            }
            Resolution::ClearLocal {
                ephemeral_only,
                redirect,
            } => {
                self.retire_driver();
                relock(&self.scheduler).cancel();
                if ephemeral_only {
                    self.store.clear_ephemeral();
                } else if let Err(error) = self.store.clear().await {
                    tracing::warn!(
                        error = (&error as &dyn std::error::Error),
                        "could not fully clear the session store"
                    );
                }
                self.state.send_replace(SessionState::Anonymous);
                if redirect {
                    let _ = self.notices.send(SessionNotice::SupersededByLogin);
                }
            }
        }
    }

    /// A fresh, decoded view of the durable tier
    async fn durable_view(&self) -> StoreView {
        let durable = match self.store.read_tier(PersistenceTier::Durable).await {
            Ok(Some(pair)) => claims::decode(&pair.access_token)
                .ok()
                .filter(|claims| !claims.is_expired_by(&self.clock)),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "could not read the durable tier"
                );
                None
            }
        };
        StoreView { durable }
    }
}

async fn wait_until<C: Clock>(clock: &C, deadline: UnixMillis) {
    loop {
        let now = clock.now();
        if now >= deadline {
            break;
        }
        let chunk = (deadline - now).min(WAKE_CHECK);
        tokio::time::sleep(chunk.into()).await;
    }
}
