//! Conflict resolution between the local session and foreign pulses
//!
//! The resolver is a pure decision function: it looks at the local tab's
//! view, the incoming message, and a *fresh* read of durable storage, and
//! names the transition to perform. It never trusts the message payload
//! over the store: two tabs can write conflicting state within the same
//! millisecond, and the store read at reconciliation time is the only
//! arbiter. Durable sessions always win over ephemeral ones: "remember me"
//! is the user's explicit long-lived intent and must not be evicted by a
//! transient per-tab session.

use crate::{
    bus::{CoordinationMessage, SyncAction},
    claims::Claims,
    store::PersistenceTier,
    Subject,
};

/// The local tab's authentication view at the moment a pulse arrives
#[derive(Clone, Debug)]
pub struct LocalView {
    /// Whether the tab currently considers itself signed in
    pub authenticated: bool,
    /// The tier the local session lives in, when signed in
    pub tier: Option<PersistenceTier>,
    /// The locally signed-in subject, when signed in
    pub subject: Option<Subject>,
}

/// What a fresh read of the durable tier showed
#[derive(Clone, Debug, Default)]
pub struct StoreView {
    /// Claims decoded from the durable pair, when one is present and
    /// readable and not yet expired
    pub durable: Option<Claims>,
}

/// The transition the local tab must perform
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing to do
    Ignore,
    /// Adopt the durable session the store now shows
    AdoptDurable,
    /// Tear down the local session
    ClearLocal {
        /// Remove only the tab-private artifacts, leaving the durable tier
        /// for its rightful owner
        ephemeral_only: bool,
        /// Send the user back to the login screen
        redirect: bool,
    },
    /// Re-read the store and re-arm the refresh timer, no UI disruption
    Rearm,
}

/// Decides how the local tab must react to a foreign pulse
pub fn resolve(local: &LocalView, message: &CoordinationMessage, store: &StoreView) -> Resolution {
    match message.action {
        SyncAction::Login => resolve_login(local, store),
        SyncAction::Logout => resolve_logout(local),
        SyncAction::TokenRefresh => resolve_refresh(local, store),
    }
}

fn resolve_login(local: &LocalView, store: &StoreView) -> Resolution {
    match (local.authenticated, local.tier) {
        // an anonymous tab adopts a durable session; if the remote login
        // was ephemeral-tier it is tab-private and none of our business
        (false, _) => {
            if store.durable.is_some() {
                Resolution::AdoptDurable
            } else {
                Resolution::Ignore
            }
        }
        // a newer durable login supersedes our tab-private session
        (true, Some(PersistenceTier::Ephemeral)) => {
            if store.durable.is_some() {
                Resolution::ClearLocal {
                    ephemeral_only: true,
                    redirect: true,
                }
            } else {
                Resolution::Ignore
            }
        }
        // two durable logins racing: last write wins through the store
        (true, Some(PersistenceTier::Durable)) => match &store.durable {
            Some(claims) if Some(claims.subject()) != local.subject.as_ref() => {
                Resolution::AdoptDurable
            }
            // same subject re-logged-in elsewhere; pick up their tokens
            Some(_) => Resolution::Rearm,
            // pulse outran the write, or the session is already being torn
            // down; a later pulse or the next read will reconcile
            None => Resolution::Ignore,
        },
        (true, None) => Resolution::Ignore,
    }
}

fn resolve_logout(local: &LocalView) -> Resolution {
    match (local.authenticated, local.tier) {
        (true, Some(PersistenceTier::Durable)) => Resolution::ClearLocal {
            ephemeral_only: false,
            redirect: false,
        },
        // a tab-private session does not depend on the durable one that
        // just ended
        _ => Resolution::Ignore,
    }
}

fn resolve_refresh(local: &LocalView, store: &StoreView) -> Resolution {
    match (local.authenticated, local.tier) {
        (true, Some(PersistenceTier::Durable)) => {
            if store.durable.is_some() {
                Resolution::Rearm
            } else {
                Resolution::Ignore
            }
        }
        // a refresh implies a durable session we somehow missed the login
        // pulse for; reconcile from the store
        (false, _) => {
            if store.durable.is_some() {
                Resolution::AdoptDurable
            } else {
                Resolution::Ignore
            }
        }
        _ => Resolution::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims;
    use crate::storage::TabId;
    use serde_json::json;
    use tessera_clock::UnixMillis;

    fn claims_for(subject: &str) -> Claims {
        let token = claims::forge_token(&json!({
            "sub": subject,
            "exp": 4_000_000_000u64,
            "role": "patient",
        }));
        claims::decode(&token).unwrap()
    }

    fn message(action: SyncAction) -> CoordinationMessage {
        CoordinationMessage {
            action,
            emitted_at: UnixMillis(1),
            tab: TabId::next(),
            payload: None,
        }
    }

    fn anonymous() -> LocalView {
        LocalView {
            authenticated: false,
            tier: None,
            subject: None,
        }
    }

    fn signed_in(tier: PersistenceTier, subject: &str) -> LocalView {
        LocalView {
            authenticated: true,
            tier: Some(tier),
            subject: Some(Subject::from(subject.to_owned())),
        }
    }

    fn durable_present(subject: &str) -> StoreView {
        StoreView {
            durable: Some(claims_for(subject)),
        }
    }

    #[test]
    fn anonymous_tab_adopts_a_durable_login() {
        let resolution = resolve(
            &anonymous(),
            &message(SyncAction::Login),
            &durable_present("patient-1"),
        );
        assert_eq!(resolution, Resolution::AdoptDurable);
    }

    #[test]
    fn anonymous_tab_ignores_an_ephemeral_login() {
        // the remote session left nothing durable behind: tab-private
        let resolution = resolve(&anonymous(), &message(SyncAction::Login), &StoreView::default());
        assert_eq!(resolution, Resolution::Ignore);
    }

    #[test]
    fn ephemeral_session_yields_to_a_durable_login() {
        let resolution = resolve(
            &signed_in(PersistenceTier::Ephemeral, "patient-y"),
            &message(SyncAction::Login),
            &durable_present("patient-x"),
        );
        assert_eq!(
            resolution,
            Resolution::ClearLocal {
                ephemeral_only: true,
                redirect: true,
            }
        );
    }

    #[test]
    fn durable_session_clears_on_foreign_logout() {
        let resolution = resolve(
            &signed_in(PersistenceTier::Durable, "patient-1"),
            &message(SyncAction::Logout),
            &StoreView::default(),
        );
        assert_eq!(
            resolution,
            Resolution::ClearLocal {
                ephemeral_only: false,
                redirect: false,
            }
        );
    }

    #[test]
    fn ephemeral_session_survives_a_foreign_logout() {
        let resolution = resolve(
            &signed_in(PersistenceTier::Ephemeral, "patient-1"),
            &message(SyncAction::Logout),
            &StoreView::default(),
        );
        assert_eq!(resolution, Resolution::Ignore);
    }

    #[test]
    fn token_refresh_rearms_a_durable_session() {
        let resolution = resolve(
            &signed_in(PersistenceTier::Durable, "patient-1"),
            &message(SyncAction::TokenRefresh),
            &durable_present("patient-1"),
        );
        assert_eq!(resolution, Resolution::Rearm);
    }

    #[test]
    fn token_refresh_lets_an_anonymous_tab_catch_up() {
        let resolution = resolve(
            &anonymous(),
            &message(SyncAction::TokenRefresh),
            &durable_present("patient-1"),
        );
        assert_eq!(resolution, Resolution::AdoptDurable);
    }

    #[test]
    fn racing_durable_logins_resolve_to_the_stored_subject() {
        let local = signed_in(PersistenceTier::Durable, "doctor-a");

        // the store now shows someone else: adopt them
        let resolution = resolve(&local, &message(SyncAction::Login), &durable_present("doctor-b"));
        assert_eq!(resolution, Resolution::AdoptDurable);

        // the store still shows us: just pick up the rewritten tokens
        let resolution = resolve(&local, &message(SyncAction::Login), &durable_present("doctor-a"));
        assert_eq!(resolution, Resolution::Rearm);
    }

    #[test]
    fn a_pulse_with_no_backing_store_is_ignored() {
        let local = signed_in(PersistenceTier::Durable, "doctor-a");
        let resolution = resolve(&local, &message(SyncAction::Login), &StoreView::default());
        assert_eq!(resolution, Resolution::Ignore);
    }
}
