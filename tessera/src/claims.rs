//! Unverified decoding of access-token claims
//!
//! The client never verifies token signatures; that is the server's job.
//! Claims are read purely to drive UX and timing decisions (who appears to
//! be signed in, when to renew), never to grant a capability. Anything that
//! fails to decode is treated as expired, so a mangled token can only ever
//! make the client *less* authenticated.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tessera_clock::{Clock, DurationMillis, UnixMillis};
use thiserror::Error;

use crate::{AccessTokenRef, Subject};

/// The role a token was issued for
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A patient booking and reviewing their own appointments
    Patient,
    /// A doctor managing their agenda
    Doctor,
    /// A front-desk operator acting on behalf of patients
    Operator,
    /// An administrator of the practice
    Administrator,
}

/// The decoded, unverified payload of an access token
///
/// Re-derived from the current access token on demand and never persisted on
/// its own; if there is no token, there are no claims.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claims {
    subject: Subject,
    expires_at: UnixMillis,
    role: Role,
    extra_flags: BTreeMap<String, bool>,
}

impl Claims {
    /// The subject the token was issued to
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// The instant the token expires
    pub fn expires_at(&self) -> UnixMillis {
        self.expires_at
    }

    /// The role the token was issued for
    pub fn role(&self) -> Role {
        self.role
    }

    /// Custom boolean flags carried alongside the registered claims
    pub fn extra_flags(&self) -> &BTreeMap<String, bool> {
        &self.extra_flags
    }

    /// Whether the token had expired as of `clock`'s current time
    pub fn is_expired_by<C: Clock>(&self, clock: &C) -> bool {
        clock.now() >= self.expires_at
    }
}

/// An error while decoding an access token's claims
#[derive(Debug, Error)]
pub enum ClaimsError {
    /// The token is not a three-part JWT
    #[error("token is not a three-part JWT")]
    MalformedStructure,
    /// The payload section is not valid base64url
    #[error("token payload is not valid base64url")]
    MalformedEncoding(#[from] base64::DecodeError),
    /// The payload section is not a valid claims document
    #[error("token payload is not a valid claims document")]
    MalformedPayload(#[from] serde_json::Error),
    /// The payload names no role this client understands
    #[error("token payload carries no usable role")]
    MissingRole,
}

#[derive(Deserialize)]
struct RawClaims {
    sub: Subject,
    /// Registered `exp` claim, in seconds since the epoch
    exp: u64,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    roles: Vec<Role>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Decodes the claims of an access token without verifying its signature
///
/// # Errors
///
/// Returns an error if the token is structurally malformed or its payload
/// cannot be understood.
pub fn decode(token: &AccessTokenRef) -> Result<Claims, ClaimsError> {
    let mut parts = token.as_str().split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_header), Some(payload), Some(_signature), None) => payload,
        _ => return Err(ClaimsError::MalformedStructure),
    };

    let raw = URL_SAFE_NO_PAD.decode(payload)?;
    let claims: RawClaims = serde_json::from_slice(&raw)?;

    let role = claims
        .role
        .or_else(|| claims.roles.first().copied())
        .ok_or(ClaimsError::MissingRole)?;

    let extra_flags = claims
        .extra
        .into_iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::Bool(flag) => Some((name, flag)),
            _ => None,
        })
        .collect();

    Ok(Claims {
        subject: claims.sub,
        expires_at: UnixMillis(claims.exp.saturating_mul(1_000)),
        role,
        extra_flags,
    })
}

/// Whether the token is expired as of `clock`'s current time
///
/// A token that cannot be decoded is reported as expired: an unreadable
/// credential must never look valid.
pub fn is_expired<C: Clock>(token: &AccessTokenRef, clock: &C) -> bool {
    match decode(token) {
        Ok(claims) => claims.is_expired_by(clock),
        Err(_) => true,
    }
}

/// How long until the token expires, or `None` if it cannot be decoded
///
/// An already-expired token reports a zero remainder rather than `None`, so
/// callers can distinguish "expired" from "unreadable".
pub fn expires_in<C: Clock>(token: &AccessTokenRef, clock: &C) -> Option<DurationMillis> {
    decode(token)
        .ok()
        .map(|claims| claims.expires_at().saturating_since(clock.now()))
}

#[cfg(test)]
pub(crate) fn forge_token(payload: &serde_json::Value) -> crate::AccessToken {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    crate::AccessToken::from(format!("{header}.{body}.unverified"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_clock::TestClock;

    fn sample() -> crate::AccessToken {
        forge_token(&json!({
            "sub": "doctor-77",
            "exp": 1_700_000_000u64,
            "role": "doctor",
            "onboarding_complete": true,
            "locum": false,
            "clinic": "riverside",
        }))
    }

    #[test]
    fn decodes_subject_role_and_expiry() {
        let claims = decode(&sample()).unwrap();
        assert_eq!(claims.subject().as_str(), "doctor-77");
        assert_eq!(claims.role(), Role::Doctor);
        assert_eq!(claims.expires_at(), UnixMillis(1_700_000_000_000));
    }

    #[test]
    fn collects_only_boolean_extras() {
        let claims = decode(&sample()).unwrap();
        assert_eq!(claims.extra_flags().get("onboarding_complete"), Some(&true));
        assert_eq!(claims.extra_flags().get("locum"), Some(&false));
        assert!(!claims.extra_flags().contains_key("clinic"));
    }

    #[test]
    fn role_falls_back_to_first_of_roles() {
        let token = forge_token(&json!({
            "sub": "op-1",
            "exp": 1_700_000_000u64,
            "roles": ["operator", "patient"],
        }));
        assert_eq!(decode(&token).unwrap().role(), Role::Operator);
    }

    #[test]
    fn missing_role_is_an_error() {
        let token = forge_token(&json!({"sub": "x", "exp": 1_700_000_000u64}));
        assert!(matches!(decode(&token), Err(ClaimsError::MissingRole)));
    }

    #[test]
    fn expiry_is_checked_against_the_clock() {
        let token = sample();
        let before = TestClock::new(UnixMillis(1_699_999_999_999));
        let at = TestClock::new(UnixMillis(1_700_000_000_000));

        assert!(!is_expired(&token, &before));
        assert!(is_expired(&token, &at));
        assert_eq!(expires_in(&token, &before), Some(DurationMillis(1)));
        assert_eq!(expires_in(&token, &at), Some(DurationMillis::ZERO));
    }

    #[test]
    fn malformed_tokens_fail_closed() {
        let clock = TestClock::new(UnixMillis(0));
        let garbage = [
            "not-a-jwt",
            "one.two",
            "one.two.three.four",
            "aGVhZGVy.!!!.c2ln",
            // valid base64, payload is not JSON
            "aGVhZGVy.aGVhZGVy.c2ln",
        ];

        for raw in garbage {
            let token = crate::AccessToken::from_static(raw);
            assert!(decode(&token).is_err(), "decoded {raw:?}");
            assert!(is_expired(&token, &clock), "{raw:?} looked valid");
            assert_eq!(expires_in(&token, &clock), None);
        }
    }
}
