//! The consumed login/refresh interface
//!
//! The authentication server is an external collaborator; this module
//! defines the seam the session manager speaks through and one HTTP
//! implementation of it. The one distinction that matters to the rest of
//! the subsystem is *rejected* versus *transient*: a 401/403 means the
//! credential itself is dead (hard logout), anything else is transport
//! trouble that must never end a session.

use async_trait::async_trait;

use crate::RefreshTokenRef;

pub mod dto;

/// Classification every authority error must answer
pub trait AuthorityFailure: std::error::Error + Send + Sync + 'static {
    /// Whether the authority positively rejected the credentials, as
    /// opposed to being unreachable or broken
    fn is_rejection(&self) -> bool;
}

/// An authority that can issue and renew credential pairs
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    /// The error type returned when a round-trip fails
    type Error: AuthorityFailure;

    /// Exchanges login credentials for a first credential pair
    async fn login(&self, request: &dto::LoginRequest) -> Result<dto::LoginGrant, Self::Error>;

    /// Exchanges a refresh token for a renewed credential pair
    async fn refresh(&self, refresh_token: &RefreshTokenRef)
        -> Result<dto::TokenGrant, Self::Error>;
}

#[cfg(feature = "http")]
pub use http::{HttpAuthority, HttpAuthorityError};

#[cfg(feature = "http")]
mod http {
    use async_trait::async_trait;
    use thiserror::Error;

    use super::{dto, AuthorityFailure, TokenAuthority};
    use crate::RefreshTokenRef;

    /// An error during a round-trip to the authority
    #[derive(Debug, Error)]
    pub enum HttpAuthorityError {
        /// The authority positively rejected the credentials
        #[error("authority rejected the credentials ({status}): {body}")]
        Rejected {
            /// The HTTP status returned
            status: u16,
            /// The body of the rejection
            body: String,
        },
        /// The authority answered with a non-auth failure status
        #[error("authority returned an error ({status}): {body}")]
        Server {
            /// The HTTP status returned
            status: u16,
            /// The body of the error
            body: String,
        },
        /// Unable to send the request at all (includes timeouts)
        #[error("error sending request to authority")]
        RequestSend(#[source] reqwest::Error),
        /// Unable to read the response
        #[error("error reading response body from authority")]
        BodyRead(#[source] reqwest::Error),
        /// Unable to deserialize the response
        #[error("error deserializing authority response")]
        Deserialize(#[from] serde_json::Error),
    }

    impl AuthorityFailure for HttpAuthorityError {
        fn is_rejection(&self) -> bool {
            matches!(self, Self::Rejected { .. })
        }
    }

    /// The production authority, speaking JSON over HTTP
    #[derive(Clone, Debug)]
    pub struct HttpAuthority {
        client: reqwest::Client,
        login_url: reqwest::Url,
        refresh_url: reqwest::Url,
    }

    impl HttpAuthority {
        /// Constructs an authority from its two endpoint URLs
        ///
        /// Request timeouts are whatever the provided client is configured
        /// with; a timeout classifies as transient, like any other
        /// transport failure.
        pub fn new(
            client: reqwest::Client,
            login_url: reqwest::Url,
            refresh_url: reqwest::Url,
        ) -> Self {
            Self {
                client,
                login_url,
                refresh_url,
            }
        }

        #[tracing::instrument(err, skip(self, url, body), fields(url = %url))]
        async fn post_json<B, T>(
            &self,
            url: &reqwest::Url,
            body: &B,
        ) -> Result<T, HttpAuthorityError>
        where
            B: serde::Serialize + Sync,
            T: serde::de::DeserializeOwned,
        {
            let response = self
                .client
                .post(url.clone())
                .json(body)
                .send()
                .await
                .map_err(HttpAuthorityError::RequestSend)?;

            let status = response.status();
            tracing::debug!(
                response.status = status.as_u16(),
                "received response from authority"
            );

            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                let body = response.text().await.unwrap_or_default();
                return Err(HttpAuthorityError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(HttpAuthorityError::Server {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(HttpAuthorityError::BodyRead)?;
            Ok(serde_json::from_slice(&bytes)?)
        }
    }

    #[async_trait]
    impl TokenAuthority for HttpAuthority {
        type Error = HttpAuthorityError;

        async fn login(
            &self,
            request: &dto::LoginRequest,
        ) -> Result<dto::LoginGrant, Self::Error> {
            tracing::trace!("requesting login from authority");
            self.post_json(&self.login_url, request).await
        }

        async fn refresh(
            &self,
            refresh_token: &RefreshTokenRef,
        ) -> Result<dto::TokenGrant, Self::Error> {
            tracing::trace!("requesting token refresh from authority");
            self.post_json(&self.refresh_url, &dto::RefreshRequest { refresh_token })
                .await
        }
    }
}

pub use testing::{StaticAuthority, StaticAuthorityError};

mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use thiserror::Error;

    use super::{dto, AuthorityFailure, TokenAuthority};
    use crate::{RefreshTokenRef, TokenPair};

    /// An error scripted into a [`StaticAuthority`]
    #[derive(Clone, Copy, Debug, Error)]
    pub enum StaticAuthorityError {
        /// Behaves like a 401/403 from the real authority
        #[error("static authority rejected the request")]
        Rejected,
        /// Behaves like a timeout or connection failure
        #[error("static authority is unavailable")]
        Unavailable,
    }

    impl AuthorityFailure for StaticAuthorityError {
        fn is_rejection(&self) -> bool {
            matches!(self, Self::Rejected)
        }
    }

    /// An authority that answers from pre-configured grants
    ///
    /// Useful for demos and tests: logins always succeed with the
    /// configured grant, and refresh outcomes can be scripted in order.
    /// When the script runs dry, refreshes echo the pair from the original
    /// grant.
    #[derive(Debug)]
    pub struct StaticAuthority {
        grant: dto::LoginGrant,
        refresh_script: Mutex<VecDeque<Result<dto::TokenGrant, StaticAuthorityError>>>,
    }

    impl StaticAuthority {
        /// Constructs an authority that always issues `grant`
        pub fn new(grant: dto::LoginGrant) -> Self {
            Self {
                grant,
                refresh_script: Mutex::new(VecDeque::new()),
            }
        }

        /// Queues the outcome of the next unscripted refresh call
        pub fn push_refresh(&self, outcome: Result<TokenPair, StaticAuthorityError>) {
            self.refresh_script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push_back(outcome.map(|pair| dto::TokenGrant {
                    access_token: pair.access_token,
                    refresh_token: pair.refresh_token,
                }));
        }
    }

    #[async_trait]
    impl TokenAuthority for StaticAuthority {
        type Error = StaticAuthorityError;

        async fn login(
            &self,
            _request: &dto::LoginRequest,
        ) -> Result<dto::LoginGrant, Self::Error> {
            Ok(self.grant.clone())
        }

        async fn refresh(
            &self,
            _refresh_token: &RefreshTokenRef,
        ) -> Result<dto::TokenGrant, Self::Error> {
            let scripted = self
                .refresh_script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            match scripted {
                Some(outcome) => outcome,
                None => Ok(dto::TokenGrant {
                    access_token: self.grant.access_token.clone(),
                    refresh_token: self.grant.refresh_token.clone(),
                }),
            }
        }
    }
}
