//! Session and credential lifecycle management for multi-tab clients
//!
//! Each tab of a same-origin client runs its own cooperative session
//! manager, yet all tabs must agree about who is signed in. The only thing
//! they share is a durable storage area with no locks and no ordering
//! guarantees, so agreement is reached the way eventually-consistent
//! systems reach it: short-lived coordination pulses announce that
//! *something* changed, and every consumer reconciles against a fresh read
//! of the store rather than trusting the message.
//!
//! The pieces, composed by [`Session`]:
//!
//! * [`store::TokenStore`]: tiered persistence of the credential pair;
//!   durable ("remember me") or ephemeral (tab-private), never both.
//! * [`claims`]: unverified decoding of access-token claims, purely to
//!   drive UX and timing; signatures are the server's problem.
//! * [`scheduler::RefreshScheduler`]: one armed deadline per tab that
//!   renews the access token before it expires.
//! * [`bus::CrossTabBus`]: write-then-retire pulses over the shared
//!   storage channel, delivered zero-or-more times to the other tabs.
//! * [`resolver`]: the policy table deciding whether the local session
//!   yields, adopts, or ignores when a pulse arrives. Durable beats
//!   ephemeral, and the store beats the message.
//! * [`authority`]: the consumed login/refresh HTTP interface, with the
//!   one split that matters: *rejected* (hard logout) versus *transient*
//!   (retry, never sign out).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera::storage::MemoryStorage;
//! use tessera::{Password, Session, SessionConfig};
//!
//! # async fn run(authority: tessera::authority::StaticAuthority) -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(MemoryStorage::new());
//! let session = Session::start(SessionConfig::default(), authority, storage).await?;
//!
//! session
//!     .login("pat@example.com", Password::from_static("secret"), true)
//!     .await?;
//!
//! let mut states = session.subscribe();
//! while states.changed().await.is_ok() {
//!     let signed_in = states.borrow().is_authenticated();
//!     tracing::info!(signed_in, "auth state changed");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `http`: the [`authority::HttpAuthority`] implementation over
//!   [reqwest].
//! * `file`: the [`storage::FileStorage`] durable backend for independent
//!   processes sharing a directory.
//!
//! Both are enabled by default.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod authority;
pub mod backoff;
mod braids;
pub mod bus;
pub mod claims;
pub mod resolver;
pub mod scheduler;
mod session;
pub mod storage;
pub mod store;

pub use braids::*;
pub use session::{LoginError, Session, SessionConfig, SessionNotice, SessionState};
pub use store::{PersistenceTier, TokenPair};
