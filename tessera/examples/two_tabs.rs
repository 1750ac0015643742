//! Two "tabs" sharing one origin's storage.
//!
//! Tab A signs in durably; tab B starts anonymous, adopts the session off
//! the coordination pulse, and follows along through the proactive refresh
//! and the final logout.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use clap::Parser;
use tessera::authority::dto::LoginGrant;
use tessera::authority::StaticAuthority;
use tessera::claims::Role;
use tessera::storage::MemoryStorage;
use tessera::{AccessToken, Password, RefreshToken, Session, SessionConfig, Subject, TokenPair};
use tessera_clock::DurationMillis;

#[derive(Debug, Parser)]
struct Opts {
    /// Lifetime of each issued access token, in seconds
    #[arg(short, long, env, default_value_t = 8)]
    token_lifetime: u64,

    /// How long to run before tab A signs out, in seconds
    #[arg(short, long, env, default_value_t = 20)]
    run_for: u64,
}

fn unverified_token(subject: &str, role: &str, lifetime: Duration) -> AccessToken {
    let expires = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("times before Unix epoch are not expected")
        .as_secs()
        + lifetime.as_secs();
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({"sub": subject, "exp": expires, "role": role}).to_string(),
    );
    AccessToken::from(format!("{header}.{payload}.demo"))
}

fn demo_authority(lifetime: Duration, refresh_serial: u32) -> StaticAuthority {
    let authority = StaticAuthority::new(LoginGrant {
        access_token: unverified_token("doctor-demo", "doctor", lifetime),
        refresh_token: RefreshToken::from(format!("refresh-{refresh_serial}")),
        subject: Subject::from_static("doctor-demo"),
        role: Role::Doctor,
        roles: vec![Role::Doctor],
        display_name: Some("Dr. Demo".into()),
    });
    for serial in 0..32 {
        authority.push_refresh(Ok(TokenPair {
            access_token: unverified_token("doctor-demo", "doctor", lifetime),
            refresh_token: RefreshToken::from(format!("refresh-{refresh_serial}-{serial}")),
        }));
    }
    authority
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let lifetime = Duration::from_secs(opts.token_lifetime);

    let origin: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
    let config = SessionConfig {
        // renew a few seconds early so the demo shows a refresh or two
        lead_time: DurationMillis(3_000),
        heartbeat_interval: Duration::from_secs(2),
        ..SessionConfig::default()
    };

    let tab_a = Session::start(
        config.clone(),
        demo_authority(lifetime, 1),
        origin.clone(),
    )
    .await?;
    let tab_b = Session::start(config, demo_authority(lifetime, 2), origin).await?;

    let mut tab_b_states = tab_b.subscribe();
    tokio::spawn(async move {
        while tab_b_states.changed().await.is_ok() {
            let state = tab_b_states.borrow_and_update().clone();
            tracing::info!(
                signed_in = state.is_authenticated(),
                subject = state.claims().map(|c| c.subject().as_str().to_owned()),
                "tab B auth state changed"
            );
        }
    });

    tracing::info!("tab A signing in with remember-me");
    tab_a
        .login("demo@example.com", Password::from_static("demo"), true)
        .await?;

    let mut status = tokio::time::interval(Duration::from_secs(2));
    let logout_at = tokio::time::Instant::now() + Duration::from_secs(opts.run_for);
    loop {
        status.tick().await;
        if tokio::time::Instant::now() >= logout_at {
            break;
        }
        tracing::info!(
            tab_a = tab_a.is_authenticated(),
            tab_b = tab_b.is_authenticated(),
            token = ?tab_a.access_token().await,
            "status"
        );
    }

    tracing::info!("tab A signing out");
    tab_a.logout().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!(
        tab_a = tab_a.is_authenticated(),
        tab_b = tab_b.is_authenticated(),
        "final state"
    );

    Ok(())
}
