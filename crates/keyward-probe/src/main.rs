//! Keyward probe binary.
//!
//! Runs a client and an endpoint session in one process, connected by a
//! transport that loses requests, and drives traffic through the full stack:
//! sealed bootstrap, X3DH, ratcheted messages, retries, circuit breaking,
//! health tracking and a simulated client restart from the saved snapshot.
//!
//! # Usage
//!
//! ```bash
//! # 40 requests over a link losing 30% of requests
//! keyward-probe --messages 40 --loss-rate 0.3
//!
//! # Watch every retry and ratchet
//! RUST_LOG=debug keyward-probe
//! ```

mod bootstrap;
mod lossy;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use keyward_client::{
    BreakerConfig, Cancellation, LoopbackTransport, ResilienceEngine, RetryConfig, SecureChannel,
    SessionLookup, SessionRegistry, SystemEnv, TransportError, TransportErrorKind, run_sweeper,
};
use keyward_core::{
    EncryptedEnvelope, Environment, EventPublisher, HealthConfig, HealthManager,
    MemorySnapshotStore, PersistenceBridge, PersistenceConfig, SessionConfig,
};
use keyward_crypto::{DhKeyPair, IdentityKeys, PreKeyBundle, SealedBoxDecryptor, SignedPreKey};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::lossy::LossyTransport;

/// Connection used for the probe session.
const CONNECT_ID: u32 = 1;

/// Client user id in the snapshot store.
const CLIENT_USER: u64 = 1;

/// Endpoint user id in its snapshot store.
const ENDPOINT_USER: u64 = 2;

type Registry = SessionRegistry<SystemEnv, MemorySnapshotStore>;

/// Keyward session stack probe
#[derive(Parser, Debug)]
#[command(name = "keyward-probe")]
#[command(about = "Exercise the Keyward session stack over a lossy loopback link")]
#[command(version)]
struct Args {
    /// Requests to send
    #[arg(short, long, default_value = "24")]
    messages: u32,

    /// Fraction of requests lost in transit (0.0 to 1.0)
    #[arg(long, default_value = "0.2")]
    loss_rate: f64,

    /// Messages between initiator ratchet rotations (0 disables)
    #[arg(long, default_value = "8")]
    rotation_interval: u32,

    /// Messages between best-effort snapshot saves
    #[arg(long, default_value = "1")]
    save_every: u32,

    /// Circuit breaker cool-down in milliseconds
    #[arg(long, default_value = "500")]
    cool_down_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    if !(0.0..=1.0).contains(&args.loss_rate) {
        return Err(format!("--loss-rate must be in [0.0, 1.0], got {}", args.loss_rate).into());
    }

    tracing::info!("Keyward probe starting");

    let env = SystemEnv::new();
    let session_config =
        SessionConfig { rotation_interval: args.rotation_interval, ..SessionConfig::default() };
    let persistence = PersistenceConfig { save_every_n_messages: args.save_every };
    let client_store = MemorySnapshotStore::new();

    let mut client: Arc<Registry> = Arc::new(SessionRegistry::new(
        env.clone(),
        session_config,
        PersistenceBridge::new(client_store.clone(), CLIENT_USER, persistence),
    ));
    let endpoint: Arc<Registry> = Arc::new(SessionRegistry::new(
        env.clone(),
        session_config,
        PersistenceBridge::new(MemorySnapshotStore::new(), ENDPOINT_USER, persistence),
    ));

    handshake(&env, &client, &endpoint)?;

    let health = Arc::new(HealthManager::new(HealthConfig::default(), EventPublisher::default()));
    let cancel = Cancellation::new();
    let monitor = tokio::spawn(log_events(Arc::clone(&health), cancel.clone()));
    let sweeper = tokio::spawn(run_sweeper(env.clone(), Arc::clone(&health), cancel.clone()));

    let retry = RetryConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(400),
        attempt_timeout: Duration::from_secs(2),
        breaker: BreakerConfig {
            cool_down: Duration::from_millis(args.cool_down_ms),
            ..BreakerConfig::default()
        },
        ..RetryConfig::default()
    };
    let engine = Arc::new(ResilienceEngine::new(env.clone(), retry, Arc::clone(&health)));
    let transport = Arc::new(LossyTransport::new(
        echo_endpoint(Arc::clone(&endpoint)),
        env.clone(),
        args.loss_rate,
    ));

    let restart_at = args.messages / 2;
    let mut channel = SecureChannel::new(
        CONNECT_ID,
        Arc::clone(&client),
        Arc::clone(&transport),
        Arc::clone(&engine),
    );
    let mut delivered = 0u32;
    let mut failed = 0u32;

    for i in 0..args.messages {
        if i == restart_at && i > 0 {
            tracing::info!("Simulating client restart from saved snapshot");
            client = Arc::new(SessionRegistry::new(
                env.clone(),
                session_config,
                PersistenceBridge::new(client_store.clone(), CLIENT_USER, persistence),
            ));
            client.restore(CONNECT_ID)?;
            channel = SecureChannel::new(
                CONNECT_ID,
                Arc::clone(&client),
                Arc::clone(&transport),
                Arc::clone(&engine),
            );
        }

        let request = format!("ping {i}");
        match channel.request(request.as_bytes(), &cancel).await {
            Ok(reply) => {
                delivered += 1;
                tracing::info!(i, reply = %String::from_utf8_lossy(&reply), "reply received");
            },
            Err(error) => {
                failed += 1;
                tracing::warn!(i, %error, "request failed");
            },
        }
    }

    let status = health.status(CONNECT_ID);
    let diagnostics = client.bridge().diagnostics();
    tracing::info!(
        delivered,
        failed,
        lost_in_transit = transport.dropped(),
        ?status,
        snapshot_saves = diagnostics.saves,
        "Probe finished"
    );

    cancel.cancel();
    sweeper.await?;
    monitor.await?;
    Ok(())
}

/// Establish the probe session, sending the initial message sealed to the
/// endpoint's bootstrap key.
fn handshake(
    env: &SystemEnv,
    client: &Registry,
    endpoint: &Registry,
) -> Result<(), Box<dyn std::error::Error>> {
    let client_identity = IdentityKeys::generate(&mut env.rng());
    let endpoint_identity = IdentityKeys::generate(&mut env.rng());
    let signed = SignedPreKey::generate(&endpoint_identity, 1, &mut env.rng());
    let bundle = PreKeyBundle::new(&endpoint_identity, &signed, None);
    let bootstrap_keys = SealedBoxDecryptor::new(DhKeyPair::generate(&mut env.rng()));

    let message = client.initiate(CONNECT_ID, &client_identity, Some(&bundle), None)?;
    let sealed = bootstrap::seal(&bootstrap_keys.encryptor(), &message, &mut env.rng())?;
    tracing::info!(
        bytes = sealed.len(),
        chunks = bootstrap::chunk_count(&bootstrap_keys, &sealed),
        "Initial message sealed"
    );

    let opened = bootstrap::open(&bootstrap_keys, &sealed)?;
    endpoint.accept(CONNECT_ID, &endpoint_identity, &signed, None, &opened, None)?;
    tracing::info!("Session established");
    Ok(())
}

/// Endpoint answering each request by echoing its plaintext.
fn echo_endpoint(endpoint: Arc<Registry>) -> LoopbackTransport {
    LoopbackTransport::new(move |connect_id, request| {
        endpoint
            .with_session(connect_id, |session| {
                let envelope = EncryptedEnvelope::from_bytes(&request)?;
                let mut reply = b"pong: ".to_vec();
                reply.extend(session.decrypt(&envelope)?);
                session.encrypt(&reply)?.to_bytes()
            })
            .map_err(|e| TransportError::classified(TransportErrorKind::Internal, e.to_string()))
    })
}

/// Log connectivity events until cancelled.
async fn log_events(health: Arc<HealthManager<Instant>>, cancel: Cancellation) {
    let mut events = health.subscribe();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => tracing::info!(?event, "connectivity event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "connectivity events dropped");
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
