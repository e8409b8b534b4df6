//! Background health sweep.

use std::sync::Arc;

use keyward_core::{Environment, HealthManager};
use tracing::{debug, info};

use crate::cancellation::Cancellation;

/// Sweep `health` every `sweep_interval` until `cancel` fires.
///
/// Intended to be spawned once per client:
///
/// ```ignore
/// tokio::spawn(run_sweeper(env.clone(), Arc::clone(&health), cancel.clone()));
/// ```
pub async fn run_sweeper<E: Environment>(
    env: E,
    health: Arc<HealthManager<E::Instant>>,
    cancel: Cancellation,
) {
    let interval = health.config().sweep_interval;
    debug!(?interval, "health sweeper started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = env.sleep(interval) => {},
        }

        let changes = health.sweep(env.now());
        for (connect_id, status) in &changes {
            info!(connect_id, ?status, "sweep changed connection status");
        }

        // Simulated sleeps complete without suspending
        tokio::task::yield_now().await;
    }

    debug!("health sweeper stopped");
}
