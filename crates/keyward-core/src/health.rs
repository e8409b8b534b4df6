//! Connection health tracking.
//!
//! One record per connection, updated after every completed operation. The
//! status is a pure function of the record's metrics (see
//! [`evaluate_status`]) unless an external override is set, or the
//! background sweep moved a quiet or failing connection to `Disconnected` or
//! `Reconnecting`.
//!
//! Time is passed in by the caller, so the manager works with both real and
//! virtual clocks.
//!
//! ```text
//!             success ──> rate' = α + (1 - α)·rate
//!             failure ──> rate' = (1 - α)·rate
//!
//! consecutive_failures >= max      ──> Failed
//! escalating category              ──> Failed
//! rate < minimum_success_rate      ──> Unhealthy
//! failures > 0 or rate < degraded  ──> Degraded
//! otherwise                        ──> Healthy
//! ```

#![allow(clippy::disallowed_types, reason = "Per-record locks are never held across await")]

use std::{
    collections::HashMap,
    ops::Sub,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    connectivity::{ConnectivityEvent, EventPublisher},
    failure::{CATEGORY_COUNT, FailureCategory},
};

/// EWMA smoothing factor for the success rate.
pub const SUCCESS_RATE_ALPHA: f64 = 0.1;

/// Consecutive failures that mark a connection failed.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Success rate below which a connection is unhealthy.
pub const DEFAULT_MINIMUM_SUCCESS_RATE: f64 = 0.5;

/// Success rate below which a connection is degraded.
pub const DEFAULT_DEGRADED_SUCCESS_RATE: f64 = 0.95;

/// Silence after which the sweep disconnects a connection.
pub const DEFAULT_MAX_UNHEALTHY_DURATION: Duration = Duration::from_secs(300);

/// Recovery attempts the sweep schedules before giving up.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Health status of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No completed operation yet
    Unknown,
    /// Operating normally
    Healthy,
    /// Recent failures, still mostly succeeding
    Degraded,
    /// Success rate below the minimum
    Unhealthy,
    /// Too many consecutive failures, or an escalating failure
    Failed,
    /// Recovery scheduled by the sweep
    Reconnecting,
    /// Silent beyond the maximum unhealthy duration
    Disconnected,
}

/// Kind of operation an outcome is reported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Session handshake
    Handshake,
    /// Request/response call
    Request,
    /// One-way send
    Send,
    /// Inbound message
    Receive,
    /// Keep-alive probe
    Heartbeat,
}

/// Health manager configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthConfig {
    /// Consecutive failures that mark a connection failed
    pub max_consecutive_failures: u32,
    /// Success rate below which a connection is unhealthy
    pub minimum_success_rate: f64,
    /// Success rate below which a connection is degraded
    pub degraded_success_rate: f64,
    /// Silence after which the sweep disconnects a connection
    pub max_unhealthy_duration: Duration,
    /// Whether the sweep schedules recovery for failing connections
    pub auto_recovery: bool,
    /// Recovery attempts scheduled before giving up
    pub max_recovery_attempts: u32,
    /// Interval between background sweeps
    pub sweep_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            minimum_success_rate: DEFAULT_MINIMUM_SUCCESS_RATE,
            degraded_success_rate: DEFAULT_DEGRADED_SUCCESS_RATE,
            max_unhealthy_duration: DEFAULT_MAX_UNHEALTHY_DURATION,
            auto_recovery: true,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Status for the given metrics.
pub fn evaluate_status(
    success_rate: f64,
    consecutive_failures: u32,
    escalated: bool,
    config: &HealthConfig,
) -> ConnectionStatus {
    if escalated || consecutive_failures >= config.max_consecutive_failures {
        ConnectionStatus::Failed
    } else if success_rate < config.minimum_success_rate {
        ConnectionStatus::Unhealthy
    } else if consecutive_failures > 0 || success_rate < config.degraded_success_rate {
        ConnectionStatus::Degraded
    } else {
        ConnectionStatus::Healthy
    }
}

/// Read model of one connection's health.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot<I> {
    /// Effective status (override applied)
    pub status: ConnectionStatus,
    /// Whether an external override is in force
    pub overridden: bool,
    /// EWMA success rate in [0, 1]
    pub success_rate: f64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Completed operations
    pub total_operations: u64,
    /// Failure counts, indexed by [`FailureCategory::index`]
    pub failure_counts: [u64; CATEGORY_COUNT],
    /// Time of the last completed operation
    pub last_activity: I,
    /// Time of the last completed operation per kind
    pub last_operation: HashMap<OperationKind, I>,
    /// Whether a recovery attempt is in progress
    pub recovering: bool,
    /// Recovery attempts since the last success
    pub recovery_attempts: u32,
}

impl<I> HealthSnapshot<I> {
    /// Failures recorded for `category`.
    pub fn failures(&self, category: FailureCategory) -> u64 {
        self.failure_counts[category.index()]
    }
}

struct HealthRecord<I> {
    status: ConnectionStatus,
    override_status: Option<ConnectionStatus>,
    success_rate: f64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_operations: u64,
    escalated: bool,
    failure_counts: [u64; CATEGORY_COUNT],
    last_activity: I,
    last_operation: HashMap<OperationKind, I>,
    recovering: bool,
    recovery_attempts: u32,
}

impl<I: Copy> HealthRecord<I> {
    fn new(now: I) -> Self {
        Self {
            status: ConnectionStatus::Unknown,
            override_status: None,
            success_rate: 1.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_operations: 0,
            escalated: false,
            failure_counts: [0; CATEGORY_COUNT],
            last_activity: now,
            last_operation: HashMap::new(),
            recovering: false,
            recovery_attempts: 0,
        }
    }

    fn effective(&self) -> ConnectionStatus {
        self.override_status.unwrap_or(self.status)
    }

    fn snapshot(&self) -> HealthSnapshot<I> {
        HealthSnapshot {
            status: self.effective(),
            overridden: self.override_status.is_some(),
            success_rate: self.success_rate,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_operations: self.total_operations,
            failure_counts: self.failure_counts,
            last_activity: self.last_activity,
            last_operation: self.last_operation.clone(),
            recovering: self.recovering,
            recovery_attempts: self.recovery_attempts,
        }
    }
}

/// Tracks health for every active connection.
///
/// Records live behind their own locks, so operations on different
/// connections do not contend beyond the brief map lookup.
pub struct HealthManager<I> {
    config: HealthConfig,
    records: Mutex<HashMap<u32, Arc<Mutex<HealthRecord<I>>>>>,
    events: EventPublisher,
}

impl<I> HealthManager<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Manager publishing status changes on `events`.
    pub fn new(config: HealthConfig, events: EventPublisher) -> Self {
        Self { config, records: Mutex::new(HashMap::new()), events }
    }

    /// Configuration in use.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Publisher shared with the retry engine.
    pub fn publisher(&self) -> &EventPublisher {
        &self.events
    }

    /// Subscribe to connectivity events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Record a successful operation.
    pub fn record_success(&self, connect_id: u32, operation: OperationKind, now: I) {
        self.record(connect_id, operation, None, now);
    }

    /// Record a failed operation.
    pub fn record_failure(
        &self,
        connect_id: u32,
        operation: OperationKind,
        category: FailureCategory,
        now: I,
    ) {
        self.record(connect_id, operation, Some(category), now);
    }

    /// Effective status; `Unknown` for untracked connections.
    pub fn status(&self, connect_id: u32) -> ConnectionStatus {
        self.get(connect_id)
            .map_or(ConnectionStatus::Unknown, |record| lock(&record).effective())
    }

    /// Read model for one connection.
    pub fn snapshot(&self, connect_id: u32) -> Option<HealthSnapshot<I>> {
        self.get(connect_id).map(|record| lock(&record).snapshot())
    }

    /// Tracked connection ids, in no particular order.
    pub fn connections(&self) -> Vec<u32> {
        lock(&self.records).keys().copied().collect()
    }

    /// Pin the effective status regardless of metrics.
    pub fn set_override(&self, connect_id: u32, status: ConnectionStatus, now: I) {
        let record = self.get_or_create(connect_id, now);
        let mut record = lock(&record);
        let previous = record.effective();
        record.override_status = Some(status);
        self.publish_change(connect_id, previous, record.effective());
    }

    /// Return to metric-derived status.
    pub fn clear_override(&self, connect_id: u32) {
        if let Some(record) = self.get(connect_id) {
            let mut record = lock(&record);
            let previous = record.effective();
            record.override_status = None;
            self.publish_change(connect_id, previous, record.effective());
        }
    }

    /// Stop tracking a torn-down connection.
    pub fn remove(&self, connect_id: u32) -> Option<HealthSnapshot<I>> {
        let record = lock(&self.records).remove(&connect_id)?;
        let snapshot = lock(&record).snapshot();
        self.publish_change(connect_id, snapshot.status, ConnectionStatus::Disconnected);
        Some(snapshot)
    }

    /// Disconnect silent connections and schedule recovery for failing ones.
    ///
    /// Returns the connections whose status changed. Overridden connections
    /// are left alone.
    pub fn sweep(&self, now: I) -> Vec<(u32, ConnectionStatus)> {
        let records: Vec<_> = lock(&self.records)
            .iter()
            .map(|(connect_id, record)| (*connect_id, Arc::clone(record)))
            .collect();

        let mut changes = Vec::new();
        for (connect_id, record) in records {
            let mut record = lock(&record);
            if record.override_status.is_some() {
                continue;
            }

            let previous = record.status;
            let silent = now - record.last_activity;
            if silent > self.config.max_unhealthy_duration {
                if previous != ConnectionStatus::Disconnected {
                    record.status = ConnectionStatus::Disconnected;
                    record.recovering = false;
                    info!(connect_id, ?silent, "connection silent, marking disconnected");
                }
            } else if self.config.auto_recovery
                && !record.recovering
                && matches!(previous, ConnectionStatus::Unhealthy | ConnectionStatus::Failed)
                && record.recovery_attempts < self.config.max_recovery_attempts
            {
                record.status = ConnectionStatus::Reconnecting;
                record.recovering = true;
                record.recovery_attempts += 1;
                info!(connect_id, attempt = record.recovery_attempts, "scheduling recovery");
            }

            if record.status != previous {
                changes.push((connect_id, record.status));
                self.publish_change(connect_id, previous, record.status);
            }
        }
        changes
    }

    fn record(
        &self,
        connect_id: u32,
        operation: OperationKind,
        failure: Option<FailureCategory>,
        now: I,
    ) {
        let record = self.get_or_create(connect_id, now);
        let mut record = lock(&record);
        let previous = record.effective();

        record.total_operations += 1;
        record.last_activity = now;
        record.last_operation.insert(operation, now);

        match failure {
            None => {
                record.success_rate =
                    SUCCESS_RATE_ALPHA + (1.0 - SUCCESS_RATE_ALPHA) * record.success_rate;
                record.consecutive_failures = 0;
                record.consecutive_successes += 1;
                record.escalated = false;
                if record.recovering {
                    info!(connect_id, attempts = record.recovery_attempts, "connection recovered");
                }
                record.recovering = false;
                record.recovery_attempts = 0;
            },
            Some(category) => {
                record.success_rate *= 1.0 - SUCCESS_RATE_ALPHA;
                record.consecutive_failures += 1;
                record.consecutive_successes = 0;
                record.failure_counts[category.index()] += 1;
                if category.escalates() {
                    record.escalated = true;
                    warn!(connect_id, %category, "escalating failure");
                }
                record.recovering = false;
                debug!(connect_id, ?operation, %category, "operation failed");
            },
        }
        record.success_rate = record.success_rate.clamp(0.0, 1.0);

        record.status = evaluate_status(
            record.success_rate,
            record.consecutive_failures,
            record.escalated,
            &self.config,
        );
        self.publish_change(connect_id, previous, record.effective());
    }

    fn publish_change(&self, connect_id: u32, previous: ConnectionStatus, current: ConnectionStatus) {
        if previous != current {
            debug!(connect_id, ?previous, ?current, "connection status changed");
            self.events.publish(ConnectivityEvent::StatusChanged { connect_id, previous, current });
        }
    }

    fn get(&self, connect_id: u32) -> Option<Arc<Mutex<HealthRecord<I>>>> {
        lock(&self.records).get(&connect_id).cloned()
    }

    fn get_or_create(&self, connect_id: u32, now: I) -> Arc<Mutex<HealthRecord<I>>> {
        Arc::clone(
            lock(&self.records)
                .entry(connect_id)
                .or_insert_with(|| Arc::new(Mutex::new(HealthRecord::new(now)))),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
