//! Client Pool - bounded set of authorized client configurations
//!
//! Every resource operation checks a configuration out for its duration.
//! Each configuration carries its own token, so spreading calls across the
//! pool bounds concurrency against the API and spreads per-token rate limits.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientConfiguration, FactoryError};
use crate::config::{ConfigError, PoolSettings};

/// Interval of the periodic pool status line
pub const METRICS_LOGGING_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("timeout after {timeout:?} waiting for available client ({metrics})")]
    AcquireTimeout {
        timeout: Duration,
        metrics: PoolMetrics,
    },

    #[error("client acquisition cancelled")]
    Cancelled,

    #[error("client pool is closed")]
    Closed,

    #[error("timed out pre-filling client pool after {0:?}")]
    InitTimeout(Duration),

    #[error("failed to initialize client pool: {0}")]
    Authorization(#[from] FactoryError),

    #[error("client pool has not been initialized")]
    NotInitialized,

    #[error("invalid client pool configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl PoolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::AcquireTimeout { .. } | PoolError::InitTimeout(_))
    }
}

/// Point-in-time snapshot of pool counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetrics {
    pub active_clients: usize,
    pub max_clients: usize,
    pub total_acquires: u64,
    pub total_releases: u64,
    pub acquire_timeouts: u64,
    pub last_acquire: Option<DateTime<Utc>>,
}

impl PoolMetrics {
    /// Fraction of the pool currently checked out
    pub fn utilization(&self) -> f64 {
        if self.max_clients == 0 {
            return 0.0;
        }
        self.active_clients as f64 / self.max_clients as f64
    }
}

/// How close the pool is to running out of clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLevel {
    Normal,
    Near,
    Critical,
}

/// Classify `active` of `max` checked-out clients. Both ratios are
/// inclusive lower bounds; a pool without capacity is `Normal`.
pub fn capacity_level(active: usize, max: usize, near: f64, critical: f64) -> CapacityLevel {
    if max == 0 {
        return CapacityLevel::Normal;
    }
    let active = active as f64;
    let max = max as f64;
    if active >= critical * max {
        CapacityLevel::Critical
    } else if active >= near * max {
        CapacityLevel::Near
    } else {
        CapacityLevel::Normal
    }
}

impl fmt::Display for PoolMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last_acquire = match self.last_acquire {
            Some(at) => at.to_rfc3339_opts(SecondsFormat::Secs, true),
            None => "never".to_string(),
        };
        write!(
            f,
            "Active: {}/{}, Acquires: {}, Releases: {}, Timeouts: {}, Last Acquire: {}",
            self.active_clients,
            self.max_clients,
            self.total_acquires,
            self.total_releases,
            self.acquire_timeouts,
            last_acquire
        )
    }
}

/// What happened to a configuration handed back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Queued for the next acquire
    Returned,
    /// Dropped because the pool was already full or closed
    Discarded,
}

#[derive(Debug, Default)]
struct Counters {
    active_clients: usize,
    total_acquires: u64,
    total_releases: u64,
    acquire_timeouts: u64,
    last_acquire: Option<DateTime<Utc>>,
}

struct Shared {
    settings: PoolSettings,
    /// One permit per queued configuration
    available: Semaphore,
    queue: Mutex<VecDeque<ClientConfiguration>>,
    counters: Mutex<Counters>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ClientPool {
    shared: Arc<Shared>,
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("metrics", &self.metrics())
            .field("idle", &self.idle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientPool {
    /// An empty pool holding at most `settings.max_clients` configurations
    pub fn new(settings: PoolSettings) -> Self {
        let capacity = settings.max_clients;
        Self {
            shared: Arc::new(Shared {
                settings,
                available: Semaphore::new(0),
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                counters: Mutex::new(Counters::default()),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn capacity(&self) -> usize {
        self.shared.settings.max_clients
    }

    /// Configurations currently queued
    pub fn idle(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Add a newly built configuration without touching the counters.
    pub(crate) fn add(&self, config: ClientConfiguration) -> ReleaseOutcome {
        self.enqueue(config)
    }

    fn enqueue(&self, config: ClientConfiguration) -> ReleaseOutcome {
        let mut queue = lock(&self.shared.queue);
        if self.is_closed() || queue.len() >= self.capacity() {
            return ReleaseOutcome::Discarded;
        }
        queue.push_back(config);
        drop(queue);
        self.shared.available.add_permits(1);
        ReleaseOutcome::Returned
    }

    fn log_debug(&self, message: fmt::Arguments<'_>) {
        if self.shared.settings.debug_logging {
            debug!("{}", message);
        }
    }

    /// Check a configuration out of the pool.
    ///
    /// Waits until one is free, `timeout` elapses, or `cancel` fires.
    /// Cancellation takes precedence over both other outcomes.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<PooledClient, PoolError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            permit = self.shared.available.acquire() => permit.map_err(|_| PoolError::Closed)?,
            _ = tokio::time::sleep(timeout) => {
                let metrics = {
                    let mut counters = lock(&self.shared.counters);
                    counters.acquire_timeouts += 1;
                    self.snapshot(&counters)
                };
                self.log_debug(format_args!("Client acquisition timeout - {}", metrics));
                return Err(PoolError::AcquireTimeout { timeout, metrics });
            }
        };
        permit.forget();

        // Every permit is backed by a queued configuration.
        let Some(config) = lock(&self.shared.queue).pop_front() else {
            return Err(PoolError::Closed);
        };

        let metrics = {
            let mut counters = lock(&self.shared.counters);
            counters.total_acquires += 1;
            counters.active_clients += 1;
            counters.last_acquire = Some(Utc::now());
            self.snapshot(&counters)
        };

        let settings = &self.shared.settings;
        if settings.debug_logging {
            match capacity_level(
                metrics.active_clients,
                metrics.max_clients,
                settings.near_capacity_ratio,
                settings.critical_capacity_ratio,
            ) {
                CapacityLevel::Critical => {
                    warn!("Client acquired but pool at critical capacity - {}", metrics)
                }
                CapacityLevel::Near => {
                    warn!("Client acquired with pool near capacity - {}", metrics)
                }
                CapacityLevel::Normal => debug!("Client acquired from pool - {}", metrics),
            }
        }

        Ok(PooledClient {
            config,
            pool: self.clone(),
            released: false,
        })
    }

    /// Hand a configuration back. Never blocks.
    ///
    /// A configuration that does not fit (the pool is full or closed) is
    /// discarded. The release is counted either way.
    pub fn release(&self, config: ClientConfiguration) -> ReleaseOutcome {
        {
            let mut counters = lock(&self.shared.counters);
            counters.total_releases += 1;
            counters.active_clients = counters.active_clients.saturating_sub(1);
        }

        let outcome = self.enqueue(config);
        match outcome {
            ReleaseOutcome::Returned => {
                self.log_debug(format_args!("Client released to pool - {}", self.metrics()));
            }
            ReleaseOutcome::Discarded if self.is_closed() => {
                self.log_debug(format_args!("Client released to closed pool - {}", self.metrics()));
            }
            ReleaseOutcome::Discarded => {
                warn!(
                    "Attempted to release client to full pool, discarding it - {}",
                    self.metrics()
                );
            }
        }
        outcome
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.snapshot(&lock(&self.shared.counters))
    }

    fn snapshot(&self, counters: &Counters) -> PoolMetrics {
        PoolMetrics {
            active_clients: counters.active_clients,
            max_clients: self.capacity(),
            total_acquires: counters.total_acquires,
            total_releases: counters.total_releases,
            acquire_timeouts: counters.acquire_timeouts,
            last_acquire: counters.last_acquire,
        }
    }

    /// Drain and drop every queued configuration. Pending and later acquires
    /// fail with [`PoolError::Closed`]. Safe to call more than once.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.cancel();
        self.shared.available.close();

        let drained = {
            let mut queue = lock(&self.shared.queue);
            let drained = queue.len();
            queue.clear();
            drained
        };

        let metrics = self.metrics();
        if metrics.active_clients > 0 {
            self.log_debug(format_args!(
                "Closing pool with {} active clients",
                metrics.active_clients
            ));
        }
        self.log_debug(format_args!(
            "Closed SDK client pool after draining {} clients - {}",
            drained, metrics
        ));
    }

    /// Periodically log the pool status line while debug logging is on.
    /// The task ends when the pool closes or `cancel` fires.
    pub fn spawn_metrics_logger(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = pool.shared.shutdown.cancelled() => return,
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        pool.log_debug(format_args!("Client pool status - {}", pool.metrics()));
                    }
                }
            }
        })
    }
}

/// A configuration checked out of a [`ClientPool`].
///
/// Returned to the pool when dropped, including during unwinding.
pub struct PooledClient {
    config: ClientConfiguration,
    pool: ClientPool,
    released: bool,
}

impl PooledClient {
    pub fn config(&self) -> &ClientConfiguration {
        &self.config
    }

    /// Return the configuration now rather than on drop.
    pub fn release(mut self) -> ReleaseOutcome {
        self.released = true;
        self.pool.release(self.config.clone())
    }
}

impl Deref for PooledClient {
    type Target = ClientConfiguration;

    fn deref(&self) -> &ClientConfiguration {
        &self.config
    }
}

impl fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(self.config.clone());
        }
    }
}
