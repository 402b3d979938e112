//! The connection pool: acquisition, singleflight probing, and the
//! idle/backoff reaper

use crate::clock::{Clock, SystemClock};
use crate::config::{HostConfig, PoolKey};
use crate::error::{PoolError, TransportError};
use crate::health::{Health, HealthSignal, HealthStatus, DEFAULT_HEALTHY_TTL, DEFAULT_MAX_BACKOFF};
use crate::transport::{self, Connection, StreamGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent streams riding one connection
    pub max_streams_per_conn: usize,
    /// Maximum connections per host; `None` means unlimited
    pub max_conns_per_host: Option<usize>,
    /// How long an idle connection survives before the reaper closes it
    pub idle_timeout: Duration,
    /// Maximum age of a success before a reuse must re-probe
    pub healthy_ttl: Duration,
    /// Ceiling on computed backoff
    pub max_backoff: Duration,
    /// Timeout applied to the `echo ok` probe command
    pub probe_timeout: Duration,
    /// How often the background reaper runs
    pub reaper_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_streams_per_conn: 10,
            max_conns_per_host: None,
            idle_timeout: Duration::from_secs(60),
            healthy_ttl: DEFAULT_HEALTHY_TTL,
            max_backoff: DEFAULT_MAX_BACKOFF,
            probe_timeout: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome broadcast to every caller sharing a singleflight probe
type ProbeOutcome = Result<(), String>;

struct PoolInner {
    health: HashMap<PoolKey, Health>,
    connections: HashMap<PoolKey, Vec<Arc<Connection>>>,
    configs: HashMap<PoolKey, HostConfig>,
    probes_inflight: HashMap<PoolKey, broadcast::Sender<ProbeOutcome>>,
}

impl PoolInner {
    fn new() -> Self {
        Self {
            health: HashMap::new(),
            connections: HashMap::new(),
            configs: HashMap::new(),
            probes_inflight: HashMap::new(),
        }
    }

    fn health_mut(&mut self, key: &PoolKey, cfg: &PoolConfig) -> &mut Health {
        self.health
            .entry(key.clone())
            .or_insert_with(|| Health::unknown(cfg.healthy_ttl, cfg.max_backoff))
    }
}

/// A leased connection, returned by [`ConnectionPool::acquire`]. Drop
/// releases the stream slot back to the pool; [`ConnectionPool::release`]
/// is also provided for callers that prefer to be explicit.
pub struct Lease {
    connection: Arc<Connection>,
    _guard: StreamGuard,
    pool_key: PoolKey,
}

impl Lease {
    /// The underlying connection
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The pool key this lease was issued against
    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }
}

/// The SSH connection pool
///
/// Cheap to clone: internal state lives behind `Arc`s. Background tasks
/// (the reaper, singleflight probes) hold a clone rather than
/// borrowing, so there is no self-referential `Arc<Self>` anywhere.
pub struct ConnectionPool {
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<PoolInner>>,
    closed: Arc<AtomicBool>,
    reaper_handle: Arc<StdMutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            inner: Arc::clone(&self.inner),
            closed: Arc::clone(&self.closed),
            reaper_handle: Arc::clone(&self.reaper_handle),
        }
    }
}

impl ConnectionPool {
    /// Create a new pool with the default system clock
    pub fn new(config: PoolConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a new pool with an injected clock (tests use [`crate::clock::ManualClock`])
    pub fn with_clock(config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Arc::new(Mutex::new(PoolInner::new())),
            closed: Arc::new(AtomicBool::new(false)),
            reaper_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Register (or overwrite) the configuration for a host
    pub async fn add_host(&self, config: HostConfig) -> Result<PoolKey, PoolError> {
        config.validate()?;
        let key = config.pool_key();
        let mut inner = self.inner.lock().await;
        inner.configs.insert(key.clone(), config);
        inner.health_mut(&key, &self.config);
        Ok(key)
    }

    /// Start the background reaper
    pub fn start(&self) {
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.reaper_interval);
            loop {
                interval.tick().await;
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.reap_once().await;
            }
        });
        *self.reaper_handle.lock().unwrap() = Some(handle);
    }

    /// Run one reaper pass: close idle connections past `idle_timeout`,
    /// and kick off async re-probes for hosts whose backoff has lifted.
    /// Exposed directly so tests can drive it without waiting on the
    /// real timer.
    pub async fn reap_once(&self) {
        let now = self.clock.now();
        let mut to_close: Vec<Arc<Connection>> = Vec::new();
        let mut to_reprobe: Vec<PoolKey> = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            for (key, conns) in inner.connections.iter_mut() {
                let idle_timeout = self.config.idle_timeout;
                let mut keep = Vec::with_capacity(conns.len());
                for conn in conns.drain(..) {
                    let idle = conn.active_streams() == 0
                        && now.duration_since(conn.last_used_at()) > idle_timeout;
                    if idle {
                        debug!(%key, "reaper: evicting idle connection");
                        to_close.push(conn);
                    } else {
                        keep.push(conn);
                    }
                }
                *conns = keep;
            }
            inner.connections.retain(|_, v| !v.is_empty());

            for (key, health) in inner.health.iter() {
                let backoff_lifted = health.backoff_until().is_some_and(|until| now >= until);
                if health.status() == HealthStatus::Unhealthy
                    && backoff_lifted
                    && !inner.probes_inflight.contains_key(key)
                {
                    to_reprobe.push(key.clone());
                }
            }
        }

        for conn in to_close {
            if let Err(e) = conn.close().await {
                warn!("reaper: error closing idle connection: {e}");
            }
        }

        for key in to_reprobe {
            let pool = self.clone();
            tokio::spawn(async move {
                let _ = pool.acquire(&key, AcquireOptions::default()).await;
            });
        }
    }

    /// Acquire a leased connection for `key`. `key` must already have
    /// been registered via [`ConnectionPool::add_host`].
    pub async fn acquire(&self, key: &PoolKey, opts: AcquireOptions) -> Result<Lease, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::PoolClosed);
        }

        let mut remaining_wait = opts.max_wait;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PoolError::PoolClosed);
            }

            let now = self.clock.now();

            // Step 3: backoff gate
            let backoff_wait = {
                let inner = self.inner.lock().await;
                inner.health.get(key).and_then(|h| {
                    h.backoff_until()
                        .filter(|&until| now < until)
                        .map(|until| until - now)
                })
            };

            if let Some(retry_after) = backoff_wait {
                if remaining_wait.is_zero() {
                    return Err(PoolError::InBackoff { retry_after });
                }
                let wait = remaining_wait.min(retry_after);
                tokio::time::sleep(wait).await;
                remaining_wait = remaining_wait.saturating_sub(wait);
                continue;
            }

            // Step 4: reuse an existing fresh connection with spare capacity
            if let Some(lease) = self.try_reuse(key, now).await {
                return Ok(lease);
            }

            // Step 5/6: singleflight probe, then adopt
            match self.probe_singleflight(key).await {
                Ok(()) => {
                    if let Some(lease) = self.try_reuse(key, self.clock.now()).await {
                        return Ok(lease);
                    }
                    // Probe succeeded but connection vanished (raced with
                    // eviction); loop once more rather than failing the
                    // caller spuriously.
                    continue;
                }
                Err(message) => {
                    return Err(PoolError::ProbeFailed(message));
                }
            }
        }
    }

    async fn try_reuse(&self, key: &PoolKey, now: Instant) -> Option<Lease> {
        let inner = self.inner.lock().await;
        let fresh = inner.health.get(key).is_some_and(|h| h.is_fresh(now));
        if !fresh {
            return None;
        }
        let conns = inner.connections.get(key)?;
        for conn in conns {
            if !conn.is_closed() && conn.active_streams() < self.config.max_streams_per_conn {
                let guard = StreamGuard::new(Arc::clone(conn), now);
                return Some(Lease {
                    connection: Arc::clone(conn),
                    _guard: guard,
                    pool_key: key.clone(),
                });
            }
        }
        None
    }

    /// Collapse concurrent probes for `key` into one shared outcome.
    async fn probe_singleflight(&self, key: &PoolKey) -> Result<(), String> {
        let mut rx = {
            let mut inner = self.inner.lock().await;
            if let Some(sender) = inner.probes_inflight.get(key) {
                sender.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                inner.probes_inflight.insert(key.clone(), tx);
                inner.health_mut(key, &self.config).begin_probe();
                drop(inner);

                let pool = self.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    pool.run_probe_and_publish(key).await;
                });
                rx
            }
        };

        rx.recv()
            .await
            .unwrap_or_else(|_| Err("probe task dropped".to_string()))
    }

    async fn run_probe_and_publish(&self, key: PoolKey) {
        let result = self.dial_and_probe(&key).await;

        let sender = {
            let mut inner = self.inner.lock().await;
            let now = self.clock.now();
            match &result {
                Ok((conn, latency)) => {
                    inner
                        .health_mut(&key, &self.config)
                        .record_success(now, Some(*latency));
                    let slot = inner.connections.entry(key.clone()).or_default();
                    let within_cap = self
                        .config
                        .max_conns_per_host
                        .is_none_or(|max| slot.len() < max);
                    if within_cap {
                        slot.push(Arc::clone(conn));
                    }
                }
                Err(e) => {
                    inner
                        .health_mut(&key, &self.config)
                        .record_failure(now, e.clone());
                }
            }
            inner.probes_inflight.remove(&key)
        };

        let outcome: ProbeOutcome = result.map(|_| ());
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }

    async fn dial_and_probe(&self, key: &PoolKey) -> Result<(Arc<Connection>, Duration), String> {
        let config = {
            let inner = self.inner.lock().await;
            inner
                .configs
                .get(key)
                .cloned()
                .ok_or_else(|| format!("no configuration registered for host {key}"))?
        };

        let now = self.clock.now();
        let conn = timeout(self.config.probe_timeout, transport::dial(&config, now))
            .await
            .map_err(|_| "dial timed out".to_string())?
            .map_err(|e: TransportError| e.to_string())?;
        let conn = Arc::new(conn);

        let probe_start = Instant::now();
        let mut child = conn.spawn_command("echo ok").map_err(|e| e.to_string())?;

        let output = timeout(self.config.probe_timeout, child.wait_with_output())
            .await
            .map_err(|_| "probe command timed out".to_string())?
            .map_err(|e| e.to_string())?;

        if !output.status.success() {
            return Err(format!(
                "probe exited with status {:?}",
                output.status.code()
            ));
        }
        if !String::from_utf8_lossy(&output.stdout).trim().contains("ok") {
            return Err("probe did not echo expected output".to_string());
        }

        info!(%key, "probe succeeded");
        Ok((conn, probe_start.elapsed()))
    }

    /// Release a leased connection. Dropping the [`Lease`] has the same
    /// effect; this exists so callers can release explicitly.
    pub fn release(&self, _lease: Lease) {}

    /// Report the outcome of an operation that ran over `lease`'s
    /// connection back to the health model.
    pub async fn report(&self, key: &PoolKey, signal: HealthSignal, detail: Option<String>) {
        let now = self.clock.now();
        match signal {
            HealthSignal::Success => {
                let mut inner = self.inner.lock().await;
                inner.health_mut(key, &self.config).record_success(now, None);
            }
            HealthSignal::Transport => {
                let conns_to_close;
                {
                    let mut inner = self.inner.lock().await;
                    inner.health_mut(key, &self.config).record_failure(
                        now,
                        detail.unwrap_or_else(|| "transport failure".to_string()),
                    );
                    conns_to_close = inner.connections.remove(key).unwrap_or_default();
                }
                for conn in conns_to_close {
                    let _ = conn.close().await;
                }
            }
            HealthSignal::CommandFailure => {
                // Network worked; health is unaffected.
            }
            HealthSignal::Timeout => {
                // Command-level timeout (124/137) does not affect health;
                // transport-stall timeouts are reported as `Transport` by
                // the caller instead.
            }
        }
    }

    /// A read-only snapshot of a host's health
    pub async fn health(&self, key: &PoolKey) -> Option<HealthSnapshot> {
        let inner = self.inner.lock().await;
        inner.health.get(key).map(|h| HealthSnapshot {
            status: h.status(),
            consecutive_failures: h.consecutive_failures(),
            backoff_until: h.backoff_until(),
            last_error: h.last_error().map(str::to_string),
            observed_latency: h.observed_latency(),
        })
    }

    /// Idempotent shutdown: stops the reaper and closes every connection
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down connection pool");

        if let Some(handle) = self.reaper_handle.lock().unwrap().take() {
            handle.abort();
        }

        let drained: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock().await;
            inner.connections.drain().flat_map(|(_, v)| v).collect()
        };
        for conn in drained {
            if let Err(e) = conn.close().await {
                warn!("error closing connection during shutdown: {e}");
            }
        }
    }

    /// Pool-wide statistics, primarily for diagnostics/tests
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let total_connections = inner.connections.values().map(Vec::len).sum();
        let hosts = inner.connections.len();
        let healthy_hosts = inner
            .health
            .values()
            .filter(|h| h.status() == HealthStatus::Healthy)
            .count();
        PoolStats {
            total_connections,
            hosts,
            healthy_hosts,
        }
    }
}

/// Snapshot of a host's health, returned by [`ConnectionPool::health`]
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    /// Current status
    pub status: HealthStatus,
    /// Consecutive failures since the last success
    pub consecutive_failures: u32,
    /// When backoff lifts, if currently in backoff
    pub backoff_until: Option<Instant>,
    /// Most recent short error description
    pub last_error: Option<String>,
    /// Most recently observed latency
    pub observed_latency: Option<Duration>,
}

/// Options controlling one [`ConnectionPool::acquire`] call
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// How long to wait on backoff/probe before giving up. Zero means
    /// "fail immediately if not already healthy."
    pub max_wait: Duration,
}

/// Pool-wide statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total live connections across all hosts
    pub total_connections: usize,
    /// Number of distinct hosts with at least one connection
    pub hosts: usize,
    /// Number of hosts currently `Healthy`
    pub healthy_hosts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_pool() -> ConnectionPool {
        ConnectionPool::with_clock(PoolConfig::default(), Arc::new(ManualClock::new()))
    }

    #[tokio::test]
    async fn add_host_registers_unknown_health() {
        let pool = test_pool();
        let key = pool
            .add_host(HostConfig::new("example.com"))
            .await
            .unwrap();
        let health = pool.health(&key).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn acquire_unknown_host_is_probe_failed() {
        let pool = test_pool();
        let key = HostConfig::new("example.com").pool_key();
        let err = pool.acquire(&key, AcquireOptions::default()).await;
        assert!(matches!(err, Err(PoolError::ProbeFailed(_))));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = test_pool();
        pool.shutdown().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_after_shutdown_is_pool_closed() {
        let pool = test_pool();
        let key = pool
            .add_host(HostConfig::new("example.com"))
            .await
            .unwrap();
        pool.shutdown().await;
        let err = pool.acquire(&key, AcquireOptions::default()).await;
        assert!(matches!(err, Err(PoolError::PoolClosed)));
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let pool = test_pool();
        let stats = pool.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.hosts, 0);
    }

    #[tokio::test]
    async fn report_transport_failure_sets_backoff() {
        let pool = test_pool();
        let key = pool
            .add_host(HostConfig::new("example.com"))
            .await
            .unwrap();
        pool.report(&key, HealthSignal::Transport, Some("boom".into()))
            .await;
        let health = pool.health(&key).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.backoff_until.is_some());
    }

    #[tokio::test]
    async fn report_command_failure_does_not_affect_health() {
        let pool = test_pool();
        let key = pool
            .add_host(HostConfig::new("example.com"))
            .await
            .unwrap();
        pool.report(&key, HealthSignal::Success, None).await;
        pool.report(&key, HealthSignal::CommandFailure, None).await;
        let health = pool.health(&key).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn pool_clone_shares_state() {
        let pool = test_pool();
        let key = pool
            .add_host(HostConfig::new("example.com"))
            .await
            .unwrap();
        let cloned = pool.clone();
        cloned
            .report(&key, HealthSignal::Transport, Some("x".into()))
            .await;
        let health = pool.health(&key).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }
}
