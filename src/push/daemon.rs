//! HTTP client and loop runner for collector replication.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::gateway::Secret;
use crate::pacer::{IntervalPacer, Pacer};
use crate::state::{Snapshot, StateStore};

/// Path appended to the collector base URL.
pub const WEBHOOK_PATH: &str = "/api/bridge/telemetry/webhook";

/// Consecutive failed cycles after which failures are logged at `error`.
const ESCALATE_AFTER: u32 = 5;

/// Join a collector base URL and [`WEBHOOK_PATH`], tolerating a trailing slash.
pub fn webhook_url(base: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), WEBHOOK_PATH)
}

/// Errors from a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The collector replied with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The request did not complete within the client timeout.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The request could not be sent (DNS, refused connection, reset).
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },
}

/// Outcome of one loop iteration. Only used for logging and counters.
#[derive(Debug)]
pub enum PushCycleResult {
    /// The collector accepted the snapshot with this status code.
    Delivered { status: u16 },
    /// No snapshot was available; no request was made.
    Offline { reason: String },
    /// The delivery attempt failed.
    Failed(PushError),
    /// No collector URL is configured.
    Disabled,
}

/// Counters returned when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushStats {
    pub cycles: u64,
    pub delivered: u64,
    pub failed: u64,
    pub offline: u64,
}

/// Runtime configuration for the daemon.
#[derive(Debug, Clone)]
pub struct PushDaemonConfig {
    /// Collector base URL. `None` disables the daemon.
    pub collector_url: Option<String>,
    /// Bearer token sent with every push.
    pub token: Option<Secret>,
    /// Time between cycles.
    pub interval: Duration,
    /// Whole-request timeout for one delivery.
    pub request_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl PushDaemonConfig {
    /// Defaults: 5 s interval, 5 s request timeout, 3 s connect timeout.
    pub fn new(collector_url: Option<String>) -> Self {
        Self {
            collector_url: collector_url.filter(|u| !u.trim().is_empty()),
            token: None,
            interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// The replication loop. Construct with [`PushDaemon::builder`].
pub struct PushDaemon {
    config: PushDaemonConfig,
    webhook: Option<String>,
    store: Arc<dyn StateStore>,
    client: reqwest::Client,
}

impl PushDaemon {
    pub fn builder(collector_url: Option<String>) -> PushDaemonBuilder {
        PushDaemonBuilder::new(collector_url)
    }

    /// Full webhook URL, or `None` when the daemon is disabled.
    pub fn webhook(&self) -> Option<&str> {
        self.webhook.as_deref()
    }

    pub fn config(&self) -> &PushDaemonConfig {
        &self.config
    }

    /// POST one snapshot to the collector.
    ///
    /// # Returns
    /// - `Ok(status)` on a 2xx response.
    /// - `Err(PushError::Timeout)` when the client timeout elapses.
    /// - `Err(PushError::Connect)` on any other transport failure.
    /// - `Err(PushError::Http)` on a non-2xx response.
    async fn deliver(&self, url: &str, snapshot: &Snapshot) -> Result<u16, PushError> {
        let mut req = self.client.post(url).json(snapshot);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token.expose());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PushError::Timeout {
                    url: url.to_string(),
                }
            } else {
                PushError::Connect {
                    url: url.to_string(),
                    detail: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PushError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(status.as_u16())
    }

    /// Run exactly one read-and-send cycle.
    pub async fn push_once(&self) -> PushCycleResult {
        let Some(url) = self.webhook.as_deref() else {
            return PushCycleResult::Disabled;
        };

        let snapshot = match self.store.read_snapshot() {
            Ok(s) => s,
            Err(e) => {
                return PushCycleResult::Offline {
                    reason: e.to_string(),
                }
            }
        };

        match self.deliver(url, &snapshot).await {
            Ok(status) => PushCycleResult::Delivered { status },
            Err(e) => PushCycleResult::Failed(e),
        }
    }

    /// Run the loop until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Returns immediately, after one log line, when no collector is
    /// configured.
    pub async fn run<P: Pacer>(self, mut pacer: P, mut shutdown: watch::Receiver<bool>) -> PushStats {
        let mut stats = PushStats::default();

        let Some(url) = self.webhook.clone() else {
            info!("no collector URL configured, push daemon disabled");
            return stats;
        };
        if self.config.token.is_none() {
            warn!(url = %url, "no bridge token configured, pushing without Authorization");
        }
        info!(url = %url, interval = ?self.config.interval, "push daemon started");

        let mut consecutive_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = pacer.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            stats.cycles += 1;
            match self.push_once().await {
                PushCycleResult::Delivered { status } => {
                    stats.delivered += 1;
                    if consecutive_failures > 0 {
                        info!(url = %url, status, after_failures = consecutive_failures, "collector reachable again");
                    } else {
                        debug!(url = %url, status, "snapshot pushed");
                    }
                    consecutive_failures = 0;
                }
                PushCycleResult::Offline { reason } => {
                    stats.offline += 1;
                    debug!(reason = %reason, "snapshot unavailable, skipping push");
                }
                PushCycleResult::Failed(e) => {
                    stats.failed += 1;
                    consecutive_failures = consecutive_failures.saturating_add(1);

                    if consecutive_failures >= ESCALATE_AFTER {
                        error!(
                            error = %e,
                            url = %url,
                            consecutive_failures,
                            "push failed repeatedly, will retry next tick"
                        );
                    } else {
                        warn!(error = %e, url = %url, "push failed, will retry next tick");
                    }
                }
                PushCycleResult::Disabled => break,
            }
        }

        info!(
            cycles = stats.cycles,
            delivered = stats.delivered,
            failed = stats.failed,
            "push daemon stopped"
        );
        stats
    }

    /// Spawn [`run`](Self::run) on the runtime with wall-clock pacing.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<PushStats> {
        let pacer = IntervalPacer::new(self.config.interval);
        tokio::spawn(self.run(pacer, shutdown))
    }
}

/// Builder for [`PushDaemon`].
///
/// # Example
/// ```rust,ignore
/// let daemon = PushDaemon::builder(Some("http://collector:8080".into()))
///     .store(Arc::clone(&store))
///     .interval(Duration::from_secs(10))
///     .build()
///     .expect("store is required");
/// ```
pub struct PushDaemonBuilder {
    config: PushDaemonConfig,
    store: Option<Arc<dyn StateStore>>,
}

impl PushDaemonBuilder {
    pub fn new(collector_url: Option<String>) -> Self {
        Self {
            config: PushDaemonConfig::new(collector_url),
            store: None,
        }
    }

    /// Attach the state store snapshots are read from. **Required.**
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn token(mut self, token: Option<Secret>) -> Self {
        self.config.token = token;
        self
    }

    /// Override the cycle period (default 5 s).
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Override the per-request timeout (default 5 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Override the TCP connect timeout (default 3 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// # Errors
    /// Returns `Err("store is required")` when no store was provided.
    pub fn build(self) -> Result<PushDaemon, &'static str> {
        let store = self.store.ok_or("store is required")?;

        // Builder failure only happens when TLS backends can't initialize;
        // fall back to the default client instead of panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .unwrap_or_default();

        let webhook = self.config.collector_url.as_deref().map(webhook_url);

        Ok(PushDaemon {
            config: self.config,
            webhook,
            store,
            client,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
