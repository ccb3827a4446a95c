//! # Push Daemon
//!
//! Best-effort replication of the organ telemetry snapshot to a remote
//! collector.
//!
//! ## What It Does
//!
//! Every period (default 5 s) the daemon reads the current snapshot from the
//! [`StateStore`](crate::state::StateStore) and POSTs it to
//! `<collector>/api/bridge/telemetry/webhook` with the shared bearer token.
//! Each cycle is independent: no retries, no backoff, no batching. A failed
//! cycle is logged and the next one runs on schedule.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let daemon = PushDaemon::builder(config.collector_url.clone())
//!     .store(Arc::clone(&store))
//!     .token(config.secret.clone())
//!     .build()?;
//! let handle = daemon.spawn(shutdown_rx);
//! ```

pub mod daemon;

pub use daemon::{
    webhook_url, PushCycleResult, PushDaemon, PushDaemonBuilder, PushDaemonConfig, PushError,
    PushStats, WEBHOOK_PATH,
};
