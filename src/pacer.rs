//! Tick sources for the periodic loops.
//!
//! The push daemon and streaming sessions never sleep directly; they await a
//! [`Pacer`]. Production code uses [`IntervalPacer`]; tests drive a loop one
//! iteration at a time with [`ManualPacer`] instead of waiting on wall time.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// A source of periodic wake-ups. `tick` must be cancel-safe because loops
/// race it against shutdown and socket reads in `tokio::select!`.
pub trait Pacer: Send + 'static {
    fn tick(&mut self) -> impl Future<Output = ()> + Send + '_;
}

/// Wall-clock pacing backed by [`tokio::time::interval`].
///
/// The first tick fires one full period after construction, so a loop waits
/// before its first iteration. Missed ticks are skipped rather than bursted.
pub struct IntervalPacer {
    interval: Interval,
}

impl IntervalPacer {
    pub fn new(period: Duration) -> Self {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    /// Like [`new`](Self::new) but the first tick completes immediately.
    pub fn immediate(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

impl Pacer for IntervalPacer {
    fn tick(&mut self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            self.interval.tick().await;
        }
    }
}

/// Pacing driven by explicit [`PacerHandle::advance`] calls.
///
/// Once every handle is dropped the pacer never ticks again, so the loop
/// stays parked until it is shut down or its connection closes.
pub struct ManualPacer {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Sender side of a [`ManualPacer`].
#[derive(Clone)]
pub struct PacerHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl PacerHandle {
    /// Release one tick. Returns `false` when the pacer has been dropped.
    pub fn advance(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

impl ManualPacer {
    pub fn new() -> (PacerHandle, ManualPacer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PacerHandle { tx }, ManualPacer { rx })
    }
}

impl Pacer for ManualPacer {
    fn tick(&mut self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            if self.rx.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
    }
}
