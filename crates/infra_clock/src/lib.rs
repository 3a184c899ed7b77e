use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Asia::Kolkata;
use tokio::sync::watch;

/// Single time authority for the session runtime. Every time-gated decision
/// reads IST wall time through this trait, which is what makes a replayed
/// day deterministic: the virtual variant is advanced by the tick stream.
#[async_trait]
pub trait SessionClock: Send + Sync {
    /// Current IST wall time (naive; IST has no DST).
    fn now(&self) -> NaiveDateTime;

    /// Resolve once `now() >= deadline`. Returns immediately if already past.
    async fn wait_until(&self, deadline: NaiveDateTime);
}

#[derive(Debug, Default)]
pub struct IstWallClock;

#[async_trait]
impl SessionClock for IstWallClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&Kolkata).naive_local()
    }

    async fn wait_until(&self, deadline: NaiveDateTime) {
        // Re-check in bounded slices so host clock adjustments cannot leave
        // the task sleeping past a cutover.
        loop {
            let now = self.now();
            if now >= deadline {
                return;
            }
            let remaining = (deadline - now)
                .to_std()
                .unwrap_or(Duration::from_millis(1));
            tokio::time::sleep(remaining.min(Duration::from_millis(500))).await;
        }
    }
}

/// Replay clock: virtual time is the maximum tick timestamp seen so far.
/// Waiters are woken through a watch channel whenever time advances.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    tx: watch::Sender<NaiveDateTime>,
}

impl VirtualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        let (tx, _) = watch::channel(start);
        Self { tx }
    }

    /// Advance to `ts` if it is ahead of the current virtual time. Regressive
    /// timestamps are ignored, keeping the clock monotone.
    pub fn advance(&self, ts: NaiveDateTime) {
        self.tx.send_if_modified(|current| {
            if ts > *current {
                *current = ts;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl SessionClock for VirtualClock {
    fn now(&self) -> NaiveDateTime {
        *self.tx.borrow()
    }

    async fn wait_until(&self, deadline: NaiveDateTime) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped: the replay ended, release the waiter.
                return;
            }
        }
    }
}
