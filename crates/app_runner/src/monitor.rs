//! Heartbeat staleness monitor for live modes: components that stop
//! heartbeating degrade to WARN after 10 s and DOWN after 60 s, surfacing
//! through `/health` and `meta.batch_agent`.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use core_types::AgentStatus;
use infra_clock::{IstWallClock, SessionClock};
use state_store::StateStore;
use tokio::sync::watch;

const WARN_AFTER_SECS: i64 = 10;
const DOWN_AFTER_SECS: i64 = 60;

fn staleness_status(last: NaiveDateTime, now: NaiveDateTime) -> AgentStatus {
    let age = (now - last).num_seconds();
    if age >= DOWN_AFTER_SECS {
        AgentStatus::Down
    } else if age >= WARN_AFTER_SECS {
        AgentStatus::Warn
    } else {
        AgentStatus::Ok
    }
}

fn severity(status: AgentStatus) -> u8 {
    match status {
        AgentStatus::Ok => 0,
        AgentStatus::Warn => 1,
        AgentStatus::Down => 2,
    }
}

pub async fn run_monitor(store: Arc<StateStore>, mut shutdown: watch::Receiver<bool>) {
    let clock = IstWallClock;
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        let now = clock.now();
        let snap = store.snapshot();
        let mut downgrades = Vec::new();
        for (name, hb) in &snap.agents {
            let status = staleness_status(hb.last_heartbeat_ts, now);
            // Downgrade only; components restore themselves by heartbeating.
            if severity(status) > severity(hb.status) {
                downgrades.push((name.clone(), status));
            }
        }
        let engine_hb = snap.agents.get("engine").cloned();

        if downgrades.is_empty() && engine_hb == snap.meta.batch_agent {
            continue;
        }
        store.apply(move |state| {
            for (name, status) in downgrades {
                if let Some(agent) = state.agents.get_mut(&name) {
                    tracing::warn!(component = %name, ?status, "agent heartbeat stale");
                    agent.status = status;
                }
            }
            state.meta.batch_agent = engine_hb;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(10, 0, s)
            .unwrap()
    }

    #[test]
    fn staleness_thresholds() {
        assert_eq!(staleness_status(at(0), at(5)), AgentStatus::Ok);
        assert_eq!(staleness_status(at(0), at(10)), AgentStatus::Warn);
        assert_eq!(staleness_status(at(0), at(59)), AgentStatus::Warn);
        let minute_later = NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(10, 1, 0)
            .unwrap();
        assert_eq!(staleness_status(at(0), minute_later), AgentStatus::Down);
    }
}
