//! Single shared snapshot of the running session. Writers publish immutable
//! copies through a copy-on-write pointer swap; readers (HTTP, persistence)
//! take the current `Arc` without blocking anyone. Disk is a persistence
//! side-effect, never an inter-component channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use core_types::{
    AgentHeartbeat, AgentStatus, PlanStatus, PnlSummary, Position, QuoteState, RiskState, RunMode,
    SessionResult, TagSet,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaState {
    pub mode: RunMode,
    pub date: Option<NaiveDate>,
    /// IST wall clock, rendered for the UI.
    pub clock: String,
    pub sim: bool,
    pub plan_status: PlanStatus,
    pub plan_built_at: Option<NaiveDateTime>,
    pub plan_locked: bool,
    pub daily_risk_rs: f64,
    pub risk_per_trade_rs: f64,
    pub total_planned_risk_rs: f64,
    pub active_trades: u32,
    pub pnl: PnlSummary,
    pub risk_state: RiskState,
    pub batch_agent: Option<AgentHeartbeat>,
}

impl Default for MetaState {
    fn default() -> Self {
        Self {
            mode: RunMode::Paper,
            date: None,
            clock: String::new(),
            sim: false,
            plan_status: PlanStatus::Missing,
            plan_built_at: None,
            plan_locked: false,
            daily_risk_rs: 0.0,
            risk_per_trade_rs: 0.0,
            total_planned_risk_rs: 0.0,
            active_trades: 0,
            pnl: PnlSummary::default(),
            risk_state: RiskState::default(),
            batch_agent: None,
        }
    }
}

/// 09:40→15:05 outcome for one symbol, labelled at the EOD flatten.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SessionOutcome {
    pub label: SessionResult,
    pub return_pct: f64,
}

/// The whole-document shape persisted as `live_state.json`. BTreeMaps keep
/// key order stable so identical sessions produce identical bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemState {
    pub meta: MetaState,
    pub quotes: BTreeMap<String, QuoteState>,
    pub tags: BTreeMap<String, TagSet>,
    pub positions: BTreeMap<String, Position>,
    pub agents: BTreeMap<String, AgentHeartbeat>,
    pub results: BTreeMap<String, SessionOutcome>,
    pub kill_switch: bool,
}

pub struct StateStore {
    snapshot: RwLock<Arc<SystemState>>,
    version: AtomicU64,
    dirty_tx: watch::Sender<u64>,
}

impl StateStore {
    pub fn new(initial: SystemState) -> Arc<Self> {
        let (dirty_tx, _) = watch::channel(0);
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(initial)),
            version: AtomicU64::new(0),
            dirty_tx,
        })
    }

    /// Apply a delta and publish the new snapshot. Cross-family updates
    /// (e.g. positions plus P&L) go through a single call so readers never
    /// observe a torn state.
    pub fn apply<F>(&self, mutate: F) -> u64
    where
        F: FnOnce(&mut SystemState),
    {
        let mut guard = self.snapshot.write();
        let mut next = SystemState::clone(&guard);
        mutate(&mut next);
        *guard = Arc::new(next);
        drop(guard);

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.dirty_tx.send(version);
        metrics::counter!("state_applies_total").increment(1);
        version
    }

    pub fn snapshot(&self) -> Arc<SystemState> {
        self.snapshot.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn subscribe_dirty(&self) -> watch::Receiver<u64> {
        self.dirty_tx.subscribe()
    }

    /// Record liveness for a runtime component.
    pub fn heartbeat(&self, component: &str, status: AgentStatus, detail: &str, now: NaiveDateTime) {
        self.apply(|state| {
            state.agents.insert(
                component.to_string(),
                AgentHeartbeat {
                    component: component.to_string(),
                    status,
                    detail: detail.to_string(),
                    last_heartbeat_ts: now,
                },
            );
        });
    }

    /// Atomic whole-document write: tmp file then rename.
    pub fn persist_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("create state dir")?;
            }
        }
        let snapshot = self.snapshot();
        let body = serde_json::to_vec_pretty(snapshot.as_ref()).context("encode state")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &body).context("write state tmp")?;
        std::fs::rename(&tmp, path).context("rename state tmp")?;
        metrics::counter!("state_persists_total").increment(1);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Option<SystemState>> {
        match std::fs::read(path) {
            Ok(body) => {
                let state = serde_json::from_slice(&body)
                    .with_context(|| format!("decode {}", path.display()))?;
                Ok(Some(state))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("read persisted state"),
        }
    }
}

/// Debounced persistence loop: waits for a dirty signal, coalesces bursts,
/// writes atomically, and warns when a write blows the soft deadline. Runs
/// a final write on shutdown so restarts resume from the latest state.
pub async fn run_persistence(
    store: Arc<StateStore>,
    path: PathBuf,
    debounce: Duration,
    soft_deadline: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dirty = store.subscribe_dirty();
    let mut written: u64 = 0;
    loop {
        // Version comparison (rather than the watch alone) also covers
        // updates applied before this task subscribed or during a write.
        if store.version() > written {
            tokio::time::sleep(debounce).await;
            dirty.borrow_and_update();
            written = store.version();
            persist_with_deadline(&store, &path, soft_deadline);
            continue;
        }
        tokio::select! {
            changed = dirty.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    if store.version() > written {
        persist_with_deadline(&store, &path, soft_deadline);
    }
}

fn persist_with_deadline(store: &StateStore, path: &Path, soft_deadline: Duration) {
    let started = Instant::now();
    if let Err(err) = store.persist_to(path) {
        tracing::warn!(?err, "state persist failed");
        return;
    }
    let elapsed = started.elapsed();
    if elapsed > soft_deadline {
        tracing::warn!(?elapsed, "state persist exceeded soft deadline");
    }
}
