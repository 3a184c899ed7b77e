//! Startup wiring: load read-only inputs, decide the session day, rebuild
//! the frequency table, and rehydrate any persisted mid-day state.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use core_types::{Bar, RunMode};
use freq_table::FrequencyTable;
use infra_clock::{IstWallClock, SessionClock};
use market_store::{load_intraday, MasterStore};
use plan_builder::SnapshotStore;
use state_store::{StateStore, SystemState};

use crate::config::AppConfig;
use crate::engine::ResumeState;

/// Maps to the process exit-code contract: config problems exit 1, missing
/// startup dependencies exit 2.
#[derive(Debug)]
pub enum StartupFailure {
    Config(anyhow::Error),
    Dependency(anyhow::Error),
}

impl StartupFailure {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Dependency(_) => 2,
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        match self {
            Self::Config(err) | Self::Dependency(err) => err,
        }
    }
}

pub struct Runtime {
    pub cfg: AppConfig,
    pub state: Arc<StateStore>,
    pub masters: Arc<MasterStore>,
    pub freq: Arc<FrequencyTable>,
    pub snapshots: SnapshotStore,
    pub day: NaiveDate,
    pub resume: ResumeState,
    /// Per-symbol session bars backing the SIM replay feed.
    pub replay_bars: Option<BTreeMap<String, Vec<Bar>>>,
}

pub async fn prepare(cfg: AppConfig) -> Result<Runtime, StartupFailure> {
    let masters = MasterStore::load(&cfg.paths.masters, &cfg.symbols);
    if masters.is_empty() {
        return Err(StartupFailure::Dependency(anyhow!(
            "no master history for any universe symbol under {}",
            cfg.paths.masters.display()
        )));
    }
    let masters = Arc::new(masters);

    let (day, replay_bars) = match cfg.mode {
        RunMode::Sim => resolve_sim_day(&cfg).map_err(StartupFailure::Dependency)?,
        RunMode::Live | RunMode::Paper => (IstWallClock.now().date(), None),
    };
    tracing::info!(%day, mode = %cfg.mode, "session day resolved");

    let freq = Arc::new(FrequencyTable::build(
        &masters,
        &cfg.symbols,
        day,
        &cfg.picker,
    ));

    let snapshots = SnapshotStore::new(cfg.paths.state.clone());

    let mut resume = ResumeState::default();
    let mut initial = SystemState::default();
    if !cfg.reset_state {
        match StateStore::load(&cfg.state_file()) {
            Ok(Some(persisted)) if persisted.meta.date == Some(day) => {
                tracing::info!("resuming persisted state for {day}");
                resume.tags = persisted.tags.clone();
                resume.positions = persisted.positions.clone();
                initial = persisted;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(?err, "persisted state unreadable; starting fresh");
            }
        }
    }

    match snapshots.read(day).await {
        Ok(Some(plan)) => resume.plan = Some(plan),
        Ok(None) => {}
        Err(err) => tracing::warn!(?err, "plan snapshot unreadable; rebuilding at cutover"),
    }

    initial.meta.mode = cfg.mode;
    initial.meta.date = Some(day);
    initial.meta.sim = cfg.mode.is_sim();
    initial.meta.daily_risk_rs = cfg.risk.daily_rs;
    initial.meta.risk_per_trade_rs = cfg.risk.per_trade_rs;
    let state = StateStore::new(initial);

    Ok(Runtime {
        cfg,
        state,
        masters,
        freq,
        snapshots,
        day,
        resume,
        replay_bars,
    })
}

fn resolve_sim_day(cfg: &AppConfig) -> Result<(NaiveDate, Option<BTreeMap<String, Vec<Bar>>>)> {
    let mut series = BTreeMap::new();
    for symbol in &cfg.symbols {
        match load_intraday(&cfg.paths.intraday, symbol) {
            Ok(s) if !s.bars.is_empty() => {
                series.insert(symbol.clone(), s);
            }
            Ok(_) => tracing::warn!(%symbol, "intraday file is empty"),
            Err(err) => tracing::warn!(%symbol, ?err, "intraday file unavailable"),
        }
    }
    if series.is_empty() {
        anyhow::bail!(
            "SIM mode needs intraday bars under {}",
            cfg.paths.intraday.display()
        );
    }

    let day = match cfg.trading_day {
        Some(day) => day,
        None => series
            .values()
            .filter_map(|s| s.days().last().copied())
            .max()
            .ok_or_else(|| anyhow!("no session days in intraday data"))?,
    };

    let bars: BTreeMap<String, Vec<Bar>> = series
        .iter()
        .map(|(symbol, s)| (symbol.clone(), s.day_bars(day)))
        .filter(|(_, bars)| !bars.is_empty())
        .collect();
    if bars.is_empty() {
        anyhow::bail!("no intraday bars for {day}");
    }
    Ok((day, Some(bars)))
}
