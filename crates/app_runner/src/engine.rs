//! The session engine: a single-consumer actor owning the bar aggregator,
//! the working tag set, and the paper engine. Ticks, cadence cycles, and
//! timeline nudges all arrive on one channel, so every state family has
//! exactly one writer and a replayed day is processed in a fixed order.

use std::collections::BTreeMap;
use std::sync::Arc;

use bar_aggregator::BarAggregator;
use chrono::{NaiveDate, NaiveDateTime};
use core_types::{
    AgentStatus, Bar, DayLevels, PlanSnapshot, PlanStatus, Position, QuoteState, RiskState,
    RiskStatus, RunMode, TagSet, Tick,
};
use freq_table::FrequencyTable;
use infra_clock::SessionClock;
use market_store::MasterStore;
use paper_engine::{FillJournal, PaperEngine};
use plan_builder::{build_snapshot, SnapshotStore, SymbolInputs};
use state_store::{SessionOutcome, StateStore};
use tag_classifier as classify;
use timeline_gate::{RevealField, TimelineGate};
use tokio::sync::mpsc;

use crate::config::AppConfig;

#[derive(Debug)]
pub enum EngineEvent {
    Tick(Tick),
    /// Cadence poke from the live/paper interval task.
    Cycle,
    /// Timeline poke fired at each cutover instant.
    Nudge,
    StreamEnded,
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy)]
struct CutoverFlags {
    pdc: bool,
    ol: bool,
    plan: bool,
    eod: bool,
}

/// Carried across a restart: whatever the persisted state says the session
/// had already produced.
#[derive(Debug, Default)]
pub struct ResumeState {
    pub tags: BTreeMap<String, TagSet>,
    pub positions: BTreeMap<String, Position>,
    pub plan: Option<PlanSnapshot>,
}

pub struct EngineCore {
    cfg: AppConfig,
    clock: Arc<dyn SessionClock>,
    gate: TimelineGate,
    state: Arc<StateStore>,
    masters: Arc<MasterStore>,
    freq: Arc<FrequencyTable>,
    snapshots: SnapshotStore,
    day: NaiveDate,
    mode: RunMode,

    aggregator: BarAggregator,
    day_bars: BTreeMap<String, Vec<Bar>>,
    day_levels: BTreeMap<String, DayLevels>,
    volumes: BTreeMap<String, u64>,
    quotes: BTreeMap<String, f64>,
    quote_ts: BTreeMap<String, NaiveDateTime>,
    tags: BTreeMap<String, TagSet>,
    paper: Option<PaperEngine>,
    journal: Option<FillJournal>,
    flags: CutoverFlags,
    last_heartbeat_ts: Option<NaiveDateTime>,
}

impl EngineCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        clock: Arc<dyn SessionClock>,
        state: Arc<StateStore>,
        masters: Arc<MasterStore>,
        freq: Arc<FrequencyTable>,
        snapshots: SnapshotStore,
        day: NaiveDate,
        resume: ResumeState,
    ) -> Self {
        let mode = cfg.mode;
        let gate = TimelineGate::new(cfg.cutovers);

        let mut tags: BTreeMap<String, TagSet> = cfg
            .symbols
            .iter()
            .map(|s| (s.clone(), TagSet::default()))
            .collect();
        for (symbol, resumed) in resume.tags {
            tags.insert(symbol, resumed);
        }

        let mut flags = CutoverFlags::default();
        let mut paper = None;
        if let Some(plan) = &resume.plan {
            if plan.locked && plan.status.is_tradable() {
                flags.pdc = true;
                flags.ol = true;
                flags.plan = true;
                paper = Some(if resume.positions.is_empty() {
                    PaperEngine::from_plan(&plan.portfolio_plan)
                } else {
                    PaperEngine::resume(resume.positions, plan.portfolio_plan.daily_risk_rs)
                });
                tracing::info!(date = %plan.date, "resumed locked plan from disk");
            }
        }

        Self {
            cfg,
            clock,
            gate,
            state,
            masters,
            freq,
            snapshots,
            day,
            mode,
            aggregator: BarAggregator::new(),
            day_bars: BTreeMap::new(),
            day_levels: BTreeMap::new(),
            volumes: BTreeMap::new(),
            quotes: BTreeMap::new(),
            quote_ts: BTreeMap::new(),
            tags,
            paper,
            journal: None,
            flags,
            last_heartbeat_ts: None,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            let now = self.clock.now();
            match event {
                EngineEvent::Tick(tick) => {
                    self.on_tick(tick, now);
                    self.maybe_fire_cutovers(now).await;
                    if self.mode.is_sim() {
                        self.run_paper_cycle(now).await;
                    }
                    self.maybe_heartbeat(now);
                }
                EngineEvent::Cycle => {
                    self.maybe_fire_cutovers(now).await;
                    self.run_paper_cycle(now).await;
                    self.maybe_heartbeat(now);
                }
                EngineEvent::Nudge => {
                    self.maybe_fire_cutovers(now).await;
                    self.run_paper_cycle(now).await;
                }
                EngineEvent::StreamEnded => {
                    self.maybe_fire_cutovers(now).await;
                    if self.mode.is_sim() {
                        self.run_paper_cycle(now).await;
                        tracing::info!("replay drained; engine stopping");
                        break;
                    }
                    self.state
                        .heartbeat("tick_source", AgentStatus::Warn, "stream ended", now);
                }
                EngineEvent::Shutdown => {
                    // Open positions stay OPEN across shutdown; the next
                    // start reconciles them from persisted state.
                    tracing::info!("engine shutting down");
                    break;
                }
            }
        }
    }

    fn on_tick(&mut self, tick: Tick, now: NaiveDateTime) {
        if tick.ts.date() != self.day {
            tracing::warn!(symbol = %tick.symbol, ts = %tick.ts, "tick outside session day; dropped");
            return;
        }
        metrics::counter!("ticks_total").increment(1);

        if self.cfg.engine.enable_agg5 {
            if let Some(bar) = self.aggregator.on_tick(&tick) {
                self.absorb_bar(bar);
            }
            for bar in self.aggregator.flush_until(now) {
                self.absorb_bar(bar);
            }
        }

        let levels = self
            .day_levels
            .entry(tick.symbol.clone())
            .or_insert(DayLevels {
                o: tick.ltp,
                h: tick.ltp,
                l: tick.ltp,
                c: tick.ltp,
            });
        levels.h = levels.h.max(tick.ltp);
        levels.l = levels.l.min(tick.ltp);
        levels.c = tick.ltp;
        let levels = *levels;

        let volume = {
            let v = self.volumes.entry(tick.symbol.clone()).or_insert(0);
            *v = v.saturating_add(tick.volume);
            *v
        };
        self.quotes.insert(tick.symbol.clone(), tick.ltp);
        self.quote_ts.insert(tick.symbol.clone(), tick.ts);

        let change_pct = self
            .masters
            .prev_session(&tick.symbol, self.day)
            .map(|prev| 100.0 * (tick.ltp - prev.ohlc.close) / prev.ohlc.close)
            .unwrap_or(0.0);

        let clock_label = format!("{} IST", now.format("%Y-%m-%d %H:%M:%S"));
        let symbol = tick.symbol.clone();
        let ts = tick.ts;
        let ltp = tick.ltp;
        self.state.apply(move |state| {
            state.meta.clock = clock_label;
            let entry = state.quotes.entry(symbol).or_insert(QuoteState {
                ltp,
                last_update: ts,
                ohlc: levels,
                volume,
                change_pct,
            });
            entry.ltp = ltp;
            // last_update is monotone per symbol even if ticks arrive late
            entry.last_update = entry.last_update.max(ts);
            entry.ohlc = levels;
            entry.volume = volume;
            entry.change_pct = change_pct;
        });
    }

    fn absorb_bar(&mut self, bar: Bar) {
        metrics::counter!("bars_sealed_total").increment(1);
        self.day_bars.entry(bar.symbol.clone()).or_default().push(bar);
    }

    async fn maybe_fire_cutovers(&mut self, now: NaiveDateTime) {
        if !self.flags.pdc
            && self
                .gate
                .reveal(RevealField::TagPdc, now, PlanStatus::Missing, false)
        {
            self.fire_pdc(now);
            self.flags.pdc = true;
        }
        if !self.flags.ol
            && self
                .gate
                .reveal(RevealField::TagOl, now, PlanStatus::Missing, false)
        {
            self.fire_ol(now);
            self.flags.ol = true;
        }
        if !self.flags.plan
            && self
                .gate
                .reveal(RevealField::TagOt, now, PlanStatus::Missing, false)
        {
            self.fire_ot_and_plan(now).await;
            self.flags.plan = true;
        }
        if !self.flags.eod && self.gate.past_eod(now) {
            self.run_paper_cycle(now).await;
            self.label_session_results();
            self.flags.eod = true;
        }
    }

    fn fire_pdc(&mut self, now: NaiveDateTime) {
        for symbol in &self.cfg.symbols {
            let Some(tag_set) = self.tags.get_mut(symbol) else {
                continue;
            };
            if tag_set.pdc.is_some() {
                continue;
            }
            match self.masters.prev_session(symbol, self.day) {
                Some(prev) => {
                    tag_set.pdc = Some(classify::prev_day_context(
                        &prev.ohlc,
                        &self.cfg.classifier,
                    ));
                    tag_set.pdc_computed_at = Some(now);
                }
                None => {
                    tracing::warn!(%symbol, "no prior session; PDC stays null");
                }
            }
        }
        self.publish_tags();
        tracing::info!("PDC cutover done");
    }

    fn fire_ol(&mut self, now: NaiveDateTime) {
        for symbol in &self.cfg.symbols {
            let Some(tag_set) = self.tags.get_mut(symbol) else {
                continue;
            };
            if tag_set.ol.is_some() {
                continue;
            }
            let day_open = self.day_levels.get(symbol).map(|l| l.o);
            let prev = self.masters.prev_session(symbol, self.day);
            if let (Some(open), Some(prev)) = (day_open, prev) {
                tag_set.ol = classify::open_location(open, &prev.ohlc, &self.cfg.classifier);
                if tag_set.ol.is_some() {
                    tag_set.ol_computed_at = Some(now);
                }
            } else {
                tracing::warn!(%symbol, "open location inputs missing; OL stays null");
            }
        }
        self.publish_tags();
        tracing::info!("OL cutover done");
    }

    async fn fire_ot_and_plan(&mut self, now: NaiveDateTime) {
        for bar in self.aggregator.flush_until(now) {
            self.absorb_bar(bar);
        }

        for symbol in &self.cfg.symbols {
            let Some(tag_set) = self.tags.get_mut(symbol) else {
                continue;
            };
            if tag_set.ot.is_some() {
                continue;
            }
            let bars = self.day_bars.get(symbol).cloned().unwrap_or_default();
            let has_opening_bars = bars
                .iter()
                .any(|b| b.start.time() >= self.gate.cutovers().session_open);
            if has_opening_bars {
                tag_set.ot = Some(classify::opening_trend(&bars, &self.cfg.classifier));
                tag_set.ot_computed_at = Some(now);
            } else {
                tracing::warn!(%symbol, "no opening bars; OT stays null");
            }
        }
        self.publish_tags();
        tracing::info!("OT cutover done");

        self.state
            .apply(|state| state.meta.plan_status = PlanStatus::Building);

        let inputs: BTreeMap<String, SymbolInputs> = self
            .cfg
            .symbols
            .iter()
            .map(|symbol| {
                let tag_set = self.tags.get(symbol).cloned().unwrap_or_default();
                (
                    symbol.clone(),
                    SymbolInputs {
                        pdc: tag_set.pdc,
                        ol: tag_set.ol,
                        ot: tag_set.ot,
                        day_bars: self.day_bars.get(symbol).cloned().unwrap_or_default(),
                    },
                )
            })
            .collect();

        let snapshot = build_snapshot(
            self.day,
            self.mode,
            now,
            &self.cfg.symbols,
            &inputs,
            &self.freq,
            &self.cfg.picker,
            &self.cfg.risk,
        );

        match self.snapshots.write(&snapshot).await {
            Ok(()) => {
                self.publish_plan(&snapshot);
                if snapshot.locked {
                    self.paper = Some(PaperEngine::from_plan(&snapshot.portfolio_plan));
                    tracing::info!(
                        status = ?snapshot.status,
                        active = snapshot.portfolio_plan.active_trades,
                        "plan locked"
                    );
                } else {
                    self.state.heartbeat(
                        "plan_builder",
                        AgentStatus::Warn,
                        "no symbols resolvable",
                        now,
                    );
                }
            }
            Err(err) => {
                tracing::error!(?err, "plan snapshot write failed; halting new trading");
                self.state.apply(|state| {
                    state.meta.plan_status = PlanStatus::Failed;
                    state.meta.plan_locked = false;
                    state.meta.risk_state = RiskState {
                        status: RiskStatus::Halted,
                        reason: "snapshot_write_failed".to_string(),
                    };
                });
            }
        }
    }

    fn publish_tags(&self) {
        let tags = self.tags.clone();
        self.state.apply(move |state| {
            state.tags = tags;
        });
    }

    fn publish_plan(&self, snapshot: &PlanSnapshot) {
        let status = snapshot.status;
        let locked = snapshot.locked;
        let built_at = snapshot.built_at;
        let plan = snapshot.portfolio_plan.clone();
        self.state.apply(move |state| {
            state.meta.plan_status = status;
            state.meta.plan_locked = locked;
            state.meta.plan_built_at = Some(built_at);
            state.meta.daily_risk_rs = plan.daily_risk_rs;
            state.meta.risk_per_trade_rs = plan.risk_per_trade_rs;
            state.meta.total_planned_risk_rs = plan.total_planned_risk_rs;
            state.meta.active_trades = plan.active_trades;
        });
    }

    async fn run_paper_cycle(&mut self, now: NaiveDateTime) {
        let Some(paper) = &mut self.paper else {
            return;
        };
        let kill = self.state.snapshot().kill_switch;
        let entries_open = self.gate.entries_open(now);
        let past_eod = self.gate.past_eod(now);

        // Quotes that have gone stale must not open or close positions. In
        // replay the clock only moves on ticks, so nothing ever ages out.
        let quotes: BTreeMap<String, f64> = if self.mode.is_sim() {
            self.quotes.clone()
        } else {
            self.quotes
                .iter()
                .filter(|(symbol, _)| {
                    self.quote_ts
                        .get(*symbol)
                        .is_some_and(|ts| (now - *ts) <= chrono::Duration::seconds(10))
                })
                .map(|(symbol, ltp)| (symbol.clone(), *ltp))
                .collect()
        };

        let report = paper.on_cycle(now, &quotes, entries_open, past_eod, kill);

        if !report.fills.is_empty() {
            if self.journal.is_none() {
                match FillJournal::open(self.cfg.journal_file(self.day)).await {
                    Ok(journal) => self.journal = Some(journal),
                    Err(err) => tracing::error!(?err, "fill journal unavailable"),
                }
            }
            if let Some(journal) = &mut self.journal {
                for fill in &report.fills {
                    if let Err(err) = journal.write(fill).await {
                        tracing::warn!(?err, "fill journal write failed");
                    }
                }
                if let Err(err) = journal.flush().await {
                    tracing::warn!(?err, "fill journal flush failed");
                }
            }
            metrics::counter!("fills_total").increment(report.fills.len() as u64);
        }

        if report.changed {
            let positions = paper.positions().clone();
            let pnl = paper.pnl();
            let risk = if kill {
                RiskState {
                    status: RiskStatus::Halted,
                    reason: "kill_switch".to_string(),
                }
            } else {
                paper.risk_state()
            };
            self.state.apply(move |state| {
                state.positions = positions;
                state.meta.pnl = pnl;
                state.meta.risk_state = risk;
            });
        }
    }

    fn label_session_results(&mut self) {
        let mut results = BTreeMap::new();
        for (symbol, bars) in &self.day_bars {
            let (label, return_pct) = classify::session_result(bars, &self.cfg.classifier);
            results.insert(
                symbol.clone(),
                SessionOutcome {
                    label,
                    return_pct,
                },
            );
        }
        if results.is_empty() {
            return;
        }
        self.state.apply(move |state| {
            state.results = results;
        });
    }

    fn maybe_heartbeat(&mut self, now: NaiveDateTime) {
        let due = match self.last_heartbeat_ts {
            Some(last) => (now - last) >= chrono::Duration::seconds(2),
            None => true,
        };
        if !due {
            return;
        }
        self.last_heartbeat_ts = Some(now);
        let detail = if self.paper.is_some() {
            "tracking plan"
        } else if self.flags.plan {
            "idle (no tradable plan)"
        } else {
            "pre-plan"
        };
        self.state
            .heartbeat("engine", AgentStatus::Ok, detail, now);
    }
}
