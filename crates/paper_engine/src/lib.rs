//! Intraday paper execution: tracks live quotes against the locked plan,
//! simulates limit fills, enforces stop/target/time exits and the daily
//! loss latch, and journals every simulated execution.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use core_types::{
    fill_id, Direction, ExitReason, Fill, FillReason, Pick, PnlSummary, PortfolioPlan, Position,
    PositionStatus, RiskState, RiskStatus, Side,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub fills: Vec<Fill>,
    pub changed: bool,
}

/// One engine per session day. The engine is the single writer for position
/// state; callers feed it quote maps at a fixed cadence (or per tick in
/// replay) and publish the results into shared state.
#[derive(Debug)]
pub struct PaperEngine {
    positions: BTreeMap<String, Position>,
    daily_risk_rs: f64,
    halted: bool,
    halt_reason: Option<String>,
}

impl PaperEngine {
    /// Seed PENDING positions from the locked plan's non-ABSTAIN rows.
    pub fn from_plan(plan: &PortfolioPlan) -> Self {
        let mut positions = BTreeMap::new();
        for row in &plan.plans {
            let Some(direction) = row.pick.direction() else {
                continue;
            };
            let (Some(entry), Some(stop), Some(tp1), Some(tp2)) =
                (row.entry, row.stop, row.tp1, row.tp2)
            else {
                continue;
            };
            if row.qty == 0 {
                continue;
            }
            positions.insert(
                row.symbol.clone(),
                Position {
                    symbol: row.symbol.clone(),
                    direction,
                    status: PositionStatus::Pending,
                    qty: row.qty,
                    remaining_qty: row.qty,
                    entry_price: entry,
                    stop,
                    tp1,
                    tp2,
                    tp1_done: false,
                    cancelled: false,
                    opened_at: None,
                    closed_at: None,
                    open_pnl_rs: 0.0,
                    realized_pnl_rs: 0.0,
                    exit_reason: None,
                },
            );
        }
        Self {
            positions,
            daily_risk_rs: plan.daily_risk_rs,
            halted: false,
            halt_reason: None,
        }
    }

    /// Rebuild from persisted state after a mid-day restart. OPEN positions
    /// resume tracking without a new entry fill; the loss latch re-arms from
    /// the already-realized total.
    pub fn resume(positions: BTreeMap<String, Position>, daily_risk_rs: f64) -> Self {
        let mut engine = Self {
            positions,
            daily_risk_rs,
            halted: false,
            halt_reason: None,
        };
        if engine.realized_total() < -daily_risk_rs {
            engine.halted = true;
            engine.halt_reason = Some("daily_loss_limit".to_string());
        }
        engine
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn realized_total(&self) -> f64 {
        self.positions.values().map(|p| p.realized_pnl_rs).sum()
    }

    pub fn pnl(&self) -> PnlSummary {
        let realized = self.realized_total();
        let open: f64 = self
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.open_pnl_rs)
            .sum();
        PnlSummary {
            day: realized + open,
            open,
            realized,
        }
    }

    pub fn risk_state(&self) -> RiskState {
        if self.halted {
            RiskState {
                status: RiskStatus::Halted,
                reason: self
                    .halt_reason
                    .clone()
                    .unwrap_or_else(|| "halted".to_string()),
            }
        } else {
            RiskState::default()
        }
    }

    pub fn has_live_positions(&self) -> bool {
        self.positions
            .values()
            .any(|p| p.status != PositionStatus::Closed)
    }

    /// One evaluation pass. `entries_open` and `past_eod` come from the
    /// timeline gate; `kill` is the operator switch.
    pub fn on_cycle(
        &mut self,
        now: NaiveDateTime,
        quotes: &BTreeMap<String, f64>,
        entries_open: bool,
        past_eod: bool,
        kill: bool,
    ) -> CycleReport {
        let mut report = CycleReport::default();

        if kill {
            self.flatten_all(now, quotes, ExitReason::Kill, &mut report);
            return report;
        }
        if past_eod {
            self.flatten_all(now, quotes, ExitReason::Time, &mut report);
            return report;
        }

        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        for symbol in symbols {
            let Some(&ltp) = quotes.get(&symbol) else {
                continue;
            };
            self.step_position(&symbol, ltp, now, entries_open, &mut report);
        }

        // One-way latch: realized losses beyond the daily budget cancel all
        // pending entries and block new ones for the rest of the session.
        if !self.halted && self.realized_total() < -self.daily_risk_rs {
            self.halted = true;
            self.halt_reason = Some("daily_loss_limit".to_string());
            for position in self.positions.values_mut() {
                if position.status == PositionStatus::Pending {
                    position.status = PositionStatus::Closed;
                    position.cancelled = true;
                    position.closed_at = Some(now);
                    report.changed = true;
                }
            }
            tracing::warn!(realized = self.realized_total(), "daily loss latch tripped");
            metrics::counter!("paper_daily_loss_halts_total").increment(1);
        }

        report
    }

    fn step_position(
        &mut self,
        symbol: &str,
        ltp: f64,
        now: NaiveDateTime,
        entries_open: bool,
        report: &mut CycleReport,
    ) {
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };

        if position.status == PositionStatus::Pending && entries_open && !self.halted {
            let crossed = match position.direction {
                Direction::Long => ltp >= position.entry_price,
                Direction::Short => ltp <= position.entry_price,
            };
            if crossed {
                position.status = PositionStatus::Open;
                position.opened_at = Some(now);
                report.fills.push(Fill {
                    id: fill_id(symbol, FillReason::Entry, now),
                    symbol: symbol.to_string(),
                    side: entry_side(position.direction),
                    qty: position.qty,
                    price: position.entry_price,
                    ts: now,
                    reason: FillReason::Entry,
                });
                report.changed = true;
                metrics::counter!("paper_entries_total").increment(1);
            }
        }

        if position.status != PositionStatus::Open {
            return;
        }

        let sign = position.direction.signed();

        // Stop before target within the same tick; ties go against the
        // trader. After TP1 the stop sits at entry (break-even trail).
        let stop_hit = match position.direction {
            Direction::Long => ltp <= position.stop,
            Direction::Short => ltp >= position.stop,
        };
        if stop_hit {
            let price = position.stop;
            let qty = position.remaining_qty;
            position.realized_pnl_rs += f64::from(qty) * (price - position.entry_price) * sign;
            close_position(position, now, ExitReason::Sl);
            report.fills.push(Fill {
                id: fill_id(symbol, FillReason::Sl, now),
                symbol: symbol.to_string(),
                side: exit_side(position.direction),
                qty,
                price,
                ts: now,
                reason: FillReason::Sl,
            });
            report.changed = true;
            metrics::counter!("paper_exits_total", "reason" => "sl").increment(1);
            return;
        }

        if !position.tp1_done {
            let tp1_hit = match position.direction {
                Direction::Long => ltp >= position.tp1,
                Direction::Short => ltp <= position.tp1,
            };
            if tp1_hit {
                let half = position.qty / 2;
                position.tp1_done = true;
                position.stop = position.entry_price;
                if half > 0 {
                    position.remaining_qty -= half;
                    position.realized_pnl_rs +=
                        f64::from(half) * (position.tp1 - position.entry_price) * sign;
                    report.fills.push(Fill {
                        id: fill_id(symbol, FillReason::Tp1, now),
                        symbol: symbol.to_string(),
                        side: exit_side(position.direction),
                        qty: half,
                        price: position.tp1,
                        ts: now,
                        reason: FillReason::Tp1,
                    });
                    metrics::counter!("paper_exits_total", "reason" => "tp1").increment(1);
                }
                report.changed = true;
            }
        }

        if position.tp1_done && position.status == PositionStatus::Open {
            let tp2_hit = match position.direction {
                Direction::Long => ltp >= position.tp2,
                Direction::Short => ltp <= position.tp2,
            };
            if tp2_hit {
                let price = position.tp2;
                let qty = position.remaining_qty;
                position.realized_pnl_rs += f64::from(qty) * (price - position.entry_price) * sign;
                close_position(position, now, ExitReason::Tp2);
                report.fills.push(Fill {
                    id: fill_id(symbol, FillReason::Tp2, now),
                    symbol: symbol.to_string(),
                    side: exit_side(position.direction),
                    qty,
                    price,
                    ts: now,
                    reason: FillReason::Tp2,
                });
                report.changed = true;
                metrics::counter!("paper_exits_total", "reason" => "tp2").increment(1);
                return;
            }
        }

        if position.status == PositionStatus::Open {
            let open_pnl =
                f64::from(position.remaining_qty) * (ltp - position.entry_price) * sign;
            if (open_pnl - position.open_pnl_rs).abs() > f64::EPSILON {
                position.open_pnl_rs = open_pnl;
                report.changed = true;
            }
        }
    }

    fn flatten_all(
        &mut self,
        now: NaiveDateTime,
        quotes: &BTreeMap<String, f64>,
        reason: ExitReason,
        report: &mut CycleReport,
    ) {
        let fill_reason = match reason {
            ExitReason::Kill => FillReason::Kill,
            _ => FillReason::Time,
        };
        for position in self.positions.values_mut() {
            match position.status {
                PositionStatus::Pending => {
                    position.status = PositionStatus::Closed;
                    position.cancelled = true;
                    position.closed_at = Some(now);
                    position.exit_reason = Some(reason);
                    report.changed = true;
                }
                PositionStatus::Open => {
                    let price = match quotes.get(&position.symbol) {
                        Some(&ltp) => ltp,
                        None => {
                            tracing::warn!(
                                symbol = %position.symbol,
                                "no quote at flatten; exiting at entry"
                            );
                            position.entry_price
                        }
                    };
                    let qty = position.remaining_qty;
                    position.realized_pnl_rs +=
                        f64::from(qty) * (price - position.entry_price) * position.direction.signed();
                    close_position(position, now, reason);
                    report.fills.push(Fill {
                        id: fill_id(&position.symbol, fill_reason, now),
                        symbol: position.symbol.clone(),
                        side: exit_side(position.direction),
                        qty,
                        price,
                        ts: now,
                        reason: fill_reason,
                    });
                    report.changed = true;
                }
                PositionStatus::Closed => {}
            }
        }
    }
}

fn close_position(position: &mut Position, now: NaiveDateTime, reason: ExitReason) {
    position.status = PositionStatus::Closed;
    position.remaining_qty = 0;
    position.open_pnl_rs = 0.0;
    position.closed_at = Some(now);
    position.exit_reason = Some(reason);
}

fn entry_side(direction: Direction) -> Side {
    match direction {
        Direction::Long => Side::Buy,
        Direction::Short => Side::Sell,
    }
}

fn exit_side(direction: Direction) -> Side {
    match direction {
        Direction::Long => Side::Sell,
        Direction::Short => Side::Buy,
    }
}

/// Append-only JSONL journal of simulated executions.
pub struct FillJournal {
    file: File,
}

impl FillJournal {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("create journal dir")?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context("open fill journal")?;
        Ok(Self { file })
    }

    pub async fn write(&mut self, fill: &Fill) -> Result<()> {
        let line = serde_json::to_string(fill).context("encode fill")?;
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await.context("flush fill journal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use core_types::{Level, PlanRow, PlanTags};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn plan_row(symbol: &str, pick: Pick, entry: f64, stop: f64, tp1: f64, tp2: f64, qty: u32) -> PlanRow {
        PlanRow {
            symbol: symbol.to_string(),
            pick,
            confidence: 70,
            level: Level::L3,
            samples: 10,
            entry: Some(entry),
            stop: Some(stop),
            tp1: Some(tp1),
            tp2: Some(tp2),
            qty,
            r_per_share: Some((entry - stop).abs()),
            reason: "test".to_string(),
            tags: PlanTags::default(),
        }
    }

    fn plan_of(rows: Vec<PlanRow>, daily_risk_rs: f64) -> PortfolioPlan {
        let active = rows.iter().filter(|r| r.pick != Pick::Abstain).count() as u32;
        PortfolioPlan {
            date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
            daily_risk_rs,
            risk_per_trade_rs: 1000.0,
            total_planned_risk_rs: 0.0,
            active_trades: active,
            plans: rows,
        }
    }

    fn quotes(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect()
    }

    #[test]
    fn bull_tp1_then_time_exit() {
        let plan = plan_of(
            vec![plan_row("ALPHA", Pick::Bull, 100.0, 99.2, 100.8, 101.6, 1250)],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);

        // Entry crossed.
        let r = engine.on_cycle(at(9, 41), &quotes(&[("ALPHA", 100.10)]), true, false, false);
        assert_eq!(r.fills.len(), 1);
        assert_eq!(r.fills[0].reason, FillReason::Entry);
        assert_eq!(r.fills[0].price, 100.0);

        engine.on_cycle(at(9, 45), &quotes(&[("ALPHA", 100.50)]), true, false, false);

        // TP1: half out at 100.80, stop trails to entry.
        let r = engine.on_cycle(at(10, 0), &quotes(&[("ALPHA", 100.80)]), true, false, false);
        assert_eq!(r.fills.len(), 1);
        assert_eq!(r.fills[0].reason, FillReason::Tp1);
        assert_eq!(r.fills[0].qty, 625);
        let pos = &engine.positions()["ALPHA"];
        assert_eq!(pos.remaining_qty, 625);
        assert_eq!(pos.stop, 100.0);
        assert!((pos.realized_pnl_rs - 500.0).abs() < 1e-9);

        // Drifts but never reaches TP2 or the break-even stop.
        engine.on_cycle(at(11, 0), &quotes(&[("ALPHA", 100.60)]), true, false, false);
        engine.on_cycle(at(13, 0), &quotes(&[("ALPHA", 100.30)]), true, false, false);

        // 15:05 force-flat of the remainder.
        let r = engine.on_cycle(at(15, 5), &quotes(&[("ALPHA", 100.20)]), false, true, false);
        assert_eq!(r.fills.len(), 1);
        assert_eq!(r.fills[0].reason, FillReason::Time);
        assert_eq!(r.fills[0].qty, 625);
        let pos = &engine.positions()["ALPHA"];
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.exit_reason, Some(ExitReason::Time));
        assert!((pos.realized_pnl_rs - 625.0).abs() < 1e-9);
        assert_eq!(engine.pnl().open, 0.0);
    }

    #[test]
    fn bear_stop_loss_fills_at_stop() {
        let plan = plan_of(
            vec![plan_row("BETA", Pick::Bear, 500.0, 504.0, 496.0, 492.0, 250)],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);

        engine.on_cycle(at(9, 41), &quotes(&[("BETA", 499.0)]), true, false, false);
        assert_eq!(engine.positions()["BETA"].status, PositionStatus::Open);

        engine.on_cycle(at(9, 43), &quotes(&[("BETA", 501.0)]), true, false, false);
        engine.on_cycle(at(9, 45), &quotes(&[("BETA", 503.5)]), true, false, false);
        let r = engine.on_cycle(at(9, 47), &quotes(&[("BETA", 504.2)]), true, false, false);
        assert_eq!(r.fills.len(), 1);
        assert_eq!(r.fills[0].reason, FillReason::Sl);
        assert_eq!(r.fills[0].price, 504.0);
        let pos = &engine.positions()["BETA"];
        assert_eq!(pos.exit_reason, Some(ExitReason::Sl));
        assert!((pos.realized_pnl_rs + 1000.0).abs() < 1e-9);
    }

    #[test]
    fn exact_touch_closes_in_that_tick() {
        let plan = plan_of(
            vec![plan_row("ALPHA", Pick::Bull, 100.0, 99.0, 101.0, 102.0, 10)],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);
        engine.on_cycle(at(9, 41), &quotes(&[("ALPHA", 100.0)]), true, false, false);
        let r = engine.on_cycle(at(9, 42), &quotes(&[("ALPHA", 99.0)]), true, false, false);
        assert_eq!(r.fills[0].reason, FillReason::Sl);
    }

    #[test]
    fn short_stopped_out_on_adverse_spike() {
        let plan = plan_of(
            vec![plan_row("ALPHA", Pick::Bear, 100.0, 101.0, 99.0, 98.0, 10)],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);
        engine.on_cycle(at(9, 41), &quotes(&[("ALPHA", 100.0)]), true, false, false);
        let r = engine.on_cycle(at(9, 42), &quotes(&[("ALPHA", 101.5)]), true, false, false);
        assert_eq!(r.fills[0].reason, FillReason::Sl);
        assert_eq!(r.fills[0].price, 101.0);
        assert_eq!(engine.positions()["ALPHA"].exit_reason, Some(ExitReason::Sl));
    }

    #[test]
    fn gap_through_both_targets_exits_fully() {
        let plan = plan_of(
            vec![plan_row("ALPHA", Pick::Bull, 100.0, 99.0, 101.0, 102.0, 100)],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);
        engine.on_cycle(at(9, 41), &quotes(&[("ALPHA", 100.0)]), true, false, false);
        let r = engine.on_cycle(at(9, 50), &quotes(&[("ALPHA", 102.5)]), true, false, false);
        let reasons: Vec<FillReason> = r.fills.iter().map(|f| f.reason).collect();
        assert_eq!(reasons, vec![FillReason::Tp1, FillReason::Tp2]);
        let pos = &engine.positions()["ALPHA"];
        assert_eq!(pos.status, PositionStatus::Closed);
        // 50 out at tp1 (+50), 50 out at tp2 (+100).
        assert!((pos.realized_pnl_rs - 150.0).abs() < 1e-9);
    }

    #[test]
    fn pending_never_crossed_cancels_at_eod() {
        let plan = plan_of(
            vec![plan_row("ALPHA", Pick::Bull, 100.0, 99.0, 101.0, 102.0, 10)],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);
        engine.on_cycle(at(10, 0), &quotes(&[("ALPHA", 99.5)]), true, false, false);
        assert_eq!(engine.positions()["ALPHA"].status, PositionStatus::Pending);

        let r = engine.on_cycle(at(15, 5), &quotes(&[("ALPHA", 99.5)]), false, true, false);
        assert!(r.fills.is_empty());
        let pos = &engine.positions()["ALPHA"];
        assert_eq!(pos.status, PositionStatus::Closed);
        assert!(pos.cancelled);
        assert_eq!(pos.exit_reason, Some(ExitReason::Time));
    }

    #[test]
    fn kill_switch_flattens_open_and_cancels_pending() {
        let plan = plan_of(
            vec![
                plan_row("ALPHA", Pick::Bull, 100.0, 99.0, 101.0, 102.0, 10),
                plan_row("BETA", Pick::Bear, 50.0, 51.0, 49.0, 48.0, 10),
            ],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);
        engine.on_cycle(at(9, 41), &quotes(&[("ALPHA", 100.2)]), true, false, false);

        let r = engine.on_cycle(
            at(10, 0),
            &quotes(&[("ALPHA", 100.5), ("BETA", 49.9)]),
            true,
            false,
            true,
        );
        assert_eq!(r.fills.len(), 1);
        assert_eq!(r.fills[0].reason, FillReason::Kill);
        assert_eq!(r.fills[0].price, 100.5);
        assert_eq!(
            engine.positions()["ALPHA"].exit_reason,
            Some(ExitReason::Kill)
        );
        let beta = &engine.positions()["BETA"];
        assert!(beta.cancelled);
        assert_eq!(beta.exit_reason, Some(ExitReason::Kill));
    }

    #[test]
    fn daily_loss_latch_cancels_pending_and_blocks_entries() {
        let plan = plan_of(
            vec![
                plan_row("A1", Pick::Bull, 100.0, 55.0, 145.0, 190.0, 100),
                plan_row("A2", Pick::Bull, 100.0, 70.0, 130.0, 160.0, 100),
                plan_row("A3", Pick::Bull, 100.0, 68.0, 132.0, 164.0, 100),
                plan_row("A4", Pick::Bull, 100.0, 99.0, 101.0, 102.0, 10),
            ],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);

        // Open three, leave the fourth pending below its entry.
        engine.on_cycle(
            at(9, 41),
            &quotes(&[("A1", 100.0), ("A2", 100.0), ("A3", 100.0), ("A4", 99.0)]),
            true,
            false,
            false,
        );
        // Stops: −4500, −3000, −3200 → −10700 realized.
        let r = engine.on_cycle(
            at(10, 0),
            &quotes(&[("A1", 55.0), ("A2", 70.0), ("A3", 68.0), ("A4", 99.0)]),
            true,
            false,
            false,
        );
        assert_eq!(r.fills.len(), 3);
        assert!((engine.realized_total() + 10_700.0).abs() < 1e-9);
        assert_eq!(engine.risk_state().status, RiskStatus::Halted);
        assert_eq!(engine.risk_state().reason, "daily_loss_limit");

        let a4 = &engine.positions()["A4"];
        assert_eq!(a4.status, PositionStatus::Closed);
        assert!(a4.cancelled);

        // Latch is one-way: a crossing quote no longer opens anything.
        let r = engine.on_cycle(at(10, 5), &quotes(&[("A4", 100.5)]), true, false, false);
        assert!(r.fills.is_empty());
    }

    #[test]
    fn resume_keeps_open_position_without_refilling() {
        let plan = plan_of(
            vec![plan_row("ALPHA", Pick::Bull, 100.0, 99.0, 101.0, 102.0, 10)],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);
        engine.on_cycle(at(9, 41), &quotes(&[("ALPHA", 100.2)]), true, false, false);
        let persisted = engine.positions().clone();

        let mut resumed = PaperEngine::resume(persisted, 10_000.0);
        let r = resumed.on_cycle(at(11, 30), &quotes(&[("ALPHA", 100.6)]), true, false, false);
        assert!(r.fills.is_empty());
        let pos = &resumed.positions()["ALPHA"];
        assert_eq!(pos.status, PositionStatus::Open);
        assert!((pos.open_pnl_rs - 6.0).abs() < 1e-9);
    }

    #[test]
    fn closed_realized_matches_qty_times_move() {
        let plan = plan_of(
            vec![plan_row("ALPHA", Pick::Bull, 100.0, 99.0, 101.0, 102.0, 40)],
            10_000.0,
        );
        let mut engine = PaperEngine::from_plan(&plan);
        engine.on_cycle(at(9, 41), &quotes(&[("ALPHA", 100.0)]), true, false, false);
        engine.on_cycle(at(9, 45), &quotes(&[("ALPHA", 99.0)]), true, false, false);
        let pos = &engine.positions()["ALPHA"];
        assert_eq!(pos.exit_reason, Some(ExitReason::Sl));
        assert!((pos.realized_pnl_rs - 40.0 * (99.0 - 100.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn journal_appends_one_line_per_fill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fills.jsonl");
        let mut journal = FillJournal::open(&path).await.expect("open");
        let fill = Fill {
            id: fill_id("ALPHA", FillReason::Entry, at(9, 41)),
            symbol: "ALPHA".to_string(),
            side: Side::Buy,
            qty: 10,
            price: 100.0,
            ts: at(9, 41),
            reason: FillReason::Entry,
        };
        journal.write(&fill).await.expect("write");
        journal.write(&fill).await.expect("write");
        journal.flush().await.expect("flush");

        let body = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(body.lines().count(), 2);
        let parsed: Fill = serde_json::from_str(body.lines().next().unwrap()).expect("parse");
        assert_eq!(parsed.symbol, "ALPHA");
    }
}
