//! Assembles the 09:40 portfolio plan and freezes it into the daily
//! snapshot artifact.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use core_types::{
    Bar, Level, OpenLocation, OpeningTrend, Pick, PlanRow, PlanSnapshot, PlanStatus, PlanTags,
    PortfolioPlan, PrevDayContext, RunMode,
};
use freq_table::{FrequencyTable, PickerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    pub daily_rs: f64,
    pub per_trade_rs: f64,
    pub r_atr_mult: f64,
    /// Stops tighter than this fraction of entry are rejected.
    pub min_risk_frac: f64,
    /// Divide the daily budget across active picks instead of using the
    /// fixed per-trade figure.
    pub split_across_active: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_rs: 10_000.0,
            per_trade_rs: 1_000.0,
            r_atr_mult: 1.0,
            min_risk_frac: 0.002,
            split_across_active: false,
        }
    }
}

/// Everything the builder needs for one symbol. Symbols with incomplete tags
/// are left out of the plan and downgrade the snapshot to READY_PARTIAL.
#[derive(Debug, Clone, Default)]
pub struct SymbolInputs {
    pub pdc: Option<PrevDayContext>,
    pub ol: Option<OpenLocation>,
    pub ot: Option<OpeningTrend>,
    pub day_bars: Vec<Bar>,
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn opening_window(bars: &[Bar]) -> Vec<&Bar> {
    let from = NaiveTime::from_hms_opt(9, 15, 0).unwrap();
    let to = NaiveTime::from_hms_opt(9, 40, 0).unwrap();
    let mut window: Vec<&Bar> = bars
        .iter()
        .filter(|b| {
            let t = b.start.time();
            t >= from && t < to
        })
        .collect();
    window.sort_by_key(|b| b.start);
    window
}

/// Average true range of the opening bars, chained on prior close.
fn atr(window: &[&Bar]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let mut prev_close: Option<f64> = None;
    let mut total = 0.0;
    for bar in window {
        let hl = bar.high - bar.low;
        let tr = match prev_close {
            Some(pc) => hl.max((bar.high - pc).abs()).max((bar.low - pc).abs()),
            None => hl,
        };
        total += tr;
        prev_close = Some(bar.close);
    }
    total / window.len() as f64
}

struct Candidate {
    row: PlanRow,
    r_per_share: f64,
}

fn abstain_row(
    symbol: &str,
    tags: PlanTags,
    level: Level,
    confidence: u8,
    samples: u32,
    reason: &str,
) -> PlanRow {
    PlanRow {
        symbol: symbol.to_string(),
        pick: Pick::Abstain,
        confidence,
        level,
        samples,
        entry: None,
        stop: None,
        tp1: None,
        tp2: None,
        qty: 0,
        r_per_share: None,
        reason: reason.to_string(),
        tags,
    }
}

fn candidate_for_symbol(
    symbol: &str,
    pdc: PrevDayContext,
    ol: OpenLocation,
    ot: OpeningTrend,
    bars: &[Bar],
    table: &FrequencyTable,
    picker: &PickerConfig,
    risk: &RiskConfig,
) -> Candidate {
    let tags = PlanTags {
        prev_day_context: Some(pdc),
        open_location: Some(ol),
        opening_trend: Some(ot),
    };
    let outcome = table.pick(symbol, pdc, ol, ot, picker);
    if outcome.pick == Pick::Abstain {
        return Candidate {
            row: abstain_row(
                symbol,
                tags,
                outcome.level,
                outcome.confidence_pct,
                outcome.samples,
                &outcome.reason,
            ),
            r_per_share: 0.0,
        };
    }

    let window = opening_window(bars);
    let entry_start = NaiveTime::from_hms_opt(9, 35, 0).unwrap();
    let Some(entry_bar) = window.iter().find(|b| b.start.time() == entry_start) else {
        return Candidate {
            row: abstain_row(
                symbol,
                tags,
                outcome.level,
                outcome.confidence_pct,
                outcome.samples,
                "missing_entry_bar",
            ),
            r_per_share: 0.0,
        };
    };

    let entry = entry_bar.close;
    let atr5 = atr(&window);
    let low5 = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let high5 = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);

    let stop = match outcome.pick {
        Pick::Bull => low5.min(entry - risk.r_atr_mult * atr5),
        Pick::Bear => high5.max(entry + risk.r_atr_mult * atr5),
        Pick::Abstain => unreachable!("abstain handled above"),
    };

    let r = (entry - stop).abs();
    if r < entry.abs() * risk.min_risk_frac {
        return Candidate {
            row: abstain_row(
                symbol,
                tags,
                outcome.level,
                outcome.confidence_pct,
                outcome.samples,
                "tight_stop",
            ),
            r_per_share: 0.0,
        };
    }

    let sign = match outcome.pick {
        Pick::Bull => 1.0,
        _ => -1.0,
    };
    let tp1 = entry + sign * r;
    let tp2 = entry + sign * 2.0 * r;

    Candidate {
        row: PlanRow {
            symbol: symbol.to_string(),
            pick: outcome.pick,
            confidence: outcome.confidence_pct,
            level: outcome.level,
            samples: outcome.samples,
            entry: Some(round4(entry)),
            stop: Some(round4(stop)),
            tp1: Some(round4(tp1)),
            tp2: Some(round4(tp2)),
            qty: 0,
            r_per_share: Some(round4(r)),
            reason: outcome.reason,
            tags,
        },
        r_per_share: r,
    }
}

/// Build the portfolio plan for `date`. Runs exactly once per session, after
/// all three tags have been computed for whichever symbols could be tagged.
pub fn build_snapshot(
    date: NaiveDate,
    mode: RunMode,
    built_at: NaiveDateTime,
    universe: &[String],
    inputs: &BTreeMap<String, SymbolInputs>,
    table: &FrequencyTable,
    picker: &PickerConfig,
    risk: &RiskConfig,
) -> PlanSnapshot {
    let mut candidates = Vec::new();
    let mut skipped_symbols = 0usize;

    for symbol in universe {
        let Some(input) = inputs.get(symbol) else {
            skipped_symbols += 1;
            continue;
        };
        let (Some(pdc), Some(ol), Some(ot)) = (input.pdc, input.ol, input.ot) else {
            tracing::warn!(%symbol, "tags incomplete; symbol excluded from plan");
            skipped_symbols += 1;
            continue;
        };
        candidates.push(candidate_for_symbol(
            symbol,
            pdc,
            ol,
            ot,
            &input.day_bars,
            table,
            picker,
            risk,
        ));
    }

    // Sizing pass: the per-trade budget is either fixed or an even split of
    // the daily budget over active picks.
    let active_before_sizing = candidates
        .iter()
        .filter(|c| c.row.pick != Pick::Abstain)
        .count();
    let risk_per_trade = if risk.split_across_active && active_before_sizing > 0 {
        (risk.daily_rs / active_before_sizing as f64).floor()
    } else {
        risk.per_trade_rs
    };

    let mut plans = Vec::with_capacity(candidates.len());
    let mut total_planned_risk = 0.0;
    let mut active_trades = 0u32;

    for mut candidate in candidates {
        if candidate.row.pick != Pick::Abstain {
            let qty = (risk_per_trade / candidate.r_per_share).floor();
            if qty < 1.0 {
                candidate.row = abstain_row(
                    &candidate.row.symbol,
                    candidate.row.tags.clone(),
                    candidate.row.level,
                    candidate.row.confidence,
                    candidate.row.samples,
                    "qty_zero",
                );
            } else {
                candidate.row.qty = qty as u32;
                total_planned_risk += qty * candidate.r_per_share;
                active_trades += 1;
            }
        }
        plans.push(candidate.row);
    }

    let status = if plans.is_empty() {
        PlanStatus::Failed
    } else if skipped_symbols > 0 {
        PlanStatus::ReadyPartial
    } else {
        PlanStatus::Ready
    };

    PlanSnapshot {
        date,
        mode,
        built_at,
        status,
        locked: status.is_tradable(),
        portfolio_plan: PortfolioPlan {
            date,
            daily_risk_rs: risk.daily_rs,
            risk_per_trade_rs: risk_per_trade,
            total_planned_risk_rs: round4(total_planned_risk),
            active_trades,
            plans,
        },
    }
}

/// On-disk home of the per-day plan artifacts. Writes are atomic
/// (tmp + rename) and retried; a final failure is the caller's cue to mark
/// the snapshot FAILED and stop trading.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    write_attempts: u32,
    retry_backoff: Duration,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }

    pub fn plan_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("plan_snapshot_{date}.json"))
    }

    pub async fn write(&self, snapshot: &PlanSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("create snapshot dir")?;
        let path = self.plan_path(snapshot.date);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot).context("encode plan snapshot")?;

        let mut last_err = None;
        for attempt in 1..=self.write_attempts {
            let result = async {
                tokio::fs::write(&tmp, &body).await?;
                tokio::fs::rename(&tmp, &path).await?;
                Ok::<_, std::io::Error>(())
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(?err, attempt, "plan snapshot write failed");
                    last_err = Some(err);
                    if attempt < self.write_attempts {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
            }
        }
        match last_err {
            Some(err) => Err(err).context("plan snapshot write exhausted"),
            None => anyhow::bail!("plan snapshot write exhausted"),
        }
    }

    pub async fn read(&self, date: NaiveDate) -> Result<Option<PlanSnapshot>> {
        let path = self.plan_path(date);
        match tokio::fs::read(&path).await {
            Ok(body) => {
                let snapshot = serde_json::from_slice(&body)
                    .with_context(|| format!("decode {}", path.display()))?;
                Ok(Some(snapshot))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("read plan snapshot"),
        }
    }
}
