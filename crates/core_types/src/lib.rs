use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BAR_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    Live,
    Paper,
    Sim,
}

impl RunMode {
    pub fn is_sim(self) -> bool {
        matches!(self, Self::Sim)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Live => "LIVE",
            Self::Paper => "PAPER",
            Self::Sim => "SIM",
        };
        f.write_str(value)
    }
}

impl FromStr for RunMode {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LIVE" => Ok(Self::Live),
            "PAPER" => Ok(Self::Paper),
            "SIM" => Ok(Self::Sim),
            other => Err(CoreError::Config(format!("unknown mode: {other}"))),
        }
    }
}

/// One observed trade for a symbol. Timestamps are IST wall time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub ts: NaiveDateTime,
    pub ltp: f64,
    pub volume: u64,
}

/// A closed 5-minute bar. `start` is aligned to the 5-minute grid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub start: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    pub fn end(&self) -> NaiveDateTime {
        self.start + Duration::minutes(BAR_MINUTES)
    }

    pub fn is_well_formed(&self) -> bool {
        i64::from(self.start.minute()) % BAR_MINUTES == 0
            && self.start.second() == 0
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
    }
}

/// Previous session aggregate used by the classifiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DayOhlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl DayOhlc {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DayLevels {
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
}

/// Latest observed quote for a symbol, published into shared state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteState {
    pub ltp: f64,
    pub last_update: NaiveDateTime,
    pub ohlc: DayLevels,
    pub volume: u64,
    pub change_pct: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrevDayContext {
    Bull,
    Bear,
    Tr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpenLocation {
    Oar,
    Ooh,
    Oim,
    Ool,
    Obr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpeningTrend {
    Bull,
    Bear,
    Tr,
}

impl OpeningTrend {
    pub fn is_directional(self) -> bool {
        !matches!(self, Self::Tr)
    }
}

/// 09:40→15:05 session outcome label carried in the master history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionResult {
    Bull,
    Bear,
    Tr,
}

/// Per-symbol tag record. Fields stay `None` until their cutover fires and,
/// once set, are never overwritten within the same session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TagSet {
    #[serde(rename = "PDC")]
    pub pdc: Option<PrevDayContext>,
    #[serde(rename = "OL")]
    pub ol: Option<OpenLocation>,
    #[serde(rename = "OT")]
    pub ot: Option<OpeningTrend>,
    pub pdc_computed_at: Option<NaiveDateTime>,
    pub ol_computed_at: Option<NaiveDateTime>,
    pub ot_computed_at: Option<NaiveDateTime>,
}

impl TagSet {
    pub fn is_complete(&self) -> bool {
        self.pdc.is_some() && self.ol.is_some() && self.ot.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Pick {
    Bull,
    Bear,
    Abstain,
}

impl Pick {
    pub fn direction(self) -> Option<Direction> {
        match self {
            Self::Bull => Some(Direction::Long),
            Self::Bear => Some(Direction::Short),
            Self::Abstain => None,
        }
    }
}

impl fmt::Display for Pick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Bull => "BULL",
            Self::Bear => "BEAR",
            Self::Abstain => "ABSTAIN",
        };
        f.write_str(value)
    }
}

/// Specificity of the frequency-table key the picker settled on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L0,
    L1,
    L2,
    L3,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanTags {
    #[serde(rename = "PrevDayContext")]
    pub prev_day_context: Option<PrevDayContext>,
    #[serde(rename = "OpenLocation")]
    pub open_location: Option<OpenLocation>,
    #[serde(rename = "OpeningTrend")]
    pub opening_trend: Option<OpeningTrend>,
}

/// Per-symbol directive inside the locked daily plan. Price fields are `None`
/// for ABSTAIN rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanRow {
    pub symbol: String,
    pub pick: Pick,
    pub confidence: u8,
    pub level: Level,
    pub samples: u32,
    pub entry: Option<f64>,
    pub stop: Option<f64>,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub qty: u32,
    pub r_per_share: Option<f64>,
    pub reason: String,
    pub tags: PlanTags,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortfolioPlan {
    pub date: NaiveDate,
    pub daily_risk_rs: f64,
    pub risk_per_trade_rs: f64,
    pub total_planned_risk_rs: f64,
    pub active_trades: u32,
    pub plans: Vec<PlanRow>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Missing,
    Building,
    Ready,
    ReadyPartial,
    Failed,
}

impl PlanStatus {
    pub fn is_tradable(self) -> bool {
        matches!(self, Self::Ready | Self::ReadyPartial)
    }
}

/// The immutable daily plan artifact. Once `locked` with a tradable status,
/// no field mutates for the rest of the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSnapshot {
    pub date: NaiveDate,
    pub mode: RunMode,
    pub built_at: NaiveDateTime,
    pub status: PlanStatus,
    pub locked: bool,
    pub portfolio_plan: PortfolioPlan,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn signed(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Sl,
    Tp1,
    Tp2,
    Time,
    Kill,
}

impl ExitReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::Sl => "SL",
            Self::Tp1 => "TP1",
            Self::Tp2 => "TP2",
            Self::Time => "TIME",
            Self::Kill => "KILL",
        }
    }
}

/// Live paper trade. `qty` is the planned size; `remaining_qty` shrinks on
/// the TP1 partial exit. `cancelled` marks PENDING→CLOSED without a fill.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub status: PositionStatus,
    pub qty: u32,
    pub remaining_qty: u32,
    pub entry_price: f64,
    pub stop: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp1_done: bool,
    pub cancelled: bool,
    pub opened_at: Option<NaiveDateTime>,
    pub closed_at: Option<NaiveDateTime>,
    pub open_pnl_rs: f64,
    pub realized_pnl_rs: f64,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillReason {
    Entry,
    Sl,
    Tp1,
    Tp2,
    Time,
    Kill,
}

impl FillReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Sl => "SL",
            Self::Tp1 => "TP1",
            Self::Tp2 => "TP2",
            Self::Time => "TIME",
            Self::Kill => "KILL",
        }
    }
}

/// Append-only journal row for a simulated execution. Ids are derived from
/// (symbol, reason, timestamp) so a replayed day journals identically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: u32,
    pub price: f64,
    pub ts: NaiveDateTime,
    pub reason: FillReason,
}

pub fn fill_id(symbol: &str, reason: FillReason, ts: NaiveDateTime) -> String {
    format!("{symbol}-{}-{}", reason.label(), ts.format("%Y%m%d%H%M%S"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Ok,
    Warn,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentHeartbeat {
    pub component: String,
    pub status: AgentStatus,
    pub detail: String,
    pub last_heartbeat_ts: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    Normal,
    Halted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskState {
    pub status: RiskStatus,
    pub reason: String,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            status: RiskStatus::Normal,
            reason: "ok".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PnlSummary {
    pub day: f64,
    pub open: f64,
    pub realized: f64,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),
    #[error("data gap: {0}")]
    DataGap(String),
    #[error("transient i/o: {0}")]
    TransientIo(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl CoreError {
    /// Only invariant violations bubble up as a fatal halt; everything else
    /// degrades through heartbeats and per-symbol downgrades.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// Capability seam for tick delivery. The replay variant reads persisted
/// bars; the live variant is fed by a broker bridge over a bounded channel.
#[async_trait]
pub trait TickSource: Send {
    /// `Ok(None)` signals end of stream.
    async fn next_tick(&mut self) -> Result<Option<Tick>>;

    fn mode(&self) -> RunMode;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn run_mode_parses_case_insensitively() {
        assert_eq!("sim".parse::<RunMode>().unwrap(), RunMode::Sim);
        assert_eq!("LIVE".parse::<RunMode>().unwrap(), RunMode::Live);
        assert!("turbo".parse::<RunMode>().is_err());
    }

    #[test]
    fn bar_end_is_five_minutes_after_start() {
        let bar = Bar {
            symbol: "ALPHA".to_string(),
            start: dt(9, 15),
            open: 100.0,
            high: 101.0,
            low: 99.5,
            close: 100.5,
            volume: 1_000,
        };
        assert_eq!(bar.end(), dt(9, 20));
        assert!(bar.is_well_formed());
    }

    #[test]
    fn misaligned_bar_is_rejected() {
        let bar = Bar {
            symbol: "ALPHA".to_string(),
            start: dt(9, 17),
            open: 100.0,
            high: 101.0,
            low: 99.5,
            close: 100.5,
            volume: 0,
        };
        assert!(!bar.is_well_formed());
    }

    #[test]
    fn tag_enums_serialize_uppercase() {
        assert_eq!(
            serde_json::to_string(&OpenLocation::Oar).unwrap(),
            "\"OAR\""
        );
        assert_eq!(
            serde_json::to_string(&PlanStatus::ReadyPartial).unwrap(),
            "\"READY_PARTIAL\""
        );
        assert_eq!(serde_json::to_string(&ExitReason::Tp1).unwrap(), "\"TP1\"");
    }

    #[test]
    fn plan_row_json_roundtrip() {
        let row = PlanRow {
            symbol: "ALPHA".to_string(),
            pick: Pick::Bull,
            confidence: 78,
            level: Level::L3,
            samples: 9,
            entry: Some(100.0),
            stop: Some(99.2),
            tp1: Some(100.8),
            tp2: Some(101.6),
            qty: 1250,
            r_per_share: Some(0.8),
            reason: "L3 freq".to_string(),
            tags: PlanTags {
                prev_day_context: Some(PrevDayContext::Bull),
                open_location: Some(OpenLocation::Oim),
                opening_trend: Some(OpeningTrend::Bull),
            },
        };
        let raw = serde_json::to_string(&row).expect("serialize");
        let parsed: PlanRow = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, row);
    }

    #[test]
    fn only_invariant_violations_are_fatal() {
        assert!(CoreError::InvariantViolation("dup bar".into()).is_fatal());
        assert!(!CoreError::DataGap("no prior day".into()).is_fatal());
    }
}
