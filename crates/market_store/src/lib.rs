use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use chrono_tz::Asia::Kolkata;
use core_types::{Bar, DayOhlc, OpenLocation, OpeningTrend, PrevDayContext, SessionResult};
use serde::Deserialize;

/// Parse an intraday timestamp. Files carry IST either as an explicit offset
/// (ISO-8601) or as naive wall time; both normalize to IST-naive.
pub fn parse_ist_datetime(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Kolkata).naive_local());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
    }
    anyhow::bail!("unparseable timestamp: {raw}")
}

#[derive(Debug, Deserialize)]
struct IntradayRecord {
    #[serde(rename = "DateTime", alias = "datetime", alias = "timestamp")]
    datetime: String,
    #[serde(rename = "Open", alias = "open")]
    open: f64,
    #[serde(rename = "High", alias = "high")]
    high: f64,
    #[serde(rename = "Low", alias = "low")]
    low: f64,
    #[serde(rename = "Close", alias = "close")]
    close: f64,
    #[serde(rename = "Volume", alias = "volume", default)]
    volume: Option<u64>,
}

/// All 5-minute bars for one symbol, sorted by start, deduped keep-last.
#[derive(Debug, Clone)]
pub struct IntradaySeries {
    pub symbol: String,
    pub bars: Vec<Bar>,
}

impl IntradaySeries {
    pub fn day_bars(&self, day: NaiveDate) -> Vec<Bar> {
        self.bars
            .iter()
            .filter(|b| b.start.date() == day)
            .cloned()
            .collect()
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days: Vec<NaiveDate> = self.bars.iter().map(|b| b.start.date()).collect();
        days.dedup();
        days
    }
}

pub fn intraday_path(dir: &Path, symbol: &str) -> PathBuf {
    dir.join(format!("{symbol}_5minute.csv"))
}

pub fn master_path(dir: &Path, symbol: &str) -> PathBuf {
    dir.join(format!("{symbol}_5MINUTE_MASTER.csv"))
}

pub fn load_intraday(dir: &Path, symbol: &str) -> Result<IntradaySeries> {
    let path = intraday_path(dir, symbol);
    let mut reader = csv::Reader::from_path(&path)
        .with_context(|| format!("open intraday csv {}", path.display()))?;

    let mut by_start: HashMap<NaiveDateTime, Bar> = HashMap::new();
    for record in reader.deserialize::<IntradayRecord>() {
        let record = record.with_context(|| format!("read intraday row for {symbol}"))?;
        let start = parse_ist_datetime(&record.datetime)?;
        by_start.insert(
            start,
            Bar {
                symbol: symbol.to_string(),
                start,
                open: record.open,
                high: record.high,
                low: record.low,
                close: record.close,
                volume: record.volume.unwrap_or(0),
            },
        );
    }

    let mut bars: Vec<Bar> = by_start.into_values().collect();
    bars.sort_by_key(|b| b.start);
    Ok(IntradaySeries {
        symbol: symbol.to_string(),
        bars,
    })
}

fn parse_tag<T, F>(raw: &str, parse: F) -> Option<T>
where
    F: Fn(&str) -> Option<T>,
{
    let norm = raw.trim().to_ascii_uppercase();
    if norm.is_empty() || norm == "NAN" {
        return None;
    }
    parse(&norm)
}

/// One historical session row from a symbol master. Tag columns may be blank
/// for sessions that predate the tagging scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterRow {
    pub date: NaiveDate,
    pub ohlc: DayOhlc,
    pub opening_trend: Option<OpeningTrend>,
    pub open_location: Option<OpenLocation>,
    pub prev_day_context: Option<PrevDayContext>,
    pub result: Option<SessionResult>,
}

#[derive(Debug, Deserialize)]
struct MasterRecord {
    #[serde(rename = "Date", alias = "date")]
    date: String,
    #[serde(rename = "Open", alias = "open")]
    open: f64,
    #[serde(rename = "High", alias = "high")]
    high: f64,
    #[serde(rename = "Low", alias = "low")]
    low: f64,
    #[serde(rename = "Close", alias = "close")]
    close: f64,
    #[serde(rename = "OpeningTrend", default)]
    opening_trend: String,
    #[serde(rename = "OpenLocation", default)]
    open_location: String,
    #[serde(rename = "PrevDayContext", default)]
    prev_day_context: String,
    #[serde(rename = "Result", default)]
    result: String,
}

fn ot_from_str(raw: &str) -> Option<OpeningTrend> {
    match raw {
        "BULL" => Some(OpeningTrend::Bull),
        "BEAR" => Some(OpeningTrend::Bear),
        "TR" => Some(OpeningTrend::Tr),
        _ => None,
    }
}

fn ol_from_str(raw: &str) -> Option<OpenLocation> {
    match raw {
        "OAR" => Some(OpenLocation::Oar),
        "OOH" => Some(OpenLocation::Ooh),
        "OIM" => Some(OpenLocation::Oim),
        "OOL" => Some(OpenLocation::Ool),
        "OBR" => Some(OpenLocation::Obr),
        _ => None,
    }
}

fn pdc_from_str(raw: &str) -> Option<PrevDayContext> {
    match raw {
        "BULL" => Some(PrevDayContext::Bull),
        "BEAR" => Some(PrevDayContext::Bear),
        "TR" => Some(PrevDayContext::Tr),
        _ => None,
    }
}

fn result_from_str(raw: &str) -> Option<SessionResult> {
    match raw {
        "BULL" => Some(SessionResult::Bull),
        "BEAR" => Some(SessionResult::Bear),
        "TR" => Some(SessionResult::Tr),
        _ => None,
    }
}

pub fn load_master(dir: &Path, symbol: &str) -> Result<Vec<MasterRow>> {
    let path = master_path(dir, symbol);
    let mut reader = csv::Reader::from_path(&path)
        .with_context(|| format!("open master csv {}", path.display()))?;

    let mut by_date: HashMap<NaiveDate, MasterRow> = HashMap::new();
    for record in reader.deserialize::<MasterRecord>() {
        let record = record.with_context(|| format!("read master row for {symbol}"))?;
        let date = NaiveDate::parse_from_str(record.date.trim(), "%Y-%m-%d")
            .with_context(|| format!("bad master date: {}", record.date))?;
        by_date.insert(
            date,
            MasterRow {
                date,
                ohlc: DayOhlc {
                    open: record.open,
                    high: record.high,
                    low: record.low,
                    close: record.close,
                },
                opening_trend: parse_tag(&record.opening_trend, ot_from_str),
                open_location: parse_tag(&record.open_location, ol_from_str),
                prev_day_context: parse_tag(&record.prev_day_context, pdc_from_str),
                result: parse_tag(&record.result, result_from_str),
            },
        );
    }

    let mut rows: Vec<MasterRow> = by_date.into_values().collect();
    rows.sort_by_key(|r| r.date);
    Ok(rows)
}

/// Read-only master history for the whole universe, loaded once at startup.
/// Symbols whose file is missing simply have no entry; callers treat that as
/// a per-symbol data gap, not a failure.
#[derive(Debug, Default)]
pub struct MasterStore {
    by_symbol: HashMap<String, Vec<MasterRow>>,
}

impl MasterStore {
    pub fn load(dir: &Path, symbols: &[String]) -> Self {
        let mut by_symbol = HashMap::new();
        for symbol in symbols {
            match load_master(dir, symbol) {
                Ok(rows) if !rows.is_empty() => {
                    by_symbol.insert(symbol.clone(), rows);
                }
                Ok(_) => {
                    tracing::warn!(%symbol, "master file is empty");
                }
                Err(err) => {
                    tracing::warn!(%symbol, ?err, "master file unavailable");
                }
            }
        }
        Self { by_symbol }
    }

    pub fn from_rows(by_symbol: HashMap<String, Vec<MasterRow>>) -> Self {
        Self { by_symbol }
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    pub fn rows(&self, symbol: &str) -> Option<&[MasterRow]> {
        self.by_symbol.get(symbol).map(Vec::as_slice)
    }

    /// Most recent session strictly before `day`.
    pub fn prev_session(&self, symbol: &str, day: NaiveDate) -> Option<&MasterRow> {
        self.by_symbol
            .get(symbol)?
            .iter()
            .rev()
            .find(|row| row.date < day)
    }
}
