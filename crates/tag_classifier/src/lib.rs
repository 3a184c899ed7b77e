//! Pure session-tag classifiers. Same inputs always yield the same tags;
//! nothing here reads the clock or touches I/O.

use chrono::{NaiveTime, Timelike};
use core_types::{Bar, DayOhlc, OpenLocation, OpeningTrend, PrevDayContext, SessionResult};
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Prev-day range below this percent of close reads as a range day.
    pub narrow_range_pct: f64,
    pub body_strong_frac: f64,
    pub body_weak_frac: f64,
    pub clv_bull: f64,
    pub clv_bear: f64,
    /// Open-location band as a fraction of the prev-day range.
    pub ol_band_frac: f64,
    pub ot_move_pct: f64,
    pub ot_tight_range_pct: f64,
    pub ot_tiny_move_pct: f64,
    pub ot_pos_top: f64,
    pub ot_pos_bottom: f64,
    pub ot_min_dir_votes: i32,
    pub ot_overlap_frac: f64,
    /// 09:40→15:05 net move percent for a directional session result.
    pub result_move_pct: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            narrow_range_pct: 1.00,
            body_strong_frac: 0.45,
            body_weak_frac: 0.25,
            clv_bull: 0.65,
            clv_bear: 0.35,
            ol_band_frac: 0.30,
            ot_move_pct: 0.35,
            ot_tight_range_pct: 0.80,
            ot_tiny_move_pct: 0.30,
            ot_pos_top: 0.60,
            ot_pos_bottom: 0.40,
            ot_min_dir_votes: 2,
            ot_overlap_frac: 0.50,
            result_move_pct: 0.60,
        }
    }
}

/// Previous Day Context from the prior session's daily candle: direction by
/// close-location-value, strength by body fraction, narrow days are TR.
pub fn prev_day_context(prev: &DayOhlc, cfg: &ClassifierConfig) -> PrevDayContext {
    let rng = prev.range().max(EPS);
    let range_pct = 100.0 * rng / prev.close.abs().max(EPS);
    let body_frac = (prev.close - prev.open).abs() / rng;
    let clv = (prev.close - prev.low) / rng;

    if range_pct <= cfg.narrow_range_pct || body_frac <= cfg.body_weak_frac {
        return PrevDayContext::Tr;
    }
    if clv >= cfg.clv_bull && body_frac >= cfg.body_strong_frac {
        return PrevDayContext::Bull;
    }
    if clv <= cfg.clv_bear && body_frac >= cfg.body_strong_frac {
        return PrevDayContext::Bear;
    }
    PrevDayContext::Tr
}

/// Open Location: today's 09:15 open against the prior day's range, with a
/// band of `ol_band_frac`·range hugging each extreme. `None` when the prior
/// range is degenerate.
pub fn open_location(
    day_open: f64,
    prev: &DayOhlc,
    cfg: &ClassifierConfig,
) -> Option<OpenLocation> {
    if !(prev.high > prev.low) || !day_open.is_finite() {
        return None;
    }
    let rng = prev.range();
    Some(if day_open < prev.low {
        OpenLocation::Obr
    } else if day_open <= prev.low + cfg.ol_band_frac * rng {
        OpenLocation::Ool
    } else if day_open > prev.high {
        OpenLocation::Oar
    } else if day_open >= prev.high - cfg.ol_band_frac * rng {
        OpenLocation::Ooh
    } else {
        OpenLocation::Oim
    })
}

fn slice_window(bars: &[Bar], from: NaiveTime, to_exclusive: NaiveTime) -> Vec<&Bar> {
    let mut window: Vec<&Bar> = bars
        .iter()
        .filter(|b| {
            let t = b.start.time();
            t >= from && t < to_exclusive
        })
        .collect();
    window.sort_by_key(|b| b.start);
    window
}

fn overlap_score(window: &[&Bar]) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut n = 0usize;
    for pair in window.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let num = (a.high.min(b.high) - a.low.max(b.low)).max(0.0);
        let den = (a.high.max(b.high) - a.low.min(b.low)).max(EPS);
        total += num / den;
        n += 1;
    }
    total / n as f64
}

fn dir_count(window: &[&Bar]) -> i32 {
    let up = window.iter().filter(|b| b.close > b.open).count() as i32;
    let down = window.iter().filter(|b| b.close < b.open).count() as i32;
    up - down
}

/// Opening Trend over 09:15–09:40: three votes (net move, close position in
/// the opening range, up/down persistence) with a chop override for tight,
/// heavily-overlapping windows.
pub fn opening_trend(day_bars: &[Bar], cfg: &ClassifierConfig) -> OpeningTrend {
    let window = slice_window(
        day_bars,
        NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
        NaiveTime::from_hms_opt(9, 40, 0).unwrap(),
    );
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return OpeningTrend::Tr;
    };

    let open0 = first.open.abs().max(EPS);
    let close_n = last.close;
    let hmax = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let lmin = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);

    let move_pct = 100.0 * (close_n - first.open) / open0;
    let range_pct = 100.0 * (hmax - lmin) / open0;
    let pos = if hmax <= lmin {
        0.5
    } else {
        (close_n - lmin) / (hmax - lmin)
    };
    let dcount = dir_count(&window);
    let ovl = overlap_score(&window);

    if range_pct < cfg.ot_tight_range_pct
        && move_pct.abs() < cfg.ot_tiny_move_pct
        && ovl > cfg.ot_overlap_frac
    {
        return OpeningTrend::Tr;
    }

    let v_dist = if move_pct >= cfg.ot_move_pct {
        1
    } else if move_pct <= -cfg.ot_move_pct {
        -1
    } else {
        0
    };
    let v_pos = if pos >= cfg.ot_pos_top {
        1
    } else if pos <= cfg.ot_pos_bottom {
        -1
    } else {
        0
    };
    let v_pers = if dcount >= cfg.ot_min_dir_votes {
        1
    } else if dcount <= -cfg.ot_min_dir_votes {
        -1
    } else {
        0
    };

    match v_dist + v_pos + v_pers {
        s if s >= 2 => OpeningTrend::Bull,
        s if s <= -2 => OpeningTrend::Bear,
        _ => OpeningTrend::Tr,
    }
}

/// Session result over 09:40→15:05 (first open to last close), labelled
/// directional past `result_move_pct`. Returns the label and the net percent.
pub fn session_result(day_bars: &[Bar], cfg: &ClassifierConfig) -> (SessionResult, f64) {
    let mut window: Vec<&Bar> = day_bars
        .iter()
        .filter(|b| {
            let t = b.start.time();
            let mins = i64::from(t.hour()) * 60 + i64::from(t.minute());
            (9 * 60 + 40..=15 * 60 + 5).contains(&mins)
        })
        .collect();
    window.sort_by_key(|b| b.start);

    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return (SessionResult::Tr, 0.0);
    };
    if first.open.abs() < EPS {
        return (SessionResult::Tr, 0.0);
    }
    let ret = 100.0 * (last.close - first.open) / first.open;
    let label = if ret >= cfg.result_move_pct {
        SessionResult::Bull
    } else if ret <= -cfg.result_move_pct {
        SessionResult::Bear
    } else {
        SessionResult::Tr
    };
    (label, (ret * 1000.0).round() / 1000.0)
}
