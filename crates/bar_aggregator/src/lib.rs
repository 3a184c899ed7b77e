use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime, Timelike};
use core_types::{Bar, Tick, BAR_MINUTES};

/// Floor a timestamp to its 5-minute window start. A tick exactly on a
/// window boundary belongs to the window that starts there.
pub fn window_start(ts: NaiveDateTime) -> NaiveDateTime {
    let minute = i64::from(ts.minute());
    let floored = minute - minute % BAR_MINUTES;
    ts.date()
        .and_hms_opt(ts.hour(), floored as u32, 0)
        .expect("window start within day")
}

/// The bar currently being built for a symbol, published into state as the
/// running OHLC until the window seals.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingBar {
    pub start: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub close_ts: NaiveDateTime,
    pub volume: u64,
}

impl WorkingBar {
    fn from_tick(tick: &Tick, start: NaiveDateTime) -> Self {
        Self {
            start,
            open: tick.ltp,
            high: tick.ltp,
            low: tick.ltp,
            close: tick.ltp,
            close_ts: tick.ts,
            volume: tick.volume,
        }
    }

    fn absorb(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.ltp);
        self.low = self.low.min(tick.ltp);
        self.volume = self.volume.saturating_add(tick.volume);
        // Close follows the latest timestamp seen; open never moves.
        if tick.ts >= self.close_ts {
            self.close = tick.ltp;
            self.close_ts = tick.ts;
        }
    }

    fn seal(&self, symbol: &str) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            start: self.start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Converts ticks into closed 5-minute bars. For each (symbol, window) that
/// received at least one tick, exactly one closed bar is emitted; windows
/// with no ticks are simply absent.
#[derive(Debug, Default)]
pub struct BarAggregator {
    working: HashMap<String, WorkingBar>,
    last_emitted: HashMap<String, NaiveDateTime>,
}

impl BarAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one tick. Returns the sealed bar when this tick crosses into the
    /// next window.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Bar> {
        let start = window_start(tick.ts);

        if let Some(emitted) = self.last_emitted.get(&tick.symbol) {
            if start <= *emitted {
                tracing::warn!(
                    symbol = %tick.symbol,
                    ts = %tick.ts,
                    "late tick for an already-sealed window; dropped"
                );
                return None;
            }
        }

        match self.working.get_mut(&tick.symbol) {
            Some(current) if current.start == start => {
                current.absorb(tick);
                None
            }
            Some(current) if start > current.start => {
                let sealed = current.seal(&tick.symbol);
                self.last_emitted.insert(tick.symbol.clone(), sealed.start);
                self.working
                    .insert(tick.symbol.clone(), WorkingBar::from_tick(tick, start));
                Some(sealed)
            }
            Some(current) => {
                // Out-of-order into a previous, still-unsealed window: the
                // working bar keeps its open; extremes and close-by-ts apply.
                current.absorb(tick);
                None
            }
            None => {
                self.working
                    .insert(tick.symbol.clone(), WorkingBar::from_tick(tick, start));
                None
            }
        }
    }

    /// Seal every working bar whose window has ended by `now`. Called on
    /// clock progress so a symbol's final bar does not hang on a next tick
    /// that never comes.
    pub fn flush_until(&mut self, now: NaiveDateTime) -> Vec<Bar> {
        let mut sealed = Vec::new();
        let due: Vec<String> = self
            .working
            .iter()
            .filter(|(_, wb)| wb.start + Duration::minutes(BAR_MINUTES) <= now)
            .map(|(sym, _)| sym.clone())
            .collect();
        for symbol in due {
            if let Some(wb) = self.working.remove(&symbol) {
                let bar = wb.seal(&symbol);
                self.last_emitted.insert(symbol, bar.start);
                sealed.push(bar);
            }
        }
        sealed.sort_by(|a, b| a.start.cmp(&b.start).then(a.symbol.cmp(&b.symbol)));
        sealed
    }

    pub fn in_progress(&self, symbol: &str) -> Option<&WorkingBar> {
        self.working.get(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn tick(sym: &str, t: NaiveDateTime, ltp: f64) -> Tick {
        Tick {
            symbol: sym.to_string(),
            ts: t,
            ltp,
            volume: 10,
        }
    }

    #[test]
    fn boundary_tick_belongs_to_next_window() {
        assert_eq!(window_start(ts(9, 19, 59)), ts(9, 15, 0));
        assert_eq!(window_start(ts(9, 20, 0)), ts(9, 20, 0));
    }

    #[test]
    fn seals_exactly_one_bar_per_window() {
        let mut agg = BarAggregator::new();
        assert!(agg.on_tick(&tick("ALPHA", ts(9, 15, 0), 100.0)).is_none());
        assert!(agg.on_tick(&tick("ALPHA", ts(9, 17, 0), 101.0)).is_none());
        assert!(agg.on_tick(&tick("ALPHA", ts(9, 19, 59), 100.5)).is_none());

        let sealed = agg
            .on_tick(&tick("ALPHA", ts(9, 20, 0), 100.7))
            .expect("bar sealed on window crossing");
        assert_eq!(sealed.start, ts(9, 15, 0));
        assert_eq!(sealed.open, 100.0);
        assert_eq!(sealed.high, 101.0);
        assert_eq!(sealed.close, 100.5);
        assert_eq!(sealed.volume, 30);

        // A late tick for the sealed window must not re-emit it.
        assert!(agg.on_tick(&tick("ALPHA", ts(9, 18, 0), 99.0)).is_none());
    }

    #[test]
    fn out_of_order_within_window_keeps_open_and_latest_close() {
        let mut agg = BarAggregator::new();
        agg.on_tick(&tick("ALPHA", ts(9, 16, 0), 100.0));
        agg.on_tick(&tick("ALPHA", ts(9, 18, 0), 102.0));
        // Arrives late but timestamped earlier: extends the low only.
        agg.on_tick(&tick("ALPHA", ts(9, 17, 0), 99.0));

        let wb = agg.in_progress("ALPHA").expect("working bar");
        assert_eq!(wb.open, 100.0);
        assert_eq!(wb.low, 99.0);
        assert_eq!(wb.close, 102.0);
    }

    #[test]
    fn flush_seals_due_windows_only() {
        let mut agg = BarAggregator::new();
        agg.on_tick(&tick("ALPHA", ts(9, 15, 0), 100.0));
        agg.on_tick(&tick("BETA", ts(9, 21, 0), 50.0));

        let sealed = agg.flush_until(ts(9, 20, 0));
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].symbol, "ALPHA");
        assert!(agg.in_progress("ALPHA").is_none());
        assert!(agg.in_progress("BETA").is_some());
    }

    #[test]
    fn symbols_aggregate_independently() {
        let mut agg = BarAggregator::new();
        agg.on_tick(&tick("ALPHA", ts(9, 15, 0), 100.0));
        agg.on_tick(&tick("BETA", ts(9, 15, 30), 50.0));
        let sealed = agg
            .on_tick(&tick("ALPHA", ts(9, 20, 1), 101.0))
            .expect("alpha sealed");
        assert_eq!(sealed.symbol, "ALPHA");
        assert!(agg.in_progress("BETA").is_some());
    }
}
