//! Historical tag-frequency table and the directional-bias picker.
//!
//! Counts come from the symbol masters at startup and never mutate at
//! runtime. Lookup keys get progressively less specific: L3 (PDC, OL, OT),
//! two L2 keys (OL, OT) then (PDC, OT), L1 (OT), and the L0 marginal.

use std::collections::HashMap;

use chrono::{Datelike, Months, NaiveDate};
use core_types::{Level, OpenLocation, OpeningTrend, Pick, PrevDayContext, SessionResult};
use market_store::MasterStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreqCounts {
    pub bull: u32,
    pub bear: u32,
    pub tr: u32,
}

impl FreqCounts {
    fn record(&mut self, result: SessionResult) {
        match result {
            SessionResult::Bull => self.bull += 1,
            SessionResult::Bear => self.bear += 1,
            SessionResult::Tr => self.tr += 1,
        }
    }

    /// Directional sample count; TR outcomes never vote.
    pub fn directional(&self) -> u32 {
        self.bull + self.bear
    }
}

#[derive(Debug, Default)]
struct SymbolFrequencies {
    l3: HashMap<(PrevDayContext, OpenLocation, OpeningTrend), FreqCounts>,
    l2_ol_ot: HashMap<(OpenLocation, OpeningTrend), FreqCounts>,
    l2_pdc_ot: HashMap<(PrevDayContext, OpeningTrend), FreqCounts>,
    l1: HashMap<OpeningTrend, FreqCounts>,
    l0: FreqCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PickerConfig {
    pub nmin_l3: u32,
    pub nmin_l2: u32,
    pub nmin_l1: u32,
    pub nmin_l0: u32,
    pub conf_min: f64,
    pub tr_guard_conf: f64,
    /// Minimum bull/bear split distance, in percentage points.
    pub edge_gap_pp: f64,
    pub require_ot_align: bool,
    pub lookback_years: u32,
}

impl Default for PickerConfig {
    fn default() -> Self {
        Self {
            nmin_l3: 8,
            nmin_l2: 12,
            nmin_l1: 20,
            nmin_l0: 3,
            conf_min: 0.55,
            tr_guard_conf: 0.65,
            edge_gap_pp: 8.0,
            require_ot_align: true,
            lookback_years: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PickOutcome {
    pub pick: Pick,
    pub confidence_pct: u8,
    pub level: Level,
    pub samples: u32,
    pub bull: u32,
    pub bear: u32,
    pub gap_pp: f64,
    pub reason: String,
}

impl PickOutcome {
    fn abstain(level: Level, counts: FreqCounts, reason: &str) -> Self {
        Self {
            pick: Pick::Abstain,
            confidence_pct: 0,
            level,
            samples: counts.directional(),
            bull: counts.bull,
            bear: counts.bear,
            gap_pp: 0.0,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrequencyTable {
    by_symbol: HashMap<String, SymbolFrequencies>,
}

impl FrequencyTable {
    /// Count historical outcomes for each universe symbol, restricted to
    /// weekday sessions strictly before `asof` within the lookback window.
    pub fn build(
        masters: &MasterStore,
        symbols: &[String],
        asof: NaiveDate,
        cfg: &PickerConfig,
    ) -> Self {
        let floor = asof
            .checked_sub_months(Months::new(12 * cfg.lookback_years))
            .unwrap_or(NaiveDate::MIN);

        let mut by_symbol = HashMap::new();
        for symbol in symbols {
            let Some(rows) = masters.rows(symbol) else {
                continue;
            };
            let mut freq = SymbolFrequencies::default();
            for row in rows {
                if row.date >= asof || row.date < floor {
                    continue;
                }
                if row.date.weekday().number_from_monday() > 5 {
                    continue;
                }
                let Some(result) = row.result else {
                    continue;
                };
                freq.l0.record(result);
                if let Some(ot) = row.opening_trend {
                    freq.l1.entry(ot).or_default().record(result);
                    if let Some(ol) = row.open_location {
                        freq.l2_ol_ot.entry((ol, ot)).or_default().record(result);
                    }
                    if let Some(pdc) = row.prev_day_context {
                        freq.l2_pdc_ot.entry((pdc, ot)).or_default().record(result);
                        if let Some(ol) = row.open_location {
                            freq.l3.entry((pdc, ol, ot)).or_default().record(result);
                        }
                    }
                }
            }
            by_symbol.insert(symbol.clone(), freq);
        }
        Self { by_symbol }
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.by_symbol.contains_key(symbol)
    }

    /// Run the level-fallback picker for one symbol's tag triple.
    pub fn pick(
        &self,
        symbol: &str,
        pdc: PrevDayContext,
        ol: OpenLocation,
        ot: OpeningTrend,
        cfg: &PickerConfig,
    ) -> PickOutcome {
        let Some(freq) = self.by_symbol.get(symbol) else {
            return PickOutcome::abstain(Level::L0, FreqCounts::default(), "no_history");
        };

        let ladder: [(Level, FreqCounts, u32); 5] = [
            (
                Level::L3,
                freq.l3.get(&(pdc, ol, ot)).copied().unwrap_or_default(),
                cfg.nmin_l3,
            ),
            (
                Level::L2,
                freq.l2_ol_ot.get(&(ol, ot)).copied().unwrap_or_default(),
                cfg.nmin_l2,
            ),
            (
                Level::L2,
                freq.l2_pdc_ot.get(&(pdc, ot)).copied().unwrap_or_default(),
                cfg.nmin_l2,
            ),
            (
                Level::L1,
                freq.l1.get(&ot).copied().unwrap_or_default(),
                cfg.nmin_l1,
            ),
            (Level::L0, freq.l0, cfg.nmin_l0),
        ];

        let Some((level, counts, _)) = ladder
            .iter()
            .copied()
            .find(|(_, counts, nmin)| counts.directional() >= *nmin)
        else {
            return PickOutcome::abstain(Level::L0, freq.l0, "insufficient_history");
        };

        let n = counts.directional();
        let (majority, pick) = if counts.bull > counts.bear {
            (counts.bull, Pick::Bull)
        } else if counts.bear > counts.bull {
            (counts.bear, Pick::Bear)
        } else {
            return PickOutcome::abstain(level, counts, "tied_history");
        };

        let conf = f64::from(majority) / f64::from(n);
        let gap_pp = 100.0 * f64::from(counts.bull.abs_diff(counts.bear)) / f64::from(n);
        let confidence_pct = (100.0 * conf).round() as u8;

        let mut outcome = PickOutcome {
            pick,
            confidence_pct,
            level,
            samples: n,
            bull: counts.bull,
            bear: counts.bear,
            gap_pp,
            reason: format!(
                "{level} freq: BULL={} BEAR={} N={n} gap={gap_pp:.1}pp conf={confidence_pct}%",
                counts.bull, counts.bear
            ),
        };

        let abstain = |outcome: &mut PickOutcome, reason: &str| {
            outcome.pick = Pick::Abstain;
            outcome.reason = reason.to_string();
        };

        if gap_pp < cfg.edge_gap_pp {
            abstain(&mut outcome, "thin_edge");
        } else if conf < cfg.conf_min {
            abstain(&mut outcome, "low_confidence");
        } else if ot == OpeningTrend::Tr && (level != Level::L3 || conf < cfg.tr_guard_conf) {
            abstain(&mut outcome, "trend_range_guard");
        } else if cfg.require_ot_align && ot.is_directional() {
            let aligned = matches!(
                (outcome.pick, ot),
                (Pick::Bull, OpeningTrend::Bull) | (Pick::Bear, OpeningTrend::Bear)
            );
            if !aligned {
                abstain(&mut outcome, "ot_misaligned");
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::DayOhlc;
    use market_store::MasterRow;

    fn row(
        date: NaiveDate,
        pdc: PrevDayContext,
        ol: OpenLocation,
        ot: OpeningTrend,
        result: SessionResult,
    ) -> MasterRow {
        MasterRow {
            date,
            ohlc: DayOhlc {
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
            },
            opening_trend: Some(ot),
            open_location: Some(ol),
            prev_day_context: Some(pdc),
            result: Some(result),
        }
    }

    fn weekdays_back_from(asof: NaiveDate) -> impl Iterator<Item = NaiveDate> {
        (1i64..600)
            .map(move |i| asof - chrono::Duration::days(i))
            .filter(|d| d.weekday().number_from_monday() <= 5)
    }

    fn table_with(rows: Vec<MasterRow>, asof: NaiveDate, cfg: &PickerConfig) -> FrequencyTable {
        let mut by_symbol = HashMap::new();
        by_symbol.insert("ALPHA".to_string(), rows);
        let store = MasterStore::from_rows(by_symbol);
        FrequencyTable::build(&store, &["ALPHA".to_string()], asof, cfg)
    }

    fn asof() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 1).unwrap()
    }

    #[test]
    fn l3_majority_with_edge_picks_bull() {
        let cfg = PickerConfig::default();
        let mut days = weekdays_back_from(asof());
        let mut rows = Vec::new();
        for _ in 0..7 {
            rows.push(row(
                days.next().unwrap(),
                PrevDayContext::Bull,
                OpenLocation::Oim,
                OpeningTrend::Bull,
                SessionResult::Bull,
            ));
        }
        for _ in 0..2 {
            rows.push(row(
                days.next().unwrap(),
                PrevDayContext::Bull,
                OpenLocation::Oim,
                OpeningTrend::Bull,
                SessionResult::Bear,
            ));
        }
        let table = table_with(rows, asof(), &cfg);
        let out = table.pick(
            "ALPHA",
            PrevDayContext::Bull,
            OpenLocation::Oim,
            OpeningTrend::Bull,
            &cfg,
        );
        assert_eq!(out.pick, Pick::Bull);
        assert_eq!(out.level, Level::L3);
        assert_eq!(out.samples, 9);
        assert_eq!(out.confidence_pct, 78);
    }

    #[test]
    fn sparse_l3_falls_back_to_l2() {
        let cfg = PickerConfig::default();
        let mut days = weekdays_back_from(asof());
        let mut rows = Vec::new();
        // Only 3 L3 samples for (BULL, OIM, BULL), but plenty under (OIM, BULL)
        // with varying PDC.
        for i in 0..15 {
            let pdc = if i < 3 {
                PrevDayContext::Bull
            } else {
                PrevDayContext::Tr
            };
            rows.push(row(
                days.next().unwrap(),
                pdc,
                OpenLocation::Oim,
                OpeningTrend::Bull,
                if i % 5 == 0 {
                    SessionResult::Bear
                } else {
                    SessionResult::Bull
                },
            ));
        }
        let table = table_with(rows, asof(), &cfg);
        let out = table.pick(
            "ALPHA",
            PrevDayContext::Bull,
            OpenLocation::Oim,
            OpeningTrend::Bull,
            &cfg,
        );
        assert_eq!(out.level, Level::L2);
        assert_eq!(out.pick, Pick::Bull);
        assert_eq!(out.samples, 15);
    }

    #[test]
    fn thin_edge_abstains() {
        let cfg = PickerConfig::default();
        let mut days = weekdays_back_from(asof());
        let mut rows = Vec::new();
        for i in 0..10 {
            rows.push(row(
                days.next().unwrap(),
                PrevDayContext::Bull,
                OpenLocation::Oim,
                OpeningTrend::Bull,
                if i % 2 == 0 {
                    SessionResult::Bull
                } else {
                    SessionResult::Bear
                },
            ));
        }
        let table = table_with(rows, asof(), &cfg);
        let out = table.pick(
            "ALPHA",
            PrevDayContext::Bull,
            OpenLocation::Oim,
            OpeningTrend::Bull,
            &cfg,
        );
        assert_eq!(out.pick, Pick::Abstain);
        assert_eq!(out.reason, "thin_edge");
    }

    #[test]
    fn tr_opening_trend_needs_strong_l3() {
        let cfg = PickerConfig::default();
        let mut days = weekdays_back_from(asof());
        let mut rows = Vec::new();
        // 5 bull / 3 bear at L3 under OT=TR: conf 62.5% < 65% guard.
        for i in 0..8 {
            rows.push(row(
                days.next().unwrap(),
                PrevDayContext::Bull,
                OpenLocation::Oim,
                OpeningTrend::Tr,
                if i < 5 {
                    SessionResult::Bull
                } else {
                    SessionResult::Bear
                },
            ));
        }
        let table = table_with(rows, asof(), &cfg);
        let out = table.pick(
            "ALPHA",
            PrevDayContext::Bull,
            OpenLocation::Oim,
            OpeningTrend::Tr,
            &cfg,
        );
        assert_eq!(out.pick, Pick::Abstain);
        assert_eq!(out.reason, "trend_range_guard");
    }

    #[test]
    fn pick_against_directional_ot_abstains() {
        let cfg = PickerConfig::default();
        let mut days = weekdays_back_from(asof());
        let mut rows = Vec::new();
        // History strongly bearish under a bull opening trend.
        for i in 0..10 {
            rows.push(row(
                days.next().unwrap(),
                PrevDayContext::Bear,
                OpenLocation::Ooh,
                OpeningTrend::Bull,
                if i < 9 {
                    SessionResult::Bear
                } else {
                    SessionResult::Bull
                },
            ));
        }
        let table = table_with(rows, asof(), &cfg);
        let out = table.pick(
            "ALPHA",
            PrevDayContext::Bear,
            OpenLocation::Ooh,
            OpeningTrend::Bull,
            &cfg,
        );
        assert_eq!(out.pick, Pick::Abstain);
        assert_eq!(out.reason, "ot_misaligned");
    }

    #[test]
    fn rows_outside_lookback_are_ignored() {
        let cfg = PickerConfig::default();
        let stale = NaiveDate::from_ymd_opt(2015, 6, 1).unwrap();
        let rows = (0i64..20)
            .map(|i| {
                row(
                    stale - chrono::Duration::days(i),
                    PrevDayContext::Bull,
                    OpenLocation::Oim,
                    OpeningTrend::Bull,
                    SessionResult::Bull,
                )
            })
            .collect();
        let table = table_with(rows, asof(), &cfg);
        let out = table.pick(
            "ALPHA",
            PrevDayContext::Bull,
            OpenLocation::Oim,
            OpeningTrend::Bull,
            &cfg,
        );
        assert_eq!(out.pick, Pick::Abstain);
        assert_eq!(out.reason, "insufficient_history");
    }

    #[test]
    fn unknown_symbol_abstains() {
        let table = FrequencyTable::default();
        let out = table.pick(
            "GHOST",
            PrevDayContext::Tr,
            OpenLocation::Oim,
            OpeningTrend::Tr,
            &PickerConfig::default(),
        );
        assert_eq!(out.pick, Pick::Abstain);
        assert_eq!(out.reason, "no_history");
    }
}
