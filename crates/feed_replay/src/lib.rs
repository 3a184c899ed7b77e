//! Tick sources. The replay variant decomposes persisted 5-minute bars into
//! a deterministic tick sequence; the live variant is a bounded channel fed
//! by an out-of-process broker bridge.

use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use core_types::{Bar, RunMode, Tick, TickSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    pub seed: u64,
    /// Wall-clock pacing factor (e.g. 10.0 replays a session ten times
    /// faster than real time). `None` runs as fast as the consumer drains.
    pub speed: Option<f64>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            speed: None,
        }
    }
}

/// Synthesizes four ticks per bar: open at the window start, the two
/// extremes mid-window (order decided by a seeded coin), and the close just
/// before the window ends. Same bars + same seed → the same tick sequence.
pub struct ReplayTickSource {
    ticks: VecDeque<Tick>,
    mode: RunMode,
    speed: Option<f64>,
    prev_ts: Option<NaiveDateTime>,
}

impl ReplayTickSource {
    pub fn from_bars(bars_by_symbol: &BTreeMap<String, Vec<Bar>>, cfg: ReplayConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut ticks = Vec::new();

        for (symbol, bars) in bars_by_symbol {
            for bar in bars {
                let high_first = rng.random_bool(0.5);
                let (first_ext, second_ext) = if high_first {
                    (bar.high, bar.low)
                } else {
                    (bar.low, bar.high)
                };
                ticks.push(Tick {
                    symbol: symbol.clone(),
                    ts: bar.start,
                    ltp: bar.open,
                    volume: 0,
                });
                ticks.push(Tick {
                    symbol: symbol.clone(),
                    ts: bar.start + ChronoDuration::minutes(2),
                    ltp: first_ext,
                    volume: 0,
                });
                ticks.push(Tick {
                    symbol: symbol.clone(),
                    ts: bar.start + ChronoDuration::minutes(3),
                    ltp: second_ext,
                    volume: 0,
                });
                ticks.push(Tick {
                    symbol: symbol.clone(),
                    ts: bar.start + ChronoDuration::minutes(4) + ChronoDuration::seconds(59),
                    ltp: bar.close,
                    volume: bar.volume,
                });
            }
        }

        ticks.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.symbol.cmp(&b.symbol)));
        Self {
            ticks: ticks.into(),
            mode: RunMode::Sim,
            speed: cfg.speed,
            prev_ts: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.ticks.len()
    }
}

#[async_trait]
impl TickSource for ReplayTickSource {
    async fn next_tick(&mut self) -> Result<Option<Tick>> {
        let Some(tick) = self.ticks.pop_front() else {
            return Ok(None);
        };

        if let (Some(speed), Some(prev)) = (self.speed, self.prev_ts) {
            let delta_ms = (tick.ts - prev).num_milliseconds().max(0) as f64;
            let sleep_ms = (delta_ms / speed.max(0.001)).round() as u64;
            if sleep_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
            }
        }
        self.prev_ts = Some(tick.ts);

        Ok(Some(tick))
    }

    fn mode(&self) -> RunMode {
        self.mode
    }
}

/// Producer half of the live bridge. Quote ticks that do not fit the bounded
/// channel are dropped (the next quote supersedes them anyway); the counter
/// keeps the loss visible.
#[derive(Clone)]
pub struct TickSender {
    tx: mpsc::Sender<Tick>,
    dropped: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl TickSender {
    pub fn send(&self, tick: Tick) {
        if self.tx.try_send(tick).is_err() {
            let n = self
                .dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                + 1;
            if n % 1000 == 1 {
                tracing::warn!(dropped = n, "live tick channel full");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

pub struct LiveBridgeSource {
    rx: mpsc::Receiver<Tick>,
    mode: RunMode,
}

pub fn live_bridge(mode: RunMode, capacity: usize) -> (TickSender, LiveBridgeSource) {
    let (tx, rx) = mpsc::channel(capacity.max(16));
    (
        TickSender {
            tx,
            dropped: Default::default(),
        },
        LiveBridgeSource { rx, mode },
    )
}

#[async_trait]
impl TickSource for LiveBridgeSource {
    async fn next_tick(&mut self) -> Result<Option<Tick>> {
        Ok(self.rx.recv().await)
    }

    fn mode(&self) -> RunMode {
        self.mode
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn start(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn bar(symbol: &str, h: u32, m: u32, o: f64, hi: f64, lo: f64, c: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            start: start(h, m),
            open: o,
            high: hi,
            low: lo,
            close: c,
            volume: 100,
        }
    }

    fn bars() -> BTreeMap<String, Vec<Bar>> {
        let mut map = BTreeMap::new();
        map.insert(
            "ALPHA".to_string(),
            vec![
                bar("ALPHA", 9, 15, 100.0, 101.0, 99.5, 100.5),
                bar("ALPHA", 9, 20, 100.5, 100.9, 100.1, 100.2),
            ],
        );
        map.insert(
            "BETA".to_string(),
            vec![bar("BETA", 9, 15, 50.0, 50.4, 49.8, 50.1)],
        );
        map
    }

    async fn drain(mut source: ReplayTickSource) -> Vec<Tick> {
        let mut out = Vec::new();
        while let Some(tick) = source.next_tick().await.expect("tick") {
            out.push(tick);
        }
        out
    }

    #[tokio::test]
    async fn four_ticks_per_bar_open_to_close() {
        let source = ReplayTickSource::from_bars(&bars(), ReplayConfig::default());
        let ticks = drain(source).await;
        assert_eq!(ticks.len(), 12);

        let alpha: Vec<&Tick> = ticks
            .iter()
            .filter(|t| t.symbol == "ALPHA" && t.ts < start(9, 20))
            .collect();
        assert_eq!(alpha.len(), 4);
        assert_eq!(alpha[0].ltp, 100.0);
        assert_eq!(alpha[3].ltp, 100.5);
        assert_eq!(alpha[3].volume, 100);
        // The two mid-window ticks carry both extremes, in either order.
        let mids: Vec<f64> = alpha[1..3].iter().map(|t| t.ltp).collect();
        assert!(mids.contains(&101.0) && mids.contains(&99.5));
    }

    #[tokio::test]
    async fn sequence_is_ts_ordered_across_symbols() {
        let source = ReplayTickSource::from_bars(&bars(), ReplayConfig::default());
        let ticks = drain(source).await;
        for pair in ticks.windows(2) {
            assert!(pair[0].ts <= pair[1].ts);
        }
    }

    #[tokio::test]
    async fn same_seed_reproduces_the_sequence() {
        let cfg = ReplayConfig {
            seed: 42,
            speed: None,
        };
        let a = drain(ReplayTickSource::from_bars(&bars(), cfg)).await;
        let b = drain(ReplayTickSource::from_bars(&bars(), cfg)).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn stream_ends_with_none() {
        let mut source = ReplayTickSource::from_bars(&bars(), ReplayConfig::default());
        while source.next_tick().await.expect("tick").is_some() {}
        assert!(source.next_tick().await.expect("end").is_none());
    }

    #[tokio::test]
    async fn live_bridge_delivers_and_counts_drops() {
        let (sender, mut source) = live_bridge(RunMode::Paper, 16);
        sender.send(Tick {
            symbol: "ALPHA".to_string(),
            ts: start(9, 15),
            ltp: 100.0,
            volume: 1,
        });
        let tick = source.next_tick().await.expect("recv").expect("some");
        assert_eq!(tick.symbol, "ALPHA");
        assert_eq!(source.mode(), RunMode::Paper);
        assert_eq!(sender.dropped(), 0);
    }
}
