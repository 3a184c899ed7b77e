mod bootstrap;
mod config;
mod engine;
mod http_api;
mod monitor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use core_types::{AgentStatus, RunMode, TickSource};
use feed_replay::{live_bridge, ReplayConfig, ReplayTickSource};
use infra_clock::{IstWallClock, SessionClock, VirtualClock};
use metrics_exporter_prometheus::PrometheusHandle;
use state_store::{run_persistence, StateStore};
use timeline_gate::Cutovers;
use tokio::sync::{mpsc, watch};

use crate::bootstrap::Runtime;
use crate::config::AppConfig;
use crate::engine::{EngineCore, EngineEvent};
use crate::http_api::ApiState;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let _guard = observability::init_tracing("probedge");
    let prometheus = observability::init_metrics();

    let path = config::config_path();
    let cfg = match AppConfig::load(&path) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!(?err, "configuration failed");
            return 1;
        }
    };

    let runtime = match bootstrap::prepare(cfg).await {
        Ok(runtime) => runtime,
        Err(failure) => {
            tracing::error!(error = ?failure.error(), "startup dependency failed");
            return failure.exit_code();
        }
    };

    match run_session(runtime, prometheus).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(?err, "session failed");
            1
        }
    }
}

async fn run_session(runtime: Runtime, prometheus: PrometheusHandle) -> Result<()> {
    let Runtime {
        cfg,
        state,
        masters,
        freq,
        snapshots,
        day,
        resume,
        replay_bars,
    } = runtime;

    let vclock: Option<VirtualClock>;
    let clock: Arc<dyn SessionClock>;
    let source: Box<dyn TickSource>;
    // Kept alive for the whole session in live modes: the broker adapter
    // process feeds ticks through this handle.
    let mut _live_sender = None;

    match cfg.mode {
        RunMode::Sim => {
            let bars = replay_bars.ok_or_else(|| anyhow!("replay bars missing for SIM"))?;
            let start = day
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| anyhow!("bad session day"))?;
            let vc = VirtualClock::new(start);
            vclock = Some(vc.clone());
            clock = Arc::new(vc);
            source = Box::new(ReplayTickSource::from_bars(
                &bars,
                ReplayConfig {
                    seed: cfg.engine.replay_seed,
                    speed: cfg.engine.replay_speed,
                },
            ));
        }
        RunMode::Live | RunMode::Paper => {
            let (sender, bridge) = live_bridge(cfg.mode, cfg.engine.live_channel_capacity);
            _live_sender = Some(sender);
            vclock = None;
            clock = Arc::new(IstWallClock);
            source = Box::new(bridge);
        }
    }

    let (engine_tx, engine_rx) = mpsc::channel(8_192);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = EngineCore::new(
        cfg.clone(),
        clock.clone(),
        state.clone(),
        masters,
        freq,
        snapshots.clone(),
        day,
        resume,
    );
    let mut engine_handle = tokio::spawn(engine.run(engine_rx));

    spawn_ingestion(source, vclock, engine_tx.clone(), state.clone(), clock.clone());

    // SIM is driven by the tick stream alone; cutovers fire inline as
    // virtual time passes. Live modes additionally get wall-clock nudges
    // and the cadence interval.
    if !cfg.mode.is_sim() {
        spawn_timeline_nudges(clock.clone(), day, cfg.cutovers, engine_tx.clone());
        spawn_cycles(cfg.engine.cycle_seconds, engine_tx.clone());
        tokio::spawn(monitor::run_monitor(state.clone(), shutdown_rx.clone()));
    }

    let persist_handle = tokio::spawn(run_persistence(
        state.clone(),
        cfg.state_file(),
        Duration::from_millis(250),
        Duration::from_secs(2),
        shutdown_rx.clone(),
    ));

    let api_state = ApiState {
        store: state.clone(),
        snapshots,
        day,
        prometheus,
        config_view: Arc::new(cfg.public_view()),
    };
    spawn_http(cfg.http.bind.clone(), api_state, shutdown_rx.clone());

    tokio::select! {
        joined = &mut engine_handle => {
            joined.context("engine task panicked")?;
            tracing::info!("engine completed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            let _ = engine_tx.send(EngineEvent::Shutdown).await;
            if tokio::time::timeout(Duration::from_secs(5), &mut engine_handle)
                .await
                .is_err()
            {
                tracing::warn!("engine did not stop within 5s; aborting");
                engine_handle.abort();
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), persist_handle)
        .await
        .is_err()
    {
        tracing::warn!("final state persist timed out");
    }
    Ok(())
}

fn spawn_ingestion(
    mut source: Box<dyn TickSource>,
    vclock: Option<VirtualClock>,
    tx: mpsc::Sender<EngineEvent>,
    state: Arc<StateStore>,
    clock: Arc<dyn SessionClock>,
) {
    tokio::spawn(async move {
        let mut last_hb: Option<NaiveDateTime> = None;
        loop {
            match source.next_tick().await {
                Ok(Some(tick)) => {
                    if let Some(vc) = &vclock {
                        vc.advance(tick.ts);
                    }
                    let now = clock.now();
                    let hb_due = last_hb.map_or(true, |t| (now - t).num_seconds() >= 2);
                    if hb_due {
                        state.heartbeat("tick_source", AgentStatus::Ok, "streaming", now);
                        last_hb = Some(now);
                    }
                    if tx.send(EngineEvent::Tick(tick)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(EngineEvent::StreamEnded).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!(?err, "tick source error");
                    state.heartbeat(
                        "tick_source",
                        AgentStatus::Warn,
                        "source error",
                        clock.now(),
                    );
                }
            }
        }
    });
}

fn spawn_timeline_nudges(
    clock: Arc<dyn SessionClock>,
    day: NaiveDate,
    cutovers: Cutovers,
    tx: mpsc::Sender<EngineEvent>,
) {
    tokio::spawn(async move {
        for t in [cutovers.pdc, cutovers.ol, cutovers.ot, cutovers.eod_flatten] {
            clock.wait_until(day.and_time(t)).await;
            if tx.send(EngineEvent::Nudge).await.is_err() {
                return;
            }
        }
    });
}

fn spawn_cycles(cycle_seconds: u64, tx: mpsc::Sender<EngineEvent>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cycle_seconds.max(1)));
        loop {
            interval.tick().await;
            if tx.send(EngineEvent::Cycle).await.is_err() {
                return;
            }
        }
    });
}

fn spawn_http(bind: String, api_state: ApiState, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let app = http_api::router(api_state);
        match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => {
                tracing::info!(%bind, "state api started");
                let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                });
                if let Err(err) = serve.await {
                    tracing::error!(?err, "state api failed");
                }
            }
            Err(err) => tracing::error!(?err, %bind, "state api bind failed"),
        }
    });
}
