//! Tracing and Prometheus bootstrap for the session runtime.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Crates whose spans narrate a trading session. The default filter keeps
/// them at `info` and everything else at `warn`; `RUST_LOG` overrides the
/// whole directive set.
const SESSION_CRATES: &[&str] = &[
    "bar_aggregator",
    "feed_replay",
    "freq_table",
    "market_store",
    "paper_engine",
    "plan_builder",
    "state_store",
    "tag_classifier",
    "timeline_gate",
];

pub fn default_filter(service_name: &str) -> String {
    let mut directives = vec!["warn".to_string(), format!("{service_name}=info")];
    directives.extend(SESSION_CRATES.iter().map(|krate| format!("{krate}=info")));
    directives.join(",")
}

pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(service_name)));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .try_init();

    Some(guard)
}

/// Install (or reuse) the process-wide Prometheus recorder. Safe to call
/// from every task that needs a render handle.
pub fn init_metrics() -> PrometheusHandle {
    PROM_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}
