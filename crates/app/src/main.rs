//! podstatd: follows the configured namespaces and periodically logs the busiest replicas.

#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::Result;
use podstat_api::{Config, Fleet, NamespaceKind};
use tracing::{error, info, warn};

fn init_tracing() {
    let env = std::env::var("PODSTAT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid PODSTAT_METRICS_ADDR; expected host:port"),
    }
}

fn report(fleet: &Fleet) {
    let top = fleet.config().top;
    for kind in [NamespaceKind::System, NamespaceKind::App] {
        let ns = fleet.namespace(kind);
        let names = fleet.names(ns);
        info!(ns = %ns, replicas = names.len(), "usage report");
        for s in fleet.snapshot_sorted_by_cpu(ns, true).into_iter().take(top) {
            info!(ns = %ns, replica = %s.name, cpu_m = s.cpu.used(), cpu_pct = s.cpu.ratio(), "top cpu");
        }
        for s in fleet.snapshot_sorted_by_memory(ns, true).into_iter().take(top) {
            info!(ns = %ns, replica = %s.name, mem_bytes = s.memory.used(), mem_pct = s.memory.ratio(), "top memory");
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();
    init_metrics(config.metrics_addr.as_deref());
    info!(system = %config.system_namespace, app = %config.app_namespace, poll_secs = config.poll.interval.as_secs(), "podstatd starting");

    let fleet = match Fleet::connect(config).await {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "cannot reach cluster");
            std::process::exit(1);
        }
    };
    if let Err(e) = fleet.watch_configured().await {
        error!(error = %e, "startup watch failed");
        fleet.shutdown().await;
        std::process::exit(1);
    }

    let mut ticker = tokio::time::interval(fleet.config().report_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "signal handler failed");
                }
                break;
            }
            _ = ticker.tick() => report(&fleet),
        }
    }
    info!("shutting down");
    fleet.shutdown().await;
    Ok(())
}
