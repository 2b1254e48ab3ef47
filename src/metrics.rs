//! Prometheus metrics and the debug HTTP endpoint
//!
//! - `docwire_requests_total{opcode}`: decoded wire messages
//! - `docwire_commands_total{command, result}`: dispatched commands
//! - `docwire_command_duration_seconds{command}`: command latency
//! - `docwire_connections` / `docwire_connections_total`: client connections
//! - `docwire_pool_connections{state}`: backend pool occupancy

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;

use crate::backend::PoolStats;
use crate::storage::Storage;

const PREFIX: &str = "docwire";

pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    commands: IntCounterVec,
    command_duration: HistogramVec,
    connections: IntGauge,
    connections_total: IntCounter,
    pool_connections: IntGaugeVec,
    pool_timeouts: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(format!("{}_requests_total", PREFIX), "Wire messages received"),
            &["opcode"],
        )?;
        let commands = IntCounterVec::new(
            Opts::new(format!("{}_commands_total", PREFIX), "Commands dispatched"),
            &["command", "result"],
        )?;
        let command_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_command_duration_seconds", PREFIX),
                "Command latency in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["command"],
        )?;
        let connections = IntGauge::new(
            format!("{}_connections", PREFIX),
            "Open client connections",
        )?;
        let connections_total = IntCounter::new(
            format!("{}_connections_total", PREFIX),
            "Client connections accepted",
        )?;
        let pool_connections = IntGaugeVec::new(
            Opts::new(
                format!("{}_pool_connections", PREFIX),
                "Backend pool connections by state",
            ),
            &["state"],
        )?;
        let pool_timeouts = IntGauge::new(
            format!("{}_pool_acquire_timeouts", PREFIX),
            "Pool acquisitions that timed out",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(command_duration.clone()))?;
        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(pool_connections.clone()))?;
        registry.register(Box::new(pool_timeouts.clone()))?;

        Ok(Self {
            registry,
            requests,
            commands,
            command_duration,
            connections,
            connections_total,
            pool_connections,
            pool_timeouts,
        })
    }

    pub fn record_request(&self, opcode: &str) {
        self.requests.with_label_values(&[opcode]).inc();
    }

    pub fn record_command(&self, command: &str, ok: bool, elapsed: Duration) {
        let result = if ok { "ok" } else { "error" };
        self.commands.with_label_values(&[command, result]).inc();
        self.command_duration
            .with_label_values(&[command])
            .observe(elapsed.as_secs_f64());
    }

    pub fn connection_opened(&self) {
        self.connections.inc();
        self.connections_total.inc();
    }

    pub fn connection_closed(&self) {
        self.connections.dec();
    }

    pub fn open_connections(&self) -> i64 {
        self.connections.get()
    }

    pub fn total_connections(&self) -> u64 {
        self.connections_total.get()
    }

    pub fn update_pool(&self, stats: &PoolStats) {
        self.pool_connections
            .with_label_values(&["idle"])
            .set(stats.idle as i64);
        self.pool_connections
            .with_label_values(&["in_use"])
            .set(stats.in_use as i64);
        self.pool_connections
            .with_label_values(&["live"])
            .set(stats.live as i64);
        self.pool_timeouts.set(stats.timeouts as i64);
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[derive(Clone)]
struct DebugState {
    metrics: Arc<Metrics>,
    storage: Storage,
}

async fn metrics_handler(State(state): State<DebugState>) -> impl IntoResponse {
    state.metrics.update_pool(&state.storage.pool().stats());
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn livez() -> &'static str {
    "ok"
}

pub fn router(metrics: Arc<Metrics>, storage: Storage) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/debug/livez", get(livez))
        .with_state(DebugState { metrics, storage })
}

/// Serves the debug endpoint until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    storage: Storage,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Debug endpoint listening on http://{}", addr);
    axum::serve(listener, router(metrics, storage))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("OP_MSG");
        metrics.record_command("ping", true, Duration::from_millis(2));
        metrics.connection_opened();
        metrics.update_pool(&PoolStats {
            idle: 2,
            in_use: 1,
            live: 3,
            ..Default::default()
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("docwire_requests_total{opcode=\"OP_MSG\"} 1"));
        assert!(text.contains("docwire_commands_total{command=\"ping\",result=\"ok\"} 1"));
        assert!(text.contains("docwire_connections 1"));
        assert!(text.contains("docwire_pool_connections{state=\"live\"} 3"));
        assert_eq!(metrics.total_connections(), 1);

        metrics.connection_closed();
        assert_eq!(metrics.open_connections(), 0);
    }
}
