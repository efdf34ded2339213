//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::domain::error::DISPATCH_ERROR_KINDS;
use crate::infra::metrics::{
    HistogramSnapshot, Metrics, MetricsSnapshot, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(output: &mut String, name: &str, help: &str, site: &str, hist: &HistogramSnapshot) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += hist.buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += hist.buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", hist.sum_ms);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {}", hist.count());
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let snapshot = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_dispatch_metrics(&mut output, site_id, &snapshot);
    write_provider_metrics(&mut output, site_id, &snapshot);
    write_reservation_metrics(&mut output, site_id, &snapshot);

    output
}

fn write_dispatch_metrics(output: &mut String, site: &str, s: &MetricsSnapshot) {
    write_metric(
        output,
        "dispatch_requests_total",
        "Dispatch calls finished",
        MetricType::Counter,
        site,
        s.dispatches_total,
    );
    write_metric(
        output,
        "dispatch_succeeded_total",
        "Dispatch calls that produced an assignment",
        MetricType::Counter,
        site,
        s.dispatches_succeeded,
    );

    let _ = writeln!(output, "# HELP dispatch_failures_total Dispatch calls failed, by error kind");
    let _ = writeln!(output, "# TYPE dispatch_failures_total counter");
    for (kind, count) in DISPATCH_ERROR_KINDS.iter().zip(s.dispatch_failures.iter()) {
        let _ = writeln!(output, "dispatch_failures_total{{site=\"{site}\",kind=\"{kind}\"}} {count}");
    }

    write_histogram(
        output,
        "dispatch_latency_ms",
        "End-to-end dispatch latency in milliseconds",
        site,
        &s.dispatch_latency,
    );
}

fn write_provider_metrics(output: &mut String, site: &str, s: &MetricsSnapshot) {
    write_metric(
        output,
        "dispatch_geocode_requests_total",
        "Geocoding provider calls",
        MetricType::Counter,
        site,
        s.geocode_requests,
    );
    write_metric(
        output,
        "dispatch_geocode_failures_total",
        "Geocoding provider calls that failed",
        MetricType::Counter,
        site,
        s.geocode_failures,
    );
    write_metric(
        output,
        "dispatch_geocode_admission_timeouts_total",
        "Geocoding calls not admitted within the wait bound",
        MetricType::Counter,
        site,
        s.geocode_admission_timeouts,
    );
    write_histogram(
        output,
        "dispatch_geocode_latency_ms",
        "Geocoding provider latency in milliseconds",
        site,
        &s.geocode_latency,
    );

    write_metric(
        output,
        "dispatch_route_requests_total",
        "Routing provider calls",
        MetricType::Counter,
        site,
        s.route_requests,
    );
    write_metric(
        output,
        "dispatch_route_failures_total",
        "Routing provider calls that returned no route",
        MetricType::Counter,
        site,
        s.route_failures,
    );
    write_histogram(
        output,
        "dispatch_route_latency_ms",
        "Routing provider latency in milliseconds",
        site,
        &s.route_latency,
    );
}

fn write_reservation_metrics(output: &mut String, site: &str, s: &MetricsSnapshot) {
    write_metric(
        output,
        "dispatch_reservations_won_total",
        "Technician reservations won",
        MetricType::Counter,
        site,
        s.reservations_won,
    );
    write_metric(
        output,
        "dispatch_reservations_conflicted_total",
        "Technician reservations lost to contention",
        MetricType::Counter,
        site,
        s.reservations_conflicted,
    );
    write_metric(
        output,
        "dispatch_reservations_released_total",
        "Technician reservations released",
        MetricType::Counter,
        site,
        s.reservations_released,
    );
    write_metric(
        output,
        "dispatch_compensations_total",
        "Dispatch calls that released their reservations after a failure",
        MetricType::Counter,
        site,
        s.compensations,
    );
    write_metric(
        output,
        "dispatch_in_flight_reservations",
        "Reservations won and not yet released",
        MetricType::Gauge,
        site,
        s.reservations_won.saturating_sub(s.reservations_released),
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
