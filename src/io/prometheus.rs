//! Prometheus metrics HTTP endpoint
//!
//! Exposes check-in metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::domain::ticket::ResolutionStep;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::session::ScanSessionHandle;
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

/// Write one counter family with a single extra label
fn write_labeled_counter(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",{label}=\"{value}\"}} {count}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads the cumulative snapshot; the periodic reporter's window is untouched.
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_decode_metrics(&mut output, site_id, &summary);
    write_resolution_metrics(&mut output, site_id, &summary);
    write_latency_metrics(&mut output, site_id, &summary);
    write_camera_metrics(&mut output, site_id, &summary);

    output
}

fn write_decode_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "checkin_decodes_total",
        "Decodes delivered by the capture device",
        MetricType::Counter,
        site,
        summary.decodes_total,
    );
    write_metric(
        output,
        "checkin_decodes_debounced_total",
        "Decodes suppressed while a scan was in flight",
        MetricType::Counter,
        site,
        summary.decodes_debounced,
    );
    write_metric(
        output,
        "checkin_decodes_dropped_total",
        "Decodes dropped because the decode buffer was full",
        MetricType::Counter,
        site,
        summary.decodes_dropped,
    );
}

fn write_resolution_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "checkin_resolutions_total",
        "Resolution runs started",
        MetricType::Counter,
        site,
        summary.resolutions_total,
    );

    let steps = [ResolutionStep::Atomic, ResolutionStep::Joined, ResolutionStep::Direct];
    let ok: Vec<(&str, u64)> =
        steps.iter().map(|s| (s.as_str(), summary.step_success[s.index()])).collect();
    let failed: Vec<(&str, u64)> =
        steps.iter().map(|s| (s.as_str(), summary.step_failure[s.index()])).collect();
    write_labeled_counter(
        output,
        "checkin_step_success_total",
        "Backend responses per pipeline step",
        site,
        "step",
        &ok,
    );
    write_labeled_counter(
        output,
        "checkin_step_failure_total",
        "Backend failures or timeouts per pipeline step",
        site,
        "step",
        &failed,
    );

    write_labeled_counter(
        output,
        "checkin_outcomes_total",
        "Committed admissions by outcome",
        site,
        "outcome",
        &[("created", summary.checkins_created), ("already_checked_in", summary.checkins_already)],
    );
    write_labeled_counter(
        output,
        "checkin_resolution_errors_total",
        "Resolution errors by kind",
        site,
        "kind",
        &[
            ("not_found", summary.errors_not_found),
            ("backend_unavailable", summary.errors_backend),
            ("timeout", summary.errors_timeout),
            ("not_admissible", summary.errors_not_admissible),
        ],
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "checkin_resolution_latency_ms",
        "Resolution latency in milliseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.latency_sum_ms,
    );
    write_metric(
        output,
        "checkin_resolution_latency_p50_ms",
        "50th percentile resolution latency",
        MetricType::Gauge,
        site,
        summary.lat_p50_ms,
    );
    write_metric(
        output,
        "checkin_resolution_latency_p99_ms",
        "99th percentile resolution latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_ms,
    );
    write_metric(
        output,
        "checkin_resolution_latency_max_ms",
        "Maximum resolution latency since start",
        MetricType::Gauge,
        site,
        summary.max_latency_ms,
    );
}

fn write_camera_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "checkin_camera_opens_total",
        "Successful camera acquisitions",
        MetricType::Counter,
        site,
        summary.camera_opens,
    );
    write_metric(
        output,
        "checkin_camera_errors_total",
        "Camera errors surfaced to the operator",
        MetricType::Counter,
        site,
        summary.camera_errors,
    );
    write_metric(
        output,
        "checkin_session_state",
        "Scan session state (0=idle 1=initializing 2=scanning 3=resolving 4=decided 5=closed)",
        MetricType::Gauge,
        site,
        summary.session_state,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
    session: Option<ScanSessionHandle>,
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
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        // Operator re-arm from a remote button - POST /session/rearm
        (&Method::POST, "/session/rearm") => {
            let Some(session) = session else {
                return Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "session not running"));
            };
            match session.rearm().await {
                Ok(()) => {
                    info!(state = %session.state().as_str(), "remote_rearm");
                    Ok(text_response(StatusCode::ACCEPTED, "rearm requested"))
                }
                Err(e) => Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
            }
        }
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    session: Option<ScanSessionHandle>,
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
                        let session = session.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                let session = session.clone();
                                async move { handle_request(req, metrics, site_id, session).await }
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
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ResolutionError;
    use crate::domain::types::CheckInOutcome;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_decode();
        metrics.record_step(ResolutionStep::Atomic, true);
        metrics.record_resolution(Ok(CheckInOutcome::Created), 150);
        metrics.record_resolution(Err(&ResolutionError::Timeout), 5000);

        let output = format_prometheus_metrics(&metrics, "hall-a");

        assert!(output.contains("checkin_decodes_total{site=\"hall-a\"} 1"));
        assert!(output.contains("checkin_step_success_total{site=\"hall-a\",step=\"atomic\"} 1"));
        assert!(output.contains("checkin_outcomes_total{site=\"hall-a\",outcome=\"created\"} 1"));
        assert!(output.contains("checkin_resolution_errors_total{site=\"hall-a\",kind=\"timeout\"} 1"));
        assert!(output.contains("checkin_resolution_latency_ms_bucket{site=\"hall-a\",le=\"+Inf\"} 2"));
        assert!(output.contains("checkin_resolution_latency_ms_sum{site=\"hall-a\"} 5150"));
    }

    #[test]
    fn test_repeated_scrapes_keep_latency_histogram() {
        let metrics = Metrics::new();
        metrics.record_resolution(Ok(CheckInOutcome::Created), 150);

        let first = format_prometheus_metrics(&metrics, "s");
        let second = format_prometheus_metrics(&metrics, "s");
        for output in [&first, &second] {
            assert!(output.contains("checkin_resolution_latency_ms_count{site=\"s\"} 1"));
            assert!(output.contains("checkin_resolution_latency_ms_sum{site=\"s\"} 150"));
            assert!(output.contains("checkin_resolution_latency_ms_bucket{site=\"s\",le=\"200\"} 1"));
        }

        // The periodic log still sees the resolution after scrapes
        let report = metrics.report();
        assert_eq!(report.lat_buckets.iter().sum::<u64>(), 1);
        assert_eq!(report.avg_latency_ms, 150);

        let after = format_prometheus_metrics(&metrics, "s");
        assert!(after.contains("checkin_resolution_latency_ms_count{site=\"s\"} 1"));
    }
}
