//! Entry check-in engine
//!
//! Turns decoded ticket codes into admission decisions at an event entrance.
//!
//! Module structure:
//! - `domain/` - Core business types (Ticket, CheckIn, errors)
//! - `io/` - External interfaces (HTTP backend, scanners, Egress, Prometheus)
//! - `services/` - Engine logic (Camera, Resolver, Recorder, Session)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use entry_checkin::infra::{CaptureSource, Config, Metrics};
use entry_checkin::io::{is_secure_origin, Egress, HttpTicketBackend, KeyboardScanner, SerialScanner};
use entry_checkin::services::session::SessionSettings;
use entry_checkin::services::{
    create_scan_session, CameraSessionManager, CapturePlatform, ResolutionPipeline, TicketBackend,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Entry check-in engine - scan, resolve and admit tickets
#[derive(Parser, Debug)]
#[command(name = "entry-checkin", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "entry-checkin starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    let source_str = match config.capture_source() {
        CaptureSource::Serial => "serial",
        CaptureSource::Keyboard => "keyboard",
    };
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        operator = %config.operator_id(),
        capture_source = %source_str,
        camera_device = %config.camera_device(),
        max_fps = %config.max_fps(),
        backend_url = %config.backend_url(),
        step_timeout_ms = %config.step_timeout().as_millis(),
        fallback_on_not_found = %config.fallback_on_not_found(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let backend: Arc<dyn TicketBackend> = Arc::new(HttpTicketBackend::from_config(&config)?);

    let secure = is_secure_origin(config.backend_url());
    if !secure {
        warn!(backend_url = %config.backend_url(), "insecure_backend_origin");
    }
    let platform: Arc<dyn CapturePlatform> = match config.capture_source() {
        CaptureSource::Serial => {
            Arc::new(SerialScanner::new(config.camera_device(), config.camera_baud(), secure))
        }
        CaptureSource::Keyboard => Arc::new(KeyboardScanner::new(secure)),
    };

    let camera = Arc::new(CameraSessionManager::from_config(platform, &config, metrics.clone()));
    let pipeline = Arc::new(ResolutionPipeline::from_config(backend, &config, metrics.clone()));
    let (handle, session) = create_scan_session(
        camera,
        pipeline,
        SessionSettings::from_config(&config),
        metrics.clone(),
    );

    // Subscribe before the session starts so no decision is missed
    let egress = Egress::new(config.egress_file());
    let egress_rx = handle.subscribe();
    tokio::spawn(egress.run(egress_rx));

    let mut display_rx = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match display_rx.recv().await {
                Ok(event) => info!(
                    decision = %event.decision.as_str(),
                    recovery = ?event.recovery,
                    message = %event.message,
                    "operator_display"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped = %skipped, "display_lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let session_task = tokio::spawn(session.run());

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_session = Some(handle.clone());
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = entry_checkin::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_session,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    handle.open().await?;
    info!(session_id = %handle.session_id(), "session_opened");

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");

    handle.close().await;
    let _ = shutdown_tx.send(true);
    drop(handle);
    if let Err(e) = session_task.await {
        warn!(error = %e, "session_task_failed");
    }

    info!("entry-checkin shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_precedence() {
        // CONFIG_FILE is process-wide; keep every case in one test
        std::env::remove_var("CONFIG_FILE");
        let args = Args::try_parse_from(["entry-checkin"]).unwrap();
        assert_eq!(args.config, "config/dev.toml");

        std::env::set_var("CONFIG_FILE", "config/hall-b.toml");
        let args = Args::try_parse_from(["entry-checkin"]).unwrap();
        assert_eq!(args.config, "config/hall-b.toml");

        let args = Args::try_parse_from(["entry-checkin", "--config", "config/hall-a.toml"]).unwrap();
        assert_eq!(args.config, "config/hall-a.toml");
        let args = Args::try_parse_from(["entry-checkin", "--config=config/hall-c.toml"]).unwrap();
        assert_eq!(args.config, "config/hall-c.toml");
        std::env::remove_var("CONFIG_FILE");
    }
}
