use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod alerts;
mod config;
mod dbus_interface;
mod engine;
mod store;

use alerts::QueuedAlertDispatcher;
use config::{BusKind, Config};
use dbus_interface::{AttendanceService, DbusAlertSink, BUS_NAME, OBJECT_PATH};
use engine::{Engine, EngineSettings};
use store::LogStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("turnstiled starting");

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        match_threshold = config.match_threshold,
        min_liveness_confidence = config.min_liveness_confidence,
        utc_offset_secs = config.timezone.local_minus_utc(),
        geofence = config.premises.geofence.is_some(),
        supervisors = config.premises.supervisors.len(),
        "configuration loaded"
    );

    let store = LogStore::open(&config.db_path)
        .await
        .context("opening attendance database")?;

    let (dispatcher, alert_rx) = QueuedAlertDispatcher::new(config.alert_queue);
    let engine = Engine::new(
        store,
        Arc::new(dispatcher),
        EngineSettings {
            match_threshold: config.match_threshold,
            min_liveness_confidence: config.min_liveness_confidence,
            persist_timeout: config.persist_timeout,
            timezone: config.timezone,
            geofence: config.premises.geofence,
        },
    );

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine))?
        .build()
        .await
        .context("registering D-Bus service")?;

    tokio::spawn(alerts::run_delivery(
        alert_rx,
        config.premises.supervisors.clone(),
        DbusAlertSink::new(conn.clone()),
    ));

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "turnstiled ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("turnstiled shutting down");

    Ok(())
}
