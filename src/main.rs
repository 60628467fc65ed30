mod clock;
mod config;
mod connection;
mod device;
mod safety;
mod sensor;
mod telemetry;
mod transport;

use anyhow::{Context, Result};
use clock::ClockSync;
use config::{Config, TransportKind};
use connection::{HostLinkDriver, LinkManager};
use safety::{ConnectivitySupervisor, ProcessRestarter, SupervisorOutcome};
use sensor::SimulatedSensor;
use std::sync::Arc;
use std::time::Duration;
use telemetry::TelemetryLoop;
use telemetry_shared::TransportMode;
use transport::{HttpTransport, PersistentSession, Transport};

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config/node.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    let device_id = device::resolve_device_id(&config.device)?;
    let mode = TransportMode::from(config.transport.mode);

    info!("Telemetry node starting: {}", device_id);
    info!("  Link: {} on {}", config.link.ssid, config.link.interface);
    info!("  Transport: {:?} ({:?})", config.transport.mode, mode);

    let clock = Arc::new(ClockSync::new(&config.clock));
    let driver = Arc::new(HostLinkDriver::new(config.link.clone()));
    let mut link = LinkManager::new(
        mode,
        driver,
        clock.clone(),
        Duration::from_millis(config.transport.mqtt.reconnect_delay_ms),
    );

    // Exactly one transport exists for the life of the process
    let transport: Arc<dyn Transport> = match config.transport.mode {
        TransportKind::Mqtt => {
            let session = Arc::new(PersistentSession::new(
                &config.transport.mqtt,
                &device_id,
                link.event_sender(),
            )?);
            info!("  Topic: {}", session.topic());
            link.attach_session(session.clone());
            session
        }
        TransportKind::Http => {
            info!("  Endpoint: {}", config.transport.http.url);
            Arc::new(HttpTransport::new(&config.transport.http, link.state()))
        }
    };

    let established = link.established_signal();
    let _link_task = link.start().await?;

    let supervisor = ConnectivitySupervisor::new(config.establish_timeout(), Arc::new(ProcessRestarter));
    if supervisor.wait(established).await == SupervisorOutcome::Restarted {
        anyhow::bail!("connectivity not established");
    }

    let sensor = Arc::new(SimulatedSensor::new(config.sensor.clone()));
    let mut telemetry = TelemetryLoop::new(
        device_id,
        sensor,
        transport,
        clock,
        config.telemetry_interval(),
    );

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested, stopping telemetry"),
            Err(e) => {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = telemetry.run() => {}
        _ = shutdown => {}
    }

    Ok(())
}
