//! Link driver
//!
//! The driver owns the physical association. It never changes link state
//! itself; every outcome is posted to the link manager's event queue.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use telemetry_shared::LinkEvent;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;

/// Station-mode link driver
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Bring the driver up and register the event queue
    ///
    /// Posts `DriverStarted` on success. An error here is fatal.
    async fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<()>;

    /// One association attempt; the outcome arrives as an event
    async fn connect(&self);

    fn name(&self) -> &'static str;
}

/// Reachability check against the configured interface and probe target
#[derive(Debug, Clone)]
struct Probe {
    interface_dir: PathBuf,
    target: String,
    timeout: Duration,
}

impl Probe {
    async fn run(&self) -> Result<IpAddr> {
        let operstate = tokio::fs::read_to_string(self.interface_dir.join("operstate"))
            .await
            .context("Failed to read interface operstate")?;
        let operstate = operstate.trim();
        // Loopback and some tunnels report "unknown" while passing traffic
        if operstate != "up" && operstate != "unknown" {
            bail!("interface is {operstate}");
        }

        let stream = timeout(self.timeout, TcpStream::connect(&self.target))
            .await
            .map_err(|_| anyhow!("probe to {} timed out after {:?}", self.target, self.timeout))?
            .with_context(|| format!("probe to {} failed", self.target))?;

        Ok(stream.local_addr()?.ip())
    }
}

/// Link driver for a host network interface
pub struct HostLinkDriver {
    config: LinkConfig,
    probe: Probe,
    monitor_interval: Duration,
    events: OnceLock<mpsc::Sender<LinkEvent>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HostLinkDriver {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_sys_root(config, "/sys/class/net")
    }

    /// Use an alternate sysfs network directory
    pub fn with_sys_root(config: LinkConfig, sys_root: impl Into<PathBuf>) -> Self {
        let probe = Probe {
            interface_dir: sys_root.into().join(&config.interface),
            target: config.probe_address.clone(),
            timeout: Duration::from_millis(config.attempt_timeout_ms),
        };
        Self {
            monitor_interval: Duration::from_millis(config.monitor_interval_ms),
            probe,
            config,
            events: OnceLock::new(),
            monitor: Mutex::new(None),
        }
    }

    async fn stop_monitor(&self) {
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }
    }
}

#[async_trait]
impl LinkDriver for HostLinkDriver {
    async fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<()> {
        let dir = &self.probe.interface_dir;
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            bail!("network interface {} not found at {}", self.config.interface, dir.display());
        }

        if self.events.set(events.clone()).is_err() {
            bail!("link driver already started");
        }

        info!(
            "Setting link configuration SSID {} password {} on {}",
            self.config.ssid,
            mask(&self.config.password),
            self.config.interface
        );
        info!("wifi_init_sta finished.");

        events
            .send(LinkEvent::DriverStarted)
            .await
            .map_err(|_| anyhow!("link event queue closed"))?;
        Ok(())
    }

    async fn connect(&self) {
        let Some(events) = self.events.get() else {
            warn!("connect requested before the link driver started");
            return;
        };

        self.stop_monitor().await;
        info!("connecting to ap SSID:{}", self.config.ssid);

        match self.probe.run().await {
            Ok(address) => {
                info!("got ip:{}", address);
                let probe = self.probe.clone();
                let monitor_events = events.clone();
                let interval = self.monitor_interval;
                *self.monitor.lock().await = Some(tokio::spawn(async move {
                    monitor(probe, interval, monitor_events).await;
                }));
                let _ = events.send(LinkEvent::AddressAcquired { address }).await;
            }
            Err(e) => {
                let _ = events
                    .send(LinkEvent::Disconnected {
                        reason: format!("{e:#}"),
                    })
                    .await;
            }
        }
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

/// Re-probe until the link fails once, then report and stop
async fn monitor(probe: Probe, interval: Duration, events: mpsc::Sender<LinkEvent>) {
    loop {
        sleep(interval).await;
        match probe.run().await {
            Ok(_) => debug!("link probe ok"),
            Err(e) => {
                warn!("link lost: {:#}", e);
                let _ = events
                    .send(LinkEvent::Disconnected {
                        reason: format!("{e:#}"),
                    })
                    .await;
                return;
            }
        }
    }
}

fn mask(password: &str) -> &'static str {
    if password.is_empty() {
        "<open>"
    } else {
        "********"
    }
}
