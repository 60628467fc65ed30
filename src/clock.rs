//! Wall clock synchronization
//!
//! One SNTP request (RFC 4330) is sent the first time the link comes up.
//! The measured offset is applied to every later [`TimeSync::now`] reading;
//! there is no retry and no periodic resync.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ClockConfig;

const NTP_PACKET_LEN: usize = 48;

/// Seconds between 1900-01-01 and 1970-01-01
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// LI = 0, VN = 3, Mode = 3 (client)
const CLIENT_HEADER: u8 = 0x1B;
const MODE_SERVER: u8 = 4;

/// Best-effort clock synchronization, started at most once
pub trait TimeSync: Send + Sync {
    /// Start synchronization; returns false if it was already started
    fn trigger(&self) -> bool;

    /// Current wall clock time, corrected once synchronized
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// SNTP-backed clock synchronization
pub struct ClockSync {
    server: String,
    timeout: Duration,
    started: AtomicBool,
    offset_ms: Arc<AtomicI64>,
}

impl ClockSync {
    pub fn new(config: &ClockConfig) -> Self {
        Self {
            server: config.server.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            started: AtomicBool::new(false),
            offset_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Correction applied to the host clock
    pub fn offset(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl TimeSync for ClockSync {
    fn trigger(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("SNTP already started");
            return false;
        }

        info!("SNTP started: {}", self.server);
        let server = self.server.clone();
        let limit = self.timeout;
        let offset = self.offset_ms.clone();

        tokio::spawn(async move {
            match query(&server, limit).await {
                Ok(time) => {
                    let offset_ms = (time - Utc::now()).num_milliseconds();
                    offset.store(offset_ms, Ordering::SeqCst);
                    info!(
                        "SNTP SYNC: {} (offset {} ms)",
                        time.with_timezone(&Local).format("%d-%m-%Y %H:%M:%S%.3f"),
                        offset_ms
                    );
                }
                Err(e) => warn!("SNTP sync with {} failed: {:#}", server, e),
            }
        });

        true
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset()
    }
}

/// Send a single SNTP request and return the server's transmit time
pub async fn query(server: &str, limit: Duration) -> Result<DateTime<Utc>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect(server)
        .await
        .with_context(|| format!("Failed to resolve SNTP server {server}"))?;
    socket.send(&request_packet()).await?;

    let mut buf = [0u8; NTP_PACKET_LEN];
    let n = timeout(limit, socket.recv(&mut buf))
        .await
        .map_err(|_| anyhow!("SNTP reply timed out after {:?}", limit))??;

    parse_reply(&buf[..n])
}

pub fn request_packet() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    packet
}

/// Extract the transmit timestamp from a server reply
pub fn parse_reply(buf: &[u8]) -> Result<DateTime<Utc>> {
    if buf.len() < NTP_PACKET_LEN {
        return Err(anyhow!("SNTP reply too short: {} bytes", buf.len()));
    }

    let mode = buf[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(anyhow!("SNTP reply has mode {mode}, expected {MODE_SERVER}"));
    }
    let stratum = buf[1];
    if stratum == 0 {
        return Err(anyhow!("SNTP kiss-o'-death from server"));
    }

    let seconds = u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]);
    let fraction = u32::from_be_bytes([buf[44], buf[45], buf[46], buf[47]]);

    // Era 1 starts in 2036; its timestamps have the top bit clear
    let mut ntp_secs = i64::from(seconds);
    if seconds & 0x8000_0000 == 0 {
        ntp_secs += 1 << 32;
    }
    let nanos = ((u64::from(fraction) * 1_000_000_000) >> 32) as u32;

    Utc.timestamp_opt(ntp_secs - NTP_UNIX_OFFSET, nanos)
        .single()
        .ok_or_else(|| anyhow!("SNTP timestamp out of range"))
}
