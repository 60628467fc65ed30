//! Telemetry loop
//!
//! Samples the sensor at a fixed period, encodes a frame, wraps it in the
//! JSON envelope and hands it to the transport. Nothing that goes wrong in
//! one iteration reaches the next. Wake-ups are scheduled from the previous
//! deadline so processing time never accumulates as drift.

use chrono::{Local, TimeZone};
use std::sync::Arc;
use std::time::Duration;
use telemetry_shared::{codec, TelemetryEnvelope, TelemetryReading};
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::clock::TimeSync;
use crate::sensor::SensorSource;
use crate::transport::Transport;

/// What happened in one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Delivered,
    SensorFailed,
    EncodeFailed,
    DeliveryFailed,
}

pub struct TelemetryLoop {
    device_id: String,
    sensor: Arc<dyn SensorSource>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn TimeSync>,
    period: Duration,
    consecutive_failures: u32,
}

impl TelemetryLoop {
    pub fn new(
        device_id: impl Into<String>,
        sensor: Arc<dyn SensorSource>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn TimeSync>,
        period: Duration,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sensor,
            transport,
            clock,
            period,
            consecutive_failures: 0,
        }
    }

    /// Run forever
    pub async fn run(&mut self) {
        info!(
            "Telemetry every {:?} via {} as {}",
            self.period,
            self.transport.name(),
            self.device_id
        );

        let mut deadline = Instant::now();
        loop {
            self.tick(&mut deadline).await;
        }
    }

    /// One iteration, then sleep until the next deadline
    async fn tick(&mut self, deadline: &mut Instant) -> IterationOutcome {
        let outcome = self.run_once().await;
        *deadline += self.period;
        sleep_until(*deadline).await;
        outcome
    }

    /// Deliveries that have failed since the last success
    #[cfg(test)]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub async fn run_once(&mut self) -> IterationOutcome {
        let (latitude, longitude) = match self.sensor.location() {
            Ok(location) => location,
            Err(e) => {
                error!("Failed to read location: {:#}", e);
                return IterationOutcome::SensorFailed;
            }
        };
        let battery = match self.sensor.battery() {
            Ok(battery) => battery,
            Err(e) => {
                error!("Failed to read battery: {:#}", e);
                return IterationOutcome::SensorFailed;
            }
        };

        let reading = TelemetryReading {
            latitude,
            longitude,
            battery,
            timestamp: self.clock.now().timestamp(),
        };
        info!(
            "Lat: {:.6}, Lon: {:.6}, Battery: {}%, Time: {}",
            reading.latitude,
            reading.longitude,
            reading.battery,
            local_time(reading.timestamp)
        );

        let body = match codec::encode(&reading)
            .and_then(|frame| TelemetryEnvelope::new(&self.device_id, &frame, reading.timestamp))
            .and_then(|envelope| envelope.to_json())
        {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode reading: {}", e);
                return IterationOutcome::EncodeFailed;
            }
        };

        match self.transport.deliver(body.as_bytes()).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                info!("Sent via {}: {}", self.transport.name(), body);
                IterationOutcome::Delivered
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                warn!(
                    "Delivery via {} failed ({} in a row): {}",
                    self.transport.name(),
                    self.consecutive_failures,
                    e
                );
                IterationOutcome::DeliveryFailed
            }
        }
    }
}

fn local_time(timestamp: i64) -> String {
    Local
        .timestamp_opt(timestamp, 0)
        .earliest()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::traits::DeliveryError;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    /// Clock pinned to one instant
    struct FixedClock(i64);

    impl TimeSync for FixedClock {
        fn trigger(&self) -> bool {
            false
        }

        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp(self.0, 0).unwrap()
        }
    }

    fn host_clock() -> Arc<FixedClock> {
        Arc::new(FixedClock(Utc::now().timestamp()))
    }

    struct FixedSensor {
        location: Option<(f64, f64)>,
        battery: u8,
    }

    impl SensorSource for FixedSensor {
        fn location(&self) -> Result<(f64, f64)> {
            self.location.ok_or_else(|| anyhow!("no fix"))
        }

        fn battery(&self) -> Result<u8> {
            Ok(self.battery)
        }
    }

    fn sensor() -> Arc<FixedSensor> {
        Arc::new(FixedSensor {
            location: Some((13.75, 100.60)),
            battery: 42,
        })
    }

    /// Records each call; fails the listed calls and sleeps `busy` inside each one
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(Instant, String)>>,
        fail_calls: Vec<usize>,
        busy: Duration,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver(&self, body: &[u8]) -> Result<(), DeliveryError> {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((Instant::now(), String::from_utf8(body.to_vec()).unwrap()));
                calls.len() - 1
            };
            tokio::time::sleep(self.busy).await;
            if self.fail_calls.contains(&index) {
                return Err(DeliveryError::SessionClosed);
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[tokio::test]
    async fn test_iteration_delivers_envelope() {
        let transport = Arc::new(RecordingTransport::default());
        let mut telemetry = TelemetryLoop::new(
            "TC_A1B2C3D4E5F6",
            sensor(),
            transport.clone(),
            host_clock(),
            Duration::from_secs(60),
        );

        assert_eq!(telemetry.run_once().await, IterationOutcome::Delivered);

        let calls = transport.calls.lock().unwrap();
        let envelope = TelemetryEnvelope::from_json(&calls[0].1).unwrap();
        assert_eq!(envelope.id, "TC_A1B2C3D4E5F6");
        assert_eq!(envelope.payload, "938EC7892A");
        assert_eq!(envelope.date.len(), 10);
        assert_eq!(envelope.time.len(), 8);
    }

    #[tokio::test]
    async fn test_reading_uses_synchronized_clock() {
        // Host clock an hour behind the synchronized one
        let synced = Utc::now().timestamp() + 3600;
        let transport = Arc::new(RecordingTransport::default());
        let mut telemetry = TelemetryLoop::new(
            "TC_X",
            sensor(),
            transport.clone(),
            Arc::new(FixedClock(synced)),
            Duration::from_secs(60),
        );

        assert_eq!(telemetry.run_once().await, IterationOutcome::Delivered);

        let calls = transport.calls.lock().unwrap();
        let envelope = TelemetryEnvelope::from_json(&calls[0].1).unwrap();
        let frame = envelope.frame().unwrap();
        let expected = TelemetryEnvelope::new("TC_X", &frame, synced).unwrap();
        assert_eq!(envelope.date, expected.date);
        assert_eq!(envelope.time, expected.time);
    }

    #[tokio::test]
    async fn test_sensor_failure_skips_delivery() {
        let transport = Arc::new(RecordingTransport::default());
        let sensor = Arc::new(FixedSensor {
            location: None,
            battery: 42,
        });
        let mut telemetry = TelemetryLoop::new("TC_X", sensor, transport.clone(), host_clock(), Duration::from_secs(60));

        assert_eq!(telemetry.run_once().await, IterationOutcome::SensorFailed);
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_reading_skips_delivery() {
        let transport = Arc::new(RecordingTransport::default());
        let sensor = Arc::new(FixedSensor {
            location: Some((91.0, 100.60)),
            battery: 42,
        });
        let mut telemetry = TelemetryLoop::new("TC_X", sensor, transport.clone(), host_clock(), Duration::from_secs(60));

        assert_eq!(telemetry.run_once().await, IterationOutcome::EncodeFailed);
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_shift_schedule() {
        let transport = Arc::new(RecordingTransport {
            fail_calls: vec![1, 2],
            busy: Duration::from_secs(7),
            ..Default::default()
        });
        let period = Duration::from_secs(60);
        let mut telemetry = TelemetryLoop::new("TC_X", sensor(), transport.clone(), host_clock(), period);

        let start = Instant::now();
        let mut deadline = start;
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(telemetry.tick(&mut deadline).await);
        }

        assert_eq!(
            outcomes,
            vec![
                IterationOutcome::Delivered,
                IterationOutcome::DeliveryFailed,
                IterationOutcome::DeliveryFailed,
                IterationOutcome::Delivered,
                IterationOutcome::Delivered,
            ]
        );

        // Every iteration starts on its deadline despite 7s spent delivering
        let calls = transport.calls.lock().unwrap();
        for (k, (at, _)) in calls.iter().enumerate() {
            assert_eq!(at.duration_since(start), period * k as u32);
        }
        assert_eq!(telemetry.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failure_count() {
        let transport = Arc::new(RecordingTransport {
            fail_calls: vec![0, 1, 2],
            ..Default::default()
        });
        let mut telemetry = TelemetryLoop::new("TC_X", sensor(), transport, host_clock(), Duration::from_secs(1));

        for _ in 0..3 {
            telemetry.run_once().await;
        }
        assert_eq!(telemetry.consecutive_failures(), 3);
    }
}
