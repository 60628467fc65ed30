//! Persistent MQTT session
//!
//! The session object is created when the link driver starts and connected
//! each time the link comes up. A background task owns the socket: it sends
//! CONNECT, waits for CONNACK, then multiplexes publishes, keep-alive pings
//! and broker traffic until the socket fails or a teardown is requested.
//! Session state is written only by that task.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use telemetry_shared::mqtt::{self, Connect, Packet, PacketDecoder};
use telemetry_shared::LinkEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use super::traits::{DeliveryError, SessionControl, SessionState, Transport};
use crate::config::MqttConfig;

const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct SessionSettings {
    broker: String,
    topic: String,
    client_id: String,
    keep_alive: u16,
    connect_timeout: Duration,
    username: Option<String>,
    password: Option<String>,
}

struct Outbound {
    payload: Bytes,
    done: oneshot::Sender<Result<(), DeliveryError>>,
}

struct ActiveSession {
    outbound_tx: mpsc::Sender<Outbound>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// MQTT-backed persistent transport
pub struct PersistentSession {
    settings: SessionSettings,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::Sender<LinkEvent>,
    active: Mutex<Option<ActiveSession>>,
}

impl PersistentSession {
    /// Create a session that reports lifecycle events to the link manager
    pub fn new(config: &MqttConfig, device_id: &str, events: mpsc::Sender<LinkEvent>) -> Result<Self> {
        let broker = mqtt::parse_broker_url(&config.broker_url)?;
        let (state, _) = watch::channel(SessionState::Uninitialized);

        Ok(Self {
            settings: SessionSettings {
                broker,
                topic: mqtt::telemetry_topic(&config.topic_namespace, device_id),
                client_id: device_id.to_string(),
                keep_alive: config.keep_alive_secs,
                connect_timeout: Duration::from_millis(config.connect_timeout_ms),
                username: config.username.clone(),
                password: config.password.clone(),
            },
            state: Arc::new(state),
            events,
            active: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn topic(&self) -> &str {
        &self.settings.topic
    }
}

#[async_trait]
impl Transport for PersistentSession {
    async fn deliver(&self, body: &[u8]) -> Result<(), DeliveryError> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(DeliveryError::InvalidState(format!("session {state}")));
        }

        let outbound_tx = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.outbound_tx.clone())
            .ok_or(DeliveryError::SessionClosed)?;

        let (done, done_rx) = oneshot::channel();
        outbound_tx
            .send(Outbound {
                payload: Bytes::copy_from_slice(body),
                done,
            })
            .await
            .map_err(|_| DeliveryError::SessionClosed)?;

        info!("Sending MQTT message to topic: {}", self.settings.topic);
        done_rx.await.map_err(|_| DeliveryError::SessionClosed)?
    }

    fn name(&self) -> &'static str {
        "MQTT"
    }
}

#[async_trait]
impl SessionControl for PersistentSession {
    fn init(&self) -> Result<()> {
        let state = self.state();
        if state != SessionState::Uninitialized {
            bail!("MQTT session cannot be initialized from state {state}");
        }
        info!("MQTT connection url: mqtt://{}", self.settings.broker);
        self.state.send_replace(SessionState::Initialized);
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        let state = self.state();
        if state != SessionState::Initialized {
            bail!("MQTT session cannot connect from state {state}");
        }

        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|a| !a.task.is_finished()) {
            bail!("MQTT session is already connecting");
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            self.settings.clone(),
            self.state.clone(),
            self.events.clone(),
            outbound_rx,
            shutdown_rx,
        ));

        *active = Some(ActiveSession {
            outbound_tx,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    async fn teardown(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };

        let _ = active.shutdown_tx.send(());
        let abort = active.task.abort_handle();
        if timeout(TEARDOWN_GRACE, active.task).await.is_err() {
            warn!("MQTT session did not stop within {:?}, aborting", TEARDOWN_GRACE);
            abort.abort();
            self.state.send_replace(SessionState::Initialized);
        }
    }
}

/// Session task: connect, serve, then report the drop
async fn run_session(
    settings: SessionSettings,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::Sender<LinkEvent>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let reason = match serve(&settings, &state, &events, &mut outbound_rx, &mut shutdown_rx).await {
        Ok(()) => "teardown requested".to_string(),
        Err(e) => format!("{e:#}"),
    };

    state.send_replace(SessionState::Initialized);
    info!("MQTT_EVENT_DISCONNECTED: {}", reason);
    let _ = events.send(LinkEvent::SessionDisconnected { reason }).await;
}

async fn serve(
    settings: &SessionSettings,
    state: &watch::Sender<SessionState>,
    events: &mpsc::Sender<LinkEvent>,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Result<()> {
    // Teardown may arrive while still connecting
    let (mut reader, mut writer, mut decoder) = tokio::select! {
        _ = &mut *shutdown_rx => return Ok(()),
        handshake = handshake(settings) => handshake?,
    };
    let mut read_buf = vec![0u8; 1024];

    state.send_replace(SessionState::Connected);
    info!("MQTT_EVENT_CONNECTED: {}", settings.broker);
    let _ = events.send(LinkEvent::SessionConnected).await;

    let mut keep_alive = interval(Duration::from_secs(u64::from(settings.keep_alive.max(1))));
    keep_alive.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = &mut *shutdown_rx => {
                if let Ok(bytes) = mqtt::encode_to_bytes(&Packet::Disconnect) {
                    let _ = writer.write_all(&bytes).await;
                }
                let _ = writer.shutdown().await;
                return Ok(());
            }

            Some(outbound) = outbound_rx.recv() => {
                publish(&mut writer, &settings.topic, outbound).await?;
            }

            _ = keep_alive.tick() => {
                if awaiting_pong {
                    bail!("no PINGRESP within keep-alive period");
                }
                writer.write_all(&mqtt::encode_to_bytes(&Packet::PingReq)?).await?;
                awaiting_pong = true;
            }

            read = reader.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    bail!("broker closed connection");
                }
                decoder.extend(&read_buf[..n]);

                while let Some(packet) = decoder.decode_next()? {
                    match packet {
                        Packet::PingResp => awaiting_pong = false,
                        Packet::Publish { topic, .. } => debug!("MQTT_EVENT_DATA on {}", topic),
                        Packet::Disconnect => bail!("broker sent DISCONNECT"),
                        other => debug!("Ignoring MQTT packet: {:?}", other),
                    }
                }
            }
        }
    }
}

/// TCP connect, CONNECT, and a successful CONNACK
async fn handshake(
    settings: &SessionSettings,
) -> Result<(OwnedReadHalf, OwnedWriteHalf, PacketDecoder)> {
    let stream = timeout(settings.connect_timeout, TcpStream::connect(&settings.broker))
        .await
        .map_err(|_| anyhow!("connect to {} timed out", settings.broker))??;
    let (mut reader, mut writer) = stream.into_split();

    let connect = Packet::Connect(Connect {
        client_id: settings.client_id.clone(),
        keep_alive_secs: settings.keep_alive,
        clean_session: true,
        username: settings.username.clone(),
        password: settings.password.clone(),
    });
    writer.write_all(&mqtt::encode_to_bytes(&connect)?).await?;

    let mut decoder = PacketDecoder::new();
    let mut read_buf = vec![0u8; 1024];

    let ack = timeout(
        settings.connect_timeout,
        read_packet(&mut reader, &mut decoder, &mut read_buf),
    )
    .await
    .map_err(|_| anyhow!("no CONNACK within {:?}", settings.connect_timeout))??;

    match ack {
        Packet::ConnAck { return_code: 0, .. } => Ok((reader, writer, decoder)),
        Packet::ConnAck { return_code, .. } => {
            bail!("broker refused connection (return code {return_code})")
        }
        other => bail!("expected CONNACK, got {other:?}"),
    }
}

/// Write one PUBLISH and report the outcome to the caller
///
/// Encode failures only fail this message; write failures end the session.
async fn publish(writer: &mut OwnedWriteHalf, topic: &str, outbound: Outbound) -> Result<()> {
    let packet = Packet::Publish {
        topic: topic.to_string(),
        payload: outbound.payload,
    };

    let bytes = match mqtt::encode_to_bytes(&packet) {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = outbound.done.send(Err(DeliveryError::Encode(e)));
            return Ok(());
        }
    };

    match writer.write_all(&bytes).await {
        Ok(()) => {
            let _ = outbound.done.send(Ok(()));
            Ok(())
        }
        Err(e) => {
            let reason = format!("publish write failed: {e}");
            let _ = outbound.done.send(Err(DeliveryError::Io(e)));
            Err(anyhow!(reason))
        }
    }
}

async fn read_packet(
    reader: &mut OwnedReadHalf,
    decoder: &mut PacketDecoder,
    buf: &mut [u8],
) -> Result<Packet> {
    loop {
        if let Some(packet) = decoder.decode_next()? {
            return Ok(packet);
        }
        let n = reader.read(buf).await?;
        if n == 0 {
            bail!("broker closed connection");
        }
        decoder.extend(&buf[..n]);
    }
}
