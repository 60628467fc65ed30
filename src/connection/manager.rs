//! Link manager
//!
//! Adapter between the pure [`LinkStateMachine`] and the asynchronous world.
//! Driver, session and timer callbacks only post [`LinkEvent`]s to a queue;
//! a single task consumes the queue, feeds the state machine and performs
//! the returned actions. That task is the only writer of link state.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use telemetry_shared::state_machine::TransitionResult;
use telemetry_shared::{LinkAction, LinkEvent, LinkState, LinkStateMachine, TransportMode};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::driver::LinkDriver;
use crate::clock::TimeSync;
use crate::transport::SessionControl;

const EVENT_QUEUE_DEPTH: usize = 32;

/// Wake-up delivered once when the node is established
pub type EstablishedSignal = oneshot::Receiver<()>;

pub struct LinkManager {
    machine: LinkStateMachine,
    driver: Arc<dyn LinkDriver>,
    clock: Arc<dyn TimeSync>,
    session: Option<Arc<dyn SessionControl>>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
    state_tx: watch::Sender<LinkState>,
    established: Option<oneshot::Sender<()>>,
    retry_timer: Option<JoinHandle<()>>,
    session_retry: Option<JoinHandle<()>>,
    session_retry_delay: Duration,
}

impl LinkManager {
    pub fn new(
        mode: TransportMode,
        driver: Arc<dyn LinkDriver>,
        clock: Arc<dyn TimeSync>,
        session_retry_delay: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (state_tx, _) = watch::channel(LinkState::Uninitialized);

        Self {
            machine: LinkStateMachine::new(mode),
            driver,
            clock,
            session: None,
            events_tx,
            events_rx,
            state_tx,
            established: None,
            retry_timer: None,
            session_retry: None,
            session_retry_delay,
        }
    }

    /// Queue for driver and session callbacks
    pub fn event_sender(&self) -> mpsc::Sender<LinkEvent> {
        self.events_tx.clone()
    }

    /// Read-only view of the link state
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Persistent session driven on link up/down
    pub fn attach_session(&mut self, session: Arc<dyn SessionControl>) {
        self.session = Some(session);
    }

    /// Signal fired once the node is established; replaces any earlier one
    pub fn established_signal(&mut self) -> EstablishedSignal {
        let (tx, rx) = oneshot::channel();
        self.established = Some(tx);
        rx
    }

    /// Bring the link driver up and start processing events
    ///
    /// Driver or session initialization failures are returned to the caller;
    /// everything after that is handled inside the event task.
    pub async fn start(mut self) -> Result<JoinHandle<()>> {
        if self.machine.mode() == TransportMode::Persistent && self.session.is_none() {
            warn!("[LINK] Persistent transport without a session; it will never be established");
        }

        let TransitionResult::Success { from, to, actions } =
            self.machine.process_event(LinkEvent::StartRequested)
        else {
            anyhow::bail!("link manager already started");
        };
        self.publish_state(from, to);

        for action in actions {
            self.apply(action).await?;
        }

        Ok(tokio::spawn(async move { self.run().await }))
    }

    async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event).await;
        }
        error!("[LINK] Event queue closed");
    }

    async fn handle_event(&mut self, event: LinkEvent) {
        match &event {
            LinkEvent::Disconnected { reason } => warn!("[LINK] Disconnected: {}", reason),
            LinkEvent::SessionDisconnected { reason } => warn!("[LINK] Session dropped: {}", reason),
            other => info!("[LINK] Event: {:?}", other),
        }

        match self.machine.process_event(event) {
            TransitionResult::Success { from, to, actions } => {
                self.publish_state(from, to);
                for action in actions {
                    if let Err(e) = self.apply(action).await {
                        error!("[LINK] Action failed: {:#}", e);
                    }
                }
            }
            TransitionResult::Invalid { from, event } => {
                warn!("[LINK] Ignoring {:?} in state {}", event, from);
            }
        }
    }

    fn publish_state(&self, from: LinkState, to: LinkState) {
        if from != to {
            info!("[LINK] {} -> {}", from, to);
            self.state_tx.send_replace(to);
        }
    }

    async fn apply(&mut self, action: LinkAction) -> Result<()> {
        debug!("[LINK] Action: {:?}", action);

        match action {
            LinkAction::StartDriver => {
                if let Some(session) = &self.session {
                    session.init().context("Failed to initialize transport session")?;
                }
                self.driver
                    .start(self.events_tx.clone())
                    .await
                    .with_context(|| format!("Failed to start {} link driver", self.driver.name()))?;
            }

            LinkAction::ArmRetryTimer(delay) => {
                self.cancel_retry_timer();
                info!(
                    "[LINK] Retry to connect in {}s (retry count {})",
                    delay.as_secs(),
                    self.machine.retry_count()
                );

                let driver = self.driver.clone();
                self.retry_timer = Some(tokio::spawn(async move {
                    sleep(delay).await;
                    // The attempt outlives the timer so cancelling never interrupts it
                    tokio::spawn(async move { driver.connect().await });
                }));
            }

            LinkAction::CancelRetryTimer => self.cancel_retry_timer(),

            LinkAction::StartClockSync => {
                self.clock.trigger();
            }

            LinkAction::ConnectSession => {
                self.cancel_session_retry();
                if let Some(session) = &self.session {
                    session.connect().await.context("Failed to connect session")?;
                }
            }

            LinkAction::TeardownSession => {
                self.cancel_session_retry();
                if let Some(session) = &self.session {
                    session.teardown().await;
                }
            }

            LinkAction::ScheduleSessionRetry => {
                self.cancel_session_retry();
                info!("[LINK] Reconnecting session in {:?}", self.session_retry_delay);

                let events = self.events_tx.clone();
                let delay = self.session_retry_delay;
                self.session_retry = Some(tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = events.send(LinkEvent::SessionRetryElapsed).await;
                }));
            }

            LinkAction::SignalEstablished => {
                if let Some(established) = self.established.take() {
                    info!("[LINK] Connectivity established");
                    let _ = established.send(());
                }
            }
        }

        Ok(())
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn cancel_session_retry(&mut self) {
        if let Some(timer) = self.session_retry.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    const ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    /// Driver whose connect attempts follow a script; `false` fails, `true` succeeds
    #[derive(Default)]
    struct ScriptedDriver {
        events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
        script: Mutex<VecDeque<bool>>,
        connects: Mutex<Vec<Instant>>,
        fail_start: bool,
    }

    impl ScriptedDriver {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                ..Default::default()
            })
        }

        fn connect_times(&self) -> Vec<Instant> {
            self.connects.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LinkDriver for ScriptedDriver {
        async fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<()> {
            if self.fail_start {
                bail!("no radio");
            }
            *self.events.lock().unwrap() = Some(events.clone());
            events.send(LinkEvent::DriverStarted).await?;
            Ok(())
        }

        async fn connect(&self) {
            self.connects.lock().unwrap().push(Instant::now());
            let succeed = self.script.lock().unwrap().pop_front().unwrap_or(true);
            let events = self.events.lock().unwrap().clone().unwrap();
            let event = if succeed {
                LinkEvent::AddressAcquired { address: ADDRESS }
            } else {
                LinkEvent::Disconnected {
                    reason: "auth failed".into(),
                }
            };
            events.send(event).await.unwrap();
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct CountingClock {
        triggers: AtomicUsize,
    }

    impl TimeSync for CountingClock {
        fn trigger(&self) -> bool {
            self.triggers.fetch_add(1, Ordering::SeqCst) == 0
        }
    }

    /// Session that connects immediately and reports teardown like the real one
    struct FakeSession {
        events: mpsc::Sender<LinkEvent>,
        inits: AtomicUsize,
        connects: AtomicUsize,
        teardowns: AtomicUsize,
    }

    impl FakeSession {
        fn new(events: mpsc::Sender<LinkEvent>) -> Arc<Self> {
            Arc::new(Self {
                events,
                inits: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                teardowns: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SessionControl for FakeSession {
        fn init(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.events.send(LinkEvent::SessionConnected).await?;
            Ok(())
        }

        async fn teardown(&self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            let _ = self
                .events
                .send(LinkEvent::SessionDisconnected {
                    reason: "teardown requested".into(),
                })
                .await;
        }
    }

    async fn wait_for_state(state: &mut watch::Receiver<LinkState>, want: LinkState) {
        state.wait_for(|s| *s == want).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_backoff_then_established() {
        let driver = ScriptedDriver::new(&[false, false, false, true]);
        let clock = Arc::new(CountingClock::default());
        let mut manager = LinkManager::new(
            TransportMode::OneShot,
            driver.clone(),
            clock.clone(),
            Duration::from_secs(10),
        );
        let established = manager.established_signal();
        let state = manager.state();

        let start = Instant::now();
        manager.start().await.unwrap();
        established.await.unwrap();

        // Attempts at 0, then 2, 4 and 6 seconds after each failure
        let offsets: Vec<Duration> = driver
            .connect_times()
            .iter()
            .map(|t| t.duration_since(start))
            .collect();
        assert_eq!(
            offsets,
            vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(2 + 4),
                Duration::from_secs(2 + 4 + 6),
            ]
        );
        assert_eq!(*state.borrow(), LinkState::Connected);
        assert_eq!(clock.triggers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_waits_for_session() {
        let driver = ScriptedDriver::new(&[]);
        let clock = Arc::new(CountingClock::default());
        let mut manager = LinkManager::new(
            TransportMode::Persistent,
            driver.clone(),
            clock.clone(),
            Duration::from_secs(10),
        );
        let session = FakeSession::new(manager.event_sender());
        manager.attach_session(session.clone());
        let established = manager.established_signal();
        let mut state = manager.state();
        let events = manager.event_sender();

        manager.start().await.unwrap();
        established.await.unwrap();
        assert_eq!(session.inits.load(Ordering::SeqCst), 1);
        assert_eq!(session.connects.load(Ordering::SeqCst), 1);

        // Link drop tears the session down, reconnect brings it back
        events
            .send(LinkEvent::Disconnected {
                reason: "beacon timeout".into(),
            })
            .await
            .unwrap();
        wait_for_state(&mut state, LinkState::Connecting).await;
        wait_for_state(&mut state, LinkState::Connected).await;

        while session.connects.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(session.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(session.inits.load(Ordering::SeqCst), 1);
        assert_eq!(clock.triggers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_drop_reconnects_after_delay() {
        let driver = ScriptedDriver::new(&[]);
        let mut manager = LinkManager::new(
            TransportMode::Persistent,
            driver,
            Arc::new(CountingClock::default()),
            Duration::from_secs(10),
        );
        let session = FakeSession::new(manager.event_sender());
        manager.attach_session(session.clone());
        let established = manager.established_signal();
        let events = manager.event_sender();

        manager.start().await.unwrap();
        established.await.unwrap();

        let dropped_at = Instant::now();
        events
            .send(LinkEvent::SessionDisconnected {
                reason: "broker closed connection".into(),
            })
            .await
            .unwrap();

        while session.connects.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(dropped_at.elapsed() >= Duration::from_secs(10));
        assert_eq!(session.teardowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_driver_start_failure_is_fatal() {
        let driver = Arc::new(ScriptedDriver {
            fail_start: true,
            ..Default::default()
        });
        let manager = LinkManager::new(
            TransportMode::OneShot,
            driver,
            Arc::new(CountingClock::default()),
            Duration::from_secs(10),
        );

        let err = manager.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("no radio"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_event_is_ignored() {
        let driver = ScriptedDriver::new(&[]);
        let mut manager = LinkManager::new(
            TransportMode::OneShot,
            driver,
            Arc::new(CountingClock::default()),
            Duration::from_secs(10),
        );
        let established = manager.established_signal();
        let state = manager.state();
        let events = manager.event_sender();

        manager.start().await.unwrap();
        established.await.unwrap();

        events.send(LinkEvent::SessionConnected).await.unwrap();
        events.send(LinkEvent::DriverStarted).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*state.borrow(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_link_drop_during_session_handshake() {
        use crate::config::MqttConfig;
        use crate::transport::PersistentSession;
        use tokio::net::TcpListener;

        // Broker that accepts TCP and never answers CONNECT
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_url = format!("mqtt://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let driver = ScriptedDriver::new(&[]);
        let mut manager = LinkManager::new(
            TransportMode::Persistent,
            driver.clone(),
            Arc::new(CountingClock::default()),
            Duration::from_secs(10),
        );
        let config = MqttConfig {
            broker_url,
            connect_timeout_ms: 10_000,
            ..MqttConfig::default()
        };
        let session =
            Arc::new(PersistentSession::new(&config, "TC_TEST", manager.event_sender()).unwrap());
        manager.attach_session(session);
        let mut state = manager.state();
        let events = manager.event_sender();

        manager.start().await.unwrap();
        wait_for_state(&mut state, LinkState::Connected).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let dropped_at = Instant::now();
        events
            .send(LinkEvent::Disconnected {
                reason: "beacon timeout".into(),
            })
            .await
            .unwrap();

        // Teardown returns at once, so the 2s retry fires on schedule
        while driver.connect_times().len() < 2 {
            assert!(dropped_at.elapsed() < Duration::from_secs(5), "retry never fired");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let retry_after = driver.connect_times()[1].duration_since(dropped_at);
        assert!(retry_after >= Duration::from_secs(2));
        assert!(retry_after < Duration::from_millis(3000), "{retry_after:?}");
    }
}
