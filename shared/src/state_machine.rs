//! Link State Machine
//!
//! Defines valid link transitions and the side effects each one requires.
//! The machine is synchronous and owns no I/O: callers feed it driver events
//! and carry out the returned [`LinkAction`]s.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::link;

/// Link lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    Initialized,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Uninitialized => write!(f, "uninitialized"),
            LinkState::Initialized => write!(f, "initialized"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Which transport rides on top of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Long-lived publish/subscribe session; established only once the session is up
    Persistent,
    /// Request/response per delivery; established as soon as the link is up
    OneShot,
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Application asked for the link to come up
    StartRequested,
    /// Link driver finished starting
    DriverStarted,
    /// Association lost or attempt failed
    Disconnected { reason: String },
    /// Network address assigned
    AddressAcquired { address: IpAddr },
    /// Transport session reported connected
    SessionConnected,
    /// Transport session dropped
    SessionDisconnected { reason: String },
    /// Session reconnect delay elapsed
    SessionRetryElapsed,
}

/// Side effects requested by a transition, in execution order
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    /// Bring up the link driver, register handlers, apply credentials
    StartDriver,
    /// Arm the one-shot retry timer; on expiry attempt a connection
    ArmRetryTimer(Duration),
    /// Drop a pending retry timer
    CancelRetryTimer,
    /// Best-effort wall clock synchronization
    StartClockSync,
    /// Connect the persistent transport session
    ConnectSession,
    /// Tear the persistent transport session down
    TeardownSession,
    /// Wait out the session reconnect delay
    ScheduleSessionRetry,
    /// Wake whoever is waiting for the node to be established
    SignalEstablished,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid; perform `actions` in order
    Success {
        from: LinkState,
        to: LinkState,
        actions: Vec<LinkAction>,
    },
    /// Event does not apply in the current state; nothing changed
    Invalid { from: LinkState, event: LinkEvent },
}

/// Retry delay for a given consecutive-failure count
///
/// Linear, starting at zero: the first attempt after the driver starts is
/// immediate, each further failure adds [`link::BACKOFF_STEP_SECS`].
pub fn backoff(retry_count: u32) -> Duration {
    Duration::from_secs(u64::from(retry_count) * link::BACKOFF_STEP_SECS)
}

/// The link state machine
#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    mode: TransportMode,
    retry_count: u32,
    address: Option<IpAddr>,
    session_connected: bool,
    established: bool,
}

impl LinkStateMachine {
    /// Create a new state machine in Uninitialized state
    pub fn new(mode: TransportMode) -> Self {
        Self {
            state: LinkState::Uninitialized,
            mode,
            retry_count: 0,
            address: None,
            session_connected: false,
            established: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Consecutive disconnections since the last successful connection
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Address held while connected
    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    /// Whether the established signal has been requested
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        use LinkAction::*;
        use LinkState::*;

        let from = self.state;

        let actions = match (from, &event) {
            (Uninitialized, LinkEvent::StartRequested) => {
                self.state = Initialized;
                Some(vec![StartDriver])
            }

            (Initialized, LinkEvent::DriverStarted) => {
                self.state = Connecting;
                Some(vec![ArmRetryTimer(backoff(self.retry_count))])
            }

            (Connecting | Connected, LinkEvent::Disconnected { .. }) => {
                let mut actions = Vec::with_capacity(2);
                if from == Connected && self.mode == TransportMode::Persistent {
                    actions.push(TeardownSession);
                }
                self.session_connected = false;
                self.retry_count = self.retry_count.saturating_add(1);
                self.address = None;
                self.state = Connecting;
                actions.push(ArmRetryTimer(backoff(self.retry_count)));
                Some(actions)
            }

            (Connecting, LinkEvent::AddressAcquired { address }) => {
                self.retry_count = 0;
                self.address = Some(*address);
                self.state = Connected;

                let mut actions = vec![CancelRetryTimer, StartClockSync];
                match self.mode {
                    TransportMode::Persistent => actions.push(ConnectSession),
                    TransportMode::OneShot => actions.extend(self.establish()),
                }
                Some(actions)
            }

            // Lease renewal or address change while connected
            (Connected, LinkEvent::AddressAcquired { address }) => {
                self.address = Some(*address);
                Some(vec![])
            }

            (Connected, LinkEvent::SessionConnected) if self.mode == TransportMode::Persistent => {
                self.session_connected = true;
                Some(self.establish().into_iter().collect())
            }

            (Connecting | Connected, LinkEvent::SessionDisconnected { .. })
                if self.mode == TransportMode::Persistent =>
            {
                self.session_connected = false;
                if from == Connected {
                    Some(vec![ScheduleSessionRetry])
                } else {
                    // Reconnected on the next AddressAcquired
                    Some(vec![])
                }
            }

            (Connected, LinkEvent::SessionRetryElapsed)
                if self.mode == TransportMode::Persistent && !self.session_connected =>
            {
                Some(vec![ConnectSession])
            }

            _ => None,
        };

        let Some(actions) = actions else {
            return TransitionResult::Invalid { from, event };
        };

        TransitionResult::Success {
            from,
            to: self.state,
            actions,
        }
    }

    /// The established signal fires once per boot
    fn establish(&mut self) -> Option<LinkAction> {
        if self.established {
            None
        } else {
            self.established = true;
            Some(LinkAction::SignalEstablished)
        }
    }
}

/// Check if a link state may follow another
pub fn is_valid_transition(from: LinkState, to: LinkState) -> bool {
    use LinkState::*;

    matches!(
        (from, to),
        (Uninitialized, Initialized)
            | (Initialized, Connecting)
            | (Connecting, Connecting)
            | (Connecting, Connected)
            | (Connected, Connected)
            | (Connected, Connecting)
    )
}
