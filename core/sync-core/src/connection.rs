//! Connection Manager - owns the single live transport and its reconnect cycle.
//!
//! ```text
//! Disconnected --connect()--------------------------> Connecting
//! Connecting   --opened-----------------------------> Connected      (attempts = 0)
//! Connecting   --open failed------------------------> Reconnecting   (attempts += 1)
//! Reconnecting --open failed, attempts < max--------> Reconnecting   (retry after backoff)
//! Reconnecting --open failed, attempts >= max-------> Failed         (terminal)
//! Connected    --closed by peer, auto_reconnect-----> Reconnecting
//! Connected    --disconnect()-----------------------> Disconnected
//! Failed       --connect()--------------------------> Connecting     (attempts = 0)
//! ```
//!
//! The manager never blocks. Drivers call [`ConnectionManager::poll`] from
//! their event loop; it fires due retries, drains the transport and returns
//! the resulting [`ConnectionEvent`]s in delivery order.

use crate::error::{Result, SyncError};
use crate::transport::{Endpoint, Transport, TransportEvent};
use serde::Serialize;
use std::time::{Duration, Instant};
use tasksync_protocol::{Frame, Handshake};
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_DELAY_MS: u64 = 1000;
const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }

    fn is_attempting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is an edge of the connection state machine.
///
/// `explicit` marks transitions requested by the caller (`connect`/`disconnect`).
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState, explicit: bool) -> bool {
    use ConnectionState::*;
    match (from, to) {
        (Disconnected, Connecting) | (Failed, Connecting) => explicit,
        (Connected, Disconnected) => true,
        (Connecting | Reconnecting, Disconnected) => explicit,
        (Connecting, Connected)
        | (Connecting, Reconnecting)
        | (Connecting, Failed)
        | (Reconnecting, Reconnecting)
        | (Reconnecting, Connected)
        | (Reconnecting, Failed)
        | (Connected, Reconnecting) => !explicit,
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconnect Policy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed { delay: Duration },
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { initial, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub auto_reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Fixed {
                delay: Duration::from_millis(DEFAULT_DELAY_MS),
            },
            auto_reconnect: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle notifications and inbound frames, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { error: String, attempt: u32 },
    /// The reconnect budget is spent; only an explicit `connect` restarts.
    Failed { attempts: u32 },
    Frame(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Target {
    endpoint: Endpoint,
    handshake: Handshake,
}

pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    retry_at: Option<Instant>,
    target: Option<Target>,
    deferred: Vec<TransportEvent>,
    outbox: Vec<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(transport: Box<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            retry_at: None,
            target: None,
            deferred: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Consecutive failed attempts in the current cycle.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// When the next automatic retry is due, if one is scheduled.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Starts a connection cycle.
    ///
    /// A no-op while connected, or while an attempt is in flight, to the same
    /// endpoint as the same user and device. A different target tears the live
    /// connection down first, so there is never more than one. Only a
    /// malformed endpoint or handshake is an error; unreachable brokers surface
    /// as [`ConnectionEvent::ConnectError`] from `poll`.
    pub fn connect(&mut self, endpoint: &str, user_id: &str, device_id: &str) -> Result<()> {
        let endpoint = Endpoint::parse(endpoint)?;
        let handshake = Handshake::new(user_id, device_id);
        handshake
            .validate()
            .map_err(SyncError::InvalidHandshake)?;

        match self.state {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => {
                let same_target = self.target.as_ref().is_some_and(|target| {
                    target.endpoint == endpoint && target.handshake == handshake
                });
                if same_target {
                    info!(state = %self.state, "Sync connection already active for this target");
                    return Ok(());
                }
                info!(
                    state = %self.state,
                    user_id = %handshake.user_id,
                    "Sync target changed; replacing the live connection"
                );
                self.disconnect();
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }

        info!(
            endpoint = %endpoint,
            user_id = %handshake.user_id,
            device_id = %handshake.device_id,
            "Connecting to sync broker"
        );

        self.attempts = 0;
        self.retry_at = None;
        self.deferred.clear();
        self.target = Some(Target {
            endpoint,
            handshake,
        });
        self.transition(ConnectionState::Connecting, true);
        self.open_transport();
        Ok(())
    }

    /// Tears down the live transport. Safe to call at any time.
    ///
    /// A `Disconnected` notification is queued for the next `poll` when a
    /// connection was up; consumers must tolerate it arriving after teardown.
    pub fn disconnect(&mut self) {
        if self.target.is_none() {
            debug!("Disconnect requested with no active sync connection");
            return;
        }

        info!(state = %self.state, "Disconnecting from sync broker");
        let was_connected = self.is_connected();
        self.transport.close();
        self.target = None;
        self.retry_at = None;
        self.deferred.clear();

        if was_connected {
            self.outbox.push(ConnectionEvent::Disconnected {
                reason: CLIENT_DISCONNECT_REASON.to_string(),
            });
        }
        // Failed stays Failed until an explicit connect.
        if self.state != ConnectionState::Failed {
            self.transition(ConnectionState::Disconnected, true);
        }
    }

    /// Sends a `ping`. Returns false when not connected or the write fails.
    pub fn ping(&mut self) -> bool {
        if !self.is_connected() {
            debug!("Skipping ping while not connected");
            return false;
        }
        match self.transport.send(&Frame::ping()) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Failed to send ping");
                false
            }
        }
    }

    pub fn poll(&mut self) -> Vec<ConnectionEvent> {
        self.poll_at(Instant::now())
    }

    /// Fires a due retry, drains the transport and applies the state machine.
    pub fn poll_at(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        let mut events = std::mem::take(&mut self.outbox);

        if self.state == ConnectionState::Reconnecting
            && self.retry_at.map(|at| now >= at).unwrap_or(false)
        {
            self.retry_at = None;
            info!(
                attempt = self.attempts + 1,
                max_attempts = self.policy.max_attempts,
                "Retrying sync connection"
            );
            self.open_transport();
        }

        let mut incoming = std::mem::take(&mut self.deferred);
        incoming.extend(self.transport.poll());
        for event in incoming {
            self.handle_transport_event(event, now, &mut events);
        }

        events
    }

    fn open_transport(&mut self) {
        let Some(target) = self.target.as_ref() else {
            return;
        };
        if let Err(err) = self.transport.open(&target.endpoint, &target.handshake) {
            self.deferred.push(TransportEvent::OpenFailed(err.to_string()));
        }
    }

    fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
        events: &mut Vec<ConnectionEvent>,
    ) {
        match event {
            TransportEvent::Opened => {
                if !self.state.is_attempting() {
                    debug!(state = %self.state, "Ignoring transport open outside an attempt");
                    return;
                }
                self.attempts = 0;
                self.retry_at = None;
                self.transition(ConnectionState::Connected, false);
                info!("Sync connection established");
                events.push(ConnectionEvent::Connected);
            }
            TransportEvent::OpenFailed(reason) => self.handle_open_failure(reason, now, events),
            TransportEvent::Closed(reason) => match self.state {
                ConnectionState::Connected => {
                    info!(reason = %reason, "Sync connection lost");
                    events.push(ConnectionEvent::Disconnected { reason });
                    if self.policy.auto_reconnect {
                        self.attempts = 0;
                        self.retry_at = Some(now + self.policy.backoff.delay_for(1));
                        self.transition(ConnectionState::Reconnecting, false);
                    } else {
                        self.transport.close();
                        self.target = None;
                        self.transition(ConnectionState::Disconnected, false);
                    }
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.handle_open_failure(reason, now, events)
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    debug!(reason = %reason, "Ignoring transport close while idle");
                }
            },
            TransportEvent::Frame(bytes) => {
                if self.is_connected() {
                    events.push(ConnectionEvent::Frame(bytes));
                } else {
                    debug!(
                        state = %self.state,
                        bytes = bytes.len(),
                        "Dropping frame received while not connected"
                    );
                }
            }
        }
    }

    fn handle_open_failure(
        &mut self,
        reason: String,
        now: Instant,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if !self.state.is_attempting() {
            debug!(state = %self.state, error = %reason, "Ignoring connect error outside an attempt");
            return;
        }

        self.attempts += 1;
        warn!(
            attempt = self.attempts,
            max_attempts = self.policy.max_attempts,
            error = %reason,
            "Sync connection attempt failed"
        );
        events.push(ConnectionEvent::ConnectError {
            error: reason,
            attempt: self.attempts,
        });

        if self.attempts >= self.policy.max_attempts {
            self.transport.close();
            self.retry_at = None;
            self.transition(ConnectionState::Failed, false);
            error!(
                attempts = self.attempts,
                "Max reconnection attempts reached; sync connection failed"
            );
            events.push(ConnectionEvent::Failed {
                attempts: self.attempts,
            });
        } else {
            let delay = self.policy.backoff.delay_for(self.attempts);
            self.retry_at = Some(now + delay);
            debug!(delay_ms = delay.as_millis() as u64, "Scheduled sync reconnect");
            self.transition(ConnectionState::Reconnecting, false);
        }
    }

    fn transition(&mut self, to: ConnectionState, explicit: bool) {
        let from = self.state;
        if from == to && to != ConnectionState::Reconnecting {
            return;
        }
        debug_assert!(
            is_valid_transition(from, to, explicit),
            "invalid connection transition {} -> {}",
            from,
            to
        );
        if !is_valid_transition(from, to, explicit) {
            warn!(from = %from, to = %to, "Unexpected connection state transition");
        }
        debug!(from = %from, to = %to, "Connection state changed");
        self.state = to;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.transport.close();
    }
}
