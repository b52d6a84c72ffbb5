//! Per-session connection state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fresh connection without heartbeats counts as healthy for this long.
pub const HEALTHY_WITHOUT_HEARTBEAT: Duration = Duration::from_secs(30);

/// A heartbeat older than this makes a connection unhealthy.
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(60);

/// More accumulated errors than this force the ERROR state.
pub const MAX_ERRORS_BEFORE_FAULT: u32 = 5;

/// Phase of a duplex session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Liveness bookkeeping for one session. Owned by the manager; callers get copies.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub session_id: String,
    pub state: ConnectionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConnectionRecord {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            state: ConnectionState::Connecting,
            connected_at: Some(now),
            last_heartbeat: None,
            message_count: 0,
            error_count: 0,
            last_error: None,
            reconnect_attempts: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    /// Health against an explicit clock.
    pub fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_connected() {
            return false;
        }
        match (self.last_heartbeat, self.connected_at) {
            (Some(heartbeat), _) => age(now, heartbeat) < HEARTBEAT_STALE_AFTER,
            (None, Some(connected)) => age(now, connected) < HEALTHY_WITHOUT_HEARTBEAT,
            (None, None) => false,
        }
    }

    /// Time since the last sign of life, as the sweeps measure it.
    ///
    /// Sessions still establishing (CONNECTING, RECONNECTING) are measured
    /// from `connected_at`; everything else from the last heartbeat, falling
    /// back to `connected_at`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        let since = match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => self.connected_at,
            _ => self.last_heartbeat.or(self.connected_at),
        }?;
        Some(age(now, since))
    }

    /// Apply a state change. Returns the previous state if anything changed.
    pub(crate) fn apply_state(
        &mut self,
        state: ConnectionState,
        now: DateTime<Utc>,
    ) -> Option<ConnectionState> {
        let old = self.state;
        if old == state {
            return None;
        }
        self.state = state;
        match state {
            ConnectionState::Connected => {
                self.connected_at = Some(now);
                self.reconnect_attempts = 0;
            }
            ConnectionState::Reconnecting => self.reconnect_attempts += 1,
            _ => {}
        }
        Some(old)
    }

    pub(crate) fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
    }

    pub(crate) fn record_message(&mut self) {
        self.message_count += 1;
    }

    /// Count an error. Returns `true` once the error budget is exceeded.
    pub(crate) fn record_error(&mut self, error: Option<&str>) -> bool {
        self.error_count += 1;
        if let Some(error) = error {
            self.last_error = Some(error.to_string());
        }
        self.error_count > MAX_ERRORS_BEFORE_FAULT
    }
}

fn age(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn connected(now: DateTime<Utc>) -> ConnectionRecord {
        let mut record = ConnectionRecord::new("s1", now);
        record.apply_state(ConnectionState::Connected, now);
        record
    }

    #[test]
    fn new_record_is_connecting_and_unhealthy() {
        let now = Utc::now();
        let record = ConnectionRecord::new("s1", now);
        assert_eq!(record.state, ConnectionState::Connecting);
        assert!(!record.is_connected());
        assert!(!record.is_healthy_at(now));
    }

    #[test]
    fn health_without_heartbeat_expires_after_thirty_seconds() {
        let t0 = Utc::now();
        let record = connected(t0);
        assert!(record.is_healthy_at(t0 + TimeDelta::seconds(29)));
        assert!(!record.is_healthy_at(t0 + TimeDelta::seconds(31)));
        assert_eq!(record.state, ConnectionState::Connected);
    }

    #[test]
    fn heartbeat_extends_health_to_sixty_seconds() {
        let t0 = Utc::now();
        let mut record = connected(t0);
        let beat = t0 + TimeDelta::seconds(40);
        record.record_heartbeat(beat);
        assert!(record.is_healthy_at(beat + TimeDelta::seconds(59)));
        assert!(!record.is_healthy_at(beat + TimeDelta::seconds(61)));
    }

    #[test]
    fn state_changes_track_reconnects() {
        let now = Utc::now();
        let mut record = connected(now);
        assert_eq!(
            record.apply_state(ConnectionState::Error, now),
            Some(ConnectionState::Connected)
        );
        record.apply_state(ConnectionState::Reconnecting, now);
        assert_eq!(record.reconnect_attempts, 1);
        assert_eq!(record.apply_state(ConnectionState::Reconnecting, now), None);
        assert_eq!(record.reconnect_attempts, 1);

        let later = now + TimeDelta::seconds(5);
        record.apply_state(ConnectionState::Connected, later);
        assert_eq!(record.reconnect_attempts, 0);
        assert_eq!(record.connected_at, Some(later));
    }

    #[test]
    fn error_budget() {
        let mut record = ConnectionRecord::new("s1", Utc::now());
        for _ in 0..MAX_ERRORS_BEFORE_FAULT {
            assert!(!record.record_error(None));
        }
        assert!(record.record_error(Some("socket reset")));
        assert_eq!(record.last_error.as_deref(), Some("socket reset"));
    }

    #[test]
    fn idle_reference_depends_on_state() {
        let t0 = Utc::now();
        let mut record = connected(t0);
        record.record_heartbeat(t0 + TimeDelta::seconds(50));
        let now = t0 + TimeDelta::seconds(70);
        assert_eq!(record.idle_for(now), Some(Duration::from_secs(20)));

        record.apply_state(ConnectionState::Reconnecting, now);
        assert_eq!(record.idle_for(now), Some(Duration::from_secs(70)));
    }
}
