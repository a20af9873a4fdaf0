//! Session State and Status Snapshots

use crate::endpoint::Endpoint;
use std::fmt;
use std::time::Duration;

/// Session lifecycle state
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
///                     |
///                     +-> Failed -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No tunnel
    #[default]
    Disconnected,
    /// Provisioning, building the profile, establishing
    Connecting,
    /// Tunnel up, ticker running
    Connected,
    /// Stopping the ticker and tearing down
    Disconnecting,
    /// Connect attempt failed; always followed by Disconnected
    Failed,
}

impl SessionState {
    /// Every state, for exhaustive checks
    pub const ALL: [SessionState; 5] = [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::Connected,
        SessionState::Disconnecting,
        SessionState::Failed,
    ];

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Connecting or Disconnecting
    pub fn is_transitioning(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Disconnecting)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Immutable copy of the session's status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Set from Connecting until the session is Disconnected
    pub connected_endpoint: Option<Endpoint>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Connected time accumulated by the ticker
    pub duration: Duration,
    /// Most recent non-fatal failure (e.g. a teardown error)
    pub last_error: Option<String>,
}

impl SessionStatus {
    /// Whole seconds connected
    pub fn duration_secs(&self) -> u64 {
        self.duration.as_secs()
    }

    /// Zero counters for a fresh session
    pub(crate) fn reset_counters(&mut self) {
        self.bytes_received = 0;
        self.bytes_sent = 0;
        self.duration = Duration::ZERO;
    }

    /// One-line human readable summary
    pub fn format(&self) -> String {
        let endpoint = self
            .connected_endpoint
            .as_ref()
            .map(|e| e.country_label.as_str())
            .unwrap_or("-");

        format!(
            "{} | {} | {:02}:{:02}:{:02} | RX: {:.2}MB TX: {:.2}MB",
            self.state,
            endpoint,
            self.duration_secs() / 3600,
            (self.duration_secs() / 60) % 60,
            self.duration_secs() % 60,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.bytes_sent as f64 / (1024.0 * 1024.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state() {
        assert!(SessionState::Connected.is_connected());
        assert!(!SessionState::Disconnected.is_connected());
        assert!(SessionState::Connecting.is_transitioning());
        assert!(SessionState::Disconnecting.is_transitioning());
        assert!(SessionState::Failed.is_failed());
        assert_eq!(SessionState::default(), SessionState::Disconnected);
    }

    #[test]
    fn test_status_format() {
        let status = SessionStatus {
            state: SessionState::Connected,
            connected_endpoint: Some(Endpoint::new("Japan", "198.18.0.40:51820", "k")),
            bytes_received: 3 * 1024 * 1024,
            bytes_sent: 1024 * 1024,
            duration: Duration::from_secs(3725),
            last_error: None,
        };

        assert_eq!(
            status.format(),
            "Connected | Japan | 01:02:05 | RX: 3.00MB TX: 1.00MB"
        );
    }

    #[test]
    fn test_reset_counters() {
        let mut status = SessionStatus {
            bytes_received: 10,
            bytes_sent: 20,
            duration: Duration::from_secs(5),
            ..Default::default()
        };
        status.reset_counters();

        assert_eq!(status.bytes_received, 0);
        assert_eq!(status.bytes_sent, 0);
        assert_eq!(status.duration_secs(), 0);
    }
}
