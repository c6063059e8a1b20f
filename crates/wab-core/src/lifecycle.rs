//! Connection lifecycle: classify disconnects, decide whether to reconnect,
//! surface pairing codes to the operator.

use std::{fmt, sync::Arc, time::Duration};

use qrcode::{render::unicode, QrCode};

use crate::messaging::types::{ConnectionState, ConnectionUpdate};

/// Status codes the network uses when closing a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    LoggedOut,
    BadSession,
    RestartRequired,
    MultideviceMismatch,
    Forbidden,
    UnavailableService,
    Unknown(u16),
}

impl DisconnectReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            // Also sent for timeouts.
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::UnavailableService,
            515 => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::UnavailableService => 503,
            Self::RestartRequired => 515,
            Self::Unknown(c) => c,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionLost => "connection lost",
            Self::ConnectionReplaced => "connection replaced",
            Self::LoggedOut => "logged out",
            Self::BadSession => "bad session",
            Self::RestartRequired => "restart required",
            Self::MultideviceMismatch => "multidevice mismatch",
            Self::Forbidden => "forbidden",
            Self::UnavailableService => "unavailable service",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Every close is reconnectable except an explicit logout.
pub fn should_reconnect(status_code: Option<u16>) -> bool {
    status_code.map(DisconnectReason::from_code) != Some(DisconnectReason::LoggedOut)
}

/// What the event loop should do after a lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Keep consuming events from the current session.
    Continue,
    /// Drop the current session and bootstrap a new one.
    Reconnect { immediate: bool },
    /// Stop for good; the operator must pair again.
    Halt,
}

type PairingSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Reacts to connection-state changes.
#[derive(Clone)]
pub struct ConnectionLifecycle {
    pairing_sink: PairingSink,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new(Arc::new(|qr: &str| println!("{}", render_pairing_code(qr))))
    }
}

impl ConnectionLifecycle {
    pub fn new(pairing_sink: PairingSink) -> Self {
        Self { pairing_sink }
    }

    pub fn handle(&self, update: &ConnectionUpdate) -> Decision {
        if let Some(qr) = update.qr.as_deref().filter(|s| !s.is_empty()) {
            tracing::info!("pairing code received; link this device from the phone");
            (self.pairing_sink)(qr);
        }

        match update.connection {
            Some(ConnectionState::Closed) => self.on_closed(update),
            Some(ConnectionState::Open) => {
                tracing::info!("opened connection");
                Decision::Continue
            }
            Some(ConnectionState::Connecting) => {
                tracing::debug!("connecting");
                Decision::Continue
            }
            None => Decision::Continue,
        }
    }

    fn on_closed(&self, update: &ConnectionUpdate) -> Decision {
        let status_code = update.last_disconnect.as_ref().and_then(|d| d.status_code);
        let message = update
            .last_disconnect
            .as_ref()
            .and_then(|d| d.message.as_deref());
        let reconnect = should_reconnect(status_code);

        match status_code.map(DisconnectReason::from_code) {
            Some(DisconnectReason::RestartRequired) => {
                tracing::info!("session needs restart, auto-restarting");
                return Decision::Reconnect { immediate: true };
            }
            Some(DisconnectReason::LoggedOut) => {
                tracing::error!(
                    "logged out; delete the credential directory and pair this device again"
                );
            }
            reason => {
                let reason = reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "none".to_string());
                tracing::warn!(status = %reason, reconnect, "connection closed");
                if let Some(message) = message {
                    tracing::warn!("error details: {message}");
                }
            }
        }

        if reconnect {
            Decision::Reconnect { immediate: false }
        } else {
            Decision::Halt
        }
    }
}

/// Render a pairing payload as a terminal QR code the phone can scan.
///
/// Falls back to the raw payload when it cannot be encoded.
pub fn render_pairing_code(qr: &str) -> String {
    let body = match QrCode::new(qr.as_bytes()) {
        Ok(code) => code
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build(),
        Err(e) => {
            tracing::warn!("pairing code could not be rendered as QR: {e}");
            qr.to_string()
        }
    };
    format!("Scan this code on your phone (Linked devices > Link a device):\n\n{body}\n")
}

/// Exponential backoff between reconnect attempts.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    attempt: u32,
    /// `0` means unlimited.
    max_attempts: u32,
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    /// The zero-delay restart has been used since the last `open`.
    immediate_spent: bool,
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            initial_delay,
            current_delay: initial_delay,
            max_delay: max_delay.max(initial_delay),
            immediate_spent: false,
        }
    }

    /// Called once a session reaches `open`.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
        self.immediate_spent = false;
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.max_attempts == 0 || self.attempt < self.max_attempts
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.attempt = self.attempt.saturating_add(1);
        self.current_delay = std::cmp::min(self.current_delay.saturating_mul(2), self.max_delay);
        Some(delay)
    }

    /// Like [`next_delay`](Self::next_delay), but an immediate request gets
    /// a zero delay once per open session. Repeated immediate requests back
    /// off like any other disconnect. Both count against the attempt budget.
    pub fn next_delay_after(&mut self, immediate: bool) -> Option<Duration> {
        if !immediate || self.immediate_spent {
            return self.next_delay();
        }
        if !self.has_attempts_remaining() {
            return None;
        }

        self.immediate_spent = true;
        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::ZERO)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_lifecycle() -> (ConnectionLifecycle, Arc<Mutex<Vec<String>>>) {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let sink = shown.clone();
        let lc = ConnectionLifecycle::new(Arc::new(move |qr: &str| {
            sink.lock().unwrap().push(qr.to_string())
        }));
        (lc, shown)
    }

    #[test]
    fn only_logged_out_stops_reconnecting() {
        assert!(!should_reconnect(Some(401)));
        assert!(should_reconnect(None));
        for code in [0u16, 200, 403, 408, 411, 428, 440, 500, 503, 515, 999] {
            assert!(should_reconnect(Some(code)), "code {code}");
        }
    }

    #[test]
    fn reason_codes_round_trip_for_named_reasons() {
        for code in [401u16, 403, 408, 411, 428, 440, 500, 503, 515] {
            assert_eq!(DisconnectReason::from_code(code).code(), code);
        }
        assert_eq!(DisconnectReason::from_code(499), DisconnectReason::Unknown(499));
        assert_eq!(
            DisconnectReason::LoggedOut.to_string(),
            "logged out (401)"
        );
    }

    #[test]
    fn closed_decisions_follow_status_code() {
        let (lc, _) = recording_lifecycle();
        assert_eq!(
            lc.handle(&ConnectionUpdate::closed(Some(401), Some("logged out"))),
            Decision::Halt
        );
        assert_eq!(
            lc.handle(&ConnectionUpdate::closed(Some(515), None)),
            Decision::Reconnect { immediate: true }
        );
        assert_eq!(
            lc.handle(&ConnectionUpdate::closed(Some(428), Some("closed"))),
            Decision::Reconnect { immediate: false }
        );
        assert_eq!(
            lc.handle(&ConnectionUpdate::closed(None, None)),
            Decision::Reconnect { immediate: false }
        );
        let no_reason = ConnectionUpdate::state(ConnectionState::Closed);
        assert_eq!(lc.handle(&no_reason), Decision::Reconnect { immediate: false });
    }

    #[test]
    fn open_and_connecting_continue() {
        let (lc, shown) = recording_lifecycle();
        assert_eq!(
            lc.handle(&ConnectionUpdate::state(ConnectionState::Open)),
            Decision::Continue
        );
        assert_eq!(
            lc.handle(&ConnectionUpdate::state(ConnectionState::Connecting)),
            Decision::Continue
        );
        assert!(shown.lock().unwrap().is_empty());
    }

    #[test]
    fn pairing_code_is_displayed() {
        let (lc, shown) = recording_lifecycle();
        let update = ConnectionUpdate {
            qr: Some("2@abc,def".to_string()),
            ..ConnectionUpdate::default()
        };
        assert_eq!(lc.handle(&update), Decision::Continue);
        assert_eq!(shown.lock().unwrap().as_slice(), ["2@abc,def".to_string()]);
    }

    #[test]
    fn pairing_code_renders_as_block_qr() {
        let rendered = render_pairing_code("2@abc,def,ghi");
        assert!(!rendered.contains("2@abc,def,ghi"));
        assert!(rendered.lines().count() > 10);
        assert!(rendered
            .chars()
            .any(|c| matches!(c, '\u{2580}' | '\u{2584}' | '\u{2588}')));
    }

    #[test]
    fn oversized_pairing_code_falls_back_to_text() {
        let payload = "x".repeat(5000);
        let rendered = render_pairing_code(&payload);
        assert!(rendered.contains(&payload));
    }

    #[test]
    fn backoff_doubles_up_to_ceiling_and_resets() {
        let mut p = ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(5), 0);
        assert_eq!(p.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(p.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(p.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(p.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(p.attempt(), 4);

        p.reset();
        assert_eq!(p.attempt(), 0);
        assert_eq!(p.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn backoff_respects_attempt_budget() {
        let mut p = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(1), 2);
        assert!(p.next_delay().is_some());
        assert!(p.next_delay().is_some());
        assert!(p.next_delay().is_none());
        assert!(!p.has_attempts_remaining());
    }

    #[test]
    fn repeated_immediate_restarts_back_off() {
        let mut p = ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(60), 0);
        assert_eq!(p.next_delay_after(true), Some(Duration::ZERO));
        assert_eq!(p.next_delay_after(true), Some(Duration::from_secs(2)));
        assert_eq!(p.next_delay_after(true), Some(Duration::from_secs(4)));
        assert_eq!(p.attempt(), 3);

        p.reset();
        assert_eq!(p.next_delay_after(true), Some(Duration::ZERO));
    }

    #[test]
    fn immediate_restarts_count_against_the_budget() {
        let mut p = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(1), 1);
        assert_eq!(p.next_delay_after(true), Some(Duration::ZERO));
        assert_eq!(p.next_delay_after(true), None);
    }
}
