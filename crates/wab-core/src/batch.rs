use chrono::{DateTime, Utc};

use crate::{domain::Jid, messaging::port::SessionClient};

/// Result of one fan-out. Purely informational; nothing downstream acts on it.
#[derive(Clone, Debug)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub sent: Vec<Jid>,
    pub failed: Vec<(Jid, String)>,
}

impl BatchReport {
    pub fn success_count(&self) -> usize {
        self.sent.len()
    }

    /// `"<ok>/<total>"`.
    pub fn tally(&self) -> String {
        format!("{}/{}", self.success_count(), self.total)
    }
}

/// Delivers one payload to every recipient, one after the other.
#[derive(Clone, Debug)]
pub struct BatchSender {
    recipients: Vec<String>,
}

impl BatchSender {
    pub fn new(recipients: Vec<String>) -> Self {
        Self { recipients }
    }

    /// Never fails as a whole: a failed recipient is logged and skipped.
    pub async fn send(&self, client: &dyn SessionClient, text: &str) -> BatchReport {
        let started_at = Utc::now();
        let total = self.recipients.len();
        tracing::info!(payload = %text, total, "starting batch send");

        let mut sent = Vec::new();
        let mut failed = Vec::new();

        for number in &self.recipients {
            let jid = Jid::from_phone(number);
            match client.send_text(&jid, text).await {
                Ok(()) => {
                    tracing::info!(to = %jid, "sent");
                    sent.push(jid);
                }
                Err(e) => {
                    tracing::error!(to = %jid, "failed to send: {e}");
                    failed.push((jid, e.to_string()));
                }
            }
        }

        let report = BatchReport {
            started_at,
            total,
            sent,
            failed,
        };
        let elapsed_ms = (Utc::now() - report.started_at).num_milliseconds();
        tracing::info!(
            elapsed_ms,
            "batch send completed. Sent to {} recipients",
            report.tally()
        );
        report
    }
}
