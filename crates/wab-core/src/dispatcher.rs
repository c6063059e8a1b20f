//! Inbound message routing. One command: `/sendbatch <message>`.

use crate::{
    batch::{BatchReport, BatchSender},
    messaging::{
        port::SessionClient,
        types::{MessagesUpsert, UpsertKind},
    },
};

/// Command token plus its one mandatory space.
pub const SEND_BATCH_PREFIX: &str = "/sendbatch ";

pub const USAGE_HINT: &str = "Please provide a message to send. Usage: /sendbatch <message>";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SendBatch(String),
    /// `/sendbatch ` followed by nothing but whitespace.
    MissingPayload,
    Unrecognized,
}

pub fn parse_command(text: &str) -> Command {
    let Some(rest) = text.strip_prefix(SEND_BATCH_PREFIX) else {
        return Command::Unrecognized;
    };
    let payload = rest.trim();
    if payload.is_empty() {
        Command::MissingPayload
    } else {
        Command::SendBatch(payload.to_string())
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Not actionable (no message, no content, no text, no sender, wrong tag).
    Discarded,
    /// Text that is not a command.
    Ignored,
    UsageReplied,
    BatchSent(BatchReport),
}

pub struct CommandDispatcher {
    batch: BatchSender,
}

impl CommandDispatcher {
    pub fn new(batch: BatchSender) -> Self {
        Self { batch }
    }

    /// Handle one upsert notification. Never fails: send errors are logged.
    pub async fn dispatch(
        &self,
        client: &dyn SessionClient,
        upsert: &MessagesUpsert,
    ) -> DispatchOutcome {
        if upsert.kind != UpsertKind::Notify {
            return DispatchOutcome::Discarded;
        }
        let Some(msg) = upsert.messages.first() else {
            return DispatchOutcome::Discarded;
        };
        if msg.content.is_none() {
            return DispatchOutcome::Discarded;
        }
        let sender = msg.sender.as_ref().filter(|s| !s.as_str().is_empty());
        let (Some(text), Some(sender)) = (msg.text_content(), sender) else {
            return DispatchOutcome::Discarded;
        };

        tracing::info!(from = %sender, "received message: {text}");

        match parse_command(text) {
            Command::SendBatch(payload) => {
                DispatchOutcome::BatchSent(self.batch.send(client, &payload).await)
            }
            Command::MissingPayload => {
                if let Err(e) = client.send_text(sender, USAGE_HINT).await {
                    tracing::warn!(to = %sender, "failed to send usage hint: {e}");
                }
                DispatchOutcome::UsageReplied
            }
            Command::Unrecognized => {
                tracing::info!("ignoring message not starting with /sendbatch");
                DispatchOutcome::Ignored
            }
        }
    }
}
