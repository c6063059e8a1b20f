use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::Jid,
    messaging::types::{Credentials, SessionEvent},
    Result,
};

/// A live connection to the chat network.
///
/// The bridge process is the first implementation; tests use in-memory fakes.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Send a plain-text message and wait until the network accepted or rejected it.
    async fn send_text(&self, to: &Jid, text: &str) -> Result<()>;

    /// Tear the connection down. Must be safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// A freshly bootstrapped session: the send handle plus its event stream.
pub struct Connection {
    pub client: std::sync::Arc<dyn SessionClient>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Factory for sessions. Each call yields a brand new client instance.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, credentials: Credentials) -> Result<Connection>;
}
