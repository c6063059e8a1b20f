//! The session event loop.
//!
//! One task owns the loop: bootstrap a session, consume its events one at a
//! time, and on a reconnectable close start over with backoff. The active
//! client lives in [`SessionSlot`]; every send goes through it.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    credentials::CredentialStore,
    dispatcher::CommandDispatcher,
    errors::Error,
    lifecycle::{ConnectionLifecycle, Decision, ReconnectPolicy},
    messaging::{
        port::{SessionClient, SessionConnector},
        types::{ConnectionState, ConnectionUpdate, SessionEvent},
    },
    Result,
};

#[derive(Default)]
struct SlotState {
    generation: u64,
    client: Option<Arc<dyn SessionClient>>,
}

/// Holder of the single active session handle.
///
/// Replacement is compare-and-swap on a generation counter so two bootstraps
/// can never both install a client.
#[derive(Default)]
pub struct SessionSlot {
    inner: Mutex<SlotState>,
}

impl SessionSlot {
    pub async fn generation(&self) -> u64 {
        self.inner.lock().await.generation
    }

    /// Install `client` if nobody replaced the slot since `expected` was read.
    ///
    /// Returns the new generation and the client that was displaced.
    pub async fn replace(
        &self,
        expected: u64,
        client: Arc<dyn SessionClient>,
    ) -> Result<(u64, Option<Arc<dyn SessionClient>>)> {
        let mut st = self.inner.lock().await;
        if st.generation != expected {
            return Err(Error::Session(format!(
                "session slot moved to generation {} (expected {expected})",
                st.generation
            )));
        }
        st.generation += 1;
        let previous = st.client.replace(client);
        Ok((st.generation, previous))
    }

    pub async fn current(&self) -> Option<Arc<dyn SessionClient>> {
        self.inner.lock().await.client.clone()
    }

    /// Empty the slot (generation is kept).
    pub async fn clear(&self) -> Option<Arc<dyn SessionClient>> {
        self.inner.lock().await.client.take()
    }
}

/// Why [`SessionRunner::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The network logged this device out; pairing is required.
    LoggedOut,
    /// Shutdown was requested.
    Shutdown,
    /// The reconnect budget ran out.
    GaveUp,
}

enum SessionEnd {
    Reconnect { immediate: bool },
    Halt,
    Shutdown,
}

pub struct SessionRunner {
    connector: Arc<dyn SessionConnector>,
    store: Arc<dyn CredentialStore>,
    lifecycle: ConnectionLifecycle,
    dispatcher: CommandDispatcher,
    policy: ReconnectPolicy,
    slot: Arc<SessionSlot>,
}

impl SessionRunner {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        store: Arc<dyn CredentialStore>,
        lifecycle: ConnectionLifecycle,
        dispatcher: CommandDispatcher,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            connector,
            store,
            lifecycle,
            dispatcher,
            policy,
            slot: Arc::new(SessionSlot::default()),
        }
    }

    pub fn slot(&self) -> Arc<SessionSlot> {
        self.slot.clone()
    }

    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<RunOutcome> {
        loop {
            let credentials = self.store.load().await?;
            if credentials.is_empty() {
                tracing::info!("no stored credentials; a pairing code will be shown");
            }

            let conn = match self.connector.connect(credentials).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("session bootstrap failed: {e}");
                    match self.wait_before_retry(false, &shutdown).await {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
            };

            let expected = self.slot.generation().await;
            let (generation, previous) = self.slot.replace(expected, conn.client).await?;
            if let Some(previous) = previous {
                close_quietly(previous.as_ref()).await;
            }
            tracing::debug!(generation, "session installed");

            let end = self.consume(conn.events, &shutdown).await;
            if let Some(client) = self.slot.clear().await {
                close_quietly(client.as_ref()).await;
            }

            match end {
                SessionEnd::Reconnect { immediate } => {
                    if let Some(outcome) = self.wait_before_retry(immediate, &shutdown).await {
                        return Ok(outcome);
                    }
                }
                SessionEnd::Halt => return Ok(RunOutcome::LoggedOut),
                SessionEnd::Shutdown => return Ok(RunOutcome::Shutdown),
            }
        }
    }

    /// Sleep per the backoff policy. `Some` means stop instead of retrying.
    async fn wait_before_retry(
        &mut self,
        immediate: bool,
        shutdown: &CancellationToken,
    ) -> Option<RunOutcome> {
        if shutdown.is_cancelled() {
            return Some(RunOutcome::Shutdown);
        }
        let Some(delay) = self.policy.next_delay_after(immediate) else {
            tracing::error!(
                attempts = self.policy.attempt(),
                "giving up after repeated reconnect failures"
            );
            return Some(RunOutcome::GaveUp);
        };
        tracing::info!(
            attempt = self.policy.attempt(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        if delay.is_zero() {
            return None;
        }

        tokio::select! {
            _ = shutdown.cancelled() => Some(RunOutcome::Shutdown),
            _ = sleep(delay) => None,
        }
    }

    async fn consume(
        &mut self,
        mut events: mpsc::Receiver<SessionEvent>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                ev = events.recv() => ev,
            };

            // A vanished event stream is a close without a reason.
            let event = event.unwrap_or_else(|| {
                tracing::warn!("session event stream ended");
                SessionEvent::ConnectionUpdate(ConnectionUpdate::closed(None, None))
            });

            match event {
                SessionEvent::Version(v) => {
                    tracing::info!("using WA v{}, isLatest: {}", v.dotted(), v.is_latest);
                }
                SessionEvent::ConnectionUpdate(update) => {
                    if update.connection == Some(ConnectionState::Open) {
                        self.policy.reset();
                    }
                    match self.lifecycle.handle(&update) {
                        Decision::Continue => {}
                        Decision::Reconnect { immediate } => {
                            return SessionEnd::Reconnect { immediate }
                        }
                        Decision::Halt => return SessionEnd::Halt,
                    }
                }
                SessionEvent::MessagesUpsert(upsert) => {
                    let Some(client) = self.slot.current().await else {
                        tracing::warn!("no active session; dropping inbound messages");
                        continue;
                    };
                    self.dispatcher.dispatch(client.as_ref(), &upsert).await;
                }
                SessionEvent::CredentialsUpdate(update) => {
                    if let Err(e) = self.store.save(&update).await {
                        tracing::error!("failed to persist credentials: {e}");
                    }
                }
            }
        }
    }
}

async fn close_quietly(client: &dyn SessionClient) {
    if let Err(e) = client.close().await {
        tracing::debug!("closing session failed: {e}");
    }
}
