//! WhatsApp session adapter over a bridge process.
//!
//! The bridge owns the WhatsApp Web transport (noise handshake, signal keys,
//! protobuf framing). We spawn it, hand it the stored credentials, and talk
//! newline-delimited JSON over its stdin/stdout (see [`protocol`]).

pub mod protocol;

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use wab_core::{
    domain::Jid,
    errors::Error,
    messaging::{
        port::{Connection, SessionClient, SessionConnector},
        types::{ConnectionUpdate, Credentials, SessionEvent},
    },
    Result,
};

use crate::protocol::{decode_error, decode_line, truncate_text, Decoded, OutboundFrame};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;
const EVENT_BUFFER: usize = 64;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub auth_dir: PathBuf,
    pub send_timeout: Duration,
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

type SendWaiter = oneshot::Sender<std::result::Result<(), String>>;

/// In-flight sends keyed by request id. Once `closed`, no new send is accepted.
#[derive(Default)]
struct PendingSends {
    waiters: HashMap<u64, SendWaiter>,
    closed: bool,
}

type Pending = Arc<std::sync::Mutex<PendingSends>>;

/// Spawns one bridge process per session.
#[derive(Clone, Debug)]
pub struct BridgeConnector {
    cfg: BridgeConfig,
}

impl BridgeConnector {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl SessionConnector for BridgeConnector {
    async fn connect(&self, credentials: Credentials) -> Result<Connection> {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Session(format!(
                "failed to spawn bridge {}: {e}",
                self.cfg.program.display()
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("bridge stdout was not captured".to_string()))?;
        let stderr_tail: Arc<Mutex<StderrTail>> = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::debug!("bridge: {line}");
                    tail.lock().await.push_line(line);
                }
            });
        }

        let auth_dir = self.cfg.auth_dir.display().to_string();
        let init = OutboundFrame::Init {
            auth_dir: &auth_dir,
            creds: credentials.creds.as_ref(),
            keys: &credentials.keys,
        }
        .to_line()?;
        stdin.write_all(init.as_bytes()).await?;
        stdin.flush().await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(std::sync::Mutex::new(PendingSends::default()));
        let cancel = CancellationToken::new();

        tokio::spawn(forward_events(relay_rx, tx));
        tokio::spawn(read_frames(
            stdout,
            relay_tx,
            pending.clone(),
            stderr_tail,
            cancel.clone(),
        ));

        let client = Arc::new(BridgeClient {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            send_timeout: self.cfg.send_timeout,
            cancel,
        });

        Ok(Connection { client, events: rx })
    }
}

/// Move events from the reader into the session channel.
///
/// The session loop stops draining while it dispatches a batch; the reader
/// must keep routing send acknowledgements meanwhile, so it never waits here.
async fn forward_events(
    mut relay: mpsc::UnboundedReceiver<SessionEvent>,
    tx: mpsc::Sender<SessionEvent>,
) {
    while let Some(ev) = relay.recv().await {
        if tx.send(ev).await.is_err() {
            break;
        }
    }
}

/// Pump stdout frames until EOF, cancellation, or a read error.
async fn read_frames(
    stdout: ChildStdout,
    relay: mpsc::UnboundedSender<SessionEvent>,
    pending: Pending,
    stderr_tail: Arc<Mutex<StderrTail>>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                fail_pending(&pending, "bridge process exited");
                let stderr = stderr_tail.lock().await.snapshot();
                let mut msg = "bridge process exited".to_string();
                if !stderr.trim().is_empty() {
                    msg.push_str("\nstderr (tail):\n");
                    msg.push_str(&stderr);
                }
                let _ = relay.send(SessionEvent::ConnectionUpdate(ConnectionUpdate::closed(
                    None,
                    Some(&msg),
                )));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("bridge stdout read failed: {e}");
                break;
            }
        }

        // Invalid UTF-8 fails to decode below and is skipped like any bad frame.
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match decode_line(line) {
            Ok(Decoded::Event(ev)) => {
                if relay.send(ev).is_err() {
                    break;
                }
            }
            Ok(Decoded::SendResult { id, result }) => {
                let waiter = pending.lock().ok().and_then(|mut p| p.waiters.remove(&id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => tracing::debug!(id, "send result for unknown request"),
                }
            }
            Ok(Decoded::Ignored) => {
                tracing::trace!("ignoring bridge frame: {}", truncate_text(line, 200));
            }
            Err(e) => {
                tracing::warn!("{}", decode_error(line, &e));
            }
        }
    }

    fail_pending(&pending, "bridge connection closed");
}

fn fail_pending(pending: &Pending, reason: &str) {
    let Ok(mut p) = pending.lock() else {
        return;
    };
    p.closed = true;
    for (_, waiter) in p.waiters.drain() {
        let _ = waiter.send(Err(reason.to_string()));
    }
}

/// Send handle for one bridge process.
pub struct BridgeClient {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    next_id: AtomicU64,
    send_timeout: Duration,
    cancel: CancellationToken,
}

impl BridgeClient {
    async fn write_frame(&self, frame: &OutboundFrame<'_>) -> Result<()> {
        let line = frame.to_line()?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::Session("bridge is closed".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn forget(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.waiters.remove(&id);
        }
    }

    async fn kill_child(&self) -> Result<()> {
        let child = { self.child.lock().await.take() };
        let Some(mut child) = child else {
            return Ok(());
        };

        // If it's already exited, `try_wait` reaps it.
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        child.kill().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionClient for BridgeClient {
    async fn send_text(&self, to: &Jid, text: &str) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut p = self
                .pending
                .lock()
                .map_err(|_| Error::Session("pending send table poisoned".to_string()))?;
            if p.closed {
                return Err(Error::Session("bridge connection closed".to_string()));
            }
            p.waiters.insert(id, tx);
        }

        if let Err(e) = self
            .write_frame(&OutboundFrame::Send {
                id,
                to: to.as_str(),
                text,
            })
            .await
        {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(Error::Session(reason)),
            Ok(Err(_)) => Err(Error::Session("bridge dropped the send request".to_string())),
            Err(_) => {
                self.forget(id);
                Err(Error::Session(format!(
                    "no acknowledgement within {}ms",
                    self.send_timeout.as_millis()
                )))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        // Ask nicely first; the bridge may already be gone.
        let _ = self.write_frame(&OutboundFrame::Close).await;
        self.cancel.cancel();
        self.stdin.lock().await.take();
        fail_pending(&self.pending, "bridge closed");
        self.kill_child().await
    }
}
