use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use wab_bridge::{BridgeConfig, BridgeConnector};
use wab_core::{
    batch::BatchSender,
    config::Config,
    credentials::FileCredentialStore,
    dispatcher::CommandDispatcher,
    lifecycle::{ConnectionLifecycle, ReconnectPolicy},
    session::{RunOutcome, SessionRunner},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wab_core::logging::init("wab")?;

    let cfg = Config::load().context("failed to load configuration")?;
    tracing::info!(
        auth_dir = %cfg.auth_dir.display(),
        bridge = %cfg.bridge_path.display(),
        recipients = cfg.recipients.len(),
        "starting wab"
    );

    let connector = Arc::new(BridgeConnector::new(BridgeConfig {
        program: cfg.bridge_path.clone(),
        args: cfg.bridge_args.clone(),
        auth_dir: cfg.auth_dir.clone(),
        send_timeout: cfg.send_timeout,
    }));
    let store = Arc::new(FileCredentialStore::new(cfg.auth_dir.clone()));
    let dispatcher = CommandDispatcher::new(BatchSender::new(cfg.recipients.clone()));
    let policy = ReconnectPolicy::new(
        cfg.reconnect_initial_delay,
        cfg.reconnect_max_delay,
        cfg.reconnect_max_attempts,
    );

    let mut runner = SessionRunner::new(
        connector,
        store,
        ConnectionLifecycle::default(),
        dispatcher,
        policy,
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    match runner.run(shutdown).await? {
        RunOutcome::Shutdown => Ok(()),
        RunOutcome::LoggedOut => {
            anyhow::bail!(
                "logged out: delete {} and restart to pair again",
                cfg.auth_dir.display()
            )
        }
        RunOutcome::GaveUp => anyhow::bail!("could not re-establish the session"),
    }
}
