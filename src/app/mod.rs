//! Process wiring: transports, signal listener and the game lifecycle

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::lifecycle::{spawn_signal_listener, ExitState, Game, GameLifecycle, LifecycleSettings};
use crate::transport::{LocalChannel, RemoteConfig, RemoteSession, Transports};

/// Process exit code when the Game Engine rejects our credentials.
/// Supervisors treat it as "do not restart".
pub const AUTH_FAILURE_EXIT_CODE: i32 = 77;

/// Connect to the Game Engine and drive `game` until shutdown
pub async fn run<G: Game>(config: Config, game: G) -> anyhow::Result<ExitState> {
    let cancel = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();

    let signals = spawn_signal_listener(signal_tx).context("failed to install signal handlers")?;

    let remote = RemoteSession::new(RemoteConfig::from(&config));
    let remote_handle = remote.handle();
    let mut tasks = vec![tokio::spawn(remote.run(event_tx.clone(), cancel.clone()))];

    let local_handle = match &config.local_socket_path {
        Some(path) => {
            info!(path = %path.display(), "Local channel enabled");
            let local = LocalChannel::new(path, config.local_retry, config.ack_timeout);
            let handle = local.handle();
            tasks.push(tokio::spawn(local.run(event_tx.clone(), cancel.clone())));
            Some(handle)
        }
        None => None,
    };
    drop(event_tx);

    let sink = Arc::new(Transports::new(remote_handle, local_handle, cancel.clone()));
    let lifecycle = GameLifecycle::new(game, LifecycleSettings::from(&config), sink);
    let result = lifecycle.run(event_rx, signal_rx).await;

    cancel.cancel();
    signals.abort();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Transport task ended abnormally");
        }
    }

    Ok(result?)
}
