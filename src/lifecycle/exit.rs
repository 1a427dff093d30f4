//! Exit reasons and process signal handling

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Why the process is shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitReason {
    #[default]
    Unknown,
    Exception,
    Sigint,
    Sigterm,
    Update,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "UNKNOWN",
            Self::Exception => "EXCEPTION",
            Self::Sigint => "SIGINT",
            Self::Sigterm => "SIGTERM",
            Self::Update => "UPDATE",
        })
    }
}

/// Recorded once, at teardown
#[derive(Debug)]
pub struct ExitState {
    pub reason: ExitReason,
    pub error: Option<anyhow::Error>,
}

/// OS signals the lifecycle reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGUSR1: shut down for an update at the next game boundary
    Update,
}

/// Forward OS signals to the lifecycle until the receiver goes away
pub fn spawn_signal_listener(
    tx: mpsc::UnboundedSender<ProcessSignal>,
) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut update = signal(SignalKind::user_defined1())?;

        Ok(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = interrupt.recv() => ProcessSignal::Interrupt,
                    _ = terminate.recv() => ProcessSignal::Terminate,
                    _ = update.recv() => ProcessSignal::Update,
                };
                info!(signal = ?received, "Received signal");
                if tx.send(received).is_err() {
                    break;
                }
            }
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                if tx.send(ProcessSignal::Interrupt).is_err() {
                    break;
                }
            }
        }))
    }
}
