//! Lifecycle phases and the single cancellable phase task

use std::any::Any;
use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::GeEvent;
use crate::transport::Responder;
use crate::util::time::Timer;

/// Game phases in lifecycle order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Phase {
    #[default]
    Init,
    Config,
    Prepare,
    PreGame,
    Countdown,
    Start,
    Finish,
    End,
}

impl From<GeEvent> for Phase {
    fn from(event: GeEvent) -> Self {
        match event {
            GeEvent::Config => Self::Config,
            GeEvent::PrepareGame => Self::Prepare,
            GeEvent::PreGameStarted => Self::PreGame,
            GeEvent::CountdownStarted => Self::Countdown,
            GeEvent::GameStarted => Self::Start,
            GeEvent::GracePeriodStarted => Self::Finish,
            GeEvent::GameEnded => Self::End,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Config => "CONFIG",
            Self::Prepare => "PREPARE",
            Self::PreGame => "PRE_GAME",
            Self::Countdown => "COUNTDOWN",
            Self::Start => "START",
            Self::Finish => "FINISH",
            Self::End => "END",
        })
    }
}

/// What a completed phase handler reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PhaseResult {
    Ready,
    Prepared { auto_approve: bool },
    PreGame { seat: Option<u32> },
}

pub(crate) enum PhaseOutcome {
    Completed(PhaseResult),
    Cancelled,
    Failed(anyhow::Error),
    Panicked(Box<dyn Any + Send + 'static>),
}

/// The one running phase handler
pub(crate) struct PhaseTask {
    pub phase: Phase,
    pub reply: Option<Responder>,
    /// Executes the finish handler (FINISH, or END catching up on a missed one)
    pub runs_finish: bool,
    cancel: CancellationToken,
    handle: JoinHandle<PhaseOutcome>,
    timer: Timer,
}

impl PhaseTask {
    pub fn new(
        phase: Phase,
        reply: Option<Responder>,
        cancel: CancellationToken,
        handle: JoinHandle<PhaseOutcome>,
    ) -> Self {
        Self {
            phase,
            reply,
            runs_finish: phase == Phase::Finish,
            cancel,
            handle,
            timer: Timer::new(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.timer.elapsed_ms()
    }

    /// Wait for the handler to finish on its own
    pub async fn join(&mut self) -> PhaseOutcome {
        match (&mut self.handle).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => PhaseOutcome::Panicked(e.into_panic()),
            Err(_) => PhaseOutcome::Cancelled,
        }
    }

    /// Request cooperative cancellation and wait until the handler has unwound
    pub async fn cancel(mut self) -> (Phase, PhaseOutcome) {
        self.cancel.cancel();
        let outcome = self.join().await;
        (self.phase, outcome)
    }
}

/// Resolves with the current task's outcome, or never when idle
pub(crate) async fn join_current(current: &mut Option<PhaseTask>) -> PhaseOutcome {
    match current {
        Some(task) => task.join().await,
        None => std::future::pending().await,
    }
}
