//! Game lifecycle state machine
//!
//! `INIT` runs once, then Game Engine events drive the cycle
//! `CONFIG → PREPARE → PRE_GAME → COUNTDOWN → START → FINISH → END → CONFIG`.
//! At most one phase handler runs at a time: a new event cancels the running
//! handler, waits for it to unwind, then starts the next one. Shutdown always
//! cancels the running handler, calls `on_exit`, shuts every input down and
//! closes the transports, whatever caused it.

pub mod context;
pub mod exit;
pub mod phase;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::protocol::events::{GAME_APPROVED, PHASE_READY, ROBOT_INPUTS};
use crate::protocol::{GeEvent, Message};
use crate::router::{InputRegistry, MessageRouter, Route};
use crate::transport::{AuthError, Inbound, MessageSink, Origin, Responder, TransportEvent};

pub use context::{ContextError, GameContext};
pub use exit::{spawn_signal_listener, ExitReason, ExitState, ProcessSignal};
pub use phase::Phase;

use phase::{join_current, PhaseOutcome, PhaseResult, PhaseTask};

/// User game logic. Every phase callback runs as a cancellable task; a
/// returned error ends the process after orderly shutdown.
#[async_trait]
pub trait Game: Send + Sync + 'static {
    /// Register inputs. Runs once, before any message is processed.
    async fn on_init(&self, inputs: &mut InputRegistry) -> anyhow::Result<()>;

    async fn on_config(&self, _ctx: &GameContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// `None` or `Some(true)` approves the game automatically; `Some(false)`
    /// waits for an operator.
    async fn on_prepare(&self, _ctx: &GameContext) -> anyhow::Result<Option<bool>> {
        Ok(None)
    }

    /// Seat to make active for the coming game; `None` keeps the current one
    async fn on_pre_game(&self, _ctx: &GameContext) -> anyhow::Result<Option<u32>> {
        Ok(None)
    }

    async fn on_countdown(&self, _ctx: &GameContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &GameContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_finish(&self, _ctx: &GameContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_exit(&self, _reason: ExitReason, _error: Option<&anyhow::Error>) {}
}

/// Lifecycle knobs
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub robot_id: String,
    pub watchdog_timeout: Duration,
    pub enable_inputs_on_start: bool,
}

impl From<&Config> for LifecycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            robot_id: config.robot_id.clone(),
            watchdog_timeout: config.watchdog_timeout,
            enable_inputs_on_start: config.enable_inputs_on_start,
        }
    }
}

/// Fatal lifecycle outcomes, returned only after shutdown completed
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("phase handler failed: {0:#}")]
    PhaseFailed(anyhow::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

enum Fatal {
    No,
    Phase,
    Auth(AuthError),
    Panic(Box<dyn Any + Send + 'static>),
}

struct ExitCause {
    reason: ExitReason,
    error: Option<anyhow::Error>,
    fatal: Fatal,
}

impl ExitCause {
    fn signal(reason: ExitReason) -> Self {
        Self {
            reason,
            error: None,
            fatal: Fatal::No,
        }
    }

    fn phase_error(e: anyhow::Error) -> Self {
        Self {
            reason: ExitReason::Exception,
            error: Some(e),
            fatal: Fatal::Phase,
        }
    }

    fn auth(e: AuthError) -> Self {
        Self {
            reason: ExitReason::Exception,
            error: Some(anyhow::Error::new(e.clone())),
            fatal: Fatal::Auth(e),
        }
    }

    fn panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self {
            reason: ExitReason::Exception,
            error: Some(anyhow!("phase handler panicked: {message}")),
            fatal: Fatal::Panic(payload),
        }
    }
}

enum Flow {
    Continue,
    Exit(ExitCause),
}

/// Drives a [`Game`] from transport events and process signals
pub struct GameLifecycle<G: Game> {
    game: Arc<G>,
    settings: LifecycleSettings,
    sink: Arc<dyn MessageSink>,
}

impl<G: Game> GameLifecycle<G> {
    pub fn new(game: G, settings: LifecycleSettings, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            game: Arc::new(game),
            settings,
            sink,
        }
    }

    /// Run until a signal, a fatal error, or the event channel closing.
    ///
    /// Phase handler errors and authentication failures come back as `Err`
    /// after shutdown; a panicking phase handler is resumed after shutdown.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut signals: mpsc::UnboundedReceiver<ProcessSignal>,
    ) -> Result<ExitState, LifecycleError> {
        info!(phase = %Phase::Init, "Entering phase");
        let mut inputs = InputRegistry::new();
        let init = self.game.on_init(&mut inputs).await;
        info!(inputs = inputs.len(), "Inputs registered");

        let router = Arc::new(MessageRouter::new(inputs, self.settings.watchdog_timeout));
        let ctx = GameContext::new(self.sink.clone(), router.clone(), self.settings.robot_id.clone());

        let mut machine = Machine {
            game: self.game,
            settings: self.settings,
            ctx,
            router,
            current: None,
            finish_done: false,
            awaiting_approval: false,
            update_requested: false,
        };

        let cause = match init {
            Ok(()) => machine.event_loop(&mut events, &mut signals).await,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Initialisation failed");
                ExitCause::phase_error(e)
            }
        };

        machine.shutdown(cause).await
    }
}

struct Machine<G: Game> {
    game: Arc<G>,
    settings: LifecycleSettings,
    ctx: GameContext,
    router: Arc<MessageRouter>,
    current: Option<PhaseTask>,
    /// Set once the finish handler has completed for the current game
    finish_done: bool,
    awaiting_approval: bool,
    /// Update signal received; honoured at the next CONFIG
    update_requested: bool,
}

impl<G: Game> Machine<G> {
    async fn event_loop(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        signals: &mut mpsc::UnboundedReceiver<ProcessSignal>,
    ) -> ExitCause {
        let mut signals_open = true;

        loop {
            let flow = tokio::select! {
                outcome = join_current(&mut self.current) => self.complete_current(outcome),
                event = events.recv() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        warn!("Transport event channel closed");
                        Flow::Exit(ExitCause::signal(ExitReason::Unknown))
                    }
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => self.on_signal(signal),
                    None => {
                        signals_open = false;
                        Flow::Continue
                    }
                },
            };

            if let Flow::Exit(cause) = flow {
                return cause;
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Message(inbound) => self.on_inbound(inbound).await,
            TransportEvent::Connected(origin) => {
                info!(origin = %origin, "Transport connected");
                if origin == Origin::Remote {
                    self.publish_inputs();
                }
                Flow::Continue
            }
            TransportEvent::Disconnected(origin) => {
                warn!(origin = %origin, "Transport disconnected");
                Flow::Continue
            }
            TransportEvent::AuthFailed(e) => {
                error!(error = %e, "Authentication failed");
                Flow::Exit(ExitCause::auth(e))
            }
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) -> Flow {
        let Inbound {
            message,
            origin,
            reply,
        } = inbound;

        match self.router.dispatch(&message) {
            Ok(Route::Lifecycle(event)) => return self.on_game_event(event, &message, reply).await,
            Ok(Route::Approval) => {
                self.on_approval();
                respond(reply, json!({ "ok": true }));
            }
            Ok(Route::Delivered { .. }) | Ok(Route::Handled) => {
                respond(reply, json!({ "ok": true }));
            }
            Err(e) => {
                warn!(
                    event = %message.event,
                    seat = message.seat,
                    src = ?message.src,
                    origin = %origin,
                    reason = %e,
                    "Dropping message"
                );
                respond(reply, json!({ "ok": false, "error": e.to_string() }));
            }
        }
        Flow::Continue
    }

    async fn on_game_event(
        &mut self,
        event: GeEvent,
        message: &Message,
        reply: Option<Responder>,
    ) -> Flow {
        let phase = Phase::from(event);

        if phase == Phase::Config && self.update_requested {
            info!("Update requested, shutting down at game boundary");
            return Flow::Exit(ExitCause::signal(ExitReason::Update));
        }

        // Duplicate or late grace period: leave the running handler alone
        if phase == Phase::Finish && (self.finish_done || self.finish_in_flight()) {
            debug!(done = self.finish_done, "Finish already handled, skipping");
            self.report_ready(Phase::Finish, reply, json!({ "ready": true }));
            return Flow::Continue;
        }

        if let Some(flow) = self.cancel_current().await {
            return flow;
        }

        let mut run_finish = false;
        match phase {
            Phase::Config => {
                self.ctx.apply_config(&message.payload);
                self.finish_done = false;
                self.awaiting_approval = false;
            }
            Phase::Start => {
                if self.settings.enable_inputs_on_start {
                    self.router.enable_routing(None);
                }
            }
            Phase::End => {
                run_finish = !self.finish_done;
            }
            _ => {}
        }

        self.ctx.set_phase(phase);
        info!(phase = %phase, event = event.name(), "Entering phase");
        self.spawn_phase(phase, run_finish, reply);
        Flow::Continue
    }

    fn spawn_phase(&mut self, phase: Phase, run_finish: bool, reply: Option<Responder>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let game = self.game.clone();
        let ctx = self.ctx.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => PhaseOutcome::Cancelled,
                result = run_phase(game.as_ref(), &ctx, phase, run_finish) => match result {
                    Ok(result) => PhaseOutcome::Completed(result),
                    Err(e) => PhaseOutcome::Failed(e),
                },
            }
        });

        let mut task = PhaseTask::new(phase, reply, cancel, handle);
        task.runs_finish |= run_finish;
        self.current = Some(task);
    }

    /// The running task is executing the finish handler
    fn finish_in_flight(&self) -> bool {
        self.current.as_ref().is_some_and(|task| task.runs_finish)
    }

    /// Cancel the running handler and wait for it. Its result is discarded.
    async fn cancel_current(&mut self) -> Option<Flow> {
        let task = self.current.take()?;
        let runs_finish = task.runs_finish;
        info!(phase = %task.phase, "Cancelling running phase handler");
        let (phase, outcome) = task.cancel().await;

        if runs_finish && matches!(outcome, PhaseOutcome::Completed(_)) {
            self.finish_done = true;
        }

        if phase == Phase::End {
            self.end_cleanup();
        }

        match outcome {
            PhaseOutcome::Completed(_) | PhaseOutcome::Cancelled => None,
            PhaseOutcome::Failed(e) => {
                error!(phase = %phase, error = %format!("{e:#}"), "Phase handler failed");
                Some(Flow::Exit(ExitCause::phase_error(e)))
            }
            PhaseOutcome::Panicked(payload) => {
                error!(phase = %phase, "Phase handler panicked");
                Some(Flow::Exit(ExitCause::panic(payload)))
            }
        }
    }

    fn complete_current(&mut self, outcome: PhaseOutcome) -> Flow {
        let Some(task) = self.current.take() else {
            return Flow::Continue;
        };
        let phase = task.phase;
        let elapsed_ms = task.elapsed_ms();

        let flow = match outcome {
            PhaseOutcome::Completed(result) => {
                debug!(phase = %phase, elapsed_ms, "Phase handler finished");
                if task.runs_finish {
                    self.finish_done = true;
                }
                let response = self.apply_result(result);
                self.report_ready(phase, task.reply, response);
                Flow::Continue
            }
            PhaseOutcome::Cancelled => {
                debug!(phase = %phase, "Phase handler cancelled");
                Flow::Continue
            }
            PhaseOutcome::Failed(e) => {
                error!(phase = %phase, elapsed_ms, error = %format!("{e:#}"), "Phase handler failed");
                Flow::Exit(ExitCause::phase_error(e))
            }
            PhaseOutcome::Panicked(payload) => {
                error!(phase = %phase, elapsed_ms, "Phase handler panicked");
                Flow::Exit(ExitCause::panic(payload))
            }
        };

        if phase == Phase::End {
            self.end_cleanup();
        }
        flow
    }

    fn apply_result(&mut self, result: PhaseResult) -> Value {
        match result {
            PhaseResult::Ready => json!({ "ready": true }),
            PhaseResult::Prepared { auto_approve } => {
                if auto_approve {
                    self.approve_game();
                } else {
                    self.awaiting_approval = true;
                    info!("Waiting for operator approval");
                }
                json!({ "ready": true, "autoApprove": auto_approve })
            }
            PhaseResult::PreGame { seat } => {
                let seat = seat.unwrap_or_else(|| self.ctx.current_seat());
                if let Err(e) = self.ctx.set_current_seat(seat) {
                    warn!(seat, error = %e, "Failed to announce current seat");
                }
                json!({ "ready": true, "seat": seat })
            }
        }
    }

    /// Answer the Game Engine's request, or announce readiness if it sent none
    fn report_ready(&self, phase: Phase, reply: Option<Responder>, mut response: Value) {
        match reply {
            Some(reply) => {
                if !reply.respond(response) {
                    warn!(phase = %phase, "Could not acknowledge phase, connection gone");
                }
            }
            None => {
                response["phase"] = json!(phase.to_string());
                self.send(PHASE_READY, response);
            }
        }
    }

    fn on_approval(&mut self) {
        if self.awaiting_approval {
            info!("Operator approved game");
            self.approve_game();
        } else {
            warn!(phase = %self.ctx.phase(), "Approval received while not waiting for one, ignoring");
        }
    }

    fn approve_game(&mut self) {
        self.awaiting_approval = false;
        self.send(GAME_APPROVED, json!({}));
    }

    fn send(&self, event: &str, payload: Value) {
        let message = Message::to_game_engine(event)
            .with_src(self.settings.robot_id.clone())
            .with_seat(self.ctx.current_seat())
            .with_payload(payload);
        match message {
            Ok(message) => {
                self.ctx.sink().send(message);
            }
            Err(e) => warn!(event = %event, error = %e, "Failed to build outbound message"),
        }
    }

    /// Announce the registered bindings; the Game Engine acknowledges them
    fn publish_inputs(&self) {
        let payload = json!({ "inputs": self.router.inputs().descriptors() });
        let message = match Message::to_game_engine(ROBOT_INPUTS)
            .with_src(self.settings.robot_id.clone())
            .with_payload(payload)
        {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to build input publication");
                return;
            }
        };

        let sink = self.ctx.sink().clone();
        tokio::spawn(async move {
            match sink.send_and_await_ack(message).await {
                Ok(response) => info!(response = %response, "Input bindings acknowledged"),
                Err(e) => warn!(error = %e, "Input bindings were not acknowledged"),
            }
        });
    }

    fn end_cleanup(&mut self) {
        self.router.disable_routing(None);
        self.ctx.clear_game_state();
        self.awaiting_approval = false;
        info!("Game ended, inputs disabled and game state cleared");
    }

    fn on_signal(&mut self, signal: ProcessSignal) -> Flow {
        match signal {
            ProcessSignal::Interrupt => Flow::Exit(ExitCause::signal(ExitReason::Sigint)),
            ProcessSignal::Terminate => Flow::Exit(ExitCause::signal(ExitReason::Sigterm)),
            ProcessSignal::Update => {
                self.update_requested = true;
                info!(phase = %self.ctx.phase(), "Update requested, deferring to next game boundary");
                Flow::Continue
            }
        }
    }

    async fn shutdown(mut self, cause: ExitCause) -> Result<ExitState, LifecycleError> {
        let ExitCause {
            reason,
            error,
            fatal,
        } = cause;
        info!(reason = %reason, "Shutting down");

        if let Some(task) = self.current.take() {
            let (phase, outcome) = task.cancel().await;
            match outcome {
                PhaseOutcome::Failed(e) => {
                    warn!(phase = %phase, error = %format!("{e:#}"), "Phase handler failed while stopping");
                }
                PhaseOutcome::Panicked(_) => {
                    warn!(phase = %phase, "Phase handler panicked while stopping");
                }
                _ => debug!(phase = %phase, "Phase handler stopped"),
            }
        }

        self.game.on_exit(reason, error.as_ref()).await;
        self.router.shutdown_inputs();
        self.ctx.sink().close();
        info!(reason = %reason, "Shutdown complete");

        match fatal {
            Fatal::No => Ok(ExitState { reason, error }),
            Fatal::Phase => Err(LifecycleError::PhaseFailed(
                error.unwrap_or_else(|| anyhow!("phase handler failed")),
            )),
            Fatal::Auth(e) => Err(LifecycleError::Auth(e)),
            Fatal::Panic(payload) => std::panic::resume_unwind(payload),
        }
    }
}

async fn run_phase<G: Game>(
    game: &G,
    ctx: &GameContext,
    phase: Phase,
    run_finish: bool,
) -> anyhow::Result<PhaseResult> {
    match phase {
        Phase::Init => Ok(PhaseResult::Ready),
        Phase::Config => {
            game.on_config(ctx).await?;
            Ok(PhaseResult::Ready)
        }
        Phase::Prepare => {
            let approve = game.on_prepare(ctx).await?;
            Ok(PhaseResult::Prepared {
                auto_approve: approve.unwrap_or(true),
            })
        }
        Phase::PreGame => Ok(PhaseResult::PreGame {
            seat: game.on_pre_game(ctx).await?,
        }),
        Phase::Countdown => {
            game.on_countdown(ctx).await?;
            Ok(PhaseResult::Ready)
        }
        Phase::Start => {
            game.on_start(ctx).await?;
            Ok(PhaseResult::Ready)
        }
        Phase::Finish => {
            game.on_finish(ctx).await?;
            Ok(PhaseResult::Ready)
        }
        Phase::End => {
            if run_finish {
                info!("Grace period was missed, running finish before end");
                game.on_finish(ctx).await?;
            }
            Ok(PhaseResult::Ready)
        }
    }
}

fn respond(reply: Option<Responder>, response: Value) {
    if let Some(reply) = reply {
        reply.respond(response);
    }
}
