//! Per-process game context handed to every phase handler

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::protocol::events;
use crate::protocol::{Message, MessageError};
use crate::router::MessageRouter;
use crate::transport::MessageSink;
use crate::util::time::unix_millis;

use super::phase::Phase;

/// Errors from context helpers
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("final_score and seat_final_score cannot both be set")]
    ConflictingFinalFlags,

    #[error(transparent)]
    Message(#[from] MessageError),
}

#[derive(Debug, Default)]
struct GameState {
    phase: Phase,
    configs: Option<Value>,
    players: Vec<Value>,
    current_seat: u32,
}

struct ContextInner {
    sink: Arc<dyn MessageSink>,
    router: Arc<MessageRouter>,
    robot_id: String,
    state: Mutex<GameState>,
}

/// Game state and outbound helpers, owned by the lifecycle and cloned into
/// each phase handler.
#[derive(Clone)]
pub struct GameContext {
    inner: Arc<ContextInner>,
}

impl GameContext {
    pub(crate) fn new(
        sink: Arc<dyn MessageSink>,
        router: Arc<MessageRouter>,
        robot_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                sink,
                router,
                robot_id: robot_id.into(),
                state: Mutex::new(GameState::default()),
            }),
        }
    }

    pub fn robot_id(&self) -> &str {
        &self.inner.robot_id
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// Game configuration from the latest `config` event
    pub fn configs(&self) -> Option<Value> {
        self.inner.state.lock().configs.clone()
    }

    /// Players announced by the latest `config` event
    pub fn players(&self) -> Vec<Value> {
        self.inner.state.lock().players.clone()
    }

    pub fn current_seat(&self) -> u32 {
        self.inner.state.lock().current_seat
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    fn outbound(&self, event: &str, seat: u32, payload: Value) -> Result<Message, MessageError> {
        Message::to_game_engine(event)
            .with_src(self.inner.robot_id.clone())
            .with_seat(seat)
            .with_payload(payload)
    }

    fn send(&self, event: &str, seat: u32, payload: Value) -> Result<bool, ContextError> {
        let message = self.outbound(event, seat, payload)?;
        Ok(self.inner.sink.send(message))
    }

    /// Report a score. Marking both the game-final and seat-final flags is
    /// rejected.
    pub fn send_score(
        &self,
        score: f64,
        seat: u32,
        final_score: bool,
        seat_final_score: bool,
    ) -> Result<bool, ContextError> {
        if final_score && seat_final_score {
            return Err(ContextError::ConflictingFinalFlags);
        }
        self.send(
            events::SCORE_UPDATE,
            seat,
            json!({ "score": score, "final": final_score, "seatFinal": seat_final_score }),
        )
    }

    /// Report a completed lap for `seat`
    pub fn send_lap(&self, seat: u32) -> Result<bool, ContextError> {
        self.send(events::LAP_UPDATE, seat, json!({}))
    }

    /// Report progress for `seat`, clamped to `0.0..=1.0`
    pub fn send_progress(&self, progress: f64, seat: u32) -> Result<bool, ContextError> {
        self.send(
            events::PROGRESS_UPDATE,
            seat,
            json!({ "progress": progress.clamp(0.0, 1.0) }),
        )
    }

    /// Designate the active seat and tell the Game Engine
    pub fn set_current_seat(&self, seat: u32) -> Result<bool, ContextError> {
        self.inner.state.lock().current_seat = seat;
        self.send(events::SET_CURRENT_SEAT, seat, json!({ "seat": seat }))
    }

    /// Send a log line to the admin console
    pub fn send_log(&self, line: impl Into<String>) -> Result<bool, ContextError> {
        let seat = self.current_seat();
        self.send(
            events::ROBOT_LOG,
            seat,
            json!({ "message": line.into(), "timestamp": unix_millis() }),
        )
    }

    pub fn enable_inputs(&self, seat: Option<u32>) {
        self.inner.router.enable_routing(seat);
    }

    pub fn disable_inputs(&self, seat: Option<u32>) {
        self.inner.router.disable_routing(seat);
    }

    pub(crate) fn sink(&self) -> &Arc<dyn MessageSink> {
        &self.inner.sink
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.inner.state.lock().phase = phase;
    }

    /// Store `configs` and `players` from a `config` payload
    pub(crate) fn apply_config(&self, payload: &Value) {
        let mut state = self.inner.state.lock();
        state.configs = payload.get("configs").cloned();
        state.players = payload
            .get("players")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
    }

    pub(crate) fn clear_game_state(&self) {
        let mut state = self.inner.state.lock();
        state.configs = None;
        state.players.clear();
    }
}
