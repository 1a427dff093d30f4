//! Robot controller client for a remote Game Engine
//!
//! Keeps an authenticated WebSocket session to the Game Engine (plus an
//! optional local socket), routes player commands to seat-scoped input
//! handlers behind a safety watchdog, and runs user game logic through the
//! engine's phase lifecycle.

pub mod app;
pub mod config;
pub mod lifecycle;
pub mod protocol;
pub mod router;
pub mod transport;
pub mod util;

pub use app::{run, AUTH_FAILURE_EXIT_CODE};
pub use config::{Config, ConfigError, LogFormat};
pub use lifecycle::{
    ExitReason, ExitState, Game, GameContext, GameLifecycle, LifecycleError, LifecycleSettings,
    Phase,
};
pub use protocol::Message;
pub use router::{InputHandler, InputRegistry};
