//! Event names and typed payloads understood by the client

use serde::{Deserialize, Serialize};

/// Outbound: registered input bindings, sent as an acknowledged request
pub const ROBOT_INPUTS: &str = "robotInputs";
/// Outbound: phase readiness when the Game Engine did not ask for an ack
pub const PHASE_READY: &str = "phaseReady";
pub const SCORE_UPDATE: &str = "scoreUpdate";
pub const LAP_UPDATE: &str = "lapUpdate";
pub const PROGRESS_UPDATE: &str = "progressUpdate";
pub const SET_CURRENT_SEAT: &str = "setCurrentSeat";
pub const GAME_APPROVED: &str = "gameApproved";
/// Admin log line, outbound from the robot and inbound from peers
pub const ROBOT_LOG: &str = "robotLog";

/// Inbound: operator approval of a prepared game
pub const APPROVE_GAME: &str = "approveGame";

/// Game Engine events that drive the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeEvent {
    Config,
    PrepareGame,
    PreGameStarted,
    CountdownStarted,
    GameStarted,
    GracePeriodStarted,
    GameEnded,
}

impl GeEvent {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "config" => Self::Config,
            "prepareGame" => Self::PrepareGame,
            "preGameStarted" => Self::PreGameStarted,
            "countdownStarted" => Self::CountdownStarted,
            "gameStarted" => Self::GameStarted,
            "gracePeriodStarted" => Self::GracePeriodStarted,
            "gameEnded" => Self::GameEnded,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::PrepareGame => "prepareGame",
            Self::PreGameStarted => "preGameStarted",
            Self::CountdownStarted => "countdownStarted",
            Self::GameStarted => "gameStarted",
            Self::GracePeriodStarted => "gracePeriodStarted",
            Self::GameEnded => "gameEnded",
        }
    }
}

/// Router administrative events, handled before input routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminEvent {
    NewPeer,
    PeerLeft,
    EnableRouting,
    DisableRouting,
    Ping,
    RobotLog,
}

impl AdminEvent {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "newPeer" => Self::NewPeer,
            "peerLeft" => Self::PeerLeft,
            "enableRouting" => Self::EnableRouting,
            "disableRouting" => Self::DisableRouting,
            "ping" => Self::Ping,
            "robotLog" => Self::RobotLog,
            _ => return None,
        })
    }

    /// Events that change routing state and therefore need authority
    pub fn requires_authority(&self) -> bool {
        matches!(
            self,
            Self::NewPeer | Self::PeerLeft | Self::EnableRouting | Self::DisableRouting
        )
    }
}

/// Kind of client behind a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Player,
    Admin,
}

/// `newPeer` payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPeer {
    pub seat: u32,
    pub id: String,
    #[serde(default)]
    pub client_type: ClientType,
}

/// `peerLeft` payload
#[derive(Debug, Clone, Deserialize)]
pub struct PeerLeft {
    pub id: String,
}

/// `enableRouting` / `disableRouting` payload; no seat means every seat
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingToggle {
    #[serde(default)]
    pub seat: Option<u32>,
}
