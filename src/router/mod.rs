//! Seat-multiplexed input routing with a safety watchdog

pub mod input;
pub mod seats;
pub mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::events::{self, NewPeer, PeerLeft, RoutingToggle};
use crate::protocol::{AdminEvent, ClientType, GeEvent, Message, MessageError};

pub use input::{InputBinding, InputDescriptor, InputHandler, InputRegistry};
pub use seats::{PeerRoute, SeatStatus, SeatTable};
pub use watchdog::Watchdog;

/// What the router did with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A Game Engine lifecycle event for the lifecycle to run
    Lifecycle(GeEvent),
    /// Operator approval of a prepared game
    Approval,
    /// Delivered to an input handler
    Delivered { input: String, seat: u32 },
    /// Consumed by the router itself (peers, routing toggles, ping, logs)
    Handled,
}

/// Reasons a message is dropped. Always logged, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no input registered as '{input}'")]
    UnknownInput { input: String, seat: u32 },

    #[error("input '{input}' is admin-only")]
    PermissionDenied { input: String, seat: u32 },

    #[error("seat {seat} is disabled")]
    SeatDisabled { input: String, seat: u32 },

    #[error("'{event}' is only accepted from the game engine")]
    NotFromGameEngine { event: String },

    #[error("'{event}' requires game engine or admin authority")]
    Unauthorized { event: String },

    #[error("unknown peer '{peer}'")]
    UnknownPeer { peer: String },

    #[error("bad payload for '{event}': {source}")]
    BadPayload {
        event: String,
        #[source]
        source: MessageError,
    },
}

/// Routes inbound messages to seats and input handlers
pub struct MessageRouter {
    inputs: Arc<InputRegistry>,
    seats: Mutex<SeatTable>,
    watchdog: Watchdog,
}

impl MessageRouter {
    pub fn new(inputs: InputRegistry, watchdog_timeout: Duration) -> Self {
        Self {
            inputs: Arc::new(inputs),
            seats: Mutex::new(SeatTable::default()),
            watchdog: Watchdog::new(watchdog_timeout),
        }
    }

    pub fn inputs(&self) -> &InputRegistry {
        &self.inputs
    }

    pub fn seat_status(&self, seat: u32) -> Option<SeatStatus> {
        self.seats.lock().status(seat)
    }

    pub fn is_seat_enabled(&self, seat: u32) -> bool {
        self.seats.lock().is_enabled(seat)
    }

    /// Classify and, where applicable, deliver one message
    pub fn dispatch(&self, msg: &Message) -> Result<Route, RouteError> {
        let from_ge = msg.is_from_game_engine();
        let seat = self.resolve_seat(msg);

        if !from_ge {
            self.kick_watchdog(seat);
        }

        if let Some(event) = GeEvent::parse(&msg.event) {
            return if from_ge {
                Ok(Route::Lifecycle(event))
            } else {
                Err(RouteError::NotFromGameEngine {
                    event: msg.event.clone(),
                })
            };
        }

        if let Some(admin_event) = AdminEvent::parse(&msg.event) {
            if admin_event.requires_authority() && !self.is_privileged(msg) {
                return Err(RouteError::Unauthorized {
                    event: msg.event.clone(),
                });
            }
            return self.handle_admin(admin_event, msg, seat);
        }

        if msg.event == events::APPROVE_GAME {
            return if self.is_privileged(msg) {
                Ok(Route::Approval)
            } else {
                Err(RouteError::Unauthorized {
                    event: msg.event.clone(),
                })
            };
        }

        self.deliver(msg, seat)
    }

    /// GE messages name their seat; peer messages use the peer's route
    fn resolve_seat(&self, msg: &Message) -> u32 {
        if msg.is_from_game_engine() {
            return msg.seat;
        }
        msg.src
            .as_deref()
            .and_then(|src| self.seats.lock().peer(src).map(|route| route.seat))
            .unwrap_or(msg.seat)
    }

    fn is_privileged(&self, msg: &Message) -> bool {
        if msg.is_admin || msg.is_from_game_engine() {
            return true;
        }
        msg.src
            .as_deref()
            .and_then(|src| {
                self.seats
                    .lock()
                    .peer(src)
                    .map(|route| route.client_type == ClientType::Admin)
            })
            .unwrap_or(false)
    }

    fn deliver(&self, msg: &Message, seat: u32) -> Result<Route, RouteError> {
        let input = msg.event.clone();
        let binding = self
            .inputs
            .get(&input)
            .ok_or_else(|| RouteError::UnknownInput {
                input: input.clone(),
                seat,
            })?;

        if binding.admin && !self.is_privileged(msg) {
            return Err(RouteError::PermissionDenied { input, seat });
        }

        {
            let mut seats = self.seats.lock();
            if !seats.is_enabled(seat) {
                return Err(RouteError::SeatDisabled { input, seat });
            }
            seats.touch(seat);
        }

        binding.handler.on_input(&msg.payload, seat);
        Ok(Route::Delivered { input, seat })
    }

    fn handle_admin(&self, event: AdminEvent, msg: &Message, seat: u32) -> Result<Route, RouteError> {
        match event {
            AdminEvent::NewPeer => {
                let peer: NewPeer = parse_payload(msg)?;
                let previous = self.seats.lock().add_peer(&peer);
                info!(peer = %peer.id, seat = peer.seat, client_type = ?peer.client_type, "Peer joined");
                if let Some(previous) = previous.filter(|p| p.seat != peer.seat) {
                    info!(peer = %peer.id, seat = previous.seat, "Peer moved seats, resetting old seat");
                    self.reset_seat(previous.seat);
                }
            }
            AdminEvent::PeerLeft => {
                let left: PeerLeft = parse_payload(msg)?;
                let route = self.seats.lock().remove_peer(&left.id);
                match route {
                    Some(route) => {
                        info!(peer = %left.id, seat = route.seat, "Peer left, resetting seat");
                        self.reset_seat(route.seat);
                    }
                    None => return Err(RouteError::UnknownPeer { peer: left.id }),
                }
            }
            AdminEvent::EnableRouting => {
                let toggle: RoutingToggle = parse_payload(msg)?;
                self.enable_routing(toggle.seat);
            }
            AdminEvent::DisableRouting => {
                let toggle: RoutingToggle = parse_payload(msg)?;
                self.disable_routing(toggle.seat);
            }
            AdminEvent::Ping => {
                debug!(seat, src = ?msg.src, "Ping");
            }
            AdminEvent::RobotLog => {
                info!(target: "robot_log", seat, src = ?msg.src, payload = %msg.payload, "Robot log");
            }
        }
        Ok(Route::Handled)
    }

    /// Resume routing for one seat or all seats. Does not arm any watchdog.
    pub fn enable_routing(&self, seat: Option<u32>) {
        self.seats.lock().set_enabled(seat, true);
        info!(seat = ?seat, "Input routing enabled");
    }

    /// Stop routing for one seat or all seats and reset the affected inputs now
    pub fn disable_routing(&self, seat: Option<u32>) {
        let affected = self.seats.lock().set_enabled(seat, false);
        info!(seat = ?seat, "Input routing disabled");
        for seat in affected {
            self.reset_seat(seat);
        }
    }

    fn kick_watchdog(&self, seat: u32) {
        let inputs = self.inputs.clone();
        let timeout = self.watchdog.timeout();
        self.watchdog.kick(seat, move || {
            warn!(seat, timeout_secs = timeout.as_secs_f64(), "No traffic for seat, resetting inputs");
            reset_inputs(&inputs, seat);
        });
    }

    /// Cancel the seat's watchdog and reset its inputs immediately
    pub fn reset_seat(&self, seat: u32) {
        self.watchdog.cancel(seat);
        reset_inputs(&self.inputs, seat);
    }

    /// Seats that may have live inputs; seat 0 when nothing is known yet
    pub fn known_seats(&self) -> Vec<u32> {
        let seats = self.seats.lock().known_seats();
        if seats.is_empty() {
            vec![0]
        } else {
            seats
        }
    }

    /// Final teardown: stop all timers and shut every input down on every seat
    pub fn shutdown_inputs(&self) {
        self.watchdog.cancel_all();
        for seat in self.known_seats() {
            for (id, binding) in self.inputs.iter() {
                debug!(input = %id, seat, "Shutting down input");
                binding.handler.shutdown(seat);
            }
        }
    }
}

fn reset_inputs(inputs: &InputRegistry, seat: u32) {
    for (id, binding) in inputs.iter() {
        debug!(input = %id, seat, "Resetting input");
        binding.handler.reset(seat);
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(msg: &Message) -> Result<T, RouteError> {
    msg.payload_as().map_err(|source| RouteError::BadPayload {
        event: msg.event.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GAME_ENGINE;
    use parking_lot::Mutex as PlMutex;
    use serde_json::{json, Value};
    use tokio::time::sleep;

    #[derive(Default)]
    struct Recorder {
        inputs: PlMutex<Vec<(Value, u32)>>,
        resets: PlMutex<Vec<u32>>,
        shutdowns: PlMutex<Vec<u32>>,
    }

    impl InputHandler for Recorder {
        fn on_input(&self, command: &Value, seat: u32) {
            self.inputs.lock().push((command.clone(), seat));
        }
        fn reset(&self, seat: u32) {
            self.resets.lock().push(seat);
        }
        fn shutdown(&self, seat: u32) {
            self.shutdowns.lock().push(seat);
        }
        fn name(&self) -> String {
            "recorder".into()
        }
    }

    fn router_with(admin: bool) -> (MessageRouter, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut registry = InputRegistry::new();
        registry.register("switch", recorder.clone(), admin).unwrap();
        (MessageRouter::new(registry, Duration::from_secs(5)), recorder)
    }

    fn from_ge(event: &str, payload: Value) -> Message {
        Message::new(event, "robot")
            .with_src(GAME_ENGINE)
            .with_payload(payload)
            .unwrap()
    }

    fn from_peer(peer: &str, event: &str, payload: Value) -> Message {
        Message::new(event, "robot")
            .with_src(peer)
            .with_payload(payload)
            .unwrap()
    }

    fn join(router: &MessageRouter, peer: &str, seat: u32, client_type: &str) {
        router
            .dispatch(&from_ge(
                "newPeer",
                json!({"seat": seat, "id": peer, "clientType": client_type}),
            ))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn switch_on_reaches_enabled_seat_once() {
        let (router, recorder) = router_with(false);
        join(&router, "p1", 0, "player");
        router.enable_routing(None);

        let route = router
            .dispatch(&from_peer("p1", "switch", json!({"state": "down"})))
            .unwrap();

        assert_eq!(
            route,
            Route::Delivered {
                input: "switch".into(),
                seat: 0
            }
        );
        assert_eq!(*recorder.inputs.lock(), vec![(json!({"state": "down"}), 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_seat_drops_input() {
        let (router, recorder) = router_with(false);
        join(&router, "p1", 0, "player");

        let err = router
            .dispatch(&from_peer("p1", "switch", json!({"state": "down"})))
            .unwrap_err();

        assert!(matches!(err, RouteError::SeatDisabled { seat: 0, .. }));
        assert!(recorder.inputs.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn admin_only_input_checks_privilege() {
        let (router, recorder) = router_with(true);
        join(&router, "player", 0, "player");
        join(&router, "operator", 1, "admin");
        router.enable_routing(None);

        let err = router
            .dispatch(&from_peer("player", "switch", json!({})))
            .unwrap_err();
        assert!(matches!(err, RouteError::PermissionDenied { .. }));

        router
            .dispatch(&from_peer("operator", "switch", json!({})))
            .unwrap();
        router
            .dispatch(&from_peer("player", "switch", json!({})).with_admin(true))
            .unwrap();
        router
            .dispatch(&from_ge("switch", json!({})).with_seat(2))
            .unwrap();

        let seats: Vec<u32> = recorder.inputs.lock().iter().map(|(_, s)| *s).collect();
        assert_eq!(seats, vec![1, 0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_input_is_dropped() {
        let (router, _recorder) = router_with(false);
        router.enable_routing(None);
        let err = router
            .dispatch(&from_peer("p1", "laser", json!({})))
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownInput { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_resets_seat_exactly_once() {
        let (router, recorder) = router_with(false);
        join(&router, "p1", 0, "player");
        router.enable_routing(None);

        router
            .dispatch(&from_peer("p1", "switch", json!({"state": "down"})))
            .unwrap();
        sleep(Duration::from_millis(5100)).await;
        assert_eq!(*recorder.resets.lock(), vec![0]);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(*recorder.resets.lock(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_postpones_reset() {
        let (router, recorder) = router_with(false);
        join(&router, "p1", 0, "player");
        router.enable_routing(None);

        router.dispatch(&from_peer("p1", "switch", json!({}))).unwrap();
        sleep(Duration::from_secs(4)).await;
        router.dispatch(&from_peer("p1", "ping", json!({}))).unwrap();
        sleep(Duration::from_secs(4)).await;
        assert!(recorder.resets.lock().is_empty());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(*recorder.resets.lock(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_left_resets_immediately() {
        let (router, recorder) = router_with(false);
        join(&router, "p1", 0, "player");
        router.enable_routing(None);

        router.dispatch(&from_peer("p1", "switch", json!({}))).unwrap();
        sleep(Duration::from_secs(1)).await;
        router
            .dispatch(&from_ge("peerLeft", json!({"id": "p1"})))
            .unwrap();
        assert_eq!(*recorder.resets.lock(), vec![0]);

        // the pending watchdog was cancelled
        sleep(Duration::from_secs(10)).await;
        assert_eq!(*recorder.resets.lock(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_resets_and_enable_does_not_rearm() {
        let (router, recorder) = router_with(false);
        join(&router, "p1", 0, "player");
        join(&router, "p2", 1, "player");
        router.enable_routing(None);

        router
            .dispatch(&from_ge("disableRouting", json!({"seat": 1})))
            .unwrap();
        assert_eq!(*recorder.resets.lock(), vec![1]);
        assert!(!router.is_seat_enabled(1));
        assert!(router.is_seat_enabled(0));

        router
            .dispatch(&from_ge("enableRouting", json!({"seat": 1})))
            .unwrap();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(*recorder.resets.lock(), vec![1]);

        router.dispatch(&from_ge("disableRouting", json!({}))).unwrap();
        assert_eq!(*recorder.resets.lock(), vec![1, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn administrative_events_need_authority() {
        let (router, recorder) = router_with(false);
        let err = router
            .dispatch(&from_peer("p1", "enableRouting", json!({})))
            .unwrap_err();
        assert!(matches!(err, RouteError::Unauthorized { .. }));
        assert!(!router.is_seat_enabled(0));

        let err = router
            .dispatch(&from_peer("p1", "gameStarted", json!({})))
            .unwrap_err();
        assert!(matches!(err, RouteError::NotFromGameEngine { .. }));
        assert!(recorder.inputs.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_events_are_handed_back() {
        let (router, _recorder) = router_with(false);
        assert_eq!(
            router.dispatch(&from_ge("gameEnded", json!({}))).unwrap(),
            Route::Lifecycle(GeEvent::GameEnded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bad_new_peer_payload_is_dropped() {
        let (router, _recorder) = router_with(false);
        let err = router
            .dispatch(&from_ge("newPeer", json!({"seat": "zero"})))
            .unwrap_err();
        assert!(matches!(err, RouteError::BadPayload { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_covers_seat_zero_when_idle() {
        let (router, recorder) = router_with(false);
        router.shutdown_inputs();
        assert_eq!(*recorder.shutdowns.lock(), vec![0]);
    }
}
