//! Demo game used by the binary

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, warn};

use ge_robot_client::lifecycle::{ExitReason, Game, GameContext};
use ge_robot_client::router::{InputHandler, InputRegistry};

/// On/off output per seat
pub struct Switch {
    label: &'static str,
    states: DashMap<u32, bool>,
}

impl Switch {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            states: DashMap::new(),
        }
    }
}

/// `{"state": "down" | "up"}`, or `{"on": bool}`
fn switch_state(command: &Value) -> Option<bool> {
    match command.get("state").and_then(Value::as_str) {
        Some("down") => Some(true),
        Some("up") => Some(false),
        Some(_) => None,
        None => command.get("on").and_then(Value::as_bool),
    }
}

impl InputHandler for Switch {
    fn on_input(&self, command: &Value, seat: u32) {
        let Some(on) = switch_state(command) else {
            warn!(switch = self.label, seat, command = %command, "Unrecognised switch command");
            return;
        };
        if self.states.insert(seat, on) != Some(on) {
            info!(switch = self.label, seat, on, "Switch toggled");
        }
    }

    fn reset(&self, seat: u32) {
        if self.states.insert(seat, false) == Some(true) {
            info!(switch = self.label, seat, "Switch reset");
        }
    }

    fn name(&self) -> String {
        self.label.to_string()
    }
}

pub struct DemoGame {
    switch: Arc<Switch>,
    lights: Arc<Switch>,
}

impl Default for DemoGame {
    fn default() -> Self {
        Self {
            switch: Arc::new(Switch::new("Switch")),
            lights: Arc::new(Switch::new("Lights")),
        }
    }
}

#[async_trait]
impl Game for DemoGame {
    async fn on_init(&self, inputs: &mut InputRegistry) -> anyhow::Result<()> {
        inputs.register("switch", self.switch.clone(), false)?;
        inputs.register("lights", self.lights.clone(), true)?;
        Ok(())
    }

    async fn on_config(&self, ctx: &GameContext) -> anyhow::Result<()> {
        info!(players = ctx.players().len(), "Game configured");
        Ok(())
    }

    async fn on_start(&self, ctx: &GameContext) -> anyhow::Result<()> {
        ctx.send_log("Demo game started")?;
        Ok(())
    }

    async fn on_finish(&self, ctx: &GameContext) -> anyhow::Result<()> {
        let seat = ctx.current_seat();
        ctx.send_progress(1.0, seat)?;
        ctx.send_score(1.0, seat, true, false)?;
        Ok(())
    }

    async fn on_exit(&self, reason: ExitReason, error: Option<&anyhow::Error>) {
        match error {
            Some(e) => info!(reason = %reason, error = %e, "Demo game exiting"),
            None => info!(reason = %reason, "Demo game exiting"),
        }
    }
}
