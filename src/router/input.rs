//! Input handler contract and the write-once binding table

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::ConfigError;

/// A device the router can drive: a switch, joystick, actuator, ...
///
/// Handlers are called from the dispatch loop and from watchdog timers, so
/// they must not block for long.
pub trait InputHandler: Send + Sync {
    /// Apply a command for `seat`
    fn on_input(&self, command: &Value, seat: u32);

    /// Return every control for `seat` to neutral
    fn reset(&self, seat: u32);

    /// Final cleanup at process exit
    fn shutdown(&self, seat: u32) {
        self.reset(seat);
    }

    fn name(&self) -> String;
}

/// A registered handler and whether it is reserved for admins
#[derive(Clone)]
pub struct InputBinding {
    pub handler: Arc<dyn InputHandler>,
    pub admin: bool,
}

/// Published form of a binding, sent to the Game Engine on connect
#[derive(Debug, Clone, Serialize)]
pub struct InputDescriptor {
    pub id: String,
    pub name: String,
    pub admin: bool,
}

/// Input bindings keyed by input id. Filled during INIT, read-only afterwards.
#[derive(Default, Clone)]
pub struct InputRegistry {
    bindings: BTreeMap<String, InputBinding>,
}

impl InputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `id`; a duplicate id is a configuration error
    pub fn register(
        &mut self,
        id: impl Into<String>,
        handler: Arc<dyn InputHandler>,
        admin: bool,
    ) -> Result<(), ConfigError> {
        let id = id.into();
        if self.bindings.contains_key(&id) {
            return Err(ConfigError::DuplicateInput(id));
        }
        self.bindings.insert(id, InputBinding { handler, admin });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&InputBinding> {
        self.bindings.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InputBinding)> {
        self.bindings.iter().map(|(id, binding)| (id.as_str(), binding))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn descriptors(&self) -> Vec<InputDescriptor> {
        self.iter()
            .map(|(id, binding)| InputDescriptor {
                id: id.to_string(),
                name: binding.handler.name(),
                admin: binding.admin,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl InputHandler for Noop {
        fn on_input(&self, _command: &Value, _seat: u32) {}
        fn reset(&self, _seat: u32) {}
        fn name(&self) -> String {
            "noop".into()
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = InputRegistry::new();
        registry.register("horn", Arc::new(Noop), false).unwrap();
        let err = registry.register("horn", Arc::new(Noop), true).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateInput(id) if id == "horn"));
        assert_eq!(registry.len(), 1);
        assert!(!registry.get("horn").unwrap().admin);
    }

    #[test]
    fn descriptors_are_sorted_by_id() {
        let mut registry = InputRegistry::new();
        registry.register("wheels", Arc::new(Noop), false).unwrap();
        registry.register("arm", Arc::new(Noop), true).unwrap();
        let ids: Vec<_> = registry.descriptors().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["arm", "wheels"]);
    }
}
