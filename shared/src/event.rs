//! Domain events carried inside client commands and dispatched on the server

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tagged value of an event parameter
///
/// `Int` and `Float` travel over the wire. `Entity` is a process-local object
/// reference that only server-side handlers may use; the codec refuses to
/// encode it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Entity(u32),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v)
    }
}

/// A named event such as `"Death"` or `"Spawn"` with typed parameters
///
/// Parameters are kept sorted by name so the encoded form is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub priority: i32,
    pub params: BTreeMap<String, ParamValue>,
    /// Ticks the event waited in a scheduler queue. Not transported.
    pub age: u32,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.add_param(key, value);
        self
    }

    pub fn add_param(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn param(&self, key: &str) -> Option<ParamValue> {
        self.params.get(key).copied()
    }

    pub fn int_param(&self, key: &str) -> Option<i32> {
        self.param(key).and_then(|v| v.as_int())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new("Spawn")
            .with_priority(1)
            .with_param("playerId", 4)
            .with_param("speed", 2.5f32);

        assert_eq!(event.kind, "Spawn");
        assert_eq!(event.priority, 1);
        assert_eq!(event.int_param("playerId"), Some(4));
        assert_eq!(event.param("speed"), Some(ParamValue::Float(2.5)));
        assert_eq!(event.age, 0);
    }

    #[test]
    fn test_params_are_sorted_by_key() {
        let event = Event::new("Collision")
            .with_param("playerId", 1)
            .with_param("objectId", 2);

        let keys: Vec<&str> = event.params.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["objectId", "playerId"]);
    }

    #[test]
    fn test_int_param_rejects_other_variants() {
        let event = Event::new("Death")
            .with_param("playerId", 1.0f32)
            .with_param("target", ParamValue::Entity(3));

        assert_eq!(event.int_param("playerId"), None);
        assert_eq!(event.int_param("target"), None);
        assert_eq!(event.int_param("missing"), None);
    }
}
