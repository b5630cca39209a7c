//! Observable key/value options, shared by realities and contexts.

use parking_lot::RwLock;
use periscope_core::EventHandler;
use serde_json::{Map, Value};

/// One option that changed.
#[derive(Clone, Debug, PartialEq)]
pub struct OptionChange {
    /// Option key.
    pub id: String,
    /// New value.
    pub value: Value,
}

/// A JSON object whose writes are announced on [`Options::on_change`].
#[derive(Debug, Default)]
pub struct Options {
    values: RwLock<Map<String, Value>>,
    change: EventHandler<OptionChange>,
}

impl Options {
    /// Creates options holding `initial`.
    #[must_use]
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            values: RwLock::new(initial),
            change: EventHandler::new(),
        }
    }

    /// One value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// Writes one value and announces it.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let id = key.into();
        self.values.write().insert(id.clone(), value.clone());
        self.change.emit(&OptionChange { id, value });
    }

    /// Writes every entry of `options`, announcing each in order.
    pub fn set_options(&self, options: &Map<String, Value>) {
        for (key, value) in options {
            self.set(key.clone(), value.clone());
        }
    }

    /// Copy of every value.
    #[must_use]
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.read().clone()
    }

    /// Fires after each write.
    #[must_use]
    pub fn on_change(&self) -> &EventHandler<OptionChange> {
        &self.change
    }
}
