//! System configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::system::Priority;

/// Configuration handed to [`System::init`](crate::System::init).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Name the system is registered under.
    pub name: String,
    /// Free-form settings for the system itself.
    pub settings: Map<String, Value>,
    /// Overrides the system's own run interval, in ticks.
    pub run_interval: Option<u64>,
    /// Overrides the system's own priority.
    pub priority: Option<Priority>,
    /// Systems that must be registered before this one is run.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SystemConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_run_interval(mut self, ticks: u64) -> Self {
        self.run_interval = Some(ticks);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, system: impl Into<String>) -> Self {
        self.dependencies.push(system.into());
        self
    }

    #[must_use]
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}
