//! Core types for the hooks system.

use crate::error::{EngineError, Result};
use crate::hooks::registry::Hook;
use crate::stage::lookup_param;
use crate::EngineContext;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Priority for hook placement.
///
/// Hooks with higher priority values are placed first.
/// Default priority is 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HookPriority(pub u32);

impl Default for HookPriority {
    fn default() -> Self {
        Self(100)
    }
}

impl HookPriority {
    /// Iteration timers.
    pub const HIGH: Self = Self(200);
    pub const NORMAL: Self = Self(100);
    /// Event writers.
    pub const LOW: Self = Self(10);

    /// Create a new hook priority.
    pub fn new(priority: u32) -> Self {
        Self(priority)
    }

    /// Get the priority value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Lifecycle events a hook can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforeLaunch,
    AfterLaunch,
    BeforeStage,
    AfterStage,
    BeforeTrainEpoch,
    AfterTrainEpoch,
    BeforeValEpoch,
    AfterValEpoch,
    BeforeTrainIter,
    AfterTrainIter,
    BeforeValIter,
    AfterValIter,
}

impl HookEvent {
    pub const ALL: [Self; 12] = [
        Self::BeforeLaunch,
        Self::AfterLaunch,
        Self::BeforeStage,
        Self::AfterStage,
        Self::BeforeTrainEpoch,
        Self::AfterTrainEpoch,
        Self::BeforeValEpoch,
        Self::AfterValEpoch,
        Self::BeforeTrainIter,
        Self::AfterTrainIter,
        Self::BeforeValIter,
        Self::AfterValIter,
    ];

    /// Get the string representation of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeLaunch => "before_launch",
            Self::AfterLaunch => "after_launch",
            Self::BeforeStage => "before_stage",
            Self::AfterStage => "after_stage",
            Self::BeforeTrainEpoch => "before_train_epoch",
            Self::AfterTrainEpoch => "after_train_epoch",
            Self::BeforeValEpoch => "before_val_epoch",
            Self::AfterValEpoch => "after_val_epoch",
            Self::BeforeTrainIter => "before_train_iter",
            Self::AfterTrainIter => "after_train_iter",
            Self::BeforeValIter => "before_val_iter",
            Self::AfterValIter => "after_val_iter",
        }
    }

    /// Invoke the callback matching this event on `hook`.
    pub fn dispatch(self, hook: &mut dyn Hook, ctx: &mut EngineContext) -> Result<()> {
        match self {
            Self::BeforeLaunch => hook.before_launch(ctx),
            Self::AfterLaunch => hook.after_launch(ctx),
            Self::BeforeStage => hook.before_stage(ctx),
            Self::AfterStage => hook.after_stage(ctx),
            Self::BeforeTrainEpoch => hook.before_train_epoch(ctx),
            Self::AfterTrainEpoch => hook.after_train_epoch(ctx),
            Self::BeforeValEpoch => hook.before_val_epoch(ctx),
            Self::AfterValEpoch => hook.after_val_epoch(ctx),
            Self::BeforeTrainIter => hook.before_train_iter(ctx),
            Self::AfterTrainIter => hook.after_train_iter(ctx),
            Self::BeforeValIter => hook.before_val_iter(ctx),
            Self::AfterValIter => hook.after_val_iter(ctx),
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| EngineError::configuration(format!("unknown hook event '{s}'")))
    }
}

fn default_overwrite() -> bool {
    true
}

/// Declarative hook description, resolved through a `HookFactory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Registered hook type, e.g. `OptimizerHook`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Registry name; defaults to the type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl HookSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            before: None,
            overwrite: true,
            priority: None,
            params: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn before(mut self, target: impl Into<String>) -> Self {
        self.before = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// The registry name the built hook should use.
    pub fn name_or_type(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }

    pub fn priority_or(&self, default: HookPriority) -> HookPriority {
        self.priority.map_or(default, HookPriority)
    }

    /// Typed lookup of an optional parameter.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        lookup_param(&self.kind, &self.params, key)
    }

    pub fn param_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.param(key)?.unwrap_or(default))
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(EngineError::configuration("hook spec requires a type"));
        }
        Ok(())
    }
}

impl From<&str> for HookSpec {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_roundtrip() {
        for event in HookEvent::ALL {
            assert_eq!(event.as_str().parse::<HookEvent>().unwrap(), event);
        }
        assert!("after_everything".parse::<HookEvent>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(HookPriority::HIGH > HookPriority::default());
        assert!(HookPriority::LOW < HookPriority::NORMAL);
    }

    #[test]
    fn test_hook_spec_from_toml() {
        let spec: HookSpec = toml::from_str(
            r#"
            type = "EventWriterHook"
            interval = 50
            before = "OptimizerHook"
            "#,
        )
        .unwrap();
        assert_eq!(spec.name_or_type(), "EventWriterHook");
        assert_eq!(spec.before.as_deref(), Some("OptimizerHook"));
        assert!(spec.overwrite);
        assert_eq!(spec.param::<usize>("interval").unwrap(), Some(50));
        let err = spec.param::<String>("interval").unwrap_err();
        assert!(matches!(&err, EngineError::Configuration(msg) if msg.starts_with("EventWriterHook.interval: ")));
    }
}
