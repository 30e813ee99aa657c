//! Hook registry for managing and dispatching hooks.

use crate::error::{EngineError, Result};
use crate::hooks::types::{HookEvent, HookPriority};
use crate::EngineContext;
use std::collections::HashMap;
use tracing::trace;

/// Trait for hook implementations.
///
/// Every event callback defaults to a no-op, so a hook only implements the
/// events it cares about. Hooks read and mutate engine state through the
/// context but never touch the progress counters.
pub trait Hook: Send {
    /// Get the name of the hook. Unique within one engine.
    fn name(&self) -> &str;

    /// Get the priority of the hook.
    fn priority(&self) -> HookPriority {
        HookPriority::default()
    }

    /// Called once when the hook is registered with an engine.
    fn on_register(&mut self, _ctx: &EngineContext) -> Result<()> {
        Ok(())
    }

    fn before_launch(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn after_launch(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn before_stage(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn after_stage(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn before_train_epoch(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn after_train_epoch(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn before_val_epoch(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn after_val_epoch(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn before_train_iter(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn after_train_iter(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn before_val_iter(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }

    fn after_val_iter(&mut self, _ctx: &mut EngineContext) -> Result<()> {
        Ok(())
    }
}

/// Ordered collection of uniquely named hooks.
///
/// Backed by a list in dispatch order plus a name-to-position index that is
/// rebuilt after every structural change.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Box<dyn Hook>>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry").field("hooks", &self.names()).finish()
    }
}

impl HookRegistry {
    /// Create a new hook registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook.
    ///
    /// A new hook is appended after every hook of equal or higher priority. A
    /// hook whose name is already taken replaces the old one in place when
    /// `overwrite` is set. When `before` names a registered hook, the
    /// (re)inserted hook is then moved to sit immediately before it.
    ///
    /// # Errors
    /// `HookNotFound` if `before` is unknown, `DuplicateHook` if the name is
    /// taken and `overwrite` is false. The registry is unchanged on error.
    pub fn register(&mut self, hook: Box<dyn Hook>, before: Option<&str>, overwrite: bool) -> Result<()> {
        let name = hook.name().to_string();

        if let Some(target) = before {
            if !self.index.contains_key(target) {
                return Err(EngineError::HookNotFound(target.to_string()));
            }
        }

        let mut pos = match self.index.get(&name) {
            Some(_) if !overwrite => return Err(EngineError::DuplicateHook(name)),
            Some(&pos) => {
                self.hooks[pos] = hook;
                pos
            }
            None => {
                let priority = hook.priority();
                let pos = self
                    .hooks
                    .iter()
                    .position(|h| h.priority() < priority)
                    .unwrap_or(self.hooks.len());
                self.hooks.insert(pos, hook);
                pos
            }
        };
        self.reindex();

        if let Some(target) = before.filter(|t| *t != name) {
            let hook = self.hooks.remove(pos);
            self.reindex();
            pos = self.index[target];
            self.hooks.insert(pos, hook);
            self.reindex();
        }

        trace!(hook = %name, position = pos, "Registered hook");
        Ok(())
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, hook) in self.hooks.iter().enumerate() {
            self.index.insert(hook.name().to_string(), i);
        }
    }

    /// Unregister a hook by name.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Hook>> {
        let pos = self.index.get(name).copied()?;
        let hook = self.hooks.remove(pos);
        self.reindex();
        Some(hook)
    }

    /// Invoke `event` on every hook in registration order.
    ///
    /// The first error aborts dispatch and is returned unchanged.
    pub fn call(&mut self, event: HookEvent, ctx: &mut EngineContext) -> Result<()> {
        for hook in &mut self.hooks {
            trace!(hook = %hook.name(), event = %event, "Dispatching hook");
            event.dispatch(hook.as_mut(), ctx)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Hook> {
        self.index.get(name).map(|&i| self.hooks[i].as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Hook names in dispatch order.
    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Clear all hooks.
    pub fn clear(&mut self) {
        self.hooks.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        name: &'static str,
        priority: HookPriority,
    }

    impl Named {
        fn boxed(name: &'static str) -> Box<dyn Hook> {
            Self::with(name, HookPriority::default())
        }

        fn with(name: &'static str, priority: HookPriority) -> Box<dyn Hook> {
            Box::new(Self { name, priority })
        }
    }

    impl Hook for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> HookPriority {
            self.priority
        }
    }

    fn registry(names: &[&'static str]) -> HookRegistry {
        let mut registry = HookRegistry::new();
        for &name in names {
            registry.register(Named::boxed(name), None, false).unwrap();
        }
        registry
    }

    #[test]
    fn test_appends_in_registration_order() {
        let registry = registry(&["a", "b", "c"]);
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
        assert_eq!(registry.position("c"), Some(2));
    }

    #[test]
    fn test_before_moves_hook_in_front_of_target() {
        let mut registry = registry(&["a", "b", "c"]);
        registry.register(Named::boxed("d"), Some("b"), false).unwrap();
        assert_eq!(registry.names(), vec!["a", "d", "b", "c"]);

        registry.register(Named::boxed("e"), Some("a"), false).unwrap();
        assert_eq!(registry.names(), vec!["e", "a", "d", "b", "c"]);
    }

    #[test]
    fn test_unknown_before_target_fails_without_change() {
        let mut registry = registry(&["a"]);
        let err = registry.register(Named::boxed("b"), Some("zzz"), true).unwrap_err();
        assert!(matches!(err, EngineError::HookNotFound(ref n) if n == "zzz"));
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[test]
    fn test_duplicate_without_overwrite_fails() {
        let mut registry = registry(&["a", "b"]);
        let err = registry.register(Named::boxed("a"), None, false).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateHook(ref n) if n == "a"));
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let mut registry = registry(&["a", "b", "c"]);
        registry.register(Named::with("b", HookPriority::HIGH), None, true).unwrap();
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_overwrite_with_before_moves() {
        let mut registry = registry(&["a", "b", "c"]);
        registry.register(Named::boxed("c"), Some("a"), true).unwrap();
        assert_eq!(registry.names(), vec!["c", "a", "b"]);

        registry.register(Named::boxed("a"), Some("a"), true).unwrap();
        assert_eq!(registry.names(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_priority_places_new_hooks() {
        let mut registry = HookRegistry::new();
        registry.register(Named::with("writer", HookPriority::LOW), None, false).unwrap();
        registry.register(Named::boxed("optimizer"), None, false).unwrap();
        registry.register(Named::with("timer", HookPriority::HIGH), None, false).unwrap();
        registry.register(Named::boxed("checkpoint"), None, false).unwrap();
        assert_eq!(registry.names(), vec!["timer", "optimizer", "checkpoint", "writer"]);
    }

    #[test]
    fn test_remove_reindexes() {
        let mut registry = registry(&["a", "b", "c"]);
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.position("c"), Some(1));
        assert!(registry.get("b").is_some());
    }
}
