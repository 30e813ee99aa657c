use crate::error::Result;
use crate::hooks::checkpoint::CheckpointHook;
use crate::hooks::eval::EvalHook;
use crate::hooks::lr_updater::LrUpdaterHook;
use crate::hooks::optimizer::{DistOptimizerHook, OptimizerHook};
use crate::hooks::registry::Hook;
use crate::hooks::timer::IterTimerHook;
use crate::hooks::types::HookSpec;
use crate::hooks::writer::EventWriterHook;
use crate::registry::Registry;
use tracing::debug;

/// Builds a hook from its spec.
pub type HookBuilder = Box<dyn Fn(&HookSpec) -> Result<Box<dyn Hook>> + Send + Sync>;

fn boxed<H: Hook + 'static>(hook: Result<H>) -> Result<Box<dyn Hook>> {
    Ok(Box::new(hook?))
}

fn build_optimizer_hook(spec: &HookSpec) -> Result<Box<dyn Hook>> {
    boxed(OptimizerHook::from_spec(spec))
}

fn build_dist_optimizer_hook(spec: &HookSpec) -> Result<Box<dyn Hook>> {
    boxed(DistOptimizerHook::from_spec(spec))
}

fn build_lr_updater_hook(spec: &HookSpec) -> Result<Box<dyn Hook>> {
    boxed(LrUpdaterHook::from_spec(spec))
}

fn build_iter_timer_hook(spec: &HookSpec) -> Result<Box<dyn Hook>> {
    boxed(IterTimerHook::from_spec(spec))
}

fn build_checkpoint_hook(spec: &HookSpec) -> Result<Box<dyn Hook>> {
    boxed(CheckpointHook::from_spec(spec))
}

fn build_eval_hook(spec: &HookSpec) -> Result<Box<dyn Hook>> {
    boxed(EvalHook::from_spec(spec))
}

fn build_event_writer_hook(spec: &HookSpec) -> Result<Box<dyn Hook>> {
    boxed(EventWriterHook::from_spec(spec))
}

/// Hook types that can be named in configuration.
pub struct HookFactory {
    builders: Registry<HookBuilder>,
}

impl std::fmt::Debug for HookFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookFactory").field("builders", &self.builders).finish()
    }
}

impl Default for HookFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HookFactory {
    /// A factory with no hook types.
    pub fn empty() -> Self {
        Self { builders: Registry::new("hook") }
    }

    /// A factory with every built-in hook type.
    pub fn with_builtins() -> Self {
        let mut factory = Self::empty();
        factory.builders.insert(OptimizerHook::TYPE, Box::new(build_optimizer_hook));
        factory.builders.insert(DistOptimizerHook::TYPE, Box::new(build_dist_optimizer_hook));
        factory.builders.insert(LrUpdaterHook::TYPE, Box::new(build_lr_updater_hook));
        factory.builders.insert(IterTimerHook::TYPE, Box::new(build_iter_timer_hook));
        factory.builders.insert(CheckpointHook::TYPE, Box::new(build_checkpoint_hook));
        factory.builders.insert(EvalHook::TYPE, Box::new(build_eval_hook));
        factory.builders.insert(EventWriterHook::TYPE, Box::new(build_event_writer_hook));
        factory
    }

    /// Register a custom hook type.
    pub fn register<F>(&mut self, name: &str, builder: F) -> Result<()>
    where
        F: Fn(&HookSpec) -> Result<Box<dyn Hook>> + Send + Sync + 'static,
    {
        self.builders.register(name, Box::new(builder))
    }

    /// Case-insensitive.
    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.builders.names().collect()
    }

    /// Build the hook described by `spec`.
    pub fn build(&self, spec: &HookSpec) -> Result<Box<dyn Hook>> {
        spec.validate()?;
        debug!(hook = %spec.kind, name = spec.name_or_type(), "Building hook");
        (self.builders.get(&spec.kind)?)(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::hooks::types::HookPriority;

    #[test]
    fn test_builtins_are_registered() {
        let factory = HookFactory::default();
        for kind in ["OptimizerHook", "DistOptimizerHook", "LrUpdaterHook", "IterTimerHook", "CheckpointHook", "EvalHook", "EventWriterHook"] {
            assert!(factory.contains(kind), "{kind} missing");
        }
        assert!(factory.contains("optimizerhook"));
    }

    #[test]
    fn test_built_hook_uses_spec_name_and_priority() {
        let factory = HookFactory::default();
        let hook = factory.build(&HookSpec::new("IterTimerHook")).unwrap();
        assert_eq!(hook.name(), "IterTimerHook");
        assert_eq!(hook.priority(), HookPriority::HIGH);

        let mut spec = HookSpec::new("OptimizerHook").named("step");
        spec.priority = Some(150);
        let hook = factory.build(&spec).unwrap();
        assert_eq!(hook.name(), "step");
        assert_eq!(hook.priority(), HookPriority(150));
    }

    #[test]
    fn test_unknown_and_empty_types_fail() {
        let factory = HookFactory::default();
        assert!(matches!(factory.build(&HookSpec::new("NoSuchHook")), Err(EngineError::Configuration(_))));
        assert!(matches!(factory.build(&HookSpec::new("  ")), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_custom_hook_registration() {
        struct Marker;

        impl Hook for Marker {
            fn name(&self) -> &str {
                "Marker"
            }
        }

        let mut factory = HookFactory::empty();
        factory.register("Marker", |_spec: &HookSpec| Ok(Box::new(Marker) as Box<dyn Hook>)).unwrap();
        assert!(factory.register("marker", |_spec: &HookSpec| Ok(Box::new(Marker) as Box<dyn Hook>)).is_err());
        assert_eq!(factory.build(&HookSpec::new("MARKER")).unwrap().name(), "Marker");
    }
}
