//! Hooks system for extending the training loop.
//!
//! Hooks observe and act on the engine at twelve lifecycle events. They are
//! kept in a `HookRegistry` whose order is the dispatch order, and can be
//! built from configuration through a `HookFactory`.

pub mod checkpoint;
pub mod eval;
pub mod factory;
pub mod lr_updater;
pub mod optimizer;
pub mod registry;
pub mod timer;
pub mod types;
pub mod writer;

pub use checkpoint::CheckpointHook;
pub use eval::EvalHook;
pub use factory::{HookBuilder, HookFactory};
pub use lr_updater::LrUpdaterHook;
pub use optimizer::{DistOptimizerHook, OptimizerHook};
pub use registry::{Hook, HookRegistry};
pub use timer::IterTimerHook;
pub use types::{HookEvent, HookPriority, HookSpec};
pub use writer::{CommandLineWriter, EventWriterHook, JsonWriter, MetricEvent, Writer};
