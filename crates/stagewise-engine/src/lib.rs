//! Stagewise Engine - multi-stage training orchestration.
//!
//! This crate drives a model through an ordered list of stages, each with its
//! own epoch count, optimizer and validation settings. It provides:
//! - The stage -> epoch -> iteration loop and its twelve hook events
//! - An ordered hook registry with built-in hooks and a hook factory
//! - A bounded metric buffer
//! - Checkpointing and resume
//! - Configuration loading
//!
//! Numeric work stays with the collaborators defined in
//! `stagewise-abstraction`.
//!
//! # Example
//!
//! ```rust,no_run
//! use stagewise_engine::{Components, EngineBuilder, EngineConfig};
//!
//! fn main() -> stagewise_engine::Result<()> {
//!     let config = EngineConfig::from_file("run.toml")?;
//!     let components = Components::new();
//!     let mut engine = EngineBuilder::from_config(&config, components)?.build()?;
//!     engine.launch()
//! }
//! ```

pub mod buffer;
pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod optim;
pub mod registry;
pub mod stage;

pub use buffer::{Buffer, DEFAULT_BUFFER_SIZE};
pub use checkpoint::{CheckpointMeta, CheckpointRecord, CheckpointSource, Checkpointer, JsonCheckpointer};
pub use comm::{Communicator, LocalCommunicator, LocalGroup, SingleProcess};
pub use config::{DataConfig, EngineConfig};
pub use engine::{
    Components, Engine, EngineBuilder, EngineContext, EngineParts, OUTPUT_KEY, Progress, ResumeReport,
};
pub use error::{EngineError, Result};
pub use hooks::{
    CheckpointHook, CommandLineWriter, DistOptimizerHook, EvalHook, EventWriterHook, Hook, HookEvent,
    HookFactory, HookPriority, HookRegistry, HookSpec, IterTimerHook, JsonWriter, LrUpdaterHook,
    MetricEvent, OptimizerHook, Writer,
};
pub use optim::{OptimizerRegistry, Sgd};
pub use stage::{ComponentSpec, OptimizerSpec, StageSchedule, StageSpec, ValidationPolicy};

pub use stagewise_abstraction as abstraction;
