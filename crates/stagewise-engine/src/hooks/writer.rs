//! Periodic metric summaries and the writers that publish them.

use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::hooks::registry::Hook;
use crate::hooks::types::{HookPriority, HookSpec};
use crate::stage::ComponentSpec;
use serde::Serialize;
use stagewise_abstraction::Mode;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use tracing::{debug, info};

/// Default JSON lines file written by `JsonWriter` inside the work directory.
pub const METRICS_FILE: &str = "metrics.jsonl";

/// One summary of windowed buffer averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub mode: Mode,
    pub stage: usize,
    pub epoch: usize,
    pub iter: usize,
    pub metrics: BTreeMap<String, f64>,
}

impl MetricEvent {
    /// `key=value` pairs in key order.
    pub fn format_metrics(&self) -> String {
        self.metrics.iter().map(|(k, v)| format!("{k}={v:.6}")).collect::<Vec<_>>().join(" ")
    }
}

/// Destination for metric summaries.
pub trait Writer: Send {
    fn name(&self) -> &str;

    /// Prepare output before the first event; called when the owning hook registers.
    fn open(&mut self, _ctx: &EngineContext) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, event: &MetricEvent) -> Result<()>;
}

/// Logs each summary as a tracing event.
#[derive(Debug, Clone, Default)]
pub struct CommandLineWriter;

impl CommandLineWriter {
    pub const TYPE: &'static str = "CommandLineWriter";
}

impl Writer for CommandLineWriter {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn write(&mut self, event: &MetricEvent) -> Result<()> {
        info!(
            mode = %event.mode,
            stage = event.stage,
            epoch = event.epoch,
            iter = event.iter,
            "{}",
            event.format_metrics()
        );
        Ok(())
    }
}

/// Appends each summary as one JSON object per line.
#[derive(Debug, Clone, Default)]
pub struct JsonWriter {
    path: Option<PathBuf>,
}

impl JsonWriter {
    pub const TYPE: &'static str = "JsonWriter";

    /// Write to `path` instead of `metrics.jsonl` in the work directory.
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()) }
    }

    /// The explicit output file, if one was given.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }
}

impl Writer for JsonWriter {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn open(&mut self, ctx: &EngineContext) -> Result<()> {
        if self.path.is_none() {
            let dir = ctx
                .work_dir()
                .ok_or_else(|| EngineError::configuration("JsonWriter needs a work_dir or a file"))?;
            self.path = Some(dir.join(METRICS_FILE));
        }
        Ok(())
    }

    fn write(&mut self, event: &MetricEvent) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| EngineError::configuration("JsonWriter has no output file"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }
}

/// Build a writer from its spec. Names are matched case-insensitively.
pub fn build_writer(spec: &ComponentSpec) -> Result<Box<dyn Writer>> {
    debug!(writer = %spec.kind, "Building writer");
    match spec.kind.to_lowercase().as_str() {
        "commandlinewriter" => Ok(Box::new(CommandLineWriter)),
        "jsonwriter" => Ok(Box::new(JsonWriter { path: spec.param("file")? })),
        other => Err(EngineError::configuration(format!("unknown writer type '{other}'"))),
    }
}

/// Summarizes buffer averages every `interval` training iterations and at
/// the end of every train and validation epoch.
///
/// Each key is averaged over the values pushed since its previous summary.
/// Keys starting with `_` are internal and skipped.
pub struct EventWriterHook {
    name: String,
    priority: HookPriority,
    interval: usize,
    writers: Vec<Box<dyn Writer>>,
    last_counts: HashMap<String, u64>,
}

impl std::fmt::Debug for EventWriterHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriterHook")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("writers", &self.writers.iter().map(|w| w.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for EventWriterHook {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

impl EventWriterHook {
    pub const TYPE: &'static str = "EventWriterHook";
    pub const DEFAULT_INTERVAL: usize = 50;

    /// A hook logging to the command line every `interval` iterations.
    pub fn new(interval: usize) -> Self {
        Self {
            name: Self::TYPE.to_string(),
            priority: HookPriority::LOW,
            interval: interval.max(1),
            writers: vec![Box::new(CommandLineWriter)],
            last_counts: HashMap::new(),
        }
    }

    /// Reads `interval` (default 50) and a `writers` list of writer specs.
    /// Without `writers` the hook logs to the command line.
    pub fn from_spec(spec: &HookSpec) -> Result<Self> {
        let interval = spec.param_or("interval", Self::DEFAULT_INTERVAL)?;
        if interval == 0 {
            return Err(EngineError::configuration("EventWriterHook interval must be >= 1"));
        }
        let writers = match spec.param::<Vec<ComponentSpec>>("writers")? {
            Some(specs) => specs.iter().map(build_writer).collect::<Result<Vec<_>>>()?,
            None => vec![Box::new(CommandLineWriter) as Box<dyn Writer>],
        };

        Ok(Self {
            name: spec.name_or_type().to_string(),
            priority: spec.priority_or(HookPriority::LOW),
            interval,
            writers,
            last_counts: HashMap::new(),
        })
    }

    /// Replace the writers.
    #[must_use]
    pub fn with_writers(mut self, writers: Vec<Box<dyn Writer>>) -> Self {
        self.writers = writers;
        self
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    fn summarize(&mut self, ctx: &EngineContext) -> Result<BTreeMap<String, f64>> {
        let buffer = ctx.buffer();
        let mut metrics = BTreeMap::new();
        for key in buffer.keys().filter(|k| !k.starts_with('_')) {
            let count = buffer.count(key);
            let last = self.last_counts.get(key).copied().unwrap_or(0);
            if count <= last {
                continue;
            }
            metrics.insert(key.to_string(), buffer.avg(key, (count - last) as usize)?);
            self.last_counts.insert(key.to_string(), count);
        }
        Ok(metrics)
    }

    fn flush(&mut self, ctx: &EngineContext) -> Result<()> {
        let metrics = self.summarize(ctx)?;
        if metrics.is_empty() {
            return Ok(());
        }

        let event = MetricEvent {
            mode: ctx.mode(),
            stage: ctx.stage(),
            epoch: ctx.epoch(),
            iter: ctx.iter(),
            metrics,
        };
        for writer in &mut self.writers {
            writer.write(&event)?;
        }
        Ok(())
    }
}

impl Hook for EventWriterHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> HookPriority {
        self.priority
    }

    fn on_register(&mut self, ctx: &EngineContext) -> Result<()> {
        for writer in &mut self.writers {
            writer.open(ctx)?;
        }
        Ok(())
    }

    fn after_train_iter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        if (ctx.iter() + 1) % self.interval == 0 {
            self.flush(ctx)?;
        }
        Ok(())
    }

    fn after_train_epoch(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.flush(ctx)
    }

    fn after_val_epoch(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.flush(ctx)
    }
}
