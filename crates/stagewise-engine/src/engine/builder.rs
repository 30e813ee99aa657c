use crate::buffer::{Buffer, DEFAULT_BUFFER_SIZE};
use crate::checkpoint::{Checkpointer, JsonCheckpointer};
use crate::comm::{Communicator, SingleProcess};
use crate::config::EngineConfig;
use crate::engine::context::{EngineContext, Progress};
use crate::engine::data::DataSources;
use crate::engine::{Engine, HookSource};
use crate::error::{EngineError, Result};
use crate::hooks::{HookFactory, HookRegistry};
use crate::optim::OptimizerRegistry;
use crate::registry::Registry;
use crate::stage::{ComponentSpec, StageSchedule, StageSpec};
use stagewise_abstraction::{DataSource, Mode, Model, ModelOutput};
use std::path::PathBuf;
use tracing::{debug, info_span};
use uuid::Uuid;

/// Builds a model from its spec and the run seed.
pub type ModelBuilder = Box<dyn Fn(&ComponentSpec, u64) -> Result<Box<dyn Model>> + Send + Sync>;

/// Builds a data source for one mode from its spec and the run seed.
pub type DataBuilder =
    Box<dyn Fn(&ComponentSpec, Mode, u64) -> Result<Box<dyn DataSource>> + Send + Sync>;

/// Named component builders used to construct an engine from configuration.
pub struct Components {
    models: Registry<ModelBuilder>,
    data: Registry<DataBuilder>,
    hooks: HookFactory,
    optimizers: OptimizerRegistry,
}

impl Default for Components {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("models", &self.models)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl Components {
    /// No models or data sources; the built-in hooks and optimizers.
    pub fn new() -> Self {
        Self {
            models: Registry::new("model"),
            data: Registry::new("data source"),
            hooks: HookFactory::default(),
            optimizers: OptimizerRegistry::default(),
        }
    }

    pub fn register_model<F>(&mut self, name: &str, builder: F) -> Result<()>
    where
        F: Fn(&ComponentSpec, u64) -> Result<Box<dyn Model>> + Send + Sync + 'static,
    {
        self.models.register(name, Box::new(builder))
    }

    pub fn register_data<F>(&mut self, name: &str, builder: F) -> Result<()>
    where
        F: Fn(&ComponentSpec, Mode, u64) -> Result<Box<dyn DataSource>> + Send + Sync + 'static,
    {
        self.data.register(name, Box::new(builder))
    }

    pub fn hooks_mut(&mut self) -> &mut HookFactory {
        &mut self.hooks
    }

    pub fn optimizers_mut(&mut self) -> &mut OptimizerRegistry {
        &mut self.optimizers
    }

    fn build_data(&self, spec: Option<&ComponentSpec>, mode: Mode, seed: u64) -> Result<Option<Box<dyn DataSource>>> {
        spec.map(|spec| (self.data.get(&spec.kind)?)(spec, mode, seed)).transpose()
    }
}

/// Step-by-step engine construction.
pub struct EngineBuilder {
    model: Option<Box<dyn Model>>,
    train: Option<Box<dyn DataSource>>,
    val: Option<Box<dyn DataSource>>,
    test: Option<Box<dyn DataSource>>,
    stages: Vec<StageSpec>,
    hooks: Vec<(HookSource, Option<String>, bool)>,
    buffer_size: usize,
    work_dir: Option<PathBuf>,
    seed: u64,
    meta: serde_json::Map<String, serde_json::Value>,
    comm: Box<dyn Communicator>,
    optimizers: OptimizerRegistry,
    hook_factory: HookFactory,
    checkpointer: Option<Box<dyn Checkpointer>>,
    run_id: Option<String>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("stages", &self.stages.len())
            .field("hooks", &self.hooks.len())
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            model: None,
            train: None,
            val: None,
            test: None,
            stages: Vec::new(),
            hooks: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            work_dir: None,
            seed: crate::config::DEFAULT_SEED,
            meta: serde_json::Map::new(),
            comm: Box::new(SingleProcess),
            optimizers: OptimizerRegistry::default(),
            hook_factory: HookFactory::default(),
            checkpointer: None,
            run_id: None,
        }
    }

    /// Start from a loaded configuration, building components by name.
    ///
    /// Hooks listed in the configuration are queued with their own `before`
    /// and `overwrite` settings.
    pub fn from_config(config: &EngineConfig, components: Components) -> Result<Self> {
        config.validate()?;
        let seed = config.seed;

        let model = (components.models.get(&config.model.kind)?)(&config.model, seed)?;
        let train = components.build_data(Some(&config.data.train), Mode::Train, seed)?;
        let val = components.build_data(config.data.val.as_ref(), Mode::Val, seed)?;
        let test = components.build_data(config.data.test.as_ref(), Mode::Test, seed)?;

        let mut builder = Self::new()
            .stages(config.stages.clone())
            .buffer_size(config.buffer_size)
            .seed(seed)
            .meta(config.meta.clone())
            .optimizers(components.optimizers)
            .hook_factory(components.hooks);
        builder.model = Some(model);
        builder.train = train;
        builder.val = val;
        builder.test = test;
        builder.work_dir.clone_from(&config.work_dir);

        for spec in &config.hooks {
            let before = spec.before.clone();
            let overwrite = spec.overwrite;
            builder.hooks.push((HookSource::Spec(spec.clone()), before, overwrite));
        }
        Ok(builder)
    }

    #[must_use]
    pub fn model(mut self, model: impl Model + 'static) -> Self {
        self.model = Some(Box::new(model));
        self
    }

    #[must_use]
    pub fn boxed_model(mut self, model: Box<dyn Model>) -> Self {
        self.model = Some(model);
        self
    }

    #[must_use]
    pub fn train_data(mut self, source: impl DataSource + 'static) -> Self {
        self.train = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn val_data(mut self, source: impl DataSource + 'static) -> Self {
        self.val = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn test_data(mut self, source: impl DataSource + 'static) -> Self {
        self.test = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn stages(mut self, stages: Vec<StageSpec>) -> Self {
        self.stages = stages;
        self
    }

    #[must_use]
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Queue a hook for registration, after any queued earlier.
    #[must_use]
    pub fn hook(mut self, hook: impl Into<HookSource>) -> Self {
        self.hooks.push((hook.into(), None, true));
        self
    }

    #[must_use]
    pub fn hook_before(mut self, hook: impl Into<HookSource>, before: &str) -> Self {
        self.hooks.push((hook.into(), Some(before.to_string()), true));
        self
    }

    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    #[must_use]
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: serde_json::Map<String, serde_json::Value>) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn communicator(mut self, comm: impl Communicator + 'static) -> Self {
        self.comm = Box::new(comm);
        self
    }

    #[must_use]
    pub fn optimizers(mut self, optimizers: OptimizerRegistry) -> Self {
        self.optimizers = optimizers;
        self
    }

    #[must_use]
    pub fn hook_factory(mut self, factory: HookFactory) -> Self {
        self.hook_factory = factory;
        self
    }

    #[must_use]
    pub fn checkpointer(mut self, checkpointer: impl Checkpointer + 'static) -> Self {
        self.checkpointer = Some(Box::new(checkpointer));
        self
    }

    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Validate the pieces, create the work directory and register queued hooks.
    pub fn build(self) -> Result<Engine> {
        let model = self.model.ok_or_else(|| EngineError::configuration("a model is required"))?;
        if self.train.is_none() {
            return Err(EngineError::MissingDataSource(Mode::Train.as_str().to_string()));
        }
        if self.buffer_size == 0 {
            return Err(EngineError::configuration("buffer_size must be >= 1"));
        }
        let stages = StageSchedule::new(self.stages)?;

        if let Some(dir) = &self.work_dir {
            std::fs::create_dir_all(dir)?;
        }

        let data = DataSources::new(self.train, self.val, self.test);
        let iters_per_epoch = data.len(Mode::Train);
        let run_id = self.run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("run", run_id = %run_id, rank = self.comm.rank());

        let checkpointer = match self.checkpointer {
            Some(checkpointer) => checkpointer,
            None => Box::new(JsonCheckpointer::new(
                self.work_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            )),
        };

        let ctx = EngineContext {
            model,
            optimizer: None,
            buffer: Buffer::new(self.buffer_size),
            losses: ModelOutput::new(),
            stages,
            progress: Progress::default(),
            mode: Mode::Train,
            iters_per_epoch,
            data,
            comm: self.comm,
            work_dir: self.work_dir,
            seed: self.seed,
            meta: self.meta,
            run_id,
            span,
        };

        let mut engine = Engine {
            ctx,
            hooks: HookRegistry::new(),
            optimizers: self.optimizers,
            hook_factory: self.hook_factory,
            checkpointer,
        };

        for (hook, before, overwrite) in self.hooks {
            engine.register_hook(hook, before.as_deref(), overwrite)?;
        }

        debug!(hooks = ?engine.hooks.names(), iters_per_epoch, "Engine built");
        Ok(engine)
    }
}
