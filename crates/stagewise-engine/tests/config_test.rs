//! Building and running an engine from a configuration document.

mod common;

use common::{Batches, Linear, init_tracing};
use stagewise_engine::abstraction::{DataSource, Mode, Model};
use stagewise_engine::{Components, EngineBuilder, EngineConfig, EngineError};

const RUN: &str = r#"
    seed = 3

    [model]
    type = "Linear"

    [data.train]
    type = "Batches"
    batches = 4

    [data.val]
    type = "Batches"
    batches = 1

    [[stages]]
    epochs = 2
    optimizer = { type = "SGD", lr = 0.01, momentum = 0.9 }
    warmup = { policy = "linear", steps = 4, ratio = 0.1 }
    validation = { interval = 1 }

    [[stages]]
    epochs = 1
    optimizer = { type = "sgd", lr = 0.001 }
    lr_schedule = { type = "iter", policy = "cosine" }
    grad_clip = { max_norm = 1.0 }

    [[hooks]]
    type = "IterTimerHook"

    [[hooks]]
    type = "LrUpdaterHook"

    [[hooks]]
    type = "OptimizerHook"

    [[hooks]]
    type = "CheckpointHook"
    interval = 2

    [[hooks]]
    type = "EvalHook"

    [[hooks]]
    type = "EventWriterHook"
    interval = 2
    writers = [{ type = "CommandLineWriter" }, { type = "JSONWriter" }]
"#;

fn components() -> Components {
    let mut components = Components::new();
    components
        .register_model("linear", |_spec, _seed| Ok(Box::new(Linear::new()) as Box<dyn Model>))
        .unwrap();
    components
        .register_data("batches", |spec, mode, _seed| {
            let n = spec.param_or("batches", 1usize)?;
            let start = if mode == Mode::Train { 0.0 } else { 10.0 };
            Ok(Box::new(Batches::new(n, start)) as Box<dyn DataSource>)
        })
        .unwrap();
    components
}

#[test]
fn test_configured_run_uses_every_builtin_hook() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::from_toml_str(RUN).unwrap();
    config.work_dir = Some(dir.path().to_path_buf());

    let mut engine = EngineBuilder::from_config(&config, components()).unwrap().build().unwrap();
    assert_eq!(
        engine.hooks().names(),
        vec!["IterTimerHook", "LrUpdaterHook", "OptimizerHook", "CheckpointHook", "EvalHook", "EventWriterHook"]
    );
    engine.launch().unwrap();

    let ctx = engine.context();
    assert_eq!(ctx.iter(), 12);
    assert_eq!(ctx.seed(), 3);
    for key in ["time", "data_time", "lr", "loss", "grad_norm", "count"] {
        assert!(ctx.buffer().contains(key), "missing {key}");
    }
    // Warmup starts at ratio * lr.
    let first_lr = ctx.buffer().values("lr").unwrap()[0].0.mean();
    assert!((first_lr - 0.001).abs() < 1e-12);

    assert!(dir.path().join("epoch_2.json").exists());
    assert!(!dir.path().join("epoch_1.json").exists());

    let metrics = std::fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
    let events: Vec<serde_json::Value> = metrics.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert!(events.iter().any(|e| e["mode"] == "train" && e["metrics"]["loss"].is_number()));
    assert!(events.iter().any(|e| e["mode"] == "val" && e["metrics"]["count"].is_number()));
    assert!(events.iter().all(|e| e["metrics"].get("_out").is_none()));
}

#[test]
fn test_unknown_component_names_fail() {
    init_tracing();
    let mut config = EngineConfig::from_toml_str(RUN).unwrap();
    config.model.kind = "Transformer".to_string();
    let err = EngineBuilder::from_config(&config, components()).unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
}

#[test]
fn test_unknown_hook_type_fails_at_build() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::from_toml_str(RUN).unwrap();
    config.work_dir = Some(dir.path().to_path_buf());
    config.hooks.push(stagewise_engine::HookSpec::new("TensorboardHook"));

    let err = EngineBuilder::from_config(&config, components()).unwrap().build().unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
}
