//! `stagewise schedule`: print the stage plan a configuration describes.

use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{Cell, Color, Table};
use stagewise_engine::{EngineConfig, StageSchedule};
use std::path::Path;

pub fn execute(config_path: &Path) -> Result<()> {
    let config = EngineConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let schedule = StageSchedule::new(config.stages)?;

    let mut table = Table::new();
    table.set_header(vec!["Stage", "Epochs", "Start", "End", "Optimizer", "LR", "Schedule", "Validation"]);
    for (i, stage) in schedule.stages().iter().enumerate() {
        let start = schedule.epochs_before(i);
        let lr = stage.optimizer.params.get("lr").map_or_else(|| "-".to_string(), ToString::to_string);
        let lr_schedule = stage
            .lr_schedule
            .as_ref()
            .map_or_else(|| "fixed".to_string(), |s| format!("{:?}/{:?}", s.policy, s.unit).to_lowercase());
        let validation = stage.validation.as_ref().map_or_else(
            || "-".to_string(),
            |v| format!("every {} after {}", v.interval, v.offset),
        );
        table.add_row(vec![
            Cell::new(i).fg(Color::Cyan),
            Cell::new(stage.epochs),
            Cell::new(start),
            Cell::new(start + stage.epochs),
            Cell::new(&stage.optimizer.kind),
            Cell::new(lr),
            Cell::new(lr_schedule),
            Cell::new(validation),
        ]);
    }

    println!("{}", "Stage schedule".bold());
    println!("{table}");
    println!("  {} {} stage(s), {} epoch(s)", "✓".green(), schedule.max_stages(), schedule.max_epochs());
    Ok(())
}
