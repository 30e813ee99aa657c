//! `stagewise inspect`: show what a checkpoint contains.

use anyhow::Result;
use colored::Colorize;
use comfy_table::Table;
use serde::Serialize;
use stagewise_engine::{CheckpointRecord, CheckpointSource, Checkpointer, JsonCheckpointer};

#[derive(Debug, Serialize)]
struct Summary<'a> {
    run_id: &'a str,
    created_at: String,
    epoch: usize,
    iter: usize,
    stages: usize,
    checksum_valid: bool,
    has_optimizer_state: bool,
    parameters: Vec<String>,
}

fn summarize(record: &CheckpointRecord) -> Result<Summary<'_>> {
    let mut parameters: Vec<String> = record
        .model_state
        .as_object()
        .map(|params| params.keys().cloned().collect())
        .unwrap_or_default();
    parameters.sort();
    Ok(Summary {
        run_id: &record.meta.run_id,
        created_at: record.meta.created_at.to_rfc3339(),
        epoch: record.meta.epoch,
        iter: record.meta.iter,
        stages: record.meta.stages.len(),
        checksum_valid: record.verify_checksum()?,
        has_optimizer_state: record.optimizer_state.is_some(),
        parameters,
    })
}

pub fn execute(checkpoint: &str, json: bool) -> Result<()> {
    let source = CheckpointSource::parse(checkpoint);
    // Loading never touches the checkpointer's own directory.
    let record = JsonCheckpointer::new(".").load(&source)?;
    let summary = summarize(&record)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{}", "Checkpoint".bold());
    println!("  Source: {}", source.to_string().cyan());
    println!("  Run: {}", summary.run_id.cyan());
    println!("  Created: {}", summary.created_at);
    println!("  Epoch: {}  Iter: {}", summary.epoch, summary.iter);
    println!("  Optimizer state: {}", if summary.has_optimizer_state { "yes" } else { "no" });
    println!("  Parameters: {}", summary.parameters.join(", "));
    if summary.checksum_valid {
        println!("  Checksum: {}", "ok".green());
    } else {
        println!("  Checksum: {}", "MISMATCH".red().bold());
    }
    println!();

    let mut table = Table::new();
    table.set_header(vec!["Stage", "Epochs", "Optimizer", "LR"]);
    for (i, stage) in record.meta.stages.iter().enumerate() {
        let lr = stage.optimizer.params.get("lr").map_or_else(|| "-".to_string(), ToString::to_string);
        table.add_row(vec![i.to_string(), stage.epochs.to_string(), stage.optimizer.kind.clone(), lr]);
    }
    println!("{table}");
    Ok(())
}
