//! CLI command implementations.
//!
//! Each `run_*` function backs one `dossier` subcommand and prints a plain
//! `key: value` report to stdout.

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::driver::StepOutcome;
use crate::migrate;
use crate::models::{AnalysisUnit, DocumentStatus};
use crate::monitor::StuckMonitor;
use crate::runtime::Runtime;
use crate::stages::StageRegistry;
use crate::validator::JsonValidator;

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    std::fs::create_dir_all(&config.storage.root).with_context(|| {
        format!(
            "Failed to create storage root: {}",
            config.storage.root.display()
        )
    })?;
    println!("Database initialized successfully.");
    Ok(())
}

pub async fn run_ingest(config: &Config, path: &Path) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document.pdf".to_string());

    let runtime = Runtime::open(config).await?;
    let outcome = runtime.pipeline.ingest(&file_name, bytes).await?;
    let doc = &outcome.document;

    if outcome.duplicate {
        println!("Already registered.");
    } else {
        println!("Registered.");
    }
    println!("id:        {}", doc.id);
    println!("file:      {}", doc.file_name);
    println!("pages:     {}", doc.page_count);
    println!("bytes:     {}", doc.byte_size);
    println!(
        "chunked:   {}",
        if config.chunking.requires_chunking(doc.page_count, doc.byte_size) {
            "yes"
        } else {
            "no"
        }
    );
    Ok(())
}

pub async fn run_analyze(config: &Config, id: &str, wait: bool) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let started = runtime.pipeline.start_analysis(id).await?;

    println!("Analysis started.");
    println!("units:     {}", started.units_created);
    if started.chunked {
        println!("chunks:    {}", started.chunks);
        println!("queue:     {} new items", started.queue_items_created);
    }

    if !wait {
        println!("Run `dossier step {}` or `dossier serve` to process units.", id);
        return Ok(());
    }

    let dispatcher = Dispatcher::start(runtime.pipeline.clone(), &config.dispatcher);
    dispatcher.enqueue(id);
    dispatcher.wait_idle().await;
    dispatcher.shutdown();

    print_status(&runtime, id).await
}

pub async fn run_step(config: &Config, id: &str) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let outcome = runtime.pipeline.process_next(id).await?;
    match outcome {
        StepOutcome::UnitCompleted {
            stage,
            tokens_used,
            model_used,
            ..
        } => {
            println!("completed: {}", stage);
            println!("model:     {}", model_used);
            println!("tokens:    {}", tokens_used);
        }
        StepOutcome::UnitFailed { stage, code, .. } => {
            println!("failed:    {} ({})", stage, code);
        }
        StepOutcome::DocumentCompleted => println!("Document completed."),
        StepOutcome::Waiting { counts } => {
            println!("Nothing pending; {} unit(s) still processing.", counts.processing)
        }
        StepOutcome::DocumentFailed { counts } => {
            println!("Document finished with {} failed unit(s).", counts.failed)
        }
        StepOutcome::NotAnalyzing { status } => {
            println!("Document is {}; nothing to do.", status)
        }
    }
    Ok(())
}

pub async fn run_status(config: &Config, id: &str) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    print_status(&runtime, id).await
}

async fn print_status(runtime: &Runtime, id: &str) -> Result<()> {
    let doc = match runtime.store.get_document(id).await? {
        Some(d) => d,
        None => {
            eprintln!("Error: document not found: {}", id);
            std::process::exit(1);
        }
    };
    let units = runtime.store.list_units(id).await?;

    println!("--- Document ---");
    println!("id:          {}", doc.id);
    println!("file:        {}", doc.file_name);
    println!("status:      {}", doc.status);
    if doc.status == DocumentStatus::Error {
        println!(
            "reason:      {}",
            doc.error_reason.as_deref().unwrap_or("(unknown)")
        );
    }
    println!("pages:       {}", doc.page_count);
    println!("chunked:     {}", doc.is_chunked);
    println!("updated_at:  {}", format_ts_iso(doc.updated_at));
    println!();

    println!("--- Units ({}) ---", units.len());
    for unit in &units {
        println!("{}", unit_line(unit));
    }
    Ok(())
}

fn unit_line(unit: &AnalysisUnit) -> String {
    let mut line = format!(
        "[{:>2}] {:<11} {}",
        unit.execution_order,
        unit.status.as_str(),
        unit.stage_title
    );
    if let (Some(model), Some(tokens)) = (&unit.model_used, unit.tokens_used) {
        line.push_str(&format!("  ({}, {} tokens)", model, tokens));
    }
    if let Some(err) = &unit.last_error {
        line.push_str(&format!("  error: {}", err));
    }
    line
}

pub async fn run_attempts(config: &Config, id: &str) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let attempts = runtime.store.list_attempts(id).await?;
    if attempts.is_empty() {
        println!("No model attempts recorded for {}.", id);
        return Ok(());
    }
    println!("--- Model attempts ({}) ---", attempts.len());
    for a in &attempts {
        let chunk = a
            .chunk_index
            .map(|c| format!(" chunk {}", c))
            .unwrap_or_default();
        println!(
            "{}  {:<6}{}  #{} {:<24} {:<7} {:>6}ms  {}",
            format_ts_iso(a.created_at),
            a.phase.as_str(),
            chunk,
            a.attempt_number,
            a.model_id,
            a.outcome.as_str(),
            a.duration_ms,
            a.error_code.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Validate a JSON file as the output of `stage`. Exits non-zero when invalid.
pub fn run_validate(config: &Config, path: &Path, stage: &str) -> Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let registry = StageRegistry::from_stages(&config.stages);
    let schema = registry.lookup(stage);
    let result = JsonValidator::new(config.validation.absolute_min_length).validate(&text, &schema);
    let d = &result.diagnostics;

    println!("stage:        {} ({})", stage, schema.kind.as_str());
    println!("valid:        {}", result.is_valid);
    println!("length:       {}", d.length);
    println!("parseable:    {}", d.is_parseable);
    println!("truncated:    {}", d.is_truncated);
    println!("completeness: {}%", d.estimated_completeness_pct);
    println!(
        "braces:       {{ {} / }} {}   brackets: [ {} / ] {}",
        d.open_braces, d.close_braces, d.open_brackets, d.close_brackets
    );
    if !d.missing_keys.is_empty() {
        println!("missing keys: {}", d.missing_keys.join(", "));
    }
    for error in &result.errors {
        println!("error:        {}", error);
    }
    for warning in &result.warnings {
        println!("warning:      {}", warning);
    }

    if !result.is_valid {
        println!("remediation:  {}", result.remediation());
        std::process::exit(1);
    }
    Ok(())
}

pub async fn run_monitor(config: &Config, once: bool) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let monitor = StuckMonitor::new(
        runtime.store.clone(),
        runtime.notifier.clone(),
        config.monitor.clone(),
    );

    if !once {
        println!(
            "Monitoring every {}s (stuck after {} min).",
            config.monitor.interval_secs, config.monitor.stuck_after_minutes
        );
        monitor.run().await;
        bail!("monitor loop exited unexpectedly");
    }

    let now = chrono::Utc::now().timestamp();
    let report = monitor.scan(now).await?;
    let resolved = monitor.resolve_completed(now).await?;
    println!("stuck:     {}", report.stuck);
    println!("alerted:   {}", report.alerted);
    println!("throttled: {}", report.throttled);
    println!("resolved:  {}", resolved);
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
