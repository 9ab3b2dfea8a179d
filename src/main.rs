//! hexpat - run a pattern file against binary data
//!
//! Usage:
//!   hexpat <pattern> <data>                     Evaluate and print the pattern tree
//!   hexpat <pattern> <data> --in limit=0x10     Set an `in` variable
//!   hexpat <pattern> <data> --breakpoint 12     Print the scopes when line 12 is reached
//!   hexpat <pattern> <data> --export-section 1=out.bin

mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Settings;
use pattern_lang::{
    EnvVar, Event, ExtensionRegistry, LogLevel, MemoryProvider, Orchestrator, PatternId,
    ProviderId, RunStatus, Runtime, SectionId, Value,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hexpat")]
#[command(about = "Evaluate a pattern language file against binary data", long_about = None)]
struct Cli {
    /// Pattern source file
    pattern: PathBuf,

    /// Data file to evaluate against
    data: PathBuf,

    /// Preprocessor define, NAME or NAME=VALUE
    #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
    defines: Vec<String>,

    /// Environment variable readable through std::env, name=value
    #[arg(long = "env", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    env: Vec<(String, String)>,

    /// Value of an `in` variable, name=value
    #[arg(long = "in", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    in_vars: Vec<(String, String)>,

    /// Additional include directory
    #[arg(short = 'I', long = "include", value_name = "DIR")]
    includes: Vec<PathBuf>,

    /// Write a section's bytes to a file after the run, ID=PATH
    #[arg(long = "export-section", value_name = "ID=PATH", value_parser = parse_assignment)]
    exports: Vec<(String, String)>,

    /// Suspend at this line, print the scopes and continue
    #[arg(short, long = "breakpoint", value_name = "LINE")]
    breakpoints: Vec<u32>,

    /// Settings file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

/// Command-line values: booleans, integers (decimal or 0x hex), floats,
/// anything else as a string
fn parse_value(s: &str) -> Value {
    let t = s.trim();
    match t {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        if let Ok(v) = u128::from_str_radix(hex, 16) {
            return Value::Unsigned(v);
        }
    }
    if let Ok(v) = t.parse::<u128>() {
        return Value::Unsigned(v);
    }
    if let Ok(v) = t.parse::<i128>() {
        return Value::Signed(v);
    }
    if let Ok(v) = t.parse::<f64>() {
        return Value::Float(v);
    }
    Value::String(s.to_string())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let (settings, load_error) = match loaded {
        Ok(settings) => (settings, None),
        Err(e) => (Settings::default(), Some(e)),
    };

    // Log to stderr; stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log.filter)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
    if let Some(e) = load_error {
        tracing::warn!("using default settings: {:#}", e);
    }

    let source = fs::read_to_string(&cli.pattern)
        .with_context(|| format!("Failed to read pattern: {}", cli.pattern.display()))?;
    let data = fs::read(&cli.data)
        .with_context(|| format!("Failed to read data: {}", cli.data.display()))?;

    let mut config = settings.orchestrator.clone();
    let mut include_paths = cli.includes.clone();
    if let Some(dir) = cli.pattern.parent() {
        include_paths.push(dir.to_path_buf());
    }
    include_paths.append(&mut config.runtime.include_paths);
    config.runtime.include_paths = include_paths;

    let mut shared = ExtensionRegistry::with_std();
    shared.freeze();
    let orch = Orchestrator::new(config, Arc::new(shared)).context("Failed to start the orchestrator")?;
    let events = orch.subscribe();
    let id = orch.attach(Arc::new(MemoryProvider::new(data)));

    orch.with_runtime_mut(id, |rt| {
        for define in &cli.defines {
            match define.split_once('=') {
                Some((name, value)) => rt.add_define(name.trim(), Some(value)),
                None => rt.add_define(define.trim(), None),
            }
        }
        rt.set_log_callback(Some(Arc::new(|level: LogLevel, text: &str| {
            eprintln!("[{}] {}", level, text);
        })));
    })?;
    for line in &cli.breakpoints {
        orch.add_breakpoint(id, *line)?;
    }

    let env: Vec<EnvVar> = cli
        .env
        .iter()
        .map(|(name, value)| EnvVar::new(name.clone(), parse_value(value)))
        .collect();
    let in_vars: BTreeMap<String, Value> = cli
        .in_vars
        .iter()
        .map(|(name, value)| (name.clone(), parse_value(value)))
        .collect();

    orch.execute(id, &source, env, in_vars)?;
    let status = wait_for_run(&orch, id, &events)?;
    orch.wait_idle(id)?;

    let exports = cli
        .exports
        .iter()
        .map(|(section, path)| {
            let section = match parse_value(section) {
                Value::Unsigned(v) => SectionId(v as u64),
                _ => bail!("Invalid section id: {}", section),
            };
            Ok((section, PathBuf::from(path)))
        })
        .collect::<Result<Vec<_>>>()?;

    orch.with_runtime(id, |rt| -> Result<()> {
        print_report(rt);
        for (section, path) in &exports {
            rt.sections()
                .export(*section, path)
                .with_context(|| format!("Failed to export section {} to {}", section, path.display()))?;
            println!("exported section {} to {}", section, path.display());
        }
        Ok(())
    })??;

    Ok(if status == RunStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Follow the run's events, printing the debugger view at every breakpoint
fn wait_for_run(
    orch: &Orchestrator,
    id: ProviderId,
    events: &std::sync::mpsc::Receiver<Event>,
) -> Result<RunStatus> {
    loop {
        let event = events.recv().context("Event channel closed")?;
        match event {
            Event::BreakpointHit { provider, line } if provider == id => {
                println!("-- suspended at line {}", line);
                for (depth, scope) in orch.scopes(id)?.iter().enumerate() {
                    let this = scope.this.as_deref().unwrap_or("-");
                    println!("   #{} {} (this: {})", depth, scope.kind, this);
                    for (name, value) in &scope.locals {
                        println!("      {} = {}", name, value);
                    }
                }
                orch.resume(id)?;
            }
            Event::EvaluationFinished {
                provider,
                status,
                elapsed,
            } if provider == id => {
                tracing::info!(?status, elapsed_ms = elapsed.as_millis() as u64, "evaluation finished");
                return Ok(status);
            }
            _ => {}
        }
    }
}

fn print_report(rt: &Runtime) {
    for error in rt.compile_errors() {
        eprintln!("{}", error);
    }
    if let Some(error) = rt.eval_error() {
        eprintln!("{}", error);
    }

    let tree = rt.tree();
    for root in tree.roots() {
        print_pattern(rt, *root, 0);
    }

    for (name, value) in rt.out_variables() {
        println!("out {} = {}", name, value);
    }
    if let Some(result) = rt.main_result() {
        println!("main() = {}", result);
    }
    for section in rt.sections().iter() {
        println!("section {} '{}' ({} bytes)", section.id, section.name, section.data.len());
    }
}

fn print_pattern(rt: &Runtime, id: PatternId, depth: usize) {
    let Some(p) = rt.pattern(id) else {
        return;
    };
    println!(
        "{:indent$}{} : {} @ 0x{:X} [0x{:X}] = {}",
        "",
        p.label(),
        p.type_name,
        p.offset,
        p.size,
        p.value,
        indent = depth * 2
    );
    for child in &p.children {
        print_pattern(rt, *child, depth + 1);
    }
}
