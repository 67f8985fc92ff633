//! Definition validator and effect simulator
//!
//! `check` lints definition TOML files. `simulate` applies one effect to a
//! throwaway entity and steps a manual clock, printing what the handler sees.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use boons_core::clock::{ManualClock, secs_between};
use boons_core::config::{load_definitions, load_file};
use boons_core::{
    ApplyOptions, CheckOptions, Clock, Context, EffectEngine, EffectHooks, EntityId, HookCtx,
    HookResult, ManualScheduler, MemoryStore, Services,
};
use boons_types::formatting::format_signed;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Validate and simulate effect definitions")]
struct Cli {
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lint a definition file, or every .toml file in a directory
    Check { path: PathBuf },

    /// Apply one effect and step time forward
    Simulate {
        /// Definition file or directory
        #[arg(short, long)]
        definitions: PathBuf,
        /// Effect key to apply
        #[arg(short, long)]
        effect: String,
        #[arg(long, default_value_t = 0)]
        stacks: i32,
        /// Total simulated seconds
        #[arg(long, default_value_t = 30.0)]
        seconds: f64,
        /// Seconds between reports
        #[arg(long, default_value_t = 5.0)]
        step: f64,
        /// Stat to check at each report
        #[arg(long)]
        stat: Option<String>,
        /// Base value for the stat check
        #[arg(long, default_value_t = 0.0)]
        base: f64,
    },
}

fn init_logging(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    if let Some(path) = log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .init();
                return Some(guard);
            }
            Err(e) => eprintln!("Cannot open log file {}: {e}", path.display()),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
    None
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file.as_deref());

    let result = match cli.command {
        Commands::Check { path } => check(&path),
        Commands::Simulate {
            definitions,
            effect,
            stacks,
            seconds,
            step,
            stat,
            base,
        } => simulate(&definitions, &effect, stacks, seconds, step, stat.as_deref(), base),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// check
// ─────────────────────────────────────────────────────────────────────────────

fn toml_files(path: &Path) -> Result<Vec<PathBuf>, String> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let entries = std::fs::read_dir(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();
    Ok(files)
}

/// Returns false when any file fails to parse or any spec has problems
fn check(path: &Path) -> Result<bool, String> {
    let files = toml_files(path)?;
    if files.is_empty() {
        println!("No definition files in {}", path.display());
        return Ok(true);
    }

    let mut seen = std::collections::HashMap::new();
    let mut issues = 0usize;
    let mut total = 0usize;

    for file in &files {
        let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let config = match load_file(file) {
            Ok(config) => config,
            Err(e) => {
                println!("✗ {name}: {e}");
                issues += 1;
                continue;
            }
        };
        println!("{name}: {} effect(s)", config.effects.len());

        for spec in &config.effects {
            total += 1;
            if let Some(previous) = seen.insert(spec.key.clone(), name.clone()) {
                println!("  ! {}: also defined in {previous}", spec.key);
            }
            let problems = spec.problems();
            if problems.is_empty() {
                let modifiers: Vec<String> = spec
                    .modifiers
                    .iter()
                    .map(|m| format!("{} {} {}", m.stat, m.operation.label(), format_signed(m.value)))
                    .collect();
                println!(
                    "  ✓ {} ({}, max_stacks {}){}",
                    spec.key,
                    describe_duration(spec.duration.into()),
                    spec.max_stacks,
                    if modifiers.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", modifiers.join(", "))
                    }
                );
            } else {
                issues += problems.len();
                for problem in problems {
                    println!("  ✗ {}: {problem}", spec.key);
                }
            }
        }
    }

    println!();
    println!("{total} definition(s), {issues} issue(s)");
    Ok(issues == 0)
}

fn describe_duration(secs: f64) -> String {
    if secs < 0.0 {
        "permanent".to_string()
    } else if secs == 0.0 {
        "instant".to_string()
    } else {
        format!("{secs}s")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// simulate
// ─────────────────────────────────────────────────────────────────────────────

/// Prints every hook as it fires
struct Narrator {
    clock: Arc<ManualClock>,
    start: chrono::DateTime<chrono::Utc>,
}

impl Narrator {
    fn say(&self, what: &str, hook: &HookCtx<'_>) -> HookResult {
        let at = secs_between(self.start, self.clock.now());
        println!("  [{at:>7.2}s] {what} {} (stacks {})", hook.record.record_key, hook.stacks());
        Ok(())
    }
}

impl EffectHooks for Narrator {
    fn on_apply(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.say("apply", hook)
    }

    fn on_remove(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.say("remove", hook)
    }

    fn on_expire(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.say("expire", hook)
    }

    fn on_tick(&self, is_first: bool, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.say(if is_first { "tick (first)" } else { "tick" }, hook)
    }
}

fn simulate(
    definitions: &Path,
    effect: &str,
    stacks: i32,
    seconds: f64,
    step: f64,
    stat: Option<&str>,
    base: f64,
) -> Result<bool, String> {
    if step <= 0.0 {
        return Err("--step must be positive".to_string());
    }

    let mut registry = if definitions.is_file() {
        let config = load_file(definitions).map_err(|e| e.to_string())?;
        let mut registry = boons_core::EffectRegistry::new();
        let duplicates = registry.add_definitions(config.effects, true);
        if !duplicates.is_empty() {
            tracing::warn!(?duplicates, "Duplicate effect definition keys");
        }
        registry
    } else {
        load_definitions(Some(definitions), None).map_err(|e| e.to_string())?
    };

    let clock = Arc::new(ManualClock::new());
    let narrator = Arc::new(Narrator {
        clock: clock.clone(),
        start: clock.now(),
    });
    let keys: Vec<String> = registry.keys().map(str::to_string).collect();
    for key in keys {
        registry.attach_hooks(&key, narrator.clone());
    }
    if !registry.contains(effect) {
        return Err(format!("unknown effect '{effect}'"));
    }

    let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
    let services = Services::new(Arc::new(registry), Arc::new(MemoryStore::new()), scheduler.clone(), clock.clone());
    let mut engine = EffectEngine::new(services);
    let owner = EntityId::new("#sim");
    let mut ctx = Context::new();

    let record_key = engine
        .handler(&owner)
        .apply(effect, ApplyOptions::new().with_stacks(stacks), &mut ctx)
        .map_err(|e| e.to_string())?;
    println!("Applied {effect} as {record_key}");

    let mut elapsed = 0.0;
    loop {
        report(&mut engine, &owner, elapsed, stat, base, &mut ctx)?;
        if elapsed >= seconds {
            break;
        }
        let delta = step.min(seconds - elapsed);
        engine
            .advance_manual(&clock, &scheduler, delta, &mut ctx)
            .map_err(|e| e.to_string())?;
        elapsed += delta;
    }
    Ok(true)
}

fn report(
    engine: &mut EffectEngine,
    owner: &EntityId,
    elapsed: f64,
    stat: Option<&str>,
    base: f64,
    ctx: &mut Context,
) -> Result<(), String> {
    let handler = engine.handler(owner);
    let lines = handler.view_detailed(ctx).map_err(|e| e.to_string())?;
    println!("t={elapsed:.2}s");
    if lines.is_empty() {
        println!("  (no visible effects)");
    }
    for line in lines {
        println!("  {line}");
    }
    if let Some(stat) = stat {
        let value = handler
            .check(base, stat, CheckOptions::quiet(), ctx)
            .map_err(|e| e.to_string())?;
        println!("  {stat}: {base} -> {value}");
    }
    Ok(())
}
