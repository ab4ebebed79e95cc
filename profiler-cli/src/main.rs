use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use profiler_core::serialize::SerializeFormat;
use profiler_core::{ClockMode, Profiler, SortKey, SortOrder, StatsFilter};

mod demo_trace;

#[derive(Debug, Parser)]
#[command(about = "Replays a bundled event trace through the profiler engine.", long_about = None)]
struct ProfilerCli {
    /// Clock source: "wall" or "cpu".
    #[arg(short = 'c', long, default_value = "cpu")]
    clock: String,

    /// Include builtin/native calls in the collected stats.
    #[arg(short = 'b', long)]
    builtins: bool,

    /// Disable per-context (thread/fiber) tracking; everything is
    /// attributed to a single default context. Multi-context tracking is on
    /// by default.
    #[arg(short = 's', long)]
    single_context: bool,

    /// Write the collected stats to this file instead of printing a summary.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Output format when `-o` is given: pstat, callgrind, or native.
    #[arg(short = 'f', long, default_value = "pstat")]
    format: String,

    /// Name of the bundled demo trace to replay.
    #[arg(default_value = "fibonacci")]
    script: String,
}

/// Argument-validation failures exit 2 (spec §6); anything past that point
/// (I/O, a profiler-core `Result::Err`) exits 1 like any other runtime
/// failure.
const EXIT_ARGUMENT_ERROR: i32 = 2;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    set_global_subscriber();

    let cli = ProfilerCli::parse();

    let clock_mode = match ClockMode::parse(&cli.clock) {
        Some(mode) => mode,
        None => {
            eprintln!("unknown clock mode '{}' (expected wall or cpu)", cli.clock);
            std::process::exit(EXIT_ARGUMENT_ERROR);
        }
    };
    let steps = match demo_trace::by_name(&cli.script) {
        Some(steps) => steps,
        None => {
            eprintln!(
                "unknown demo trace '{}' (available: {})",
                cli.script,
                demo_trace::AVAILABLE.join(", ")
            );
            std::process::exit(EXIT_ARGUMENT_ERROR);
        }
    };
    let format = if cli.output.is_some() {
        match SerializeFormat::parse(&cli.format) {
            Ok(format) => Some(format),
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(EXIT_ARGUMENT_ERROR);
            }
        }
    } else {
        None
    };

    let profiler = Profiler::new(clock_mode);
    profiler
        .start(cli.builtins, !cli.single_context)
        .context("failed to start profiler")?;

    info!(trace = %cli.script, steps = steps.len(), "replaying demo trace");
    for step in &steps {
        profiler.on_event(step.kind, step.frame.as_ref());
    }

    profiler.stop().context("failed to stop profiler")?;
    let stats = profiler.snapshot_stats();

    match (cli.output, format) {
        (Some(path), Some(format)) => save_to_file(&stats, format, &path)?,
        (None, _) => print_summary(&profiler),
        (Some(_), None) => unreachable!("format is always resolved when an output path is given"),
    }

    Ok(())
}

fn save_to_file(
    stats: &profiler_core::StatsStore,
    format: SerializeFormat,
    path: &PathBuf,
) -> anyhow::Result<()> {
    let bytes = profiler_core::serialize::encode(stats, format)?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "stats written");
    Ok(())
}

fn print_summary(profiler: &Profiler) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let views = profiler.get_func_stats(&StatsFilter::default(), SortKey::Ttot, SortOrder::Descending);

    let _ = writeln!(
        out,
        "{:<8} {:<8} {:>8} {:>12} {:>12}  FUNCTION",
        "ncall", "nactual", "tavg", "ttot", "tsub"
    );
    let ticks_per_second = profiler_core::clock::TICKS_PER_SECOND as f64;
    for entry in &views {
        let _ = writeln!(
            out,
            "{:<8} {:<8} {:>8.6} {:>12.6} {:>12.6}  {}",
            entry.ncall,
            entry.nactualcall,
            entry.tavg / ticks_per_second,
            profiler_core::Clock::ticks_to_seconds(entry.ttot),
            profiler_core::Clock::ticks_to_seconds(entry.tsub),
            entry.full_name,
        );
    }
}

fn set_global_subscriber() {
    let default_env_filter = EnvFilter::try_new("profiler_core=info,profiler_cli=info")
        .expect("hard-coded env filter should be valid");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(default_env_filter);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_file(false)
        .with_line_number(false)
        .init();
}
