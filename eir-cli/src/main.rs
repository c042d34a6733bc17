//! `eir`: validate, order, run and compare event graphs, or watch them in a
//! terminal raster.
//! Viewer controls: [s] Step, [r] Run/Pause, [q] Quit

mod app;
mod backend;
mod ui;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossterm::{
    event::{self, Event as CEvent, KeyCode},
    execute, terminal,
};
use eir_core::{serialize, EirGraph, Epsilons, ExecMode, TimeUnit};
use eir_runtime::{
    compare, events_to_jsonl, load_events, run, ExecOptions, ExecPlan, Executor, StepBudgets, Trace,
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::App;
use backend::{ExecutorBackend, RasterBackend, TraceBackend};
use ui::draw;

#[derive(Parser)]
#[command(name = "eir", version, about = "Deterministic event-graph runner")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a graph, check it and build its execution plan
    Validate { graph: PathBuf },
    /// Print the topological order, one node id per line
    Order { graph: PathBuf },
    /// Execute a graph over an input event stream
    Run(RunArgs),
    /// Compare a candidate trace against a golden one (exit 0 PASS, 1 FAIL)
    Compare(CompareArgs),
    /// Rewrite an input stream with nanosecond timestamps
    Events(EventsArgs),
    /// Terminal raster over a live run or a recorded trace
    View(ViewArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Exact,
    Fixed,
}

impl From<Mode> for ExecMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Exact => ExecMode::ExactEvent,
            Mode::Fixed => ExecMode::FixedStep,
        }
    }
}

#[derive(Args)]
struct TimeOverrides {
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Fixed-step tick in microseconds
    #[arg(long)]
    dt_us: Option<u64>,
    #[arg(long)]
    seed: Option<u64>,
}

impl TimeOverrides {
    fn apply(&self, g: &mut EirGraph) {
        if let Some(m) = self.mode {
            g.time.mode = m.into();
        }
        if let Some(dt) = self.dt_us {
            g.time.dt_us = Some(dt);
        }
        if let Some(seed) = self.seed {
            g.time.seed = seed;
        }
    }
}

#[derive(Args)]
struct RunArgs {
    graph: PathBuf,
    /// Input events (JSON lines)
    #[arg(short, long)]
    input: PathBuf,
    /// Trace output; stdout when omitted
    #[arg(short, long)]
    out: Option<PathBuf>,
    #[command(flatten)]
    time: TimeOverrides,
    /// Stop after this many instants
    #[arg(long)]
    max_instants: Option<u64>,
    /// Do not start instants after this time (µs)
    #[arg(long)]
    until_us: Option<u64>,
    /// Step independent nodes of an instant in parallel
    #[arg(long)]
    parallel: bool,
}

#[derive(Args)]
struct CompareArgs {
    #[arg(long)]
    golden: PathBuf,
    #[arg(long)]
    candidate: PathBuf,
    #[arg(long, default_value_t = 100)]
    eps_time_us: u64,
    #[arg(long, default_value_t = 1e-5)]
    eps_numeric: f64,
    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct EventsArgs {
    input: PathBuf,
    /// Unit of timestamps before any header line
    #[arg(long, default_value = "ns")]
    unit: TimeUnit,
    /// Output file; stdout when omitted
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct ViewArgs {
    /// Graph to execute live (requires --input)
    graph: Option<PathBuf>,
    #[arg(short, long, requires = "graph")]
    input: Option<PathBuf>,
    /// Recorded trace to replay instead of a live run
    #[arg(long, conflicts_with = "graph")]
    trace: Option<PathBuf>,
    #[command(flatten)]
    time: TimeOverrides,
    /// Raster width in columns
    #[arg(long, default_value_t = 80)]
    width: usize,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_graph(path: &Path) -> Result<EirGraph> {
    serialize::load_path(path).with_context(|| format!("loading graph {}", path.display()))
}

fn validate(path: &Path) -> Result<ExitCode> {
    let g = load_graph(path)?;
    let plan = ExecPlan::build(&g).with_context(|| format!("validating {}", path.display()))?;
    println!(
        "ok: {} nodes, {} edges, {} probes, mode {}",
        g.len(),
        g.edges().len(),
        plan.probes().len(),
        plan.mode()
    );
    for &i in plan.eval_order() {
        println!("  {}", plan.node(i).id);
    }
    Ok(ExitCode::SUCCESS)
}

fn order(path: &Path) -> Result<ExitCode> {
    let g = load_graph(path)?;
    for id in g.topological_ids()? {
        println!("{id}");
    }
    Ok(ExitCode::SUCCESS)
}

fn write_trace(trace: &Trace, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => trace.save(path).with_context(|| format!("writing trace {}", path.display())),
        None => Ok(trace.write_jsonl(io::stdout().lock())?),
    }
}

fn run_cmd(args: &RunArgs) -> Result<ExitCode> {
    let mut g = load_graph(&args.graph)?;
    args.time.apply(&mut g);
    let plan = ExecPlan::build(&g)?;
    let events = load_events(&args.input, g.time.unit)
        .with_context(|| format!("reading events {}", args.input.display()))?;
    let opts = ExecOptions {
        limits: StepBudgets {
            max_instants: args.max_instants,
            until_ns: args.until_us.map(|us| TimeUnit::Us.to_ns(us)),
        },
        parallel: args.parallel,
        ..ExecOptions::default()
    };

    match run(&plan, events, &opts) {
        Ok(outcome) => {
            write_trace(&outcome.trace, args.out.as_deref())?;
            info!(
                status = ?outcome.status,
                records = outcome.stats.records,
                max_drift_ns = outcome.stats.drift.max_error_ns,
                "trace written"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            if args.out.is_some() {
                write_trace(&failure.partial, args.out.as_deref())?;
            }
            let at = failure.stats.instants;
            Err(anyhow::Error::new(failure.error).context(format!("run aborted after {at} instants")))
        }
    }
}

fn compare_cmd(args: &CompareArgs) -> Result<ExitCode> {
    let golden = Trace::load(&args.golden).with_context(|| format!("reading {}", args.golden.display()))?;
    let candidate =
        Trace::load(&args.candidate).with_context(|| format!("reading {}", args.candidate.display()))?;
    let report = compare(&golden, &candidate, Epsilons::new(args.eps_time_us, args.eps_numeric));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.passed() {
        println!("PASS: {} records", report.golden_count);
    } else {
        println!(
            "FAIL: {} mismatches (golden {} records, candidate {})",
            report.mismatch_count, report.golden_count, report.candidate_count
        );
        for d in &report.mismatches {
            println!("  {d}");
        }
    }
    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn events_cmd(args: &EventsArgs) -> Result<ExitCode> {
    let events =
        load_events(&args.input, args.unit).with_context(|| format!("reading events {}", args.input.display()))?;
    let text = events_to_jsonl(&events)?;
    match &args.out {
        Some(path) => std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?,
        None => print!("{text}"),
    }
    info!(events = events.len(), "events normalized");
    Ok(ExitCode::SUCCESS)
}

fn restore_terminal() -> Result<()> {
    terminal::disable_raw_mode()?;
    execute!(io::stdout(), terminal::LeaveAlternateScreen)?;
    Ok(())
}

fn view_loop<B: RasterBackend>(mut app: App<B>) -> Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, terminal::EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    terminal.clear()?;

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = restore_terminal();
        default_hook(panic_info);
    }));

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let result = (|| -> Result<()> {
        loop {
            draw(&mut terminal, &app)?;

            let timeout = tick_rate.checked_sub(last_tick.elapsed()).unwrap_or(Duration::ZERO);
            if event::poll(timeout)? {
                if let CEvent::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        KeyCode::Char('s') => app.step(),
                        KeyCode::Char('r') => app.toggle_running(),
                        _ => {}
                    }
                }
            }

            if last_tick.elapsed() >= tick_rate {
                if app.running {
                    app.step();
                }
                last_tick = Instant::now();
            }
        }
    })();

    restore_terminal()?;
    result
}

fn view_cmd(args: &ViewArgs) -> Result<ExitCode> {
    match (&args.graph, &args.input, &args.trace) {
        (_, _, Some(path)) => {
            let trace = Trace::load(path).with_context(|| format!("reading {}", path.display()))?;
            let label = path.display().to_string();
            view_loop(App::new(TraceBackend::new(trace, label), args.width))?;
        }
        (Some(graph), Some(input), None) => {
            let mut g = load_graph(graph)?;
            args.time.apply(&mut g);
            let plan = ExecPlan::build(&g)?;
            let events =
                load_events(input, g.time.unit).with_context(|| format!("reading events {}", input.display()))?;
            let mut exec = Executor::new(plan);
            exec.ingest_all(events)?;
            let label = graph.display().to_string();
            view_loop(App::new(ExecutorBackend::new(exec, label), args.width))?;
        }
        _ => bail!("view needs either --trace <file> or <graph> --input <events>"),
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if !matches!(cli.command, Command::View(_)) {
        init_tracing(cli.verbose);
    }

    let result = match &cli.command {
        Command::Validate { graph } => validate(graph),
        Command::Order { graph } => order(graph),
        Command::Run(args) => run_cmd(args),
        Command::Compare(args) => compare_cmd(args),
        Command::Events(args) => events_cmd(args),
        Command::View(args) => view_cmd(args),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
