use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::process::{Command, Stdio};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "x")]
#[command(about = "Development automation for snoopsim")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format check, clippy, every test suite and a bench build
    Ci {
        #[arg(long)]
        verbose: bool,
    },
    /// Run tests, optionally a single suite
    Test {
        /// Suite to run (all when omitted)
        #[arg(value_enum)]
        suite: Option<Suite>,
        /// Include ignored tests
        #[arg(long)]
        ignored: bool,
    },
    /// Run the simulator
    Sim {
        /// Configuration file
        #[arg(default_value = "configs/smp.toml")]
        config: String,
        /// Number of agents
        #[arg(short = 'n', long)]
        cpus: Option<usize>,
        /// Accesses per tester, or loop iterations per CPU
        #[arg(short = 'a', long)]
        accesses: Option<u64>,
        /// Run timing CPUs instead of memory testers
        #[arg(long)]
        timing: bool,
        /// Write statistics as JSON to this file
        #[arg(long)]
        stats_json: Option<String>,
        #[arg(long)]
        release: bool,
    },
    /// Run the memory testers over a range of seeds
    Stress {
        #[arg(default_value = "configs/smp.toml")]
        config: String,
        /// Number of seeds to run
        #[arg(long, default_value = "8")]
        runs: u64,
        /// First seed
        #[arg(long, default_value = "1")]
        seed: u64,
        /// Number of testers
        #[arg(short = 'n', long, default_value = "4")]
        cpus: usize,
    },
}

/// Test suites by the part of the simulator they cover
#[derive(Clone, Copy, ValueEnum)]
enum Suite {
    /// Tag store, miss queue, protocols and cache timing
    Cache,
    /// Packets, ports, bus and physical memory
    Mem,
    /// Timing CPU, decoder and memory tester
    Cpu,
    /// Event queue, fabric and system
    Sim,
    /// Multi-agent coherence under random traffic
    Coherence,
    /// Load/store ordering and LL/SC on timing CPUs
    Ordering,
    /// Configuration loading
    Config,
}

impl Suite {
    /// Arguments selecting the suite for `cargo test`
    fn cargo_args(self) -> &'static [&'static str] {
        match self {
            Suite::Cache => &["--lib", "core::cache::"],
            Suite::Mem => &["--lib", "core::mem::"],
            Suite::Cpu => &["--lib", "core::cpu::"],
            Suite::Sim => &["--lib", "core::sim::"],
            Suite::Coherence => &["--test", "coherence_test"],
            Suite::Ordering => &["--test", "ordering_test"],
            Suite::Config => &["--test", "config_test"],
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ci { verbose } => run_ci(verbose),
        Commands::Test { suite, ignored } => run_test(suite, ignored),
        Commands::Sim {
            config,
            cpus,
            accesses,
            timing,
            stats_json,
            release,
        } => {
            let mut args = vec![config];
            if let Some(cpus) = cpus {
                args.extend(["--cpus".to_string(), cpus.to_string()]);
            }
            if let Some(accesses) = accesses {
                args.extend(["--accesses".to_string(), accesses.to_string()]);
            }
            if timing {
                args.push("--timing".to_string());
            }
            if let Some(path) = stats_json {
                args.extend(["--stats-json".to_string(), path]);
            }
            run_sim(&args, release)
        }
        Commands::Stress {
            config,
            runs,
            seed,
            cpus,
        } => run_stress(&config, seed, runs, cpus),
    }
}

fn cargo(subcommand: &str) -> Command {
    let mut cmd = Command::new("cargo");
    cmd.arg(subcommand);
    cmd
}

fn run_ci(verbose: bool) -> Result<()> {
    println!("{}", "=== snoopsim CI ===".bold().blue());

    let start = Instant::now();

    run_task(
        "Format Check",
        || execute_command(cargo("fmt").args(["--all", "--", "--check"])),
        verbose,
    )?;
    run_task(
        "Clippy",
        || {
            execute_command(cargo("clippy").args([
                "--workspace",
                "--all-targets",
                "--",
                "-D",
                "warnings",
            ]))
        },
        verbose,
    )?;
    run_task("Tests", || run_test(None, false), verbose)?;
    run_task(
        "Bench Build",
        || execute_command(cargo("bench").arg("--no-run")),
        verbose,
    )?;

    println!(
        "\n{} {}",
        "✓ CI passed in".green().bold(),
        format!("{:.2}s", start.elapsed().as_secs_f64()).bold()
    );
    Ok(())
}

fn run_test(suite: Option<Suite>, ignored: bool) -> Result<()> {
    let mut cmd = cargo("test");
    match suite {
        Some(suite) => {
            cmd.args(suite.cargo_args());
        }
        None => {
            cmd.arg("--workspace");
        }
    }
    if ignored {
        cmd.arg("--").arg("--include-ignored");
    }
    execute_command(&mut cmd)
}

fn run_sim(args: &[String], release: bool) -> Result<()> {
    println!("{}", "=== snoopsim ===".bold().blue());
    println!("{} Arguments: {}", "→".blue(), args.join(" ").cyan());

    let start = Instant::now();

    let mut cmd = cargo("run");
    cmd.args(["--bin", "snoopsim"]);
    if release {
        cmd.arg("--release");
    }
    cmd.arg("--").args(args);

    if let Err(e) = execute_command(&mut cmd) {
        println!("\n{} Simulation failed", "✗".red().bold());
        return Err(e);
    }

    println!(
        "\n{} Simulation completed in {}",
        "✓".green().bold(),
        format!("{:.2}s", start.elapsed().as_secs_f64()).bold()
    );
    Ok(())
}

/// One release-mode tester run per seed; any data error fails the run
fn run_stress(config: &str, first_seed: u64, runs: u64, cpus: usize) -> Result<()> {
    println!(
        "{} {} seeds from {} on {} testers",
        "=== Stress ===".bold().blue(),
        runs,
        first_seed,
        cpus
    );

    let start = Instant::now();
    execute_command(cargo("build").args(["--release", "--bin", "snoopsim"]))?;

    let cpus = cpus.to_string();
    for seed in first_seed..first_seed + runs {
        let seed = seed.to_string();
        run_task(
            &format!("seed {}", seed),
            || {
                execute_quiet(cargo("run").args([
                    "--release",
                    "--quiet",
                    "--bin",
                    "snoopsim",
                    "--",
                    config,
                    "--cpus",
                    cpus.as_str(),
                    "--seed",
                    seed.as_str(),
                ]))
            },
            true,
        )?;
    }

    println!(
        "\n{} {} runs in {}",
        "✓ Stress passed:".green().bold(),
        runs,
        format!("{:.2}s", start.elapsed().as_secs_f64()).bold()
    );
    Ok(())
}

fn run_task<F>(name: &str, task: F, verbose: bool) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    print!("{} {} ... ", "→".blue(), name);

    let start = Instant::now();
    match task() {
        Ok(()) => {
            let timing = if verbose {
                format!("({:.2}s)", start.elapsed().as_secs_f64())
            } else {
                String::new()
            };
            println!("{} {}", "✓".green().bold(), timing);
            Ok(())
        }
        Err(e) => {
            println!("{}", "✗".red().bold());
            Err(e)
        }
    }
}

fn execute_command(cmd: &mut Command) -> Result<()> {
    let status = cmd
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()?;
    if !status.success() {
        anyhow::bail!("{:?} failed: {}", cmd.get_program(), status);
    }
    Ok(())
}

/// Run a simulation with captured output, replaying it only on failure
///
/// The simulator exits cleanly after stale reads and only logs them, so the
/// log is checked as well.
fn execute_quiet(cmd: &mut Command) -> Result<()> {
    let output = cmd.output()?;
    let log = String::from_utf8_lossy(&output.stderr);
    let stale = log.contains("data errors detected");
    if !output.status.success() || stale {
        println!();
        print!("{}", String::from_utf8_lossy(&output.stdout));
        eprint!("{}", log);
        if stale {
            anyhow::bail!("testers read stale data");
        }
        anyhow::bail!("simulation failed: {}", output.status);
    }
    Ok(())
}
