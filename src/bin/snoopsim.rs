// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};
use snoopsim::core::config::{AgentKind, SimConfig};
use snoopsim::core::cpu::isa::asm;
use snoopsim::core::cpu::{CpuParams, FlatTranslator, SimpleThread, TimingCpu};
use snoopsim::core::error::Result;
use snoopsim::core::sim::{Smp, StatsCollector, SystemRegistry};

/// Where the CPU program is loaded
const PROGRAM_BASE: u64 = 0x1000;
/// Shared counter the CPUs increment
const COUNTER_ADDR: u64 = 0x10000;

/// Snooping cache coherence simulator
#[derive(Parser)]
#[command(name = "snoopsim")]
#[command(about = "Cycle-level CPU/cache/memory simulator with snooping coherence", long_about = None)]
struct Args {
    /// TOML configuration file (built-in defaults if omitted)
    config: Option<PathBuf>,

    /// Number of agents (memory testers or timing CPUs)
    #[arg(short = 'n', long)]
    cpus: Option<usize>,

    /// Accesses per tester, or loop iterations per CPU
    #[arg(short = 'a', long)]
    accesses: Option<u64>,

    /// Run timing CPUs instead of memory testers
    #[arg(long)]
    timing: bool,

    /// Stop after this tick
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Random seed for tester traffic
    #[arg(long)]
    seed: Option<u64>,

    /// Write statistics as JSON to this file
    #[arg(long)]
    stats_json: Option<PathBuf>,

    /// Debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Per-packet trace logging
    #[arg(long)]
    trace: bool,
}

/// Each iteration increments the shared counter with LL/SC
fn counter_program(iterations: u64) -> Vec<u8> {
    let iterations = iterations.clamp(1, i16::MAX as u64) as i16;
    asm::assemble(&[
        asm::lui(1, (COUNTER_ADDR >> 16) as u16),
        asm::ori(1, 1, COUNTER_ADDR as u16),
        asm::addiu(2, 0, iterations),
        // loop:
        asm::ll(3, 1, 0),
        asm::addiu(3, 3, 1),
        asm::sc(3, 1, 0),
        asm::beq(3, 0, -4),
        asm::addiu(2, 2, -1),
        asm::bne(2, 0, -6),
        asm::brk(),
    ])
}

fn build(config: &SimConfig) -> Result<Smp> {
    let params = config.smp_params()?;
    match config.cpu.kind {
        AgentKind::Tester => {
            let traffic = (0..config.cpu.count)
                .map(|i| Some(config.traffic(i)))
                .collect();
            Smp::with_testers(&params, traffic)
        }
        AgentKind::Timing => {
            let threads = (0..config.cpu.count)
                .map(|i| {
                    let cpu = CpuParams {
                        name: format!("cpu{}", i),
                        cpu_id: i as u32,
                        clock: config.cpu.clock,
                        max_insts: config.cpu.max_insts,
                    };
                    let thread = SimpleThread::new(PROGRAM_BASE, Box::new(FlatTranslator::identity()));
                    (cpu, thread)
                })
                .collect();
            let mut smp = Smp::with_cpus(&params, threads)?;
            smp.load(PROGRAM_BASE, &counter_program(config.cpu.accesses))?;
            Ok(smp)
        }
    }
}

fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let level = if args.trace {
        log::LevelFilter::Trace
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    info!("snoopsim v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => SimConfig::from_file(path).inspect_err(|e| error!("Bad configuration: {}", e))?,
        None => SimConfig::default(),
    };
    if let Some(cpus) = args.cpus {
        config.cpu.count = cpus;
    }
    if let Some(accesses) = args.accesses {
        config.cpu.accesses = accesses;
    }
    if let Some(seed) = args.seed {
        config.cpu.seed = seed;
    }
    if args.timing {
        config.cpu.kind = AgentKind::Timing;
    }
    if args.max_ticks.is_some() {
        config.system.max_ticks = args.max_ticks;
    }
    config.validate().inspect_err(|e| error!("Bad configuration: {}", e))?;

    info!(
        "{} {:?} agents, protocol {}, {} byte lines",
        config.cpu.count, config.cpu.kind, config.cache.protocol, config.l1.blk_size
    );

    let mut registry = SystemRegistry::new();
    let mut smp = build(&config)?;
    smp.start()?;

    let exit = match smp.system.run(config.system.max_ticks) {
        Ok(exit) => exit,
        Err(e) => {
            error!("Simulation failed @ tick {}: {}", smp.system.now(), e);
            return Err(e);
        }
    };
    info!("{}", exit);

    if config.cpu.kind == AgentKind::Timing {
        let cpu = smp.agents[0];
        let counter = smp
            .system
            .with_object::<TimingCpu, _>(cpu, |cpu, fabric| cpu.debug_read(fabric, COUNTER_ADDR, 4))?;
        let expected = config.cpu.count as u64 * config.cpu.accesses.clamp(1, i16::MAX as u64);
        if counter == expected {
            info!("Shared counter = {} (expected {})", counter, expected);
        } else {
            warn!("Shared counter = {} (expected {})", counter, expected);
        }
    }

    let mut stats = StatsCollector::new();
    smp.system.dump_stats(&mut stats);
    let data_errors = stats.sum_suffix(".data_errors");
    if data_errors > 0 {
        warn!("{} data errors detected", data_errors);
    }
    info!(
        "Hits: {}  Misses: {}  Writebacks: {}",
        stats.sum_suffix(".hits"),
        stats.sum_suffix(".misses"),
        stats.sum_suffix(".writebacks")
    );

    if let Some(path) = &args.stats_json {
        std::fs::write(path, stats.to_json()?)?;
        info!("Statistics written to {}", path.display());
    }

    registry.register(smp.system)?;
    registry.print_systems();
    Ok(())
}
