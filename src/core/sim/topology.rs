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

//! Shared-bus machine builders
//!
//! ```text
//!   agent0 ─ l1d0 ─┐
//!   agent1 ─ l1d1 ─┼─ bus ─ memory
//!   ...            │
//!   agentN ─ l1dN ─┘
//! ```
//!
//! Agents are either [`MemTester`]s (one cache each) or [`TimingCpu`]s (an
//! instruction and a data cache each). Every cache snoops the same bus.

use super::fabric::MemoryMode;
use super::system::System;
use crate::core::cache::{BasicCache, CacheParams, CPU_SIDE, MEM_SIDE};
use crate::core::cpu::mem_tester::{self, TrafficParams};
use crate::core::cpu::{CpuParams, MemTester, MicroDecoder, SimpleThread, TimingCpu, DCACHE_PORT, ICACHE_PORT};
use crate::core::error::{Result, SimError};
use crate::core::mem::bus::{agent_port, MEM_PORT};
use crate::core::mem::physical::{self, PhysicalMemory};
use crate::core::mem::port::ObjectId;
use crate::core::mem::{Addr, BusParams, CoherentBus};
use crate::core::timing::Tick;

/// Machine-wide parameters
#[derive(Debug, Clone)]
pub struct SmpParams {
    pub name: String,
    pub memory_mode: MemoryMode,
    /// Template for every L1; the name is replaced per cache
    pub cache: CacheParams,
    pub bus: BusParams,
    pub mem_base: Addr,
    pub mem_size: u64,
    pub mem_latency: Tick,
}

impl Default for SmpParams {
    fn default() -> Self {
        Self {
            name: "system".to_string(),
            memory_mode: MemoryMode::Timing,
            cache: CacheParams::default(),
            bus: BusParams::default(),
            mem_base: 0,
            mem_size: 64 << 20,
            mem_latency: 30,
        }
    }
}

/// A built machine and the ids of its parts
#[derive(Debug)]
pub struct Smp {
    pub system: System,
    pub bus: ObjectId,
    pub memory: ObjectId,
    /// Requesters, in creation order
    pub agents: Vec<ObjectId>,
    /// Caches, in bus port order
    pub caches: Vec<ObjectId>,
}

impl Smp {
    fn skeleton(params: &SmpParams) -> Self {
        let mut system = System::new(&params.name, params.memory_mode, params.cache.blk_size);
        let memory = system.add_object(Box::new(PhysicalMemory::new(
            "memory",
            params.mem_base,
            params.mem_size,
            params.mem_latency,
        )));
        let bus = system.add_object(Box::new(CoherentBus::new("bus", params.bus)));
        Self {
            system,
            bus,
            memory,
            agents: Vec::new(),
            caches: Vec::new(),
        }
    }

    fn add_cache(&mut self, params: &SmpParams, name: String) -> Result<ObjectId> {
        let cache = BasicCache::from_params(&CacheParams {
            name,
            ..params.cache.clone()
        })?;
        let id = self.system.add_object(Box::new(cache));
        let port = agent_port(self.caches.len());
        self.system.connect(id, MEM_SIDE, self.bus, &port)?;
        self.caches.push(id);
        Ok(id)
    }

    /// One memory tester per entry of `traffic`, each behind its own cache
    ///
    /// `None` entries build testers that are driven by hand.
    pub fn with_testers(params: &SmpParams, traffic: Vec<Option<TrafficParams>>) -> Result<Self> {
        let mut smp = Self::skeleton(params);
        smp.system
            .connect(smp.bus, MEM_PORT, smp.memory, physical::PORT)?;

        for (i, traffic) in traffic.into_iter().enumerate() {
            let name = format!("tester{}", i);
            let mut tester = match traffic {
                Some(traffic) => MemTester::with_traffic(&name, traffic),
                None => MemTester::new(&name),
            };
            tester.set_master_id(smp.system.get_master_id(&name));
            let tester = smp.system.add_object(Box::new(tester));
            let cache = smp.add_cache(params, format!("l1d{}", i))?;
            smp.system.connect(tester, mem_tester::PORT, cache, CPU_SIDE)?;
            smp.agents.push(tester);
        }

        smp.system.init()?;
        Ok(smp)
    }

    /// One timing CPU per thread, each with an instruction and a data cache
    pub fn with_cpus(params: &SmpParams, threads: Vec<(CpuParams, SimpleThread)>) -> Result<Self> {
        if !params.memory_mode.is_timing_mode() {
            return Err(SimError::Config(format!(
                "{}: timing CPUs need timing mode",
                params.name
            )));
        }
        let mut smp = Self::skeleton(params);
        smp.system
            .connect(smp.bus, MEM_PORT, smp.memory, physical::PORT)?;

        for (i, (cpu_params, thread)) in threads.into_iter().enumerate() {
            let cpu = smp
                .system
                .add_cpu(TimingCpu::new(cpu_params, Some(thread), Box::new(MicroDecoder)))?;
            let icache = smp.add_cache(params, format!("l1i{}", i))?;
            let dcache = smp.add_cache(params, format!("l1d{}", i))?;
            smp.system.connect(cpu, ICACHE_PORT, icache, CPU_SIDE)?;
            smp.system.connect(cpu, DCACHE_PORT, dcache, CPU_SIDE)?;
            smp.agents.push(cpu);
        }

        smp.system.init()?;
        Ok(smp)
    }

    /// Copy `bytes` into backing memory before the run
    pub fn load(&mut self, addr: Addr, bytes: &[u8]) -> Result<()> {
        let name = self.system.name().to_string();
        self.system
            .object_mut::<PhysicalMemory>(self.memory)
            .ok_or_else(|| SimError::Config(format!("{}: memory is busy", name)))?
            .load(addr, bytes)
    }

    /// Start every agent: testers begin their traffic, CPUs their threads
    pub fn start(&mut self) -> Result<()> {
        for &agent in &self.agents {
            if self.system.object::<TimingCpu>(agent).is_some() {
                self.system.activate_cpu(agent, 0)?;
            } else {
                self.system
                    .with_object::<MemTester, _>(agent, |tester, fabric| tester.start(fabric, 0))?;
            }
        }
        Ok(())
    }
}
