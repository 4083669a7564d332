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

//! Simulator configuration
//!
//! A [`SimConfig`] is read from TOML. Every section and field has a default,
//! so an empty file describes a working two-tester MESI machine.
//!
//! ```toml
//! [system]
//! memory_mode = "timing"
//!
//! [cpu]
//! kind = "tester"
//! count = 4
//!
//! [cache]
//! protocol = "moesi"
//!
//! [l1]
//! size = 8192
//! assoc = 2
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::cache::coherence::ProtocolKind;
use crate::core::cache::CacheParams;
use crate::core::cpu::mem_tester::TrafficParams;
use crate::core::error::{Result, SimError};
use crate::core::mem::{Addr, BusParams};
use crate::core::sim::fabric::MemoryMode;
use crate::core::sim::topology::SmpParams;
use crate::core::timing::Tick;

/// Machine-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub memory_mode: MemoryMode,
    /// Stop after this tick
    pub max_ticks: Option<Tick>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "system".to_string(),
            memory_mode: MemoryMode::Timing,
            max_ticks: None,
        }
    }
}

/// What drives the caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Random lane traffic from memory testers
    #[default]
    Tester,
    /// Timing CPUs running a small lock-and-increment program
    Timing,
}

/// Requester settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub kind: AgentKind,
    pub count: usize,
    /// Ticks per CPU cycle
    pub clock: Tick,
    pub max_insts: Option<u64>,
    /// Accesses per tester, or loop iterations per CPU
    pub accesses: u64,
    pub seed: u64,
    pub percent_writes: u32,
    pub max_outstanding: usize,
    /// Shared lines the testers spread their traffic over
    pub shared_lines: u64,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            kind: AgentKind::Tester,
            count: 2,
            clock: 1,
            max_insts: None,
            accesses: 1000,
            seed: 1,
            percent_writes: 40,
            max_outstanding: 4,
            shared_lines: 64,
        }
    }
}

/// Settings shared by every cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `none`, `msi`, `mesi`, `mosi` or `moesi`
    pub protocol: String,
    pub propagate_invalidates: bool,
    pub max_miss_count: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            protocol: "mesi".to_string(),
            propagate_invalidates: true,
            max_miss_count: None,
        }
    }
}

/// L1 geometry and resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    pub size: usize,
    pub assoc: usize,
    pub blk_size: usize,
    pub hit_latency: Tick,
    pub mshrs: usize,
    pub targets_per_mshr: usize,
    pub write_buffers: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        let params = CacheParams::default();
        Self {
            size: params.size,
            assoc: params.assoc,
            blk_size: params.blk_size,
            hit_latency: params.hit_latency,
            mshrs: params.mshrs,
            targets_per_mshr: params.targets_per_mshr,
            write_buffers: params.write_buffers,
        }
    }
}

/// Backing memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub base: Addr,
    pub size: u64,
    pub latency: Tick,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base: 0,
            size: 64 << 20,
            latency: 30,
        }
    }
}

/// Complete simulator configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub system: SystemConfig,
    pub cpu: CpuConfig,
    pub cache: CacheConfig,
    pub l1: L1Config,
    pub bus: BusParams,
    pub memory: MemoryConfig,
}

impl SimConfig {
    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SimConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SimError::Config(e.to_string()))
    }

    pub fn protocol(&self) -> Result<ProtocolKind> {
        self.cache.protocol.parse()
    }

    /// Check the combinations serde cannot
    pub fn validate(&self) -> Result<()> {
        let l1 = &self.l1;
        if !l1.blk_size.is_power_of_two() {
            return Err(SimError::Config(format!(
                "l1.blk_size must be a power of two, got {}",
                l1.blk_size
            )));
        }
        if l1.assoc == 0 || l1.size == 0 || l1.size % (l1.assoc * l1.blk_size) != 0 {
            return Err(SimError::Config(format!(
                "l1.size {} is not a multiple of assoc {} x blk_size {}",
                l1.size, l1.assoc, l1.blk_size
            )));
        }
        if l1.mshrs == 0 {
            return Err(SimError::Config("l1.mshrs must be at least 1".to_string()));
        }
        if l1.targets_per_mshr == 0 || l1.write_buffers == 0 {
            return Err(SimError::Config(
                "l1.targets_per_mshr and l1.write_buffers must be at least 1".to_string(),
            ));
        }
        let protocol = self.protocol()?;
        if protocol == ProtocolKind::None && self.cpu.count > 1 {
            return Err(SimError::Config(format!(
                "protocol 'none' supports one agent, {} configured",
                self.cpu.count
            )));
        }
        if self.cpu.count == 0 {
            return Err(SimError::Config("cpu.count must be at least 1".to_string()));
        }
        if self.cpu.kind == AgentKind::Timing && !self.system.memory_mode.is_timing_mode() {
            return Err(SimError::Config(
                "timing CPUs need system.memory_mode = \"timing\"".to_string(),
            ));
        }
        if self.cpu.kind == AgentKind::Tester && self.cpu.count > l1.blk_size {
            return Err(SimError::Config(format!(
                "{} testers cannot share {}-byte lines one byte lane each",
                self.cpu.count, l1.blk_size
            )));
        }
        if self.bus.width == 0 || self.bus.clock == 0 {
            return Err(SimError::Config("bus.width and bus.clock must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Cache template for the machine builders
    pub fn cache_params(&self) -> Result<CacheParams> {
        Ok(CacheParams {
            name: "l1".to_string(),
            size: self.l1.size,
            assoc: self.l1.assoc,
            blk_size: self.l1.blk_size,
            hit_latency: self.l1.hit_latency,
            mshrs: self.l1.mshrs,
            targets_per_mshr: self.l1.targets_per_mshr,
            write_buffers: self.l1.write_buffers,
            protocol: self.protocol()?,
            propagate_invalidates: self.cache.propagate_invalidates,
            max_miss_count: self.cache.max_miss_count,
        })
    }

    pub fn smp_params(&self) -> Result<SmpParams> {
        Ok(SmpParams {
            name: self.system.name.clone(),
            memory_mode: self.system.memory_mode,
            cache: self.cache_params()?,
            bus: self.bus,
            mem_base: self.memory.base,
            mem_size: self.memory.size,
            mem_latency: self.memory.latency,
        })
    }

    /// Random traffic for tester `index`
    pub fn traffic(&self, index: usize) -> TrafficParams {
        TrafficParams {
            accesses: self.cpu.accesses,
            seed: self.cpu.seed.wrapping_add(index as u64 * 0x9E37_79B9),
            base: self.memory.base,
            lines: self.cpu.shared_lines,
            blk_size: self.l1.blk_size,
            lane: index,
            percent_writes: self.cpu.percent_writes,
            max_outstanding: self.cpu.max_outstanding,
            interval: self.cpu.clock,
        }
    }
}
