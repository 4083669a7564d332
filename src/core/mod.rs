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

//! Simulator core
//!
//! This module contains every simulated component and the machinery that
//! connects them:
//! - CPU timing pipeline and memory tester
//! - Snooping caches (tags, miss tracking, coherence)
//! - Packets, links, bus and backing memory
//! - Event queue, fabric and system container
//! - Configuration

pub mod cache;
pub mod config;
pub mod cpu;
pub mod error;
pub mod mem;
pub mod sim;
pub mod timing;

// Re-export commonly used types
pub use cache::{BasicCache, CacheParams};
pub use config::SimConfig;
pub use cpu::{MemTester, TimingCpu};
pub use error::{Fault, Result, SimError};
pub use mem::{CoherentBus, Packet, PhysicalMemory, Request};
pub use sim::{ExitEvent, ExitReason, Fabric, MemoryMode, System, SystemRegistry};
