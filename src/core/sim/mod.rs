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

//! Simulation infrastructure
//!
//! - [`fabric`]: objects, links and the event queue
//! - [`system`]: the container a driver builds and runs
//! - [`registry`]: explicit list of live systems
//! - [`topology`]: builders for common shared-bus machines
//! - [`stats`]: statistics sinks

pub mod fabric;
pub mod registry;
pub mod stats;
pub mod system;
pub mod topology;

#[cfg(test)]
mod tests;

pub use fabric::{ExitReason, Fabric, MemoryMode, ObjectEvent, SimObject};
pub use registry::SystemRegistry;
pub use stats::{StatsCollector, StatsSink};
pub use system::{ExitEvent, System};
pub use topology::{Smp, SmpParams};
