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

//! Simulation infrastructure tests
//!
//! - `system`: init, run limits, exits and requester ids
//! - `registry`: the list of live systems
//! - `topology`: shared-bus machine builders

use super::*;
use crate::core::cpu::mem_tester::TrafficParams;
use crate::core::cpu::MemTester;
use crate::core::error::SimError;


/// `n` testers issuing `accesses` random accesses each over 16 lines
pub(super) fn traffic(n: usize, accesses: u64) -> Vec<Option<TrafficParams>> {
    (0..n)
        .map(|lane| {
            Some(TrafficParams {
                accesses,
                seed: 7 + lane as u64,
                lines: 16,
                lane,
                ..TrafficParams::default()
            })
        })
        .collect()
}

pub(super) fn tester(smp: &Smp, agent: usize) -> &MemTester {
    smp.system.object::<MemTester>(smp.agents[agent]).expect("tester")
}
