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

//! Custom assertions for simulator testing

use snoopsim::core::cpu::{MemTester, TimingCpu};
use snoopsim::core::sim::{Smp, StatsCollector};

/// Every tester finished its traffic and saw only the values it wrote
#[allow(dead_code)]
pub fn assert_testers_clean(smp: &Smp) {
    for &id in &smp.agents {
        let tester = smp.system.object::<MemTester>(id).expect("agent is not a tester");
        let stats = tester.stats();
        assert!(tester.traffic_done(), "tester {} has traffic left: {:?}", id, stats);
        assert_eq!(stats.data_errors, 0, "tester {} saw stale data: {:?}", id, stats);
        assert_eq!(
            stats.completed,
            stats.reads_issued + stats.writes_issued,
            "tester {} lost responses",
            id
        );
    }
}

/// Read memory through agent `agent` the way a debugger would
#[allow(dead_code)]
pub fn assert_word(smp: &mut Smp, agent: usize, addr: u64, size: usize, expected: u64) {
    let id = smp.agents[agent];
    let actual = if smp.system.object::<TimingCpu>(id).is_some() {
        smp.system
            .with_object::<TimingCpu, _>(id, |cpu, fabric| cpu.debug_read(fabric, addr, size))
    } else {
        smp.system
            .with_object::<MemTester, _>(id, |t, fabric| t.functional_read(fabric, addr, size))
    }
    .expect("Failed functional read");
    assert_eq!(
        actual, expected,
        "Memory at 0x{:08X} mismatch: expected 0x{:X}, got 0x{:X}",
        addr, expected, actual
    );
}

/// Collect every statistic of the machine
#[allow(dead_code)]
pub fn stats(smp: &Smp) -> StatsCollector {
    let mut stats = StatsCollector::new();
    smp.system.dump_stats(&mut stats);
    stats
}
