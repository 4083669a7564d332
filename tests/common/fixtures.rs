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

//! Machine builders for common test scenarios

use snoopsim::core::cache::coherence::ProtocolKind;
use snoopsim::core::cache::CacheParams;
use snoopsim::core::cpu::isa::asm;
use snoopsim::core::cpu::mem_tester::TrafficParams;
use snoopsim::core::cpu::{CpuParams, FlatTranslator, MemTester, SimpleThread};
use snoopsim::core::sim::{ExitReason, Smp, SmpParams};

/// Where CPU programs are loaded
#[allow(dead_code)]
pub const PROGRAM_BASE: u64 = 0x1000;

/// Word the counter program increments
#[allow(dead_code)]
pub const COUNTER_ADDR: u64 = 0x1_0000;

/// Default machine with the given protocol
#[allow(dead_code)]
pub fn smp_params(protocol: ProtocolKind) -> SmpParams {
    SmpParams {
        cache: CacheParams {
            protocol,
            ..CacheParams::default()
        },
        ..SmpParams::default()
    }
}

/// Machine with 1 KiB two-way caches, so lines are evicted often
#[allow(dead_code)]
pub fn tiny_cache_params(protocol: ProtocolKind) -> SmpParams {
    let mut params = smp_params(protocol);
    params.cache.size = 1024;
    params.cache.assoc = 2;
    params
}

/// One traffic generator per tester, each on its own byte lane
/// Direct-mapped eight-line caches with a single write buffer
#[allow(dead_code)]
pub fn direct_mapped_params(protocol: ProtocolKind) -> SmpParams {
    let mut params = smp_params(protocol);
    params.cache.size = 512;
    params.cache.assoc = 1;
    params.cache.write_buffers = 1;
    params
}

#[allow(dead_code)]
pub fn lane_traffic(testers: usize, accesses: u64, lines: u64, seed: u64) -> Vec<Option<TrafficParams>> {
    (0..testers)
        .map(|lane| {
            Some(TrafficParams {
                accesses,
                lines,
                lane,
                seed: seed.wrapping_mul(31).wrapping_add(lane as u64),
                ..TrafficParams::default()
            })
        })
        .collect()
}

/// Build testers, start their traffic and run until the queue empties
#[allow(dead_code)]
pub fn run_testers(params: &SmpParams, traffic: Vec<Option<TrafficParams>>) -> Smp {
    let mut smp = Smp::with_testers(params, traffic).expect("Failed to build tester machine");
    smp.start().expect("Failed to start testers");
    let exit = smp.system.run(Some(10_000_000)).expect("Simulation failed");
    assert_eq!(exit.reason, ExitReason::EventQueueEmpty, "run did not finish: {}", exit);
    smp
}

/// Queue a hand-driven write on tester `agent`
#[allow(dead_code)]
pub fn write(smp: &mut Smp, agent: usize, addr: u64, size: usize, data: u64) {
    let id = smp.agents[agent];
    smp.system
        .with_object::<MemTester, _>(id, |t, fabric| t.write(fabric, addr, size, data))
        .expect("Failed to queue write");
}

/// Queue a hand-driven read on tester `agent`
#[allow(dead_code)]
pub fn read(smp: &mut Smp, agent: usize, addr: u64, size: usize) {
    let id = smp.agents[agent];
    smp.system
        .with_object::<MemTester, _>(id, |t, fabric| t.read(fabric, addr, size))
        .expect("Failed to queue read");
}

/// LL/SC loop adding one to [`COUNTER_ADDR`] `iterations` times
#[allow(dead_code)]
pub fn counter_program(iterations: i16) -> Vec<u8> {
    asm::assemble(&[
        asm::lui(1, (COUNTER_ADDR >> 16) as u16),
        asm::addiu(2, 0, iterations),
        asm::ll(3, 1, 0),
        asm::addiu(3, 3, 1),
        asm::sc(3, 1, 0),
        asm::beq(3, 0, -4),
        asm::addiu(2, 2, -1),
        asm::bne(2, 0, -6),
        asm::brk(),
    ])
}

/// `cpus` timing CPUs running `program` from [`PROGRAM_BASE`]
#[allow(dead_code)]
pub fn cpu_machine(params: &SmpParams, cpus: u32, program: &[u8]) -> Smp {
    let threads = (0..cpus)
        .map(|i| {
            let cpu = CpuParams {
                name: format!("cpu{}", i),
                cpu_id: i,
                ..CpuParams::default()
            };
            let thread = SimpleThread::new(PROGRAM_BASE, Box::new(FlatTranslator::identity()));
            (cpu, thread)
        })
        .collect();
    let mut smp = Smp::with_cpus(params, threads).expect("Failed to build CPU machine");
    smp.load(PROGRAM_BASE, program).expect("Failed to load program");
    smp
}
