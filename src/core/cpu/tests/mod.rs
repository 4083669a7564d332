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

//! CPU test modules
//!
//! - `isa`: decoding, disassembly and execution against a recording context
//! - `thread`: register file, translation and load-locked reservations
//! - `timing_cpu`: small programs run on CPUs behind caches
//! - `mem_tester`: hand-driven and random testers

use super::isa::{asm, RegIndex};
use super::*;
use crate::core::sim::{ExitEvent, Smp, SmpParams};


/// Where test programs are loaded and start
pub(super) const PROGRAM_BASE: Addr = 0x1000;

/// A scratch data region well away from the program
pub(super) const DATA_BASE: Addr = 0x2_0000;

pub(super) fn thread_at(entry: Addr) -> SimpleThread {
    SimpleThread::new(entry, Box::new(FlatTranslator::identity()))
}

pub(super) fn cpu_params(i: u32) -> CpuParams {
    CpuParams {
        name: format!("cpu{}", i),
        cpu_id: i,
        ..CpuParams::default()
    }
}

/// `cpus` CPUs that all run `program` from [`PROGRAM_BASE`]
pub(super) fn cpu_machine(cpus: u32, program: &[u32]) -> Smp {
    let threads = (0..cpus)
        .map(|i| (cpu_params(i), thread_at(PROGRAM_BASE)))
        .collect();
    let mut smp = Smp::with_cpus(&SmpParams::default(), threads).expect("machine builds");
    smp.load(PROGRAM_BASE, &asm::assemble(program)).expect("program loads");
    smp
}

pub(super) fn start_and_run(smp: &mut Smp) -> ExitEvent {
    smp.start().expect("start");
    smp.system.run(None).expect("run")
}

pub(super) fn cpu(smp: &Smp, i: usize) -> &TimingCpu {
    smp.system.object::<TimingCpu>(smp.agents[i]).expect("cpu")
}

pub(super) fn reg(smp: &Smp, i: usize, r: RegIndex) -> u32 {
    cpu(smp, i).thread().expect("thread").reg(r)
}

pub(super) fn debug_read(smp: &mut Smp, i: usize, addr: Addr, size: usize) -> u64 {
    let id = smp.agents[i];
    smp.system
        .with_object::<TimingCpu, _>(id, |cpu, fabric| cpu.debug_read(fabric, addr, size))
        .expect("debug read")
}

/// Atomically add one to the word at [`DATA_BASE`] `iterations` times
/// with a load-locked / store-conditional loop
pub(super) fn counter_program(iterations: i16) -> Vec<u32> {
    vec![
        asm::lui(1, (DATA_BASE >> 16) as u16),
        asm::addiu(2, 0, iterations),
        asm::ll(3, 1, 0),
        asm::addiu(3, 3, 1),
        asm::sc(3, 1, 0),
        asm::beq(3, 0, -4),
        asm::addiu(2, 2, -1),
        asm::bne(2, 0, -6),
        asm::brk(),
    ]
}

/// Instructions [`counter_program`] commits when no store-conditional fails
pub(super) fn counter_insts(iterations: u64) -> u64 {
    3 + 6 * iterations
}
