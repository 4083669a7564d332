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

use super::*;
use crate::core::cpu::mem_tester::{self, MemTester};
use crate::core::mem::bus::{agent_port, BusParams, CoherentBus, MEM_PORT};
use crate::core::mem::physical::{self, PhysicalMemory};
use crate::core::mem::PacketResult;
use crate::core::sim::{ExitReason, MemoryMode, System};

struct Rig {
    system: System,
    bus: usize,
    memory: usize,
}

impl Rig {
    fn new(mode: MemoryMode) -> Self {
        let mut system = System::new("bus_test", mode, 64);
        let memory = system.add_object(Box::new(PhysicalMemory::new("memory", 0, 1 << 20, 30)));
        let bus = system.add_object(Box::new(CoherentBus::new("bus", BusParams::default())));
        system.connect(bus, MEM_PORT, memory, physical::PORT).unwrap();
        Self { system, bus, memory }
    }

    fn tester(&mut self, slot: usize) -> usize {
        let id = self
            .system
            .add_object(Box::new(MemTester::new(&format!("tester{}", slot))));
        self.system
            .connect(id, mem_tester::PORT, self.bus, &agent_port(slot))
            .unwrap();
        id
    }

    fn stub(&mut self, slot: usize, stub: Stub) -> usize {
        let id = self.system.add_object(Box::new(stub));
        self.system.connect(id, "port", self.bus, &agent_port(slot)).unwrap();
        id
    }

    fn read(&mut self, tester: usize, addr: Addr) {
        self.system
            .with_object::<MemTester, _>(tester, |t, fabric| t.read(fabric, addr, 4))
            .unwrap();
    }

    fn run(&mut self) {
        let exit = self.system.run(None).unwrap();
        assert_eq!(exit.reason, ExitReason::EventQueueEmpty);
    }

    fn bus(&self) -> &CoherentBus {
        self.system.object::<CoherentBus>(self.bus).unwrap()
    }

    fn memory(&self) -> &PhysicalMemory {
        self.system.object::<PhysicalMemory>(self.memory).unwrap()
    }

    fn memory_mut(&mut self) -> &mut PhysicalMemory {
        self.system.object_mut::<PhysicalMemory>(self.memory).unwrap()
    }

    fn tester_ref(&self, id: usize) -> &MemTester {
        self.system.object::<MemTester>(id).unwrap()
    }
}

#[test]
fn test_request_reaches_memory() {
    let mut rig = Rig::new(MemoryMode::Timing);
    let t = rig.tester(0);
    rig.system.init().unwrap();
    rig.memory_mut().load(0x100, &0xCAFE_F00Du32.to_le_bytes()).unwrap();

    rig.read(t, 0x100);
    rig.run();

    let done = rig.tester_ref(t).completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].data, 0xCAFE_F00D);
    assert_eq!(done[0].tick, 30);
    assert_eq!(rig.bus().stats().requests, 1);
    assert_eq!(rig.bus().stats().responses, 1);
}

#[test]
fn test_busy_bus_refuses_then_retries() {
    let mut rig = Rig::new(MemoryMode::Timing);
    let t0 = rig.tester(0);
    let t1 = rig.tester(1);
    rig.system.init().unwrap();

    rig.read(t0, 0x100);
    rig.read(t1, 0x200);
    assert_eq!(rig.bus().stats().busy_refusals, 1);
    assert_eq!(rig.tester_ref(t1).stats().retries, 1);
    rig.run();

    assert_eq!(rig.tester_ref(t0).completions()[0].tick, 30);
    // Granted when the header cycle ended
    assert_eq!(rig.tester_ref(t1).completions()[0].tick, 31);
    assert_eq!(rig.bus().stats().retries, 1);
}

#[test]
fn test_snooper_supplies_data() {
    let mut rig = Rig::new(MemoryMode::Timing);
    let t = rig.tester(0);
    let owner = rig.stub(
        1,
        Stub {
            snoop: SnoopMode::Supply {
                value: 0x77,
                delay: 5,
            },
            ..Stub::new("owner")
        },
    );
    rig.system.init().unwrap();

    rig.read(t, 0x100);
    rig.run();

    let done = rig.tester_ref(t).completions();
    assert_eq!(done[0].data, 0x77);
    assert_eq!(done[0].tick, 5);
    assert_eq!(rig.memory().stats().reads, 0);
    assert_eq!(rig.bus().stats().supplies, 1);
    assert_eq!(
        rig.system.object::<Stub>(owner).unwrap().snooped,
        vec![Command::ReadReq]
    );
}

#[test]
fn test_nacked_request_is_retried() {
    let mut rig = Rig::new(MemoryMode::Timing);
    let t = rig.tester(0);
    let peer = rig.stub(
        1,
        Stub {
            snoop: SnoopMode::NackOnce,
            ..Stub::new("peer")
        },
    );
    rig.system.init().unwrap();

    rig.read(t, 0x100);
    assert_eq!(rig.bus().stats().nacks, 1);
    rig.run();

    let done = rig.tester_ref(t).completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].result, PacketResult::Success);
    assert_eq!(rig.tester_ref(t).stats().retries, 1);
    assert_eq!(rig.system.object::<Stub>(peer).unwrap().snooped.len(), 2);
}

#[test]
fn test_refused_response_waits_for_retry() {
    let mut rig = Rig::new(MemoryMode::Timing);
    let agent = rig.stub(0, Stub::refusing("agent"));
    rig.system.init().unwrap();

    let port = rig.system.object::<Stub>(agent).unwrap().port.unwrap();
    let delivery = rig.system.fabric_mut().send_timing(port, read_pkt(0x100, 4)).unwrap();
    assert!(delivery.is_accepted());
    rig.run();

    let stub = rig.system.object::<Stub>(agent).unwrap();
    assert_eq!(stub.offers, 1);
    assert!(stub.received.is_empty());

    rig.system.object_mut::<Stub>(agent).unwrap().accept = true;
    rig.system.fabric_mut().send_retry(port).unwrap();
    rig.run();

    let stub = rig.system.object::<Stub>(agent).unwrap();
    assert_eq!(stub.received.len(), 1);
    assert_eq!(stub.received[0].cmd(), Command::ReadResp);
    assert_eq!(stub.received[0].dest, Some(0));
}

#[test]
fn test_atomic_adds_header_cycle() {
    let mut rig = Rig::new(MemoryMode::Atomic);
    let t = rig.tester(0);
    rig.system.init().unwrap();
    rig.memory_mut().load(0x100, &[5, 0, 0, 0]).unwrap();

    let (value, latency) = rig
        .system
        .with_object::<MemTester, _>(t, |t, fabric| t.atomic_read(fabric, 0x100, 4))
        .unwrap();
    assert_eq!(value, 5);
    assert_eq!(latency, 31);
}

#[test]
fn test_functional_write_reaches_memory() {
    let mut rig = Rig::new(MemoryMode::Timing);
    let t = rig.tester(0);
    rig.stub(1, Stub::new("peer"));
    rig.system.init().unwrap();

    rig.system
        .with_object::<MemTester, _>(t, |t, fabric| t.functional_write(fabric, 0x300, 4, 0x1234))
        .unwrap();
    assert_eq!(rig.memory().peek_u32(0x300), 0x1234);
    assert_eq!(rig.system.now(), 0);
}

#[test]
fn test_unknown_bus_port() {
    let mut rig = Rig::new(MemoryMode::Timing);
    let id = rig.system.add_object(Box::new(Stub::new("odd")));
    let err = rig.system.connect(id, "port", rig.bus, "side").unwrap_err();
    assert!(matches!(err, crate::core::error::SimError::UnknownPort { .. }));
}
