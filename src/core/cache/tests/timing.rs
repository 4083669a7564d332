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

//! Caches on a shared bus
//!
//! Each test builds a small machine of hand-driven memory testers, one L1
//! per tester, and checks what the testers observe and what state the lines
//! end up in.

use super::*;
use crate::core::cache::coherence::ProtocolKind;
use crate::core::cache::miss_queue::MissBuffer;
use crate::core::cache::tags::TagStore;
use crate::core::cpu::MemTester;
use crate::core::error::SimError;
use crate::core::mem::{CoherentBus, PacketResult, PhysicalMemory, SnoopReply};
use crate::core::sim::{ExitReason, MemoryMode, Smp, SmpParams};
use crate::core::timing::Tick;

fn machine(params: &SmpParams, testers: usize) -> Smp {
    Smp::with_testers(params, vec![None; testers]).expect("machine builds")
}

fn read(smp: &mut Smp, agent: usize, addr: Addr, size: usize) {
    let id = smp.agents[agent];
    smp.system
        .with_object::<MemTester, _>(id, |t, fabric| t.read(fabric, addr, size))
        .expect("read queued");
}

fn write(smp: &mut Smp, agent: usize, addr: Addr, size: usize, data: u64) {
    let id = smp.agents[agent];
    smp.system
        .with_object::<MemTester, _>(id, |t, fabric| t.write(fabric, addr, size, data))
        .expect("write queued");
}

fn run(smp: &mut Smp) {
    let exit = smp.system.run(None).expect("run");
    assert_eq!(exit.reason, ExitReason::EventQueueEmpty);
}

fn tester(smp: &Smp, agent: usize) -> &MemTester {
    smp.system.object::<MemTester>(smp.agents[agent]).expect("tester")
}

fn cache(smp: &Smp, index: usize) -> &BasicCache {
    smp.system.object::<BasicCache>(smp.caches[index]).expect("cache")
}

fn state(smp: &Smp, index: usize, addr: Addr) -> BlkStatus {
    cache(smp, index).tags().status(addr).state()
}

fn memory(smp: &Smp) -> &PhysicalMemory {
    smp.system.object::<PhysicalMemory>(smp.memory).expect("memory")
}

fn bus(smp: &Smp) -> &CoherentBus {
    smp.system.object::<CoherentBus>(smp.bus).expect("bus")
}

/// Put a dirty line for `addr` in cache `index`'s write buffer, leaving for
/// the bus `delay` ticks from now
fn queue_writeback(smp: &mut Smp, index: usize, addr: Addr, value: u32, delay: Tick) {
    let id = smp.caches[index];
    smp.system
        .with_object::<BasicCache, _>(id, |c, fabric| {
            let now = fabric.now();
            let req = Request::new_physical(addr, c.blk_size, RequestFlags::empty(), now);
            let mut pkt = Packet::with_range(Command::Writeback, req, addr, c.blk_size);
            let mut line = vec![0u8; c.blk_size];
            line[..4].copy_from_slice(&value.to_le_bytes());
            pkt.set_data(&line);
            c.miss_queue.do_writeback(pkt, now + delay);
            c.update_blocked(fabric)?;
            c.schedule_send(fabric, now + delay)
        })
        .expect("writeback queued");
}

#[test]
fn test_load_miss_then_hit() {
    let mut smp = machine(&SmpParams::default(), 1);
    smp.load(0x1000, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();

    read(&mut smp, 0, 0x1000, 4);
    run(&mut smp);

    let done = tester(&smp, 0).completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].cmd, Command::ReadResp);
    assert_eq!(done[0].data, 0xDEAD_BEEF);
    assert_eq!(done[0].result, PacketResult::Success);
    assert_eq!(state(&smp, 0, 0x1000), BlkStatus::EXCLUSIVE);

    let issued = smp.system.now();
    read(&mut smp, 0, 0x1004, 4);
    run(&mut smp);

    let done = tester(&smp, 0).completions();
    assert_eq!(done[1].tick, issued + cache(&smp, 0).hit_latency());
    assert_eq!(cache(&smp, 0).stats().hits[Command::ReadReq.index()], 1);
    assert_eq!(cache(&smp, 0).stats().misses[Command::ReadReq.index()], 1);
}

#[test]
fn test_back_to_back_misses_merge() {
    let mut smp = machine(&SmpParams::default(), 1);
    smp.load(0x2000, &[0x11; 16]).unwrap();

    read(&mut smp, 0, 0x2000, 4);
    read(&mut smp, 0, 0x2008, 4);
    run(&mut smp);

    let done = tester(&smp, 0).completions();
    assert_eq!(done.len(), 2);
    assert_eq!(done[0].addr, 0x2000);
    assert_eq!(done[1].addr, 0x2008);
    assert!(done.iter().all(|c| c.data == 0x1111_1111));

    assert_eq!(cache(&smp, 0).stats().mshr_hits[Command::ReadReq.index()], 1);
    assert_eq!(memory(&smp).stats().reads, 1);
}

#[test]
fn test_write_then_read_back() {
    let mut smp = machine(&SmpParams::default(), 1);
    write(&mut smp, 0, 0x3000, 4, 0x1234_5678);
    read(&mut smp, 0, 0x3000, 4);
    run(&mut smp);

    let done = tester(&smp, 0).completions();
    assert_eq!(done[0].cmd, Command::WriteResp);
    assert_eq!(done[1].data, 0x1234_5678);
    assert_eq!(state(&smp, 0, 0x3000), BlkStatus::MODIFIED);
    // Still only in the cache
    assert_eq!(memory(&smp).peek_u32(0x3000), 0);
}

#[test]
fn test_mesi_read_of_modified_line() {
    let mut smp = machine(&SmpParams::default(), 2);
    write(&mut smp, 0, 0x3000, 4, 0x1122_3344);
    run(&mut smp);
    assert_eq!(state(&smp, 0, 0x3000), BlkStatus::MODIFIED);

    read(&mut smp, 1, 0x3000, 4);
    run(&mut smp);

    assert_eq!(tester(&smp, 1).completions()[0].data, 0x1122_3344);
    assert_eq!(state(&smp, 0, 0x3000), BlkStatus::SHARED);
    assert_eq!(state(&smp, 1, 0x3000), BlkStatus::SHARED);
    // The downgrade wrote the line back
    assert_eq!(memory(&smp).peek_u32(0x3000), 0x1122_3344);
    assert!(cache(&smp, 0).stats().snoop_supplies >= 1);
}

#[test]
fn test_moesi_keeps_dirty_owner() {
    let mut params = SmpParams::default();
    params.cache.protocol = ProtocolKind::Moesi;
    let mut smp = machine(&params, 2);

    write(&mut smp, 0, 0x3000, 4, 0x1122_3344);
    run(&mut smp);
    read(&mut smp, 1, 0x3000, 4);
    run(&mut smp);

    assert_eq!(tester(&smp, 1).completions()[0].data, 0x1122_3344);
    assert_eq!(state(&smp, 0, 0x3000), BlkStatus::OWNED);
    assert_eq!(state(&smp, 1, 0x3000), BlkStatus::SHARED);
    assert_eq!(memory(&smp).peek_u32(0x3000), 0);
}

#[test]
fn test_upgrade_invalidates_sharer() {
    let mut smp = machine(&SmpParams::default(), 2);
    read(&mut smp, 0, 0x4000, 4);
    run(&mut smp);
    read(&mut smp, 1, 0x4000, 4);
    run(&mut smp);
    assert_eq!(state(&smp, 0, 0x4000), BlkStatus::SHARED);
    assert_eq!(state(&smp, 1, 0x4000), BlkStatus::SHARED);

    write(&mut smp, 1, 0x4000, 4, 0x55);
    run(&mut smp);
    assert_eq!(state(&smp, 0, 0x4000), BlkStatus::INVALID);
    assert_eq!(state(&smp, 1, 0x4000), BlkStatus::MODIFIED);

    read(&mut smp, 0, 0x4000, 4);
    run(&mut smp);
    assert_eq!(tester(&smp, 0).completions()[1].data, 0x55);
}

#[test]
fn test_functional_read_sees_dirty_line() {
    let mut smp = machine(&SmpParams::default(), 2);
    write(&mut smp, 0, 0x5000, 1, 0xAB);
    run(&mut smp);

    let peer = smp.agents[1];
    let value = smp
        .system
        .with_object::<MemTester, _>(peer, |t, fabric| t.functional_read(fabric, 0x5000, 1))
        .unwrap();
    assert_eq!(value, 0xAB);

    // Functional writes update the cached copy as well
    let owner = smp.agents[0];
    smp.system
        .with_object::<MemTester, _>(owner, |t, fabric| t.functional_write(fabric, 0x5000, 1, 0xCD))
        .unwrap();
    read(&mut smp, 0, 0x5000, 1);
    run(&mut smp);
    assert_eq!(tester(&smp, 0).completions()[1].data, 0xCD);
}

#[test]
fn test_dirty_victim_is_written_back() {
    let mut params = SmpParams::default();
    // Direct mapped, two lines: 0x000 and 0x080 collide
    params.cache.size = 128;
    params.cache.assoc = 1;
    let mut smp = machine(&params, 1);

    write(&mut smp, 0, 0x000, 4, 0xFEED);
    run(&mut smp);
    read(&mut smp, 0, 0x080, 4);
    run(&mut smp);

    assert_eq!(state(&smp, 0, 0x000), BlkStatus::INVALID);
    assert_eq!(memory(&smp).peek_u32(0x000), 0xFEED);
    assert_eq!(cache(&smp, 0).stats().replacements, 1);

    read(&mut smp, 0, 0x000, 4);
    run(&mut smp);
    assert_eq!(tester(&smp, 0).completions()[2].data, 0xFEED);
}

#[test]
fn test_bad_address_reaches_requester() {
    let mut params = SmpParams::default();
    params.mem_size = 0x1000;
    let mut smp = machine(&params, 1);

    read(&mut smp, 0, 0x8000, 4);
    run(&mut smp);

    let done = tester(&smp, 0).completions();
    assert_eq!(done[0].result, PacketResult::BadAddress);
    assert_eq!(state(&smp, 0, 0x8000), BlkStatus::INVALID);
    assert_eq!(memory(&smp).stats().bad_addresses, 1);
}

#[test]
fn test_blocked_cache_retries_requester() {
    let mut params = SmpParams::default();
    params.cache.mshrs = 1;
    let mut smp = machine(&params, 1);

    for i in 0..4 {
        read(&mut smp, 0, 0x1000 + i * 0x40, 4);
    }
    assert!(cache(&smp, 0).is_blocked());
    run(&mut smp);

    let t = tester(&smp, 0);
    assert_eq!(t.completions().len(), 4);
    assert!(t.stats().retries >= 1);
    assert!(cache(&smp, 0).stats().retries_sent >= 1);
    assert!(!cache(&smp, 0).is_blocked());
}

#[test]
fn test_miss_limit_ends_run() {
    let mut params = SmpParams::default();
    params.cache.max_miss_count = Some(1);
    let mut smp = machine(&params, 1);

    read(&mut smp, 0, 0x1000, 4);
    let exit = smp.system.run(None).unwrap();
    assert_eq!(
        exit.reason,
        ExitReason::MaxMissCount {
            cache: "l1d0".to_string()
        }
    );
}

#[test]
fn test_atomic_mode_latency() {
    let params = SmpParams {
        memory_mode: MemoryMode::Atomic,
        ..SmpParams::default()
    };
    let mut smp = machine(&params, 2);
    let (a, b) = (smp.agents[0], smp.agents[1]);

    let miss = smp
        .system
        .with_object::<MemTester, _>(a, |t, fabric| t.atomic_write(fabric, 0x7000, 4, 5))
        .unwrap();
    let hit = smp
        .system
        .with_object::<MemTester, _>(a, |t, fabric| t.atomic_write(fabric, 0x7000, 4, 6))
        .unwrap();
    assert_eq!(hit, 1);
    assert!(miss > hit);

    let (value, _) = smp
        .system
        .with_object::<MemTester, _>(b, |t, fabric| t.atomic_read(fabric, 0x7000, 4))
        .unwrap();
    assert_eq!(value, 6);
    assert_eq!(state(&smp, 1, 0x7000), BlkStatus::SHARED);
}

#[test]
fn test_drain_waits_for_outstanding_misses() {
    let mut smp = machine(&SmpParams::default(), 2);
    read(&mut smp, 0, 0x1000, 4);
    write(&mut smp, 1, 0x2000, 4, 3);

    smp.system.drain().unwrap();
    assert_eq!(tester(&smp, 0).completions().len(), 1);
    assert_eq!(tester(&smp, 1).completions().len(), 1);
    assert_eq!(cache(&smp, 0).miss_queue().outstanding(), 0);
    smp.system.resume().unwrap();
}

#[test]
fn test_full_line_write_allocates_without_fetch() {
    let mut params = SmpParams::default();
    params.cache.protocol = ProtocolKind::None;
    let mut smp = machine(&params, 1);

    write(&mut smp, 0, 0x1000, 64, 0x1122_3344);
    run(&mut smp);

    assert_eq!(tester(&smp, 0).completions().len(), 1);
    assert_eq!(cache(&smp, 0).stats().fast_writes, 1);
    assert_eq!(state(&smp, 0, 0x1000), BlkStatus::MODIFIED);
    assert_eq!(memory(&smp).stats().reads, 0);
}

#[test]
fn test_full_line_write_over_outstanding_miss_is_a_violation() {
    let mut params = SmpParams::default();
    params.cache.protocol = ProtocolKind::None;
    let mut smp = machine(&params, 1);

    read(&mut smp, 0, 0x1000, 4);
    let id = smp.agents[0];
    let err = smp
        .system
        .with_object::<MemTester, _>(id, |t, fabric| t.write(fabric, 0x1000, 64, 0))
        .unwrap_err();
    assert!(matches!(err, SimError::ProtocolViolation { .. }));
    assert_eq!(cache(&smp, 0).stats().fast_writes, 0);
}

#[test]
fn test_upgrade_survives_eviction_of_its_line() {
    let mut params = SmpParams::default();
    params.cache.protocol = ProtocolKind::Msi;
    // Direct mapped, two lines: 0x000 and 0x080 collide
    params.cache.size = 128;
    params.cache.assoc = 1;
    let mut smp = machine(&params, 1);

    read(&mut smp, 0, 0x000, 4);
    run(&mut smp);
    assert_eq!(state(&smp, 0, 0x000), BlkStatus::SHARED);

    // The fill for 0x080 lands first and evicts the line being upgraded
    read(&mut smp, 0, 0x080, 4);
    write(&mut smp, 0, 0x000, 4, 0xC0FFEE);
    run(&mut smp);

    let done = tester(&smp, 0).completions();
    assert_eq!(done.len(), 3);
    assert!(done.iter().all(|c| c.result == PacketResult::Success));
    assert_eq!(cache(&smp, 0).stats().upgrade_refetches, 1);
    assert_eq!(state(&smp, 0, 0x000), BlkStatus::MODIFIED);

    read(&mut smp, 0, 0x000, 4);
    run(&mut smp);
    assert_eq!(tester(&smp, 0).completions()[3].data, 0xC0FFEE);
}

#[test]
fn test_read_nacked_while_exclusive_request_in_service() {
    let mut params = SmpParams::default();
    params.cache.protocol = ProtocolKind::Msi;
    let mut smp = machine(&params, 2);

    // Upgrade in service
    read(&mut smp, 0, 0x4000, 4);
    run(&mut smp);
    assert_eq!(state(&smp, 0, 0x4000), BlkStatus::SHARED);
    write(&mut smp, 0, 0x4000, 4, 0x99);
    read(&mut smp, 1, 0x4000, 4);
    run(&mut smp);

    let nacked = cache(&smp, 0).stats().snoops_nacked;
    assert!(nacked >= 1);
    assert!(bus(&smp).stats().nacks >= 1);
    assert_eq!(tester(&smp, 1).completions()[0].data, 0x99);
    assert_eq!(state(&smp, 0, 0x4000), BlkStatus::SHARED);
    assert_eq!(state(&smp, 1, 0x4000), BlkStatus::SHARED);

    // Read-exclusive in service
    write(&mut smp, 0, 0x4100, 4, 0x77);
    read(&mut smp, 1, 0x4100, 4);
    run(&mut smp);

    assert!(cache(&smp, 0).stats().snoops_nacked > nacked);
    assert_eq!(tester(&smp, 1).completions()[1].data, 0x77);
    assert_eq!(memory(&smp).peek_u32(0x4100), 0x77);
}

#[test]
fn test_read_behind_fill_in_service_appends_invalidate() {
    let mut smp = machine(&SmpParams::default(), 2);
    smp.load(0x6000, &0x0BAD_F00Du32.to_le_bytes()).unwrap();

    read(&mut smp, 0, 0x6000, 4);
    read(&mut smp, 1, 0x6000, 4);
    run(&mut smp);

    assert_eq!(cache(&smp, 0).stats().snoop_invalidates_appended, 1);
    assert_eq!(cache(&smp, 0).stats().snoops_nacked, 0);
    assert_eq!(tester(&smp, 0).completions()[0].data, 0x0BAD_F00D);
    assert_eq!(tester(&smp, 1).completions()[0].data, 0x0BAD_F00D);
    // The first fill served its read and then applied the invalidate
    assert_eq!(state(&smp, 0, 0x6000), BlkStatus::INVALID);
    // The second saw the line shared and did not take it exclusive
    assert_eq!(state(&smp, 1, 0x6000), BlkStatus::SHARED);
    assert_eq!(memory(&smp).stats().reads, 2);
}

#[test]
fn test_pending_writeback_supplies_read() {
    let mut smp = machine(&SmpParams::default(), 2);
    queue_writeback(&mut smp, 0, 0x8000, 0x5EED, 10);

    read(&mut smp, 1, 0x8000, 4);
    run(&mut smp);

    assert_eq!(tester(&smp, 1).completions()[0].data, 0x5EED);
    assert_eq!(cache(&smp, 0).stats().snoop_supplies, 1);
    assert_eq!(state(&smp, 1, 0x8000), BlkStatus::SHARED);
    // The writeback still went out afterwards
    assert_eq!(memory(&smp).peek_u32(0x8000), 0x5EED);
    assert_eq!(cache(&smp, 0).miss_queue().outstanding(), 0);
}

#[test]
fn test_invalidating_snoop_takes_pending_writeback() {
    let mut smp = machine(&SmpParams::default(), 2);
    queue_writeback(&mut smp, 0, 0x8000, 0x5EED, 10);

    write(&mut smp, 1, 0x8004, 4, 0x77);
    run(&mut smp);

    assert_eq!(cache(&smp, 0).stats().snoop_supplies, 1);
    assert_eq!(cache(&smp, 0).miss_queue().outstanding(), 0);
    assert_eq!(state(&smp, 0, 0x8000), BlkStatus::INVALID);
    assert_eq!(state(&smp, 1, 0x8000), BlkStatus::MODIFIED);
    // Ownership moved; memory never saw the dirty data
    assert_eq!(memory(&smp).peek_u32(0x8000), 0);

    read(&mut smp, 1, 0x8000, 4);
    run(&mut smp);
    assert_eq!(tester(&smp, 1).completions()[1].data, 0x5EED);
}

#[test]
fn test_dropped_writeback_unblocks_requester() {
    let mut params = SmpParams::default();
    params.cache.write_buffers = 1;
    let mut smp = machine(&params, 2);
    queue_writeback(&mut smp, 0, 0x8000, 0x5EED, 50);
    assert!(cache(&smp, 0).is_blocked());

    read(&mut smp, 0, 0x9000, 4);
    assert!(tester(&smp, 0).completions().is_empty());
    write(&mut smp, 1, 0x8000, 4, 0x77);
    run(&mut smp);

    assert_eq!(tester(&smp, 0).completions().len(), 1);
    assert!(cache(&smp, 0).stats().retries_sent >= 1);
    assert!(!cache(&smp, 0).is_blocked());
    assert_eq!(memory(&smp).peek_u32(0x8000), 0);
}

#[test]
fn test_functional_read_sees_pending_writeback() {
    let mut smp = machine(&SmpParams::default(), 1);
    queue_writeback(&mut smp, 0, 0x8000, 0x5EED, 10);

    let id = smp.agents[0];
    let value = smp
        .system
        .with_object::<MemTester, _>(id, |t, fabric| t.functional_read(fabric, 0x8000, 4))
        .unwrap();
    assert_eq!(value, 0x5EED);
    assert_eq!(memory(&smp).peek_u32(0x8000), 0);

    run(&mut smp);
    assert_eq!(memory(&smp).peek_u32(0x8000), 0x5EED);
}

#[test]
fn test_uncacheable_snoop_leaves_line_alone() {
    let mut smp = machine(&SmpParams::default(), 1);
    write(&mut smp, 0, 0x3000, 4, 0x1234);
    run(&mut smp);
    assert_eq!(state(&smp, 0, 0x3000), BlkStatus::MODIFIED);

    let id = smp.caches[0];
    let reply = smp
        .system
        .with_object::<BasicCache, _>(id, |c, fabric| {
            let req = Request::new_physical(0x3000, 4, RequestFlags::UNCACHEABLE, fabric.now());
            let mut pkt = Packet::new(Command::ReadReq, req);
            pkt.allocate();
            c.snoop(fabric, &mut pkt)
        })
        .unwrap();

    assert_eq!(reply, SnoopReply::Ignored);
    assert_eq!(state(&smp, 0, 0x3000), BlkStatus::MODIFIED);
    assert_eq!(cache(&smp, 0).stats().snoop_supplies, 0);
    assert_eq!(cache(&smp, 0).stats().writebacks, 0);
}
