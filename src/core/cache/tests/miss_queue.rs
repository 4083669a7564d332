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

//! Miss queue tests

use super::*;
use crate::core::cache::coherence::{CoherenceProtocol, ProtocolKind};
use crate::core::cache::miss_queue::{BlockedCause, MissBuffer, MissOutcome, MissQueue};
use crate::core::cache::tags::{LruTags, TagStore};
use crate::core::error::SimError;
use crate::core::mem::{PacketFlags, PacketResult};
use crate::core::timing::Tick;

fn queue(mshrs: usize, targets: usize, write_buffers: usize) -> MissQueue {
    MissQueue::new("l1", mshrs, targets, write_buffers)
}

fn mesi() -> Box<dyn CoherenceProtocol> {
    ProtocolKind::Mesi.build(true)
}

fn miss(q: &mut MissQueue, pkt: Packet, ready: Tick) -> MissOutcome {
    q.handle_miss(pkt, 64, ready, &mesi(), BlkStatus::INVALID)
        .expect("miss accepted")
}

fn writeback(addr: Addr) -> Packet {
    let mut pkt = Packet::with_range(Command::Writeback, request(addr, 64), addr, 64);
    pkt.set_data(&[0x5A; 64]);
    pkt
}

/// Take the entry's packet and put it in service, as a send would
fn send(q: &mut MissQueue, id: crate::core::cache::mshr::MshrId) -> Packet {
    let pkt = q.get_packet(id).expect("packet to send");
    q.mark_in_service(id).expect("in service");
    pkt
}

#[test]
fn test_first_miss_allocates_line_fill() {
    let mut q = queue(4, 8, 4);
    let out = miss(&mut q, read_pkt(0x1008, 4), 1);
    assert!(!out.merged);
    assert!(out.blocked.is_empty());

    assert_eq!(q.next_ready(0), None);
    assert_eq!(q.next_ready(1), Some(out.id));
    assert_eq!(q.next_ready_time(), Some(1));

    let pkt = q.get_packet(out.id).unwrap();
    assert_eq!(pkt.cmd(), Command::ReadReq);
    assert_eq!(pkt.addr(), 0x1000);
    assert_eq!(pkt.size(), 64);
    assert!(pkt.is_cache_fill());
    assert_eq!(pkt.sender_state, Some(out.id));

    assert!(q.mark_in_service(out.id).unwrap().is_empty());
    assert!(q.mshr(out.id).unwrap().in_service);
    assert_eq!(q.outstanding(), 1);
    assert_eq!(q.next_ready(10), None);
}

#[test]
fn test_later_accesses_merge() {
    let mut q = queue(4, 8, 4);
    let first = miss(&mut q, read_pkt(0x1000, 4), 0);
    let second = miss(&mut q, write_pkt(0x1010, 4, 1), 0);
    assert!(second.merged);
    assert_eq!(second.id, first.id);

    // Still merges once the entry is on the bus
    send(&mut q, first.id);
    let third = miss(&mut q, read_pkt(0x103C, 4), 2);
    assert!(third.merged);

    assert_eq!(q.find_mshr(0x1000).unwrap().num_targets(), 3);
    assert_eq!(q.outstanding(), 1);
    assert_eq!(q.stats().mshr_hits, 2);
    assert_eq!(q.stats().mshr_misses, 1);
}

#[test]
fn test_one_entry_per_line() {
    let mut q = queue(4, 8, 4);
    for offset in [0, 8, 16, 60, 4] {
        miss(&mut q, read_pkt(0x2000 + offset, 4), 0);
    }
    miss(&mut q, read_pkt(0x2040, 4), 0);
    assert_eq!(q.outstanding(), 2);
    assert_eq!(q.find_mshr(0x2000).unwrap().num_targets(), 5);
    assert_eq!(q.find_mshr(0x2040).unwrap().num_targets(), 1);
    q.do_writeback(writeback(0x2000), 0);
    let mut lines = q.miss_addrs();
    lines.sort_unstable();
    assert_eq!(lines, vec![0x2000, 0x2040]);
}

#[test]
fn test_write_miss_on_shared_line_upgrades() {
    let mut q = queue(4, 8, 4);
    let out = q
        .handle_miss(write_pkt(0x2000, 4, 1), 64, 0, &mesi(), BlkStatus::SHARED)
        .unwrap();
    assert_eq!(q.get_packet(out.id).unwrap().cmd(), Command::UpgradeReq);

    let out = miss(&mut q, write_pkt(0x3000, 4, 1), 0);
    assert_eq!(q.get_packet(out.id).unwrap().cmd(), Command::ReadExReq);
}

#[test]
fn test_target_limit_blocks() {
    let mut q = queue(4, 2, 4);
    assert!(miss(&mut q, read_pkt(0x1000, 4), 0).blocked.is_empty());
    let out = miss(&mut q, read_pkt(0x1008, 4), 0);
    assert_eq!(out.blocked, BlockedCause::NO_TARGETS);
    assert!(q.blocked_causes().contains(BlockedCause::NO_TARGETS));
    assert!(!q.is_full());
}

#[test]
fn test_mshr_exhaustion_blocks() {
    let mut q = queue(2, 8, 4);
    assert!(miss(&mut q, read_pkt(0x0000, 4), 0).blocked.is_empty());
    let out = miss(&mut q, read_pkt(0x0040, 4), 0);
    assert!(out.blocked.contains(BlockedCause::NO_MSHRS));
    assert!(q.is_full());
    assert_eq!(q.blocked_causes(), BlockedCause::NO_MSHRS);
}

#[test]
fn test_writeback_released_once_sent() {
    let mut q = queue(4, 8, 1);
    assert_eq!(q.do_writeback(writeback(0x3000), 0), BlockedCause::NO_WB_BUFFERS);

    let id = q.next_ready(0).expect("writeback ready");
    assert!(q.mshr(id).unwrap().is_writeback());
    assert_eq!(q.find_writes(0x3000), vec![id]);

    let pkt = q.get_packet(id).unwrap();
    assert_eq!(pkt.cmd(), Command::Writeback);
    assert_eq!(pkt.data()[0], 0x5A);

    // No response expected, so the entry is freed right away
    assert_eq!(q.mark_in_service(id).unwrap(), BlockedCause::NO_WB_BUFFERS);
    assert_eq!(q.outstanding(), 0);
    assert!(q.mshr(id).is_none());
}

#[test]
fn test_writeback_precedes_miss_to_same_line() {
    let mut q = queue(4, 8, 4);
    let rd = miss(&mut q, read_pkt(0x3000, 4), 1);
    q.do_writeback(writeback(0x3000), 2);

    let first = q.next_ready(2).unwrap();
    assert!(q.mshr(first).unwrap().is_writeback());
    send(&mut q, first);
    assert_eq!(q.next_ready(2), Some(rd.id));

    // Unrelated lines keep ready-time order
    let mut q = queue(4, 8, 4);
    let rd = miss(&mut q, read_pkt(0x4000, 4), 1);
    q.do_writeback(writeback(0x3000), 2);
    assert_eq!(q.next_ready(2), Some(rd.id));
}

#[test]
fn test_refused_packet_goes_first() {
    let mut q = queue(4, 8, 4);
    let a = miss(&mut q, read_pkt(0x1000, 4), 0);
    let b = miss(&mut q, read_pkt(0x2000, 4), 0);

    assert_eq!(q.next_ready(0), Some(a.id));
    let pkt = q.get_packet(a.id).unwrap();
    assert_eq!(q.next_ready(0), Some(b.id));

    q.restore_packet(pkt).unwrap();
    assert_eq!(q.next_ready(0), Some(a.id));
    assert_eq!(q.next_ready_time(), Some(0));
    assert!(!q.mshr(a.id).unwrap().in_service);
    assert_eq!(q.stats().refused_sends, 1);
}

#[test]
fn test_response_services_targets_in_order() {
    let mut q = queue(4, 8, 4);
    let mut tags = LruTags::new(1024, 2, 64).unwrap();
    let out = miss(&mut q, read_pkt(0x1000, 4), 0);
    miss(&mut q, read_pkt(0x1004, 4), 0);
    let mut pkt = send(&mut q, out.id);

    {
        let (blk, _) = tags.allocate(0x1000, 3);
        blk.data[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        blk.set_state(BlkStatus::EXCLUSIVE);
    }
    pkt.make_timing_response().unwrap();
    let outcome = q.handle_response(pkt, &mut tags, 5).unwrap();

    assert!(!outcome.reissued);
    assert_eq!(outcome.responses.len(), 2);
    assert_eq!(outcome.responses[0].cmd(), Command::ReadResp);
    assert_eq!(outcome.responses[0].get_uint(), 0x0403_0201);
    assert_eq!(outcome.responses[1].get_uint(), 0x0807_0605);
    assert!(outcome.responses.iter().all(|r| r.result == PacketResult::Success));
    assert_eq!(q.outstanding(), 0);
}

#[test]
fn test_write_without_permission_reissues() {
    let mut q = queue(4, 8, 4);
    let mut tags = LruTags::new(1024, 2, 64).unwrap();
    let out = miss(&mut q, read_pkt(0x1000, 4), 0);
    miss(&mut q, write_pkt(0x1008, 4, 9), 0);
    let mut pkt = send(&mut q, out.id);

    tags.allocate(0x1000, 3).0.set_state(BlkStatus::SHARED);
    pkt.make_timing_response().unwrap();
    let outcome = q.handle_response(pkt, &mut tags, 5).unwrap();

    assert!(outcome.reissued);
    assert_eq!(outcome.responses.len(), 1);
    assert_eq!(outcome.responses[0].cmd(), Command::ReadResp);

    let mshr = q.find_mshr(0x1000).expect("entry kept for the write");
    assert!(!mshr.in_service);
    assert_eq!(mshr.num_targets(), 1);
    assert_eq!(mshr.orig_cmd, Command::WriteReq);
    assert_eq!(q.next_ready(5), Some(out.id));
    assert_eq!(q.stats().reissues, 1);
}

#[test]
fn test_failed_transaction_reaches_every_target() {
    let mut q = queue(4, 8, 4);
    let mut tags = LruTags::new(1024, 2, 64).unwrap();
    let out = miss(&mut q, read_pkt(0x1000, 4), 0);
    miss(&mut q, read_pkt(0x1020, 4), 0);
    let mut pkt = send(&mut q, out.id);

    pkt.result = PacketResult::BadAddress;
    pkt.make_timing_response().unwrap();
    let outcome = q.handle_response(pkt, &mut tags, 5).unwrap();

    assert_eq!(outcome.responses.len(), 2);
    assert!(outcome
        .responses
        .iter()
        .all(|r| r.result == PacketResult::BadAddress && r.cmd() == Command::ReadResp));
    assert_eq!(q.outstanding(), 0);
    assert_eq!(tags.num_valid(), 0);
}

#[test]
fn test_unexpected_responses_are_violations() {
    let mut q = queue(4, 8, 4);
    let mut tags = LruTags::new(1024, 2, 64).unwrap();

    let out = miss(&mut q, read_pkt(0x1000, 4), 0);
    let mut pkt = q.get_packet(out.id).unwrap();
    pkt.make_timing_response().unwrap();
    assert!(matches!(
        q.handle_response(pkt, &mut tags, 1),
        Err(SimError::ProtocolViolation { .. })
    ));

    let orphan = Packet::new(Command::ReadResp, request(0x2000, 64));
    assert!(q.handle_response(orphan, &mut tags, 1).is_err());
}

#[test]
fn test_uncacheable_entry_keeps_exact_range() {
    let mut q = queue(4, 8, 4);
    let out = q.handle_uncacheable(write_pkt(0x5002, 2, 0xAA55), 0).unwrap();
    assert!(q.mshr(out.id).unwrap().is_uncacheable());
    assert!(q.find_mshr(0x5000).is_none());

    let pkt = q.get_packet(out.id).unwrap();
    assert_eq!(pkt.cmd(), Command::WriteReq);
    assert_eq!(pkt.addr(), 0x5002);
    assert_eq!(pkt.size(), 2);
    assert_eq!(pkt.get_uint(), 0xAA55);
}

#[test]
fn test_no_allocate_read_takes_one_target() {
    let mut q = queue(4, 8, 4);
    let mut pkt = read_pkt(0x6004, 4);
    pkt.set_flags(PacketFlags::NO_ALLOCATE);

    let out = miss(&mut q, pkt, 0);
    assert_eq!(out.blocked, BlockedCause::NO_TARGETS);

    let bus = q.get_packet(out.id).unwrap();
    assert_eq!(bus.cmd(), Command::ReadReq);
    assert_eq!(bus.addr(), 0x6004);
    assert_eq!(bus.size(), 4);
    assert!(bus.is_no_allocate());
    assert!(!bus.is_cache_fill());
}

#[test]
fn test_stale_entry_ids_are_detected() {
    let mut q = queue(4, 8, 4);
    let old = miss(&mut q, read_pkt(0x1000, 4), 0).id;
    assert!(q.take_entry(old).is_some());
    assert!(q.take_entry(old).is_none());

    let new = miss(&mut q, read_pkt(0x2000, 4), 0).id;
    assert_eq!(new.index(), old.index());
    assert_ne!(new.generation(), old.generation());
    assert!(q.mshr(old).is_none());
    assert!(q.mshr(new).is_some());
}
