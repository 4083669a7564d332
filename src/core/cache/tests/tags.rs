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

//! Block store and line tests

use super::*;
use crate::core::cache::tags::{LruTags, TagStore};

/// 2 sets x 2 ways of 64 bytes; lines 0x000, 0x080, 0x100 share set 0
fn small() -> LruTags {
    LruTags::new(256, 2, 64).expect("valid geometry")
}

fn install(tags: &mut LruTags, addr: Addr, state: BlkStatus) -> Option<crate::core::cache::tags::Evicted> {
    let (blk, evicted) = tags.allocate(addr, 0);
    blk.set_state(state);
    evicted
}

#[test]
fn test_geometry_validation() {
    assert!(LruTags::new(256, 2, 48).is_err());
    assert!(LruTags::new(200, 2, 64).is_err());
    assert!(LruTags::new(0, 2, 64).is_err());
    // 3 sets
    assert!(LruTags::new(384, 2, 64).is_err());

    let tags = small();
    assert_eq!(tags.num_sets(), 2);
    assert_eq!(tags.assoc(), 2);
    assert_eq!(tags.blk_size(), 64);
}

#[test]
fn test_absent_line_is_invalid() {
    let tags = small();
    assert!(tags.find_block(0x1000).is_none());
    assert_eq!(tags.status(0x1000), BlkStatus::INVALID);
    assert_eq!(tags.num_valid(), 0);
}

#[test]
fn test_allocate_and_find() {
    let mut tags = small();
    assert!(install(&mut tags, 0x1000, BlkStatus::EXCLUSIVE).is_none());

    // Any byte of the line finds it
    let blk = tags.find_block(0x103F).expect("line present");
    assert_eq!(blk.addr, 0x1000);
    assert_eq!(tags.status(0x1000), BlkStatus::EXCLUSIVE);
    assert_eq!(tags.block_addr(0x1234), 0x1200);
    assert_eq!(tags.num_valid(), 1);
}

#[test]
fn test_lru_victim() {
    let mut tags = small();
    install(&mut tags, 0x000, BlkStatus::SHARED);
    install(&mut tags, 0x080, BlkStatus::SHARED);

    // Touch 0x000 so 0x080 becomes least recently used
    assert!(tags.access_block(0x000, 5).is_some());

    let evicted = install(&mut tags, 0x100, BlkStatus::SHARED).expect("set was full");
    assert_eq!(evicted.addr, 0x080);
    assert!(tags.find_block(0x080).is_none());
    assert!(tags.find_block(0x000).is_some());
    assert!(tags.find_block(0x100).is_some());
}

#[test]
fn test_invalid_way_preferred_over_eviction() {
    let mut tags = small();
    install(&mut tags, 0x000, BlkStatus::SHARED);
    install(&mut tags, 0x080, BlkStatus::SHARED);
    assert!(tags.invalidate(0x000));

    assert!(install(&mut tags, 0x100, BlkStatus::SHARED).is_none());
    assert!(tags.find_block(0x080).is_some());
}

#[test]
fn test_evicted_dirty_line_carries_data() {
    let mut tags = small();
    {
        let (blk, _) = tags.allocate(0x000, 0);
        blk.data[..4].copy_from_slice(&[1, 2, 3, 4]);
        blk.set_state(BlkStatus::MODIFIED);
    }
    install(&mut tags, 0x080, BlkStatus::SHARED);
    tags.access_block(0x080, 1);

    let evicted = install(&mut tags, 0x100, BlkStatus::SHARED).expect("victim");
    assert_eq!(evicted.addr, 0x000);
    assert!(evicted.status.is_dirty());
    assert_eq!(&evicted.data[..4], &[1, 2, 3, 4]);

    // The reused way starts out zeroed
    let blk = tags.find_block(0x100).expect("new line");
    assert!(blk.data.iter().all(|b| *b == 0));
}

#[test]
fn test_reallocating_present_line_keeps_it() {
    let mut tags = small();
    install(&mut tags, 0x000, BlkStatus::SHARED);
    assert!(install(&mut tags, 0x000, BlkStatus::MODIFIED).is_none());
    assert_eq!(tags.status(0x000), BlkStatus::MODIFIED);
    assert_eq!(tags.num_valid(), 1);
}

#[test]
fn test_invalidate_is_idempotent() {
    let mut tags = small();
    install(&mut tags, 0x000, BlkStatus::MODIFIED);

    assert!(tags.invalidate(0x000));
    assert!(!tags.invalidate(0x000));
    assert!(!tags.invalidate(0x4000));
    assert_eq!(tags.status(0x000), BlkStatus::INVALID);
}

#[test]
fn test_state_names() {
    assert_eq!(BlkStatus::MODIFIED.state_name(), "M");
    assert_eq!(BlkStatus::EXCLUSIVE.state_name(), "E");
    assert_eq!(BlkStatus::OWNED.state_name(), "O");
    assert_eq!(BlkStatus::SHARED.state_name(), "S");
    assert_eq!(BlkStatus::INVALID.state_name(), "I");
    assert_eq!((BlkStatus::SHARED | BlkStatus::REFERENCED).state_name(), "S");
}

#[test]
fn test_set_state_keeps_replacement_hint() {
    let mut blk = line(0x40, BlkStatus::SHARED | BlkStatus::REFERENCED);
    blk.set_state(BlkStatus::MODIFIED);
    assert!(blk.status.contains(BlkStatus::REFERENCED));
    assert_eq!(blk.status.state(), BlkStatus::MODIFIED);
}

#[test]
fn test_satisfy_read_and_write() {
    let mut blk = line(0x1000, BlkStatus::EXCLUSIVE);
    blk.data[8..12].copy_from_slice(&0xCAFEF00Du32.to_le_bytes());

    let mut rd = read_pkt(0x1008, 4);
    assert!(blk.satisfy(&mut rd, 3));
    assert_eq!(rd.get_uint(), 0xCAFEF00D);

    let mut wr = write_pkt(0x1010, 2, 0xBEEF);
    assert!(blk.satisfy(&mut wr, 4));
    assert_eq!(&blk.data[0x10..0x12], &[0xEF, 0xBE]);
    assert!(blk.is_dirty());
    assert_eq!(blk.ref_count, 2);
}

#[test]
fn test_satisfy_write_needs_permission() {
    let mut blk = line(0x1000, BlkStatus::SHARED);
    let mut wr = write_pkt(0x1000, 4, 7);
    assert!(!blk.satisfy(&mut wr, 0));
    assert!(!blk.is_dirty());

    let mut invalid = line(0x1000, BlkStatus::INVALID);
    assert!(!invalid.satisfy(&mut read_pkt(0x1000, 4), 0));
}

#[test]
fn test_failed_store_conditional_leaves_line() {
    let mut blk = line(0x1000, BlkStatus::SHARED);
    let req = Request::new_physical(0x1000, 4, RequestFlags::LOCKED, 0);
    let mut sc = Packet::new(Command::WriteReq, req);
    sc.set_uint(0xFFFF_FFFF);
    sc.req_mut().set_sc_result(0);

    // Completes without permission and without touching the data
    assert!(blk.satisfy(&mut sc, 0));
    assert!(blk.data[..4].iter().all(|b| *b == 0));
    assert!(!blk.is_dirty());
}
