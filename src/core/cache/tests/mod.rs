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

//! Cache stage tests
//!
//! - `tags`: set-associative store, LRU replacement and line payloads
//! - `coherence`: bus commands, fill states and the snoop table
//! - `miss_queue`: entry allocation, merging, ordering and responses
//! - `timing`: whole caches on a shared bus, driven by memory testers

use super::*;
use crate::core::mem::{Addr, Command, Packet, Request, RequestFlags};

mod miss_queue;
mod tags;
mod timing;

pub(super) fn request(addr: Addr, size: usize) -> Request {
    Request::new_physical(addr, size, RequestFlags::empty(), 0)
}

pub(super) fn read_pkt(addr: Addr, size: usize) -> Packet {
    let mut pkt = Packet::new(Command::ReadReq, request(addr, size));
    pkt.allocate();
    pkt
}

pub(super) fn write_pkt(addr: Addr, size: usize, value: u64) -> Packet {
    let mut pkt = Packet::new(Command::WriteReq, request(addr, size));
    pkt.set_uint(value);
    pkt
}

/// A 64-byte line at `addr` in `status`
pub(super) fn line(addr: Addr, status: BlkStatus) -> CacheBlk {
    let mut blk = CacheBlk::new(64);
    blk.addr = addr;
    blk.status = status;
    blk
}
