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

//! Cache blocks
//!
//! Coherence states are expressed as combinations of status bits:
//!
//! | State     | Bits                       |
//! |-----------|----------------------------|
//! | Invalid   | (none)                     |
//! | Shared    | VALID                      |
//! | Owned     | VALID, DIRTY               |
//! | Exclusive | VALID, WRITABLE            |
//! | Modified  | VALID, WRITABLE, DIRTY     |

use bitflags::bitflags;

use crate::core::mem::packet::{Command, Packet};
use crate::core::mem::Addr;
use crate::core::timing::Tick;

bitflags! {
    /// Per-line status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlkStatus: u8 {
        const VALID = 1 << 0;
        const WRITABLE = 1 << 1;
        const DIRTY = 1 << 2;
        /// Touched since fill (replacement hint only)
        const REFERENCED = 1 << 3;
    }
}

impl BlkStatus {
    pub const INVALID: BlkStatus = BlkStatus::empty();
    pub const SHARED: BlkStatus = BlkStatus::VALID;
    pub const OWNED: BlkStatus = BlkStatus::VALID.union(BlkStatus::DIRTY);
    pub const EXCLUSIVE: BlkStatus = BlkStatus::VALID.union(BlkStatus::WRITABLE);
    pub const MODIFIED: BlkStatus = BlkStatus::EXCLUSIVE.union(BlkStatus::DIRTY);

    /// Bits that make up the coherence state
    pub const STATE_MASK: BlkStatus = BlkStatus::MODIFIED;

    #[inline]
    pub fn is_valid(self) -> bool {
        self.contains(BlkStatus::VALID)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(BlkStatus::VALID | BlkStatus::WRITABLE)
    }

    #[inline]
    pub fn is_dirty(self) -> bool {
        self.contains(BlkStatus::VALID | BlkStatus::DIRTY)
    }

    /// Coherence state without replacement hints
    #[inline]
    pub fn state(self) -> BlkStatus {
        self & BlkStatus::STATE_MASK
    }

    /// One-letter protocol name of the state
    pub fn state_name(self) -> &'static str {
        match self.state() {
            s if s == BlkStatus::MODIFIED => "M",
            s if s == BlkStatus::EXCLUSIVE => "E",
            s if s == BlkStatus::OWNED => "O",
            s if s == BlkStatus::SHARED => "S",
            s if !s.is_valid() => "I",
            _ => "?",
        }
    }
}

/// One cache line
#[derive(Debug, Clone)]
pub struct CacheBlk {
    /// Line address (tag and set folded back together)
    pub addr: Addr,
    pub status: BlkStatus,
    pub data: Vec<u8>,
    /// Tick of the last access
    pub last_touch: Tick,
    /// Accesses since fill
    pub ref_count: u64,
}

impl CacheBlk {
    pub fn new(blk_size: usize) -> Self {
        Self {
            addr: 0,
            status: BlkStatus::INVALID,
            data: vec![0; blk_size],
            last_touch: 0,
            ref_count: 0,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.status.is_valid()
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.status.is_writable()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.status.is_dirty()
    }

    /// Replace the coherence state, keeping replacement hints
    pub fn set_state(&mut self, state: BlkStatus) {
        self.status = (self.status - BlkStatus::STATE_MASK) | state.state();
    }

    pub fn invalidate(&mut self) {
        self.status = BlkStatus::INVALID;
        self.ref_count = 0;
    }

    /// Perform `pkt` against this line
    ///
    /// Reads copy the requested bytes out. Writes copy them in and dirty the
    /// line, which requires write permission unless the packet is a
    /// writeback from an upper level.
    ///
    /// # Returns
    ///
    /// false if the line cannot satisfy the packet (invalid, or a write
    /// without permission)
    pub fn satisfy(&mut self, pkt: &mut Packet, now: Tick) -> bool {
        if !self.is_valid() {
            return false;
        }

        let blk_size = self.data.len();
        let offset = pkt.offset(blk_size);
        let len = pkt.size().min(blk_size - offset);

        if pkt.is_write() && pkt.req().is_locked() && pkt.req().sc_result() == Some(0) {
            // Failed store-conditional: nothing lands in the line.
            return true;
        }

        if pkt.is_write() {
            if pkt.cmd() != Command::Writeback && !self.is_writable() {
                return false;
            }
            let src = pkt.data();
            let n = len.min(src.len());
            self.data[offset..offset + n].copy_from_slice(&src[..n]);
            self.status |= BlkStatus::DIRTY;
        } else if pkt.is_read() {
            pkt.data_mut()[..len].copy_from_slice(&self.data[offset..offset + len]);
        }

        self.status |= BlkStatus::REFERENCED;
        self.last_touch = now;
        self.ref_count += 1;
        true
    }

    /// Copy the overlapping part of this line into `pkt`
    pub fn supply(&self, pkt: &mut Packet) {
        copy_line_into(self.addr, &self.data, pkt);
    }
}

/// Copy the bytes of the line at `line_addr` that overlap `pkt` into `pkt`
pub fn copy_line_into(line_addr: Addr, line: &[u8], pkt: &mut Packet) {
    let start = pkt.addr().max(line_addr);
    let end = (pkt.addr() + pkt.size() as Addr).min(line_addr + line.len() as Addr);
    if start >= end {
        return;
    }
    let len = (end - start) as usize;
    let src = (start - line_addr) as usize;
    let dst = (start - pkt.addr()) as usize;
    pkt.data_mut()[dst..dst + len].copy_from_slice(&line[src..src + len]);
}

/// Copy the bytes of `pkt` that overlap the line at `line_addr` into the line
pub fn copy_packet_into_line(pkt: &Packet, line_addr: Addr, line: &mut [u8]) {
    let start = pkt.addr().max(line_addr);
    let end = (pkt.addr() + pkt.size() as Addr).min(line_addr + line.len() as Addr);
    if start >= end || pkt.data().len() < pkt.size() {
        return;
    }
    let len = (end - start) as usize;
    let dst = (start - line_addr) as usize;
    let src = (start - pkt.addr()) as usize;
    line[dst..dst + len].copy_from_slice(&pkt.data()[src..src + len]);
}
