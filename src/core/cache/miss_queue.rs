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

//! Miss queue
//!
//! Tracks every transaction a cache has outstanding toward the next level:
//! line misses (with their merged targets), uncacheable accesses and
//! writebacks. At most one cacheable miss entry exists per line; later
//! accesses to the line become targets of that entry.
//!
//! Entries are sent in ready-time order, except that a writeback of a line
//! always goes out before a miss to the same line. A packet the next level
//! refused is re-offered before anything else.

use std::collections::VecDeque;

use bitflags::bitflags;
use serde::Serialize;

use super::blk::BlkStatus;
use super::coherence::CoherenceProtocol;
use super::mshr::{Mshr, MshrId, MshrKind};
use super::tags::TagStore;
use crate::core::error::{Result, SimError};
use crate::core::mem::packet::{Command, Packet, PacketFlags, PacketResult};
use crate::core::mem::request::RequestFlags;
use crate::core::mem::Addr;
use crate::core::timing::Tick;

bitflags! {
    /// Why a cache stopped accepting new requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockedCause: u8 {
        const NO_MSHRS = 1 << 0;
        const NO_TARGETS = 1 << 1;
        const NO_WB_BUFFERS = 1 << 2;
    }
}

/// Result of [`MissBuffer::handle_miss`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissOutcome {
    pub id: MshrId,
    /// The access joined an existing entry
    pub merged: bool,
    /// Resources that ran out because of this access
    pub blocked: BlockedCause,
}

/// Result of [`MissBuffer::handle_response`]
#[derive(Debug, Default)]
pub struct ResponseOutcome {
    /// Serviced targets, ready to be sent back to their requesters
    pub responses: Vec<Packet>,
    /// Resource freed by releasing the entry
    pub unblocked: BlockedCause,
    /// The entry was sent again for targets the fill could not satisfy
    pub reissued: bool,
}

/// Miss queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MissQueueStats {
    /// Accesses merged into an outstanding entry
    pub mshr_hits: u64,
    /// Entries allocated for line misses
    pub mshr_misses: u64,
    pub uncacheable: u64,
    pub writebacks: u64,
    pub reissues: u64,
    pub refused_sends: u64,
}

/// Miss tracking as seen by the cache
pub trait MissBuffer {
    /// Record a line miss, merging into an existing entry if there is one
    ///
    /// A new entry gets its bus command from `coherence` given the line's
    /// current `state`.
    fn handle_miss<C: CoherenceProtocol + ?Sized>(
        &mut self,
        pkt: Packet,
        blk_size: usize,
        ready_time: Tick,
        coherence: &C,
        state: BlkStatus,
    ) -> Result<MissOutcome>;

    /// Record an uncacheable access
    fn handle_uncacheable(&mut self, pkt: Packet, ready_time: Tick) -> Result<MissOutcome>;

    /// Queue a writeback packet
    fn do_writeback(&mut self, pkt: Packet, ready_time: Tick) -> BlockedCause;

    /// Cacheable miss entry for the line holding `addr`
    fn find_mshr(&self, blk_addr: Addr) -> Option<&Mshr>;

    /// Writeback entries for the line at `blk_addr`
    fn find_writes(&self, blk_addr: Addr) -> Vec<MshrId>;

    fn mshr(&self, id: MshrId) -> Option<&Mshr>;

    fn mshr_mut(&mut self, id: MshrId) -> Option<&mut Mshr>;

    /// Append a target to an entry
    fn add_target(&mut self, id: MshrId, pkt: Packet) -> Result<()>;

    /// Entry whose packet should be sent next, if one is ready at `now`
    fn next_ready(&self, now: Tick) -> Option<MshrId>;

    /// Earliest tick at which some entry becomes sendable
    fn next_ready_time(&self) -> Option<Tick>;

    /// Set the command of an entry's outgoing packet
    fn set_bus_cmd(&mut self, id: MshrId, cmd: Command) -> Result<()>;

    /// Take an entry's outgoing packet for sending
    fn get_packet(&mut self, id: MshrId) -> Result<Packet>;

    /// Put back a packet the next level refused; it is re-offered first
    fn restore_packet(&mut self, pkt: Packet) -> Result<()>;

    /// Restore the allocating command on a packet
    fn restore_orig_cmd(&self, pkt: &mut Packet);

    /// The next level accepted an entry's packet
    ///
    /// Entries that expect no response are released here.
    fn mark_in_service(&mut self, id: MshrId) -> Result<BlockedCause>;

    /// Send an entry again with command `cmd`
    fn mark_pending(&mut self, id: MshrId, cmd: Command) -> Result<()>;

    /// Service an entry's targets with its response
    fn handle_response<T: TagStore>(
        &mut self,
        pkt: Packet,
        tags: &mut T,
        now: Tick,
    ) -> Result<ResponseOutcome>;

    /// Release an entry without servicing it
    fn take_entry(&mut self, id: MshrId) -> Option<Mshr>;

    /// Entries allocated (misses, uncacheable and writebacks)
    fn outstanding(&self) -> usize;

    fn is_full(&self) -> bool;

    /// Resources that are exhausted right now
    fn blocked_causes(&self) -> BlockedCause;

    fn stats(&self) -> &MissQueueStats;
}

/// Slab-backed miss queue
#[derive(Debug)]
pub struct MissQueue {
    name: String,
    slots: Vec<Option<Mshr>>,
    generations: Vec<u32>,
    free: Vec<usize>,
    num_mshrs: usize,
    num_targets: usize,
    num_write_buffers: usize,
    allocated_misses: usize,
    allocated_writebacks: usize,
    /// Entries waiting to be sent
    pending: Vec<MshrId>,
    /// Entry whose packet was refused and must go first
    retry_head: Option<MshrId>,
    next_order: u64,
    stats: MissQueueStats,
}

impl MissQueue {
    /// # Arguments
    ///
    /// * `name` - Owning cache, for diagnostics
    /// * `num_mshrs` - Miss and uncacheable entries
    /// * `num_targets` - Targets per miss entry
    /// * `num_write_buffers` - Writeback entries
    pub fn new(name: &str, num_mshrs: usize, num_targets: usize, num_write_buffers: usize) -> Self {
        Self {
            name: name.to_string(),
            slots: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
            num_mshrs,
            num_targets,
            num_write_buffers,
            allocated_misses: 0,
            allocated_writebacks: 0,
            pending: Vec::new(),
            retry_head: None,
            next_order: 0,
            stats: MissQueueStats::default(),
        }
    }

    /// Line address of every cacheable miss entry, in slot order
    pub fn miss_addrs(&self) -> Vec<Addr> {
        self.entries()
            .filter(|m| m.kind == MshrKind::Miss)
            .map(|m| m.addr)
            .collect()
    }

    fn violation(&self, addr: Addr, cmd: Command, detail: impl Into<String>) -> SimError {
        SimError::violation(&self.name, addr, cmd, "miss queue", detail)
    }

    fn allocate(
        &mut self,
        kind: MshrKind,
        addr: Addr,
        size: usize,
        orig_cmd: Command,
        mut pkt: Packet,
        ready_time: Tick,
    ) -> MshrId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                self.slots.len() - 1
            }
        };
        let id = MshrId::new(index, self.generations[index]);
        pkt.sender_state = Some(id);

        let order = self.next_order;
        self.next_order += 1;

        let bus_cmd = pkt.cmd();
        let cache_fill = pkt.is_cache_fill();
        self.slots[index] = Some(Mshr {
            id,
            kind,
            addr,
            size,
            orig_cmd,
            bus_cmd,
            cache_fill,
            pkt: Some(pkt),
            in_service: false,
            targets: VecDeque::new(),
            ready_time,
            order,
        });

        match kind {
            MshrKind::Writeback => self.allocated_writebacks += 1,
            _ => self.allocated_misses += 1,
        }
        self.pending.push(id);
        id
    }

    fn deallocate(&mut self, id: MshrId) -> Option<Mshr> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.as_ref().map(|m| m.id) != Some(id) {
            return None;
        }
        let mshr = slot.take()?;
        self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);
        self.free.push(id.index());
        self.pending.retain(|p| *p != id);
        if self.retry_head == Some(id) {
            self.retry_head = None;
        }
        match mshr.kind {
            MshrKind::Writeback => self.allocated_writebacks -= 1,
            _ => self.allocated_misses -= 1,
        }
        Some(mshr)
    }

    fn entry(&self, id: MshrId) -> Result<&Mshr> {
        self.mshr(id).ok_or_else(|| {
            SimError::violation(&self.name, 0, Command::ReadReq, "miss queue", format!("stale entry {:?}", id))
        })
    }

    fn entry_mut(&mut self, id: MshrId) -> Result<&mut Mshr> {
        let name = self.name.clone();
        self.mshr_mut(id).ok_or_else(|| {
            SimError::violation(&name, 0, Command::ReadReq, "miss queue", format!("stale entry {:?}", id))
        })
    }

    fn entries(&self) -> impl Iterator<Item = &Mshr> {
        self.slots.iter().flatten()
    }

    fn misses_full(&self) -> bool {
        self.allocated_misses >= self.num_mshrs
    }

    fn writebacks_full(&self) -> bool {
        self.allocated_writebacks >= self.num_write_buffers
    }

    /// Bus packet for a line miss on behalf of `target`
    fn fill_packet(target: &Packet, blk_addr: Addr, blk_size: usize, cmd: Command, now: Tick) -> Packet {
        let flags = target.req().flags() - RequestFlags::LOCKED;
        let req = target.req().derive(blk_addr, blk_size, flags, now);
        let mut pkt = Packet::with_range(cmd, req, blk_addr, blk_size);
        pkt.set_flags(PacketFlags::CACHE_LINE_FILL);
        pkt.allocate();
        pkt
    }

    /// Bus packet for a read that must not allocate a line
    fn exact_read_packet(target: &Packet) -> Packet {
        let mut pkt = Packet::with_range(
            Command::ReadReq,
            target.req().clone(),
            target.addr(),
            target.size(),
        );
        pkt.set_flags(PacketFlags::NO_ALLOCATE);
        pkt.allocate();
        pkt
    }

    /// Targets an entry may collect before the cache must block
    ///
    /// An entry that will not fill a line can only serve the access that
    /// allocated it.
    fn target_limit(&self, mshr: &Mshr) -> usize {
        if mshr.cache_fill {
            self.num_targets
        } else {
            1
        }
    }

    fn targets_full(&self, mshr: &Mshr) -> bool {
        mshr.kind == MshrKind::Miss && mshr.targets.len() >= self.target_limit(mshr)
    }

    /// Release an entry, reporting which resource became free
    fn release(&mut self, id: MshrId) -> BlockedCause {
        let was_misses_full = self.misses_full();
        let was_wb_full = self.writebacks_full();
        let had_full_targets = self.mshr(id).map(|m| self.targets_full(m)).unwrap_or(false);

        let Some(mshr) = self.deallocate(id) else {
            return BlockedCause::empty();
        };

        let mut unblocked = BlockedCause::empty();
        match mshr.kind {
            MshrKind::Writeback if was_wb_full => unblocked |= BlockedCause::NO_WB_BUFFERS,
            MshrKind::Miss | MshrKind::Uncacheable if was_misses_full => {
                unblocked |= BlockedCause::NO_MSHRS
            }
            _ => {}
        }
        if had_full_targets {
            unblocked |= BlockedCause::NO_TARGETS;
        }
        unblocked
    }
}

impl MissBuffer for MissQueue {
    fn handle_miss<C: CoherenceProtocol + ?Sized>(
        &mut self,
        pkt: Packet,
        blk_size: usize,
        ready_time: Tick,
        coherence: &C,
        state: BlkStatus,
    ) -> Result<MissOutcome> {
        let blk_addr = pkt.block_addr(blk_size);

        if let Some(id) = self.find_mshr(blk_addr).map(|m| m.id) {
            self.stats.mshr_hits += 1;
            log::trace!(
                "{}: merging {} 0x{:08X} into entry for 0x{:08X}",
                self.name,
                pkt.cmd(),
                pkt.addr(),
                blk_addr
            );
            let limit = self.target_limit(self.entry(id)?);
            let mshr = self.entry_mut(id)?;
            mshr.targets.push_back(pkt);
            let blocked = if mshr.targets.len() >= limit {
                BlockedCause::NO_TARGETS
            } else {
                BlockedCause::empty()
            };
            return Ok(MissOutcome {
                id,
                merged: true,
                blocked,
            });
        }

        self.stats.mshr_misses += 1;
        let (cmd, bus_pkt) = if pkt.is_no_allocate() && pkt.is_read() {
            (Command::ReadReq, Self::exact_read_packet(&pkt))
        } else {
            let cmd = coherence.get_bus_cmd(pkt.cmd(), state);
            (cmd, Self::fill_packet(&pkt, blk_addr, blk_size, cmd, pkt.req().time()))
        };
        log::trace!(
            "{}: new entry for 0x{:08X} ({} -> {})",
            self.name,
            blk_addr,
            pkt.cmd(),
            cmd
        );

        let orig_cmd = pkt.cmd();
        let id = self.allocate(MshrKind::Miss, blk_addr, blk_size, orig_cmd, bus_pkt, ready_time);
        let limit = self.target_limit(self.entry(id)?);
        let mshr = self.entry_mut(id)?;
        mshr.targets.push_back(pkt);

        let mut blocked = BlockedCause::empty();
        if mshr.targets.len() >= limit {
            blocked |= BlockedCause::NO_TARGETS;
        }
        if self.misses_full() {
            blocked |= BlockedCause::NO_MSHRS;
        }
        Ok(MissOutcome {
            id,
            merged: false,
            blocked,
        })
    }

    fn handle_uncacheable(&mut self, pkt: Packet, ready_time: Tick) -> Result<MissOutcome> {
        self.stats.uncacheable += 1;

        let mut bus_pkt = Packet::with_range(pkt.cmd(), pkt.req().clone(), pkt.addr(), pkt.size());
        if pkt.cmd().has_data() {
            bus_pkt.set_data(pkt.data());
        } else if pkt.is_read() {
            bus_pkt.allocate();
        }

        let addr = pkt.addr();
        let size = pkt.size();
        let cmd = pkt.cmd();
        let id = self.allocate(MshrKind::Uncacheable, addr, size, cmd, bus_pkt, ready_time);
        self.entry_mut(id)?.targets.push_back(pkt);

        let blocked = if self.misses_full() {
            BlockedCause::NO_MSHRS
        } else {
            BlockedCause::empty()
        };
        Ok(MissOutcome {
            id,
            merged: false,
            blocked,
        })
    }

    fn do_writeback(&mut self, pkt: Packet, ready_time: Tick) -> BlockedCause {
        self.stats.writebacks += 1;
        log::trace!("{}: queueing writeback of 0x{:08X}", self.name, pkt.addr());

        let addr = pkt.addr();
        let size = pkt.size();
        self.allocate(MshrKind::Writeback, addr, size, Command::Writeback, pkt, ready_time);

        if self.writebacks_full() {
            BlockedCause::NO_WB_BUFFERS
        } else {
            BlockedCause::empty()
        }
    }

    fn find_mshr(&self, blk_addr: Addr) -> Option<&Mshr> {
        self.entries()
            .find(|m| m.kind == MshrKind::Miss && m.addr == blk_addr)
    }

    fn find_writes(&self, blk_addr: Addr) -> Vec<MshrId> {
        let mut writes: Vec<&Mshr> = self
            .entries()
            .filter(|m| m.kind == MshrKind::Writeback && m.addr == blk_addr)
            .collect();
        writes.sort_by_key(|m| m.order);
        writes.into_iter().map(|m| m.id).collect()
    }

    fn mshr(&self, id: MshrId) -> Option<&Mshr> {
        self.slots
            .get(id.index())?
            .as_ref()
            .filter(|m| m.id == id)
    }

    fn mshr_mut(&mut self, id: MshrId) -> Option<&mut Mshr> {
        self.slots
            .get_mut(id.index())?
            .as_mut()
            .filter(|m| m.id == id)
    }

    fn add_target(&mut self, id: MshrId, pkt: Packet) -> Result<()> {
        self.entry_mut(id)?.targets.push_back(pkt);
        Ok(())
    }

    fn next_ready(&self, now: Tick) -> Option<MshrId> {
        if let Some(id) = self.retry_head {
            return Some(id);
        }

        let first = self
            .pending
            .iter()
            .filter_map(|id| self.mshr(*id))
            .filter(|m| m.ready_time <= now)
            .min_by_key(|m| (m.ready_time, m.order))?;

        if first.kind == MshrKind::Miss {
            // Older writebacks of the same line must reach memory first.
            let wb = self
                .pending
                .iter()
                .filter_map(|id| self.mshr(*id))
                .filter(|m| m.kind == MshrKind::Writeback && m.addr == first.addr)
                .min_by_key(|m| m.order);
            if let Some(wb) = wb {
                return Some(wb.id);
            }
        }
        Some(first.id)
    }

    fn next_ready_time(&self) -> Option<Tick> {
        if self.retry_head.is_some() {
            return Some(0);
        }
        self.pending
            .iter()
            .filter_map(|id| self.mshr(*id))
            .map(|m| m.ready_time)
            .min()
    }

    fn set_bus_cmd(&mut self, id: MshrId, cmd: Command) -> Result<()> {
        let mshr = self.entry_mut(id)?;
        mshr.bus_cmd = cmd;
        if let Some(pkt) = mshr.pkt.as_mut() {
            pkt.set_cmd(cmd);
        }
        Ok(())
    }

    fn get_packet(&mut self, id: MshrId) -> Result<Packet> {
        let (addr, cmd) = {
            let mshr = self.entry(id)?;
            (mshr.addr, mshr.bus_cmd)
        };
        let mshr = self.entry_mut(id)?;
        let pkt = mshr.pkt.take();
        match pkt {
            Some(pkt) => {
                self.pending.retain(|p| *p != id);
                if self.retry_head == Some(id) {
                    self.retry_head = None;
                }
                Ok(pkt)
            }
            None => Err(self.violation(addr, cmd, "entry has no packet to send")),
        }
    }

    fn restore_packet(&mut self, mut pkt: Packet) -> Result<()> {
        let Some(id) = pkt.sender_state else {
            return Err(self.violation(pkt.addr(), pkt.cmd(), "refused packet without entry"));
        };
        self.stats.refused_sends += 1;
        self.restore_orig_cmd(&mut pkt);
        pkt.clear_flags(PacketFlags::SATISFIED | PacketFlags::SHARED_LINE | PacketFlags::NACKED_LINE);

        let mshr = self.entry_mut(id)?;
        mshr.pkt = Some(pkt);
        mshr.in_service = false;
        self.pending.push(id);
        self.retry_head = Some(id);
        Ok(())
    }

    fn restore_orig_cmd(&self, pkt: &mut Packet) {
        if let Some(mshr) = pkt.sender_state.and_then(|id| self.mshr(id)) {
            if mshr.kind == MshrKind::Miss {
                pkt.set_cmd(mshr.orig_cmd);
            }
        }
    }

    fn mark_in_service(&mut self, id: MshrId) -> Result<BlockedCause> {
        let needs_response = self.entry(id)?.needs_response();
        if !needs_response {
            return Ok(self.release(id));
        }
        let mshr = self.entry_mut(id)?;
        mshr.in_service = true;
        Ok(BlockedCause::empty())
    }

    fn mark_pending(&mut self, id: MshrId, cmd: Command) -> Result<()> {
        self.stats.reissues += 1;
        let mshr = self.entry_mut(id)?;
        mshr.in_service = false;
        mshr.orig_cmd = cmd;
        mshr.bus_cmd = cmd;
        if let Some(pkt) = mshr.pkt.as_mut() {
            pkt.reinit_request(cmd);
        }
        if !self.pending.contains(&id) {
            self.pending.push(id);
        }
        Ok(())
    }

    fn handle_response<T: TagStore>(
        &mut self,
        mut pkt: Packet,
        tags: &mut T,
        now: Tick,
    ) -> Result<ResponseOutcome> {
        let Some(id) = pkt.sender_state else {
            return Err(self.violation(pkt.addr(), pkt.cmd(), "response without entry"));
        };
        let (kind, in_service) = {
            let mshr = self.entry(id)?;
            (mshr.kind, mshr.in_service)
        };
        if !in_service {
            return Err(self.violation(pkt.addr(), pkt.cmd(), "response for an entry not in service"));
        }

        let mut outcome = ResponseOutcome::default();
        let result = pkt.result;

        if result != PacketResult::Success || kind == MshrKind::Uncacheable || pkt.is_no_allocate() {
            // Nothing to fill: hand the bus result to every target directly.
            let mshr = self.entry_mut(id)?;
            while let Some(mut target) = mshr.targets.pop_front() {
                if target.cmd() == Command::InvalidateReq {
                    continue;
                }
                target.result = result;
                if result == PacketResult::Success && target.is_read() {
                    super::blk::copy_line_into(pkt.addr(), pkt.data(), &mut target);
                }
                if target.needs_response() {
                    target.make_timing_response()?;
                    outcome.responses.push(target);
                }
            }
            outcome.unblocked = self.release(id);
            return Ok(outcome);
        }

        let blk_addr = self.entry(id)?.addr;
        let had_full_targets = self.targets_full(self.entry(id)?);
        let mshr = self.entry_mut(id)?;
        pkt.reinit_request(mshr.orig_cmd);
        mshr.pkt = Some(pkt);

        while let Some(target) = mshr.targets.front_mut() {
            if target.cmd() == Command::InvalidateReq {
                tags.invalidate(blk_addr);
                mshr.targets.pop_front();
                continue;
            }
            let satisfied = match tags.access_block(blk_addr, now) {
                Some(blk) => blk.satisfy(target, now),
                None => false,
            };
            if !satisfied {
                break;
            }
            let Some(mut target) = mshr.targets.pop_front() else {
                break;
            };
            target.result = PacketResult::Success;
            if target.needs_response() {
                target.make_timing_response()?;
                outcome.responses.push(target);
            }
        }

        // Snoops queued behind a stalled target were observed before the
        // reissue, so they take effect now.
        if !mshr.targets.is_empty() {
            let before = mshr.targets.len();
            mshr.targets.retain(|t| t.cmd() != Command::InvalidateReq);
            if mshr.targets.len() != before {
                tags.invalidate(blk_addr);
            }
        }

        let next_cmd = mshr.targets.front().map(|t| t.cmd());
        let remaining = mshr.targets.len();
        match next_cmd {
            Some(cmd) => {
                // A write found the line without permission (or the line was
                // invalidated under it): go around again.
                log::debug!(
                    "{}: reissuing 0x{:08X} for {} remaining targets",
                    self.name,
                    blk_addr,
                    remaining
                );
                self.mark_pending(id, cmd)?;
                outcome.reissued = true;
                if had_full_targets {
                    outcome.unblocked |= BlockedCause::NO_TARGETS;
                }
            }
            None => outcome.unblocked = self.release(id),
        }
        Ok(outcome)
    }

    fn take_entry(&mut self, id: MshrId) -> Option<Mshr> {
        self.deallocate(id)
    }

    fn outstanding(&self) -> usize {
        self.allocated_misses + self.allocated_writebacks
    }

    fn is_full(&self) -> bool {
        self.misses_full()
    }

    fn blocked_causes(&self) -> BlockedCause {
        let mut causes = BlockedCause::empty();
        if self.misses_full() {
            causes |= BlockedCause::NO_MSHRS;
        }
        if self.writebacks_full() {
            causes |= BlockedCause::NO_WB_BUFFERS;
        }
        if self.entries().any(|m| self.targets_full(m)) {
            causes |= BlockedCause::NO_TARGETS;
        }
        causes
    }

    fn stats(&self) -> &MissQueueStats {
        &self.stats
    }
}
