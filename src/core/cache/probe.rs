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

//! Snoops, atomic probes and functional accesses

use super::blk::{copy_line_into, copy_packet_into_line, BlkStatus};
use super::coherence::CoherenceProtocol;
use super::miss_queue::MissBuffer;
use super::tags::TagStore;
use super::Cache;
use crate::core::error::{Result, SimError};
use crate::core::mem::packet::{Command, Packet, PacketFlags, PacketResult};
use crate::core::mem::port::SnoopReply;
use crate::core::mem::request::RequestFlags;
use crate::core::mem::Addr;
use crate::core::sim::fabric::{ExitReason, Fabric};
use crate::core::timing::Tick;

impl<T: TagStore, B: MissBuffer, C: CoherenceProtocol> Cache<T, B, C> {
    /// Answer a peer's bus request
    pub(super) fn snoop(&mut self, fabric: &mut Fabric, pkt: &mut Packet) -> Result<SnoopReply> {
        self.stats.snoops += 1;
        let now = fabric.now();
        let timing = fabric.memory_mode().is_timing_mode();

        if let Some(inval) = self.coherence.propagate_invalidate(pkt, timing) {
            log::trace!("{}: invalidating 0x{:08X} above", self.name, inval.addr());
            self.cpu_resp_queue.push_back(inval);
            self.send_responses(fabric)?;
        }
        if pkt.is_uncacheable() {
            return Ok(SnoopReply::Ignored);
        }

        let blk_addr = pkt.block_addr(self.blk_size);
        let plain_invalidate = matches!(
            pkt.cmd(),
            Command::InvalidateReq | Command::WriteInvalidateReq
        );

        if self.coherence.has_protocol() || pkt.is_invalidate() {
            let in_service = self
                .miss_queue
                .find_mshr(blk_addr)
                .filter(|m| m.in_service)
                .map(|m| (m.id(), m.bus_cmd, m.cache_fill));

            if let Some((id, bus_cmd, cache_fill)) = in_service {
                if (bus_cmd.is_invalidate() || !cache_fill) && !plain_invalidate {
                    pkt.set_flags(PacketFlags::NACKED_LINE);
                    self.stats.snoops_nacked += 1;
                    log::warn!(
                        "{}: NACK {} 0x{:08X}, {} to the line is in service",
                        self.name,
                        pkt.cmd(),
                        pkt.addr(),
                        bus_cmd
                    );
                    return Ok(SnoopReply::Nacked);
                }

                // The fill has not landed yet; apply the snoop once it does.
                let inval = Packet::with_range(
                    Command::InvalidateReq,
                    pkt.req().clone(),
                    blk_addr,
                    self.blk_size,
                );
                self.miss_queue.add_target(id, inval)?;
                if pkt.is_read() && !pkt.is_invalidate() {
                    pkt.set_flags(PacketFlags::SHARED_LINE);
                }
                self.stats.snoop_invalidates_appended += 1;
                log::trace!(
                    "{}: appended invalidate for 0x{:08X} behind {}",
                    self.name,
                    blk_addr,
                    bus_cmd
                );
                return Ok(SnoopReply::Ignored);
            }

            if let Some(reply) = self.snoop_writebacks(pkt, blk_addr, now)? {
                // Dropped writebacks may free the buffer a refused access waits on.
                self.update_blocked(fabric)?;
                self.check_drained(fabric);
                return Ok(reply);
            }
        }

        if pkt.is_invalidate() {
            self.fail_pending_conditionals(blk_addr);
        }

        let decision = {
            let blk = self.tags.find_block(blk_addr);
            let mshr = self.miss_queue.find_mshr(blk_addr);
            self.coherence.handle_bus_request(pkt, blk, mshr)?
        };

        let mut line = None;
        if let Some(blk) = self.tags.find_block_mut(blk_addr) {
            let old = blk.status.state();
            if decision.satisfy {
                pkt.mark_satisfied(&self.name)?;
                blk.supply(pkt);
            }
            if decision.writeback {
                line = Some(blk.data.clone());
            }
            if decision.new_state.is_valid() {
                blk.set_state(decision.new_state);
            } else {
                blk.invalidate();
            }
            if old != decision.new_state.state() {
                log::trace!(
                    "{}: snoop {} 0x{:08X} {} -> {}",
                    self.name,
                    pkt.cmd(),
                    blk_addr,
                    old.state_name(),
                    decision.new_state.state_name()
                );
            }
        }
        if let Some(data) = line {
            self.writeback_line(fabric, blk_addr, &data, false)?;
        }

        if decision.satisfy {
            self.stats.snoop_supplies += 1;
            Ok(SnoopReply::Supplied {
                ready: now + self.hit_latency,
            })
        } else {
            Ok(SnoopReply::Ignored)
        }
    }

    /// Store-conditionals still waiting for the bus lose their reservation
    /// once another agent takes the line.
    fn fail_pending_conditionals(&mut self, blk_addr: Addr) {
        let Some(id) = self
            .miss_queue
            .find_mshr(blk_addr)
            .filter(|m| !m.in_service)
            .map(|m| m.id())
        else {
            return;
        };
        let Some(mshr) = self.miss_queue.mshr_mut(id) else {
            return;
        };
        for target in mshr.targets.iter_mut() {
            if target.is_write() && target.req().is_locked() {
                target.req_mut().set_sc_result(0);
                self.stats.sc_failures += 1;
                log::debug!("{}: store-conditional to 0x{:08X} lost its line", self.name, blk_addr);
            }
        }
    }

    /// Let pending writebacks answer a snoop for their line
    fn snoop_writebacks(
        &mut self,
        pkt: &mut Packet,
        blk_addr: Addr,
        now: Tick,
    ) -> Result<Option<SnoopReply>> {
        let Some(id) = self.miss_queue.find_writes(blk_addr).into_iter().next() else {
            return Ok(None);
        };

        let mut reply = SnoopReply::Ignored;
        if pkt.is_read() {
            let wb = self
                .miss_queue
                .mshr(id)
                .and_then(|m| m.pkt.as_ref())
                .ok_or_else(|| {
                    SimError::violation(
                        &self.name,
                        blk_addr,
                        pkt.cmd(),
                        "writeback",
                        "queued writeback has no data",
                    )
                })?;
            pkt.mark_satisfied(&self.name)?;
            pkt.set_flags(PacketFlags::SHARED_LINE);
            copy_line_into(wb.addr(), wb.data(), pkt);
            self.stats.snoop_supplies += 1;
            reply = SnoopReply::Supplied {
                ready: now + self.hit_latency,
            };
            log::trace!("{}: writeback of 0x{:08X} supplies {}", self.name, blk_addr, pkt.cmd());
        }
        if pkt.is_invalidate() {
            // The requester takes ownership of the dirty data.
            for id in self.miss_queue.find_writes(blk_addr) {
                self.miss_queue.take_entry(id);
            }
            self.tags.invalidate(blk_addr);
            log::trace!("{}: dropped writeback of 0x{:08X}", self.name, blk_addr);
        }
        Ok(Some(reply))
    }

    /// Atomic access from the requester
    ///
    /// Same decisions as the timing path, resolved before returning.
    pub(super) fn probe(&mut self, fabric: &mut Fabric, pkt: &mut Packet) -> Result<Tick> {
        let now = fabric.now();
        let cmd = pkt.cmd();
        let idx = cmd.index();
        let blk_addr = pkt.block_addr(self.blk_size);
        let mem = self.mem_port()?;

        if pkt.is_write() && pkt.req().is_locked() {
            pkt.req_mut().set_sc_result(1);
        }

        if pkt.is_uncacheable() || fabric.memory_mode().bypass_caches() {
            self.stats.uncacheable[idx] += 1;
            let latency = fabric.send_atomic(mem, pkt)?;
            return Ok(self.hit_latency + latency);
        }

        let hit = match self.tags.access_block(pkt.addr(), now) {
            Some(blk) => blk.satisfy(pkt, now),
            None => false,
        };
        if hit {
            self.stats.hits[idx] += 1;
            if cmd == Command::Writeback {
                pkt.mark_satisfied(&self.name)?;
            } else if pkt.needs_response() {
                pkt.make_atomic_response()?;
            }
            return Ok(self.hit_latency);
        }

        if cmd == Command::Writeback {
            self.stats.misses[idx] += 1;
            let latency = fabric.send_atomic(mem, pkt)?;
            return Ok(self.hit_latency + latency);
        }

        self.stats.misses[idx] += 1;
        if let Some(limit) = self.max_miss_count {
            if self.stats.total_misses() >= limit {
                fabric.exit_simulation(ExitReason::MaxMissCount {
                    cache: self.name.clone(),
                });
            }
        }

        let state = self.tags.status(blk_addr);
        let bus_cmd = self.coherence.get_bus_cmd(cmd, state);
        let flags = pkt.req().flags() - RequestFlags::LOCKED;
        let req = pkt.req().derive(blk_addr, self.blk_size, flags, now);
        let mut bus_pkt = Packet::with_range(bus_cmd, req, blk_addr, self.blk_size);
        bus_pkt.set_flags(PacketFlags::CACHE_LINE_FILL);
        bus_pkt.allocate();

        let latency = fabric.send_atomic(mem, &mut bus_pkt)?;
        match bus_pkt.result {
            PacketResult::Success => {}
            PacketResult::Nacked => {
                return Err(SimError::Unsupported(format!(
                    "{}: atomic {} 0x{:08X} was NACKed",
                    self.name, bus_cmd, blk_addr
                )))
            }
            result => {
                pkt.result = result;
                if pkt.needs_response() {
                    pkt.make_atomic_response()?;
                }
                return Ok(self.hit_latency + latency);
            }
        }

        let new_state = self.coherence.get_new_state(&bus_pkt, state)?;
        self.fill(fabric, &bus_pkt, blk_addr, new_state, true)?;

        let satisfied = match self.tags.access_block(blk_addr, now) {
            Some(blk) => blk.satisfy(pkt, now),
            None => false,
        };
        if !satisfied {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                cmd,
                new_state.state_name(),
                "filled line cannot satisfy the access",
            ));
        }
        if pkt.needs_response() {
            pkt.make_atomic_response()?;
        }
        Ok(self.hit_latency + latency)
    }

    /// Patch a functional packet with the data this cache holds
    ///
    /// Reads see, oldest to newest: pending writebacks, the line, then
    /// writes waiting on a miss. Writes update the line and every pending
    /// packet carrying data for it.
    pub(super) fn functional_overlay(&mut self, pkt: &mut Packet) {
        let blk_addr = pkt.block_addr(self.blk_size);
        let writes = self.miss_queue.find_writes(blk_addr);

        if pkt.is_write() {
            if let Some(blk) = self.tags.find_block_mut(blk_addr) {
                copy_packet_into_line(pkt, blk_addr, &mut blk.data);
            }
            for id in writes {
                if let Some(wb) = self.miss_queue.mshr_mut(id).and_then(|m| m.pkt.as_mut()) {
                    pkt.fix_packet(wb);
                }
            }
            return;
        }

        for id in writes {
            if let Some(wb) = self.miss_queue.mshr_mut(id).and_then(|m| m.pkt.as_mut()) {
                pkt.fix_packet(wb);
            }
        }
        if let Some(blk) = self.tags.find_block(blk_addr) {
            if blk.status.contains(BlkStatus::VALID) {
                copy_line_into(blk.addr, &blk.data, pkt);
            }
        }
        let mshr_id = self.miss_queue.find_mshr(blk_addr).map(|m| m.id());
        if let Some(mshr) = mshr_id.and_then(|id| self.miss_queue.mshr_mut(id)) {
            for target in mshr.targets.iter_mut().filter(|t| t.is_write()) {
                pkt.fix_packet(target);
            }
        }
    }
}
