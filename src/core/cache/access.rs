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

//! Timing path: requests from above, responses from below, and the send
//! queue toward the bus

use super::blk::{copy_packet_into_line, BlkStatus};
use super::coherence::CoherenceProtocol;
use super::miss_queue::MissBuffer;
use super::mshr::{MshrId, MshrKind};
use super::tags::{Evicted, TagStore};
use super::Cache;
use crate::core::error::{Result, SimError};
use crate::core::mem::packet::{Command, Packet, PacketResult};
use crate::core::mem::port::{Delivery, PortRef};
use crate::core::mem::request::{Request, RequestFlags};
use crate::core::mem::Addr;
use crate::core::sim::fabric::{ExitReason, Fabric, ObjectEvent};
use crate::core::timing::Tick;

impl<T: TagStore, B: MissBuffer, C: CoherenceProtocol> Cache<T, B, C> {
    /// Handle a timing request from the requester
    pub(super) fn access(&mut self, fabric: &mut Fabric, mut pkt: Packet) -> Result<Delivery> {
        if !pkt.is_request() {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                "cpu_side",
                "response arrived from the requester",
            ));
        }
        if self.is_blocked() {
            log::trace!(
                "{}: blocked ({:?}), refusing {} 0x{:08X}",
                self.name,
                self.blocked,
                pkt.cmd(),
                pkt.addr()
            );
            self.must_send_retry = true;
            self.stats.blocked_events += 1;
            return Ok(Delivery::Refused(pkt));
        }

        let now = fabric.now();
        let cmd = pkt.cmd();
        let idx = cmd.index();
        let blk_addr = pkt.block_addr(self.blk_size);

        if pkt.is_write() && pkt.req().is_locked() {
            pkt.req_mut().set_sc_result(1);
        }

        if cmd == Command::WriteInvalidateReq && self.miss_queue.find_mshr(blk_addr).is_some() {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                cmd,
                self.tags.status(blk_addr).state_name(),
                "write-invalidate to a line with an outstanding miss",
            ));
        }

        if pkt.is_uncacheable() || fabric.memory_mode().bypass_caches() {
            self.stats.uncacheable[idx] += 1;
            let ready = now + self.hit_latency;
            self.miss_queue.handle_uncacheable(pkt, ready)?;
            self.update_blocked(fabric)?;
            self.schedule_send(fabric, ready)?;
            return Ok(Delivery::Accepted);
        }

        let hit = match self.tags.access_block(pkt.addr(), now) {
            Some(blk) => blk.satisfy(&mut pkt, now),
            None => false,
        };
        if hit {
            self.stats.hits[idx] += 1;
            log::trace!("{}: hit {} 0x{:08X}", self.name, cmd, pkt.addr());
            if cmd == Command::Writeback {
                pkt.mark_satisfied(&self.name)?;
                return Ok(Delivery::Accepted);
            }
            self.respond(fabric, pkt, now + self.hit_latency)?;
            return Ok(Delivery::Accepted);
        }

        if self.is_fast_write(&pkt) {
            if self.miss_queue.find_mshr(blk_addr).is_some() {
                return Err(SimError::violation(
                    &self.name,
                    pkt.addr(),
                    cmd,
                    self.tags.status(blk_addr).state_name(),
                    "full-line write to a line with an outstanding miss",
                ));
            }
            if self.miss_queue.find_writes(blk_addr).is_empty() {
                self.stats.fast_writes += 1;
                log::trace!("{}: fast write 0x{:08X}", self.name, blk_addr);
                let (blk, evicted) = self.tags.allocate(blk_addr, now);
                copy_packet_into_line(&pkt, blk_addr, &mut blk.data);
                blk.set_state(BlkStatus::MODIFIED);
                blk.status |= BlkStatus::REFERENCED;
                if let Some(evicted) = evicted {
                    self.evict(fabric, evicted, false)?;
                }
                self.respond(fabric, pkt, now + self.hit_latency)?;
                return Ok(Delivery::Accepted);
            }
        }

        if cmd == Command::Writeback {
            // Writebacks from above that miss here continue downward.
            self.stats.misses[idx] += 1;
            self.miss_queue.do_writeback(pkt, now + self.hit_latency);
            self.update_blocked(fabric)?;
            self.schedule_send(fabric, now + self.hit_latency)?;
            return Ok(Delivery::Accepted);
        }

        self.stats.misses[idx] += 1;
        log::trace!("{}: miss {} 0x{:08X}", self.name, cmd, pkt.addr());
        if let Some(limit) = self.max_miss_count {
            if self.stats.total_misses() >= limit {
                fabric.exit_simulation(ExitReason::MaxMissCount {
                    cache: self.name.clone(),
                });
            }
        }

        let state = self.tags.status(blk_addr);
        let ready = now + self.hit_latency;
        let outcome = self
            .miss_queue
            .handle_miss(pkt, self.blk_size, ready, &self.coherence, state)?;
        if outcome.merged {
            self.stats.mshr_hits[idx] += 1;
        } else {
            self.schedule_send(fabric, ready)?;
        }
        self.update_blocked(fabric)?;
        Ok(Delivery::Accepted)
    }

    /// Whether `pkt` may allocate its line without a bus transaction
    fn is_fast_write(&self, pkt: &Packet) -> bool {
        self.coherence.allow_fast_writes()
            && matches!(pkt.cmd(), Command::WriteReq | Command::WriteInvalidateReq)
            && pkt.size() == self.blk_size
            && pkt.offset(self.blk_size) == 0
    }

    /// Turn `pkt` into a response and deliver it at `when`
    pub(super) fn respond(&mut self, fabric: &mut Fabric, mut pkt: Packet, when: Tick) -> Result<()> {
        if !pkt.needs_response() {
            return Ok(());
        }
        pkt.make_timing_response()?;
        self.schedule_response(fabric, pkt, when)
    }

    fn schedule_response(&mut self, fabric: &mut Fabric, pkt: Packet, when: Tick) -> Result<()> {
        let id = self.object_id()?;
        self.responses_in_flight += 1;
        fabric.schedule_at(id, when.max(fabric.now()), ObjectEvent::Respond(pkt))?;
        Ok(())
    }

    /// Send queued packets to the requester until it refuses one
    pub(super) fn send_responses(&mut self, fabric: &mut Fabric) -> Result<()> {
        let port = self.cpu_port()?;
        while let Some(pkt) = self.cpu_resp_queue.pop_front() {
            match fabric.send_timing(port, pkt)? {
                Delivery::Accepted => {}
                Delivery::Refused(pkt) => {
                    log::debug!("{}: requester busy, waiting for retry", self.name);
                    self.cpu_resp_queue.push_front(pkt);
                    break;
                }
            }
        }
        self.check_drained(fabric);
        Ok(())
    }

    /// Handle a response from the bus
    pub(super) fn handle_response(&mut self, fabric: &mut Fabric, pkt: Packet) -> Result<()> {
        let now = fabric.now();
        let Some(id) = pkt.sender_state else {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                "mem_side",
                "response without a miss entry",
            ));
        };
        let Some(mshr) = self.miss_queue.mshr(id) else {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                "mem_side",
                format!("response for stale miss entry {:?}", id),
            ));
        };
        if pkt.result == PacketResult::Nacked {
            return Err(SimError::Unsupported(format!(
                "{}: {} 0x{:08X} was NACKed by an agent behind another bus; \
                 cross-bus NACK retry is not implemented",
                self.name,
                pkt.cmd(),
                pkt.addr()
            )));
        }

        let blk_addr = mshr.addr;
        let fills = pkt.result == PacketResult::Success
            && mshr.kind == MshrKind::Miss
            && pkt.is_cache_fill()
            && !pkt.is_no_allocate();
        // A snoop queued an invalidate behind this fill; the line must not
        // become writable before it applies.
        let invalidate_pending = mshr
            .targets
            .iter()
            .any(|t| t.cmd() == Command::InvalidateReq);

        log::trace!(
            "{}: response {} 0x{:08X} ({:?})",
            self.name,
            pkt.cmd(),
            pkt.addr(),
            pkt.result
        );

        let old = self.tags.status(blk_addr);
        if fills && pkt.cmd() == Command::UpgradeResp && !old.is_valid() {
            // The line was evicted while the upgrade was on the bus. Nothing
            // is installed; the targets miss again and the entry goes back
            // out as a full fill.
            self.stats.upgrade_refetches += 1;
            log::debug!(
                "{}: 0x{:08X} evicted under its upgrade, refetching",
                self.name,
                blk_addr
            );
        } else if fills {
            let mut new_state = self.coherence.get_new_state(&pkt, old)?;
            if invalidate_pending {
                new_state -= BlkStatus::WRITABLE;
            }
            self.fill(fabric, &pkt, blk_addr, new_state, false)?;
        }

        let outcome = self.miss_queue.handle_response(pkt, &mut self.tags, now)?;
        let when = now + self.hit_latency;
        for resp in outcome.responses {
            self.schedule_response(fabric, resp, when)?;
        }
        if outcome.reissued {
            self.schedule_send(fabric, now)?;
        }
        self.update_blocked(fabric)?;
        self.check_drained(fabric);
        Ok(())
    }

    /// Install the line carried by fill response `pkt`
    ///
    /// An upgrade keeps the data already in the line. With `direct`, dirty
    /// victims are written back synchronously (atomic mode) instead of being
    /// queued.
    pub(super) fn fill(
        &mut self,
        fabric: &mut Fabric,
        pkt: &Packet,
        blk_addr: Addr,
        new_state: BlkStatus,
        direct: bool,
    ) -> Result<()> {
        let now = fabric.now();
        let blk_size = self.blk_size;
        let keep_data = pkt.cmd() == Command::UpgradeResp;
        if keep_data && !self.tags.status(blk_addr).is_valid() {
            return Err(SimError::violation(
                &self.name,
                blk_addr,
                pkt.cmd(),
                "I",
                "upgrade response for a line that is no longer present",
            ));
        }
        if !keep_data && pkt.data().len() < blk_size {
            return Err(SimError::violation(
                &self.name,
                blk_addr,
                pkt.cmd(),
                self.tags.status(blk_addr).state_name(),
                format!("fill carries {} of {} bytes", pkt.data().len(), blk_size),
            ));
        }
        let (blk, evicted) = self.tags.allocate(blk_addr, now);
        if !keep_data {
            blk.data.copy_from_slice(&pkt.data()[..blk_size]);
        }
        log::trace!(
            "{}: fill 0x{:08X} {} -> {}",
            self.name,
            blk_addr,
            blk.status.state_name(),
            new_state.state_name()
        );
        blk.set_state(new_state);
        blk.ref_count = 0;

        if let Some(evicted) = evicted {
            self.evict(fabric, evicted, direct)?;
        }
        Ok(())
    }

    fn evict(&mut self, fabric: &mut Fabric, evicted: Evicted, direct: bool) -> Result<()> {
        self.stats.replacements += 1;
        if evicted.status.is_dirty() {
            log::trace!("{}: evicting dirty 0x{:08X}", self.name, evicted.addr);
            self.writeback_line(fabric, evicted.addr, &evicted.data, direct)?;
        }
        Ok(())
    }

    /// Write a line's data to the next level
    pub(super) fn writeback_line(
        &mut self,
        fabric: &mut Fabric,
        addr: Addr,
        data: &[u8],
        direct: bool,
    ) -> Result<()> {
        let now = fabric.now();
        self.stats.writebacks += 1;

        let req = Request::new_physical(addr, self.blk_size, RequestFlags::empty(), now);
        let mut pkt = Packet::with_range(Command::Writeback, req, addr, self.blk_size);
        pkt.set_data(data);

        if direct {
            let port = self.mem_port()?;
            fabric.send_atomic(port, &mut pkt)?;
            return Ok(());
        }
        self.miss_queue.do_writeback(pkt, now);
        self.update_blocked(fabric)?;
        self.schedule_send(fabric, now)
    }

    /// Make sure a send attempt happens no later than `when`
    pub(super) fn schedule_send(&mut self, fabric: &mut Fabric, when: Tick) -> Result<()> {
        if self.mem_waiting_retry {
            return Ok(());
        }
        let when = when.max(fabric.now());
        if let Some((handle, at)) = self.send_event {
            if at <= when && fabric.is_scheduled(handle) {
                return Ok(());
            }
            fabric.deschedule(handle);
        }
        let id = self.object_id()?;
        let handle = fabric.schedule_at(id, when, ObjectEvent::SendRequests)?;
        self.send_event = Some((handle, when));
        Ok(())
    }

    /// Offer ready entries to the bus until it refuses one
    pub(super) fn send_requests(&mut self, fabric: &mut Fabric) -> Result<()> {
        let port = self.mem_port()?;
        let now = fabric.now();

        while !self.mem_waiting_retry {
            let Some(id) = self.miss_queue.next_ready(now) else {
                break;
            };
            self.refresh_bus_cmd(id)?;
            let pkt = self.miss_queue.get_packet(id)?;

            if fabric.memory_mode().is_atomic_mode() {
                self.send_atomic_entry(fabric, port, id, pkt)?;
                continue;
            }

            log::trace!("{}: sending {} 0x{:08X}", self.name, pkt.cmd(), pkt.addr());
            match fabric.send_timing(port, pkt)? {
                Delivery::Accepted => {
                    self.miss_queue.mark_in_service(id)?;
                    self.update_blocked(fabric)?;
                }
                Delivery::Refused(pkt) => {
                    log::debug!(
                        "{}: bus refused {} 0x{:08X}, waiting for retry",
                        self.name,
                        pkt.cmd(),
                        pkt.addr()
                    );
                    self.miss_queue.restore_packet(pkt)?;
                    self.mem_waiting_retry = true;
                }
            }
        }

        if !self.mem_waiting_retry {
            if let Some(at) = self.miss_queue.next_ready_time() {
                if at > now {
                    self.schedule_send(fabric, at)?;
                }
            }
        }
        self.check_drained(fabric);
        Ok(())
    }

    /// Pick the bus command for a miss from the line's current state
    fn refresh_bus_cmd(&mut self, id: MshrId) -> Result<()> {
        let Some(mshr) = self.miss_queue.mshr(id) else {
            return Ok(());
        };
        if mshr.kind != MshrKind::Miss || !mshr.cache_fill {
            return Ok(());
        }
        let state = self.tags.status(mshr.addr);
        let cmd = self.coherence.get_bus_cmd(mshr.orig_cmd, state);
        if cmd != mshr.bus_cmd {
            log::trace!("{}: 0x{:08X} now needs {}", self.name, mshr.addr, cmd);
        }
        self.miss_queue.set_bus_cmd(id, cmd)
    }

    fn send_atomic_entry(
        &mut self,
        fabric: &mut Fabric,
        port: PortRef,
        id: MshrId,
        mut pkt: Packet,
    ) -> Result<()> {
        self.miss_queue.mark_in_service(id)?;
        fabric.send_atomic(port, &mut pkt)?;
        if pkt.is_response() {
            self.handle_response(fabric, pkt)?;
        }
        self.update_blocked(fabric)
    }
}
