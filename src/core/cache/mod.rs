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

//! Cache stage
//!
//! A [`Cache`] sits between an upper requester (a CPU port, or a traffic
//! generator) on its `cpu_side` and a snooping bus on its `mem_side`. It is
//! generic over the three policies it is built from:
//!
//! - [`TagStore`]: where lines live and which one is evicted
//! - [`MissBuffer`]: how outstanding transactions are tracked
//! - [`CoherenceProtocol`]: bus commands, fill states and snoop answers
//!
//! The timing path lives in `access`, the snoop, atomic and functional paths
//! in `probe`.

mod access;
pub mod blk;
pub mod coherence;
pub mod miss_queue;
pub mod mshr;
mod probe;
pub mod stats;
pub mod tags;

#[cfg(test)]
mod tests;

use std::any::Any;
use std::collections::VecDeque;

use self::coherence::{CoherenceProtocol, ProtocolKind};
use self::miss_queue::{BlockedCause, MissBuffer, MissQueue};
use self::stats::CacheStats;
use self::tags::{LruTags, TagStore};
use crate::core::error::{Result, SimError};
use crate::core::mem::packet::Packet;
use crate::core::mem::port::{Delivery, ObjectId, PortRef, SnoopReply, StatusChange};
use crate::core::sim::fabric::{Fabric, ObjectEvent, SimObject};
use crate::core::sim::stats::StatsSink;
use crate::core::timing::{EventHandle, Tick};

pub use self::blk::{BlkStatus, CacheBlk};

/// Name of the port facing the requester
pub const CPU_SIDE: &str = "cpu_side";
/// Name of the port facing the bus
pub const MEM_SIDE: &str = "mem_side";

/// Cache built from configuration
pub type BasicCache = Cache<LruTags, MissQueue, Box<dyn CoherenceProtocol>>;

/// Construction parameters for a [`BasicCache`]
#[derive(Debug, Clone, PartialEq)]
pub struct CacheParams {
    pub name: String,
    /// Capacity in bytes
    pub size: usize,
    pub assoc: usize,
    pub blk_size: usize,
    /// Ticks from access to response on a hit
    pub hit_latency: Tick,
    pub mshrs: usize,
    pub targets_per_mshr: usize,
    pub write_buffers: usize,
    pub protocol: ProtocolKind,
    /// Pass invalidations up to the requester
    pub propagate_invalidates: bool,
    /// Stop the simulation after this many misses
    pub max_miss_count: Option<u64>,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            size: 32 * 1024,
            assoc: 2,
            blk_size: 64,
            hit_latency: 1,
            mshrs: 4,
            targets_per_mshr: 8,
            write_buffers: 8,
            protocol: ProtocolKind::Mesi,
            propagate_invalidates: true,
            max_miss_count: None,
        }
    }
}

/// Snooping cache
pub struct Cache<T, B, C> {
    name: String,
    id: Option<ObjectId>,
    tags: T,
    miss_queue: B,
    coherence: C,
    blk_size: usize,
    hit_latency: Tick,

    cpu_side: Option<PortRef>,
    mem_side: Option<PortRef>,

    /// Resources currently exhausted; new requests are refused while set
    blocked: BlockedCause,
    /// A requester was refused and is owed a retry
    must_send_retry: bool,
    /// The bus refused our last request
    mem_waiting_retry: bool,
    /// Pending send event and its tick
    send_event: Option<(EventHandle, Tick)>,
    /// Packets ready to go up, oldest first
    cpu_resp_queue: VecDeque<Packet>,
    /// Responses scheduled but not yet queued
    responses_in_flight: usize,

    max_miss_count: Option<u64>,
    draining: bool,
    stats: CacheStats,
}

impl BasicCache {
    /// Build an LRU cache with a miss queue and the configured protocol
    pub fn from_params(params: &CacheParams) -> Result<Self> {
        if params.mshrs == 0 || params.targets_per_mshr == 0 || params.write_buffers == 0 {
            return Err(SimError::Config(format!(
                "{}: MSHR, target and write buffer counts must be non-zero",
                params.name
            )));
        }
        let tags = LruTags::new(params.size, params.assoc, params.blk_size)?;
        let miss_queue = MissQueue::new(
            &params.name,
            params.mshrs,
            params.targets_per_mshr,
            params.write_buffers,
        );
        let coherence = params.protocol.build(params.propagate_invalidates);
        let mut cache = Cache::new(&params.name, tags, miss_queue, coherence, params.hit_latency);
        cache.max_miss_count = params.max_miss_count;
        Ok(cache)
    }
}

impl<T: TagStore, B: MissBuffer, C: CoherenceProtocol> Cache<T, B, C> {
    pub fn new(name: &str, tags: T, miss_queue: B, coherence: C, hit_latency: Tick) -> Self {
        let blk_size = tags.blk_size();
        Self {
            name: name.to_string(),
            id: None,
            tags,
            miss_queue,
            coherence,
            blk_size,
            hit_latency,
            cpu_side: None,
            mem_side: None,
            blocked: BlockedCause::empty(),
            must_send_retry: false,
            mem_waiting_retry: false,
            send_event: None,
            cpu_resp_queue: VecDeque::new(),
            responses_in_flight: 0,
            max_miss_count: None,
            draining: false,
            stats: CacheStats::new(),
        }
    }

    pub fn set_max_miss_count(&mut self, limit: Option<u64>) {
        self.max_miss_count = limit;
    }

    pub fn tags(&self) -> &T {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut T {
        &mut self.tags
    }

    pub fn miss_queue(&self) -> &B {
        &self.miss_queue
    }

    pub fn coherence(&self) -> &C {
        &self.coherence
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn blk_size(&self) -> usize {
        self.blk_size
    }

    pub fn hit_latency(&self) -> Tick {
        self.hit_latency
    }

    pub fn blocked(&self) -> BlockedCause {
        self.blocked
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    fn object_id(&self) -> Result<ObjectId> {
        self.id
            .ok_or_else(|| SimError::Config(format!("{}: used before init", self.name)))
    }

    fn cpu_port(&self) -> Result<PortRef> {
        self.cpu_side.ok_or_else(|| SimError::UnboundPort {
            component: self.name.clone(),
            port: CPU_SIDE.to_string(),
        })
    }

    fn mem_port(&self) -> Result<PortRef> {
        self.mem_side.ok_or_else(|| SimError::UnboundPort {
            component: self.name.clone(),
            port: MEM_SIDE.to_string(),
        })
    }

    /// Outstanding work that keeps the cache from being drained
    fn busy(&self) -> bool {
        self.miss_queue.outstanding() > 0
            || !self.cpu_resp_queue.is_empty()
            || self.responses_in_flight > 0
    }

    fn check_drained(&mut self, fabric: &mut Fabric) {
        if self.draining && !self.busy() {
            log::debug!("{}: drained", self.name);
            self.draining = false;
            fabric.signal_drained();
        }
    }

    /// Re-derive the blocked state from the miss queue
    ///
    /// A requester refused while blocked gets its retry once every cause
    /// has cleared.
    fn update_blocked(&mut self, fabric: &mut Fabric) -> Result<()> {
        let causes = self.miss_queue.blocked_causes();
        if causes != self.blocked {
            log::debug!("{}: blocked {:?} -> {:?}", self.name, self.blocked, causes);
        }
        let was_blocked = !self.blocked.is_empty();
        self.blocked = causes;

        if was_blocked && causes.is_empty() && self.must_send_retry {
            self.must_send_retry = false;
            self.stats.retries_sent += 1;
            let port = self.cpu_port()?;
            fabric.send_retry(port)?;
        }
        Ok(())
    }
}

impl<T, B, C> SimObject for Cache<T, B, C>
where
    T: TagStore + 'static,
    B: MissBuffer + 'static,
    C: CoherenceProtocol + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_port(&mut self, name: &str, port: PortRef) -> Result<()> {
        match name {
            CPU_SIDE => self.cpu_side = Some(port),
            MEM_SIDE => self.mem_side = Some(port),
            _ => {
                return Err(SimError::UnknownPort {
                    component: self.name.clone(),
                    port: name.to_string(),
                })
            }
        }
        Ok(())
    }

    fn init(&mut self, id: ObjectId, _fabric: &mut Fabric) -> Result<()> {
        self.id = Some(id);
        self.cpu_port()?;
        self.mem_port()?;
        log::debug!(
            "{}: {} bytes/line, {} coherence",
            self.name,
            self.blk_size,
            self.coherence.name()
        );
        Ok(())
    }

    fn recv_timing(&mut self, fabric: &mut Fabric, port: PortRef, pkt: Packet) -> Result<Delivery> {
        if Some(port) == self.cpu_side {
            self.access(fabric, pkt)
        } else {
            self.handle_response(fabric, pkt)?;
            Ok(Delivery::Accepted)
        }
    }

    fn recv_retry(&mut self, fabric: &mut Fabric, port: PortRef) -> Result<()> {
        if Some(port) == self.mem_side {
            log::trace!("{}: bus retry", self.name);
            self.mem_waiting_retry = false;
            self.send_requests(fabric)
        } else {
            self.send_responses(fabric)
        }
    }

    fn recv_atomic(&mut self, fabric: &mut Fabric, port: PortRef, pkt: &mut Packet) -> Result<Tick> {
        if Some(port) != self.cpu_side {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                "mem_side",
                "atomic request arrived on the bus side",
            ));
        }
        self.probe(fabric, pkt)
    }

    fn recv_functional(&mut self, fabric: &mut Fabric, port: PortRef, pkt: &mut Packet) -> Result<()> {
        if Some(port) == self.cpu_side {
            let mem = self.mem_port()?;
            fabric.send_functional(mem, pkt)?;
        }
        self.functional_overlay(pkt);
        Ok(())
    }

    fn recv_snoop(&mut self, fabric: &mut Fabric, _port: PortRef, pkt: &mut Packet) -> Result<SnoopReply> {
        self.snoop(fabric, pkt)
    }

    fn recv_status_change(&mut self, fabric: &mut Fabric, port: PortRef, status: StatusChange) -> Result<()> {
        if Some(port) == self.mem_side {
            if let Some(cpu) = self.cpu_side {
                fabric.send_status_change(cpu, status)?;
            }
        }
        Ok(())
    }

    fn process_event(&mut self, fabric: &mut Fabric, event: ObjectEvent) -> Result<()> {
        match event {
            ObjectEvent::SendRequests => {
                self.send_event = None;
                self.send_requests(fabric)
            }
            ObjectEvent::Respond(pkt) => {
                self.responses_in_flight = self.responses_in_flight.saturating_sub(1);
                self.cpu_resp_queue.push_back(pkt);
                self.send_responses(fabric)
            }
            other => Err(SimError::Unsupported(format!(
                "{}: unexpected event {:?}",
                self.name, other
            ))),
        }
    }

    fn drain(&mut self, _fabric: &mut Fabric) -> Result<usize> {
        if self.busy() {
            log::debug!(
                "{}: draining {} outstanding transactions",
                self.name,
                self.miss_queue.outstanding()
            );
            self.draining = true;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn resume(&mut self, _fabric: &mut Fabric) -> Result<()> {
        self.draining = false;
        Ok(())
    }

    fn dump_stats(&self, sink: &mut dyn StatsSink) {
        self.stats.dump(&self.name, sink);

        let mq = self.miss_queue.stats();
        sink.record(&format!("{}.mshr.merges", self.name), mq.mshr_hits);
        sink.record(&format!("{}.mshr.allocations", self.name), mq.mshr_misses);
        sink.record(&format!("{}.mshr.reissues", self.name), mq.reissues);
        sink.record(&format!("{}.mshr.refused_sends", self.name), mq.refused_sends);

        let coh = self.coherence.stats();
        sink.record(&format!("{}.coherence.snoops", self.name), coh.snoops);
        sink.record(&format!("{}.coherence.supplies", self.name), coh.supplies);
        sink.record(&format!("{}.coherence.invalidations", self.name), coh.invalidations);
        sink.record(&format!("{}.coherence.shared_asserted", self.name), coh.shared_asserted);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
