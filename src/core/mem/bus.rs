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

//! Snooping bus
//!
//! Connects any number of caching agents (`port[0]`, `port[1]`, ...) to one
//! memory (`mem`). Every request from an agent is snooped by all the other
//! agents before it reaches memory:
//!
//! - if a snooper supplies the data, the bus answers the requester itself
//! - if a snooper NACKs, the request is refused and retried later
//! - otherwise the request continues to memory
//!
//! The bus carries one transaction at a time. A sender that finds it busy is
//! refused and queued; when the bus goes idle the queued senders get their
//! retries one at a time, oldest first.

use std::any::Any;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::packet::{Packet, PacketFlags};
use super::port::{Delivery, ObjectId, PortRef, SnoopReply, StatusChange};
use crate::core::error::{Result, SimError};
use crate::core::sim::fabric::{Fabric, ObjectEvent, SimObject};
use crate::core::sim::stats::StatsSink;
use crate::core::timing::{EventHandle, Tick};

/// Name of the memory-facing port
pub const MEM_PORT: &str = "mem";

/// Name of agent port `i`
pub fn agent_port(i: usize) -> String {
    format!("port[{}]", i)
}

/// Bus timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusParams {
    /// Ticks per bus cycle
    pub clock: Tick,
    /// Bytes moved per cycle
    pub width: usize,
    /// Cycles spent on the address phase of every transaction
    pub header_cycles: Tick,
}

impl Default for BusParams {
    fn default() -> Self {
        Self {
            clock: 1,
            width: 8,
            header_cycles: 1,
        }
    }
}

/// Bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub requests: u64,
    pub responses: u64,
    pub snoops: u64,
    pub supplies: u64,
    pub nacks: u64,
    pub busy_refusals: u64,
    pub retries: u64,
}

pub struct CoherentBus {
    name: String,
    id: Option<ObjectId>,
    params: BusParams,
    agents: Vec<Option<PortRef>>,
    mem: Option<PortRef>,
    tick_next_idle: Tick,
    /// Agents refused while the bus was busy, oldest first
    retry_list: VecDeque<usize>,
    /// Agent whose retry is in flight, and the tick it was granted
    granted: Option<(usize, Tick)>,
    idle_event: Option<EventHandle>,
    /// Responses an agent refused, per agent
    stalled: Vec<VecDeque<Packet>>,
    responses_in_flight: usize,
    draining: bool,
    stats: BusStats,
}

impl CoherentBus {
    pub fn new(name: &str, params: BusParams) -> Self {
        Self {
            name: name.to_string(),
            id: None,
            params,
            agents: Vec::new(),
            mem: None,
            tick_next_idle: 0,
            retry_list: VecDeque::new(),
            granted: None,
            idle_event: None,
            stalled: Vec::new(),
            responses_in_flight: 0,
            draining: false,
            stats: BusStats::default(),
        }
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn num_agents(&self) -> usize {
        self.agents.len()
    }

    fn object_id(&self) -> Result<ObjectId> {
        self.id
            .ok_or_else(|| SimError::Config(format!("{}: used before init", self.name)))
    }

    fn mem_port(&self) -> Result<PortRef> {
        self.mem.ok_or_else(|| SimError::UnboundPort {
            component: self.name.clone(),
            port: MEM_PORT.to_string(),
        })
    }

    fn agent_index(&self, port: PortRef) -> Option<usize> {
        self.agents.iter().position(|p| *p == Some(port))
    }

    fn agent(&self, i: usize) -> Result<PortRef> {
        self.agents
            .get(i)
            .copied()
            .flatten()
            .ok_or_else(|| SimError::UnboundPort {
                component: self.name.clone(),
                port: agent_port(i),
            })
    }

    /// First bus clock edge at or after `tick`
    fn next_cycle(&self, tick: Tick) -> Tick {
        let clock = self.params.clock.max(1);
        tick.div_ceil(clock) * clock
    }

    /// Occupy the bus for `pkt` starting at `now`
    fn occupy(&mut self, now: Tick, pkt: &Packet) {
        let data_cycles = if pkt.cmd().has_data() {
            pkt.size().div_ceil(self.params.width.max(1)) as Tick
        } else {
            0
        };
        let cycles = self.params.header_cycles + data_cycles;
        self.tick_next_idle = self.next_cycle(now) + cycles * self.params.clock.max(1);
    }

    fn is_busy(&self, now: Tick) -> bool {
        now < self.tick_next_idle
    }

    fn is_granted(&self, i: usize) -> bool {
        matches!(self.granted, Some((g, _)) if g == i)
    }

    /// Whether agents other than `i` are owed the bus at `now`
    ///
    /// A grant is only honored during the tick it was issued.
    fn others_waiting(&self, i: usize, now: Tick) -> bool {
        let live_grant = matches!(self.granted, Some((g, at)) if g != i && at == now);
        live_grant || (!self.retry_list.is_empty() && !self.is_granted(i))
    }

    /// Refuse agent `i` and remember to retry it
    fn refuse(&mut self, fabric: &mut Fabric, i: usize) -> Result<()> {
        if self.is_granted(i) {
            self.granted = None;
        }
        if !self.retry_list.contains(&i) {
            self.retry_list.push_back(i);
        }
        self.schedule_idle(fabric)
    }

    fn schedule_idle(&mut self, fabric: &mut Fabric) -> Result<()> {
        if let Some(handle) = self.idle_event {
            if fabric.is_scheduled(handle) {
                return Ok(());
            }
        }
        let id = self.object_id()?;
        let when = self.tick_next_idle.max(fabric.now());
        self.idle_event = Some(fabric.schedule_at(id, when, ObjectEvent::BusIdle)?);
        Ok(())
    }

    /// The bus went idle: hand the next waiting agent its retry
    fn bus_idle(&mut self, fabric: &mut Fabric) -> Result<()> {
        self.idle_event = None;
        if self.is_busy(fabric.now()) {
            return self.schedule_idle(fabric);
        }
        let Some(i) = self.retry_list.pop_front() else {
            self.granted = None;
            return Ok(());
        };
        log::trace!("{}: retry to {}", self.name, agent_port(i));
        self.granted = Some((i, fabric.now()));
        self.stats.retries += 1;
        let port = self.agent(i)?;
        fabric.send_retry(port)?;
        if !self.retry_list.is_empty() {
            self.schedule_idle(fabric)?;
        }
        Ok(())
    }

    /// Snoop every agent but `from`
    ///
    /// # Returns
    ///
    /// (earliest supply time if someone supplied, whether anyone NACKed)
    fn snoop_peers(
        &mut self,
        fabric: &mut Fabric,
        from: Option<usize>,
        pkt: &mut Packet,
    ) -> Result<(Option<Tick>, bool)> {
        let mut supplied = None;
        let mut nacked = false;
        for j in 0..self.agents.len() {
            if Some(j) == from {
                continue;
            }
            let Some(port) = self.agents[j] else {
                continue;
            };
            self.stats.snoops += 1;
            match fabric.send_snoop(port, pkt)? {
                SnoopReply::Ignored => {}
                SnoopReply::Supplied { ready } => {
                    self.stats.supplies += 1;
                    supplied = Some(supplied.map_or(ready, |t: Tick| t.max(ready)));
                }
                SnoopReply::Nacked => nacked = true,
            }
        }
        Ok((supplied, nacked))
    }

    /// Request from agent `i`
    fn recv_request(&mut self, fabric: &mut Fabric, i: usize, mut pkt: Packet) -> Result<Delivery> {
        let now = fabric.now();
        if self.is_busy(now) || self.others_waiting(i, now) {
            log::trace!("{}: busy, refusing {} from {}", self.name, pkt.cmd(), agent_port(i));
            self.stats.busy_refusals += 1;
            self.refuse(fabric, i)?;
            return Ok(Delivery::Refused(pkt));
        }
        if self.is_granted(i) {
            self.granted = None;
        }

        self.stats.requests += 1;
        pkt.src = Some(i);
        self.occupy(now, &pkt);
        log::trace!(
            "{}: {} 0x{:08X} from {}, idle at {}",
            self.name,
            pkt.cmd(),
            pkt.addr(),
            agent_port(i),
            self.tick_next_idle
        );

        let (supplied, nacked) = self.snoop_peers(fabric, Some(i), &mut pkt)?;

        if nacked && !pkt.is_satisfied() {
            self.stats.nacks += 1;
            log::debug!(
                "{}: {} 0x{:08X} from {} NACKed, will retry",
                self.name,
                pkt.cmd(),
                pkt.addr(),
                agent_port(i)
            );
            pkt.clear_flags(PacketFlags::SATISFIED | PacketFlags::SHARED_LINE | PacketFlags::NACKED_LINE);
            self.refuse(fabric, i)?;
            return Ok(Delivery::Refused(pkt));
        }
        pkt.clear_flags(PacketFlags::NACKED_LINE);

        if let Some(ready) = supplied {
            if pkt.needs_response() {
                pkt.make_timing_response()?;
                let when = ready.max(self.tick_next_idle);
                let id = self.object_id()?;
                self.responses_in_flight += 1;
                fabric.schedule_at(id, when, ObjectEvent::Respond(pkt))?;
            }
        } else {
            let mem = self.mem_port()?;
            if let Delivery::Refused(pkt) = fabric.send_timing(mem, pkt)? {
                return Err(SimError::Unsupported(format!(
                    "{}: memory refused {} 0x{:08X}",
                    self.name,
                    pkt.cmd(),
                    pkt.addr()
                )));
            }
        }

        if !self.retry_list.is_empty() {
            self.schedule_idle(fabric)?;
        }
        Ok(Delivery::Accepted)
    }

    /// Route a response to the agent named by its destination
    fn deliver(&mut self, fabric: &mut Fabric, pkt: Packet) -> Result<()> {
        let Some(i) = pkt.dest.filter(|i| *i < self.agents.len()) else {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                "routing",
                format!("response has no valid destination ({:?})", pkt.dest),
            ));
        };
        if self.stalled.len() < self.agents.len() {
            self.stalled.resize_with(self.agents.len(), VecDeque::new);
        }
        self.stats.responses += 1;
        self.stalled[i].push_back(pkt);
        self.flush(fabric, i)
    }

    fn flush(&mut self, fabric: &mut Fabric, i: usize) -> Result<()> {
        let port = self.agent(i)?;
        while let Some(pkt) = self.stalled.get_mut(i).and_then(|q| q.pop_front()) {
            if let Delivery::Refused(pkt) = fabric.send_timing(port, pkt)? {
                log::debug!("{}: {} refused a response", self.name, agent_port(i));
                self.stalled[i].push_front(pkt);
                break;
            }
        }
        self.check_drained(fabric);
        Ok(())
    }

    fn busy_with_responses(&self) -> bool {
        self.responses_in_flight > 0 || self.stalled.iter().any(|q| !q.is_empty())
    }

    fn check_drained(&mut self, fabric: &mut Fabric) {
        if self.draining && !self.busy_with_responses() {
            self.draining = false;
            fabric.signal_drained();
        }
    }
}

impl SimObject for CoherentBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_port(&mut self, name: &str, port: PortRef) -> Result<()> {
        if name == MEM_PORT {
            self.mem = Some(port);
            return Ok(());
        }
        let index = name
            .strip_prefix("port[")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|n| n.parse::<usize>().ok());
        match index {
            Some(i) => {
                if self.agents.len() <= i {
                    self.agents.resize(i + 1, None);
                }
                self.agents[i] = Some(port);
                Ok(())
            }
            None => Err(SimError::UnknownPort {
                component: self.name.clone(),
                port: name.to_string(),
            }),
        }
    }

    fn init(&mut self, id: ObjectId, _fabric: &mut Fabric) -> Result<()> {
        self.id = Some(id);
        self.mem_port()?;
        self.stalled.resize_with(self.agents.len(), VecDeque::new);
        log::debug!("{}: {} agents, {:?}", self.name, self.agents.len(), self.params);
        Ok(())
    }

    fn recv_timing(&mut self, fabric: &mut Fabric, port: PortRef, pkt: Packet) -> Result<Delivery> {
        if Some(port) == self.mem {
            self.deliver(fabric, pkt)?;
            return Ok(Delivery::Accepted);
        }
        let Some(i) = self.agent_index(port) else {
            return Err(SimError::UnboundPort {
                component: self.name.clone(),
                port: format!("{:?}", port),
            });
        };
        if pkt.is_response() {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                agent_port(i),
                "agents do not send responses over the bus",
            ));
        }
        self.recv_request(fabric, i, pkt)
    }

    fn recv_retry(&mut self, fabric: &mut Fabric, port: PortRef) -> Result<()> {
        match self.agent_index(port) {
            Some(i) => self.flush(fabric, i),
            None => Ok(()),
        }
    }

    fn recv_atomic(&mut self, fabric: &mut Fabric, port: PortRef, pkt: &mut Packet) -> Result<Tick> {
        let from = self.agent_index(port);
        let header = self.params.header_cycles * self.params.clock.max(1);
        self.stats.requests += 1;

        let (supplied, nacked) = self.snoop_peers(fabric, from, pkt)?;
        if nacked && !pkt.is_satisfied() {
            return Err(SimError::Unsupported(format!(
                "{}: atomic {} 0x{:08X} was NACKed",
                self.name,
                pkt.cmd(),
                pkt.addr()
            )));
        }
        pkt.clear_flags(PacketFlags::NACKED_LINE);

        if let Some(ready) = supplied {
            if pkt.needs_response() {
                pkt.make_atomic_response()?;
            }
            return Ok(header + ready.saturating_sub(fabric.now()));
        }
        let mem = self.mem_port()?;
        let latency = fabric.send_atomic(mem, pkt)?;
        Ok(header + latency)
    }

    fn recv_functional(&mut self, fabric: &mut Fabric, port: PortRef, pkt: &mut Packet) -> Result<()> {
        let from = self.agent_index(port);
        let mem = self.mem_port()?;
        fabric.send_functional(mem, pkt)?;
        for j in 0..self.agents.len() {
            if Some(j) == from {
                continue;
            }
            if let Some(peer) = self.agents[j] {
                fabric.send_functional(peer, pkt)?;
            }
        }
        Ok(())
    }

    fn recv_status_change(&mut self, fabric: &mut Fabric, port: PortRef, status: StatusChange) -> Result<()> {
        if Some(port) != self.mem {
            return Ok(());
        }
        for peer in self.agents.clone().into_iter().flatten() {
            fabric.send_status_change(peer, status)?;
        }
        Ok(())
    }

    fn process_event(&mut self, fabric: &mut Fabric, event: ObjectEvent) -> Result<()> {
        match event {
            ObjectEvent::BusIdle => self.bus_idle(fabric),
            ObjectEvent::Respond(pkt) => {
                self.responses_in_flight = self.responses_in_flight.saturating_sub(1);
                self.deliver(fabric, pkt)
            }
            other => Err(SimError::Unsupported(format!(
                "{}: unexpected event {:?}",
                self.name, other
            ))),
        }
    }

    fn drain(&mut self, _fabric: &mut Fabric) -> Result<usize> {
        if self.busy_with_responses() {
            self.draining = true;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn dump_stats(&self, sink: &mut dyn StatsSink) {
        let s = &self.stats;
        for (what, value) in [
            ("requests", s.requests),
            ("responses", s.responses),
            ("snoops", s.snoops),
            ("supplies", s.supplies),
            ("nacks", s.nacks),
            ("busy_refusals", s.busy_refusals),
            ("retries", s.retries),
        ] {
            sink.record(&format!("{}.{}", self.name, what), value);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
