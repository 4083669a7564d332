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

//! Memory traffic generator
//!
//! A [`MemTester`] sits where a CPU would and issues reads and writes on a
//! single port. Tests drive it by hand ([`read`](MemTester::read),
//! [`write`](MemTester::write), the atomic and functional variants); the
//! CLI runs it in random mode, where each tester owns one byte lane of a
//! set of shared lines and checks every read against what it last wrote.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::error::{Result, SimError};
use crate::core::mem::port::ObjectId;
use crate::core::mem::{
    Addr, Command, Delivery, Packet, PacketFlags, PacketResult, PortRef, Request, RequestFlags,
};
use crate::core::sim::fabric::{Fabric, ObjectEvent, SimObject};
use crate::core::sim::stats::StatsSink;
use crate::core::timing::{EventHandle, Tick};

/// Name of the tester's only port
pub const PORT: &str = "port";

/// One completed timing access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub tick: Tick,
    pub cmd: Command,
    pub addr: Addr,
    pub data: u64,
    pub result: PacketResult,
}

/// Random traffic parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficParams {
    /// Accesses to issue in total
    pub accesses: u64,
    pub seed: u64,
    /// First byte of the shared region
    pub base: Addr,
    /// Number of shared lines
    pub lines: u64,
    pub blk_size: usize,
    /// Byte within each line owned by this tester
    pub lane: usize,
    pub percent_writes: u32,
    pub max_outstanding: usize,
    /// Ticks between issue attempts
    pub interval: Tick,
}

impl Default for TrafficParams {
    fn default() -> Self {
        Self {
            accesses: 1000,
            seed: 1,
            base: 0,
            lines: 64,
            blk_size: 64,
            lane: 0,
            percent_writes: 40,
            max_outstanding: 4,
            interval: 1,
        }
    }
}

/// Tester statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TesterStats {
    pub reads_issued: u64,
    pub writes_issued: u64,
    pub completed: u64,
    pub retries: u64,
    pub data_errors: u64,
}

/// xorshift64* generator, reproducible from its seed
#[derive(Debug, Clone)]
struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound.max(1)
    }
}

struct Traffic {
    params: TrafficParams,
    rng: XorShift64,
    issued: u64,
    /// Last value written to each address of the lane
    shadow: HashMap<Addr, u8>,
    /// Addresses with an access in flight
    in_flight: HashSet<Addr>,
}

impl Traffic {
    fn new(params: TrafficParams) -> Self {
        Self {
            rng: XorShift64::new(params.seed),
            params,
            issued: 0,
            shadow: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    fn done_issuing(&self) -> bool {
        self.issued >= self.params.accesses
    }

    fn pick_addr(&mut self) -> Addr {
        let line = self.rng.below(self.params.lines);
        self.params.base + line * self.params.blk_size as Addr + self.params.lane as Addr
    }
}

/// Requester with one port and an in-order send queue
pub struct MemTester {
    name: String,
    id: Option<ObjectId>,
    port: Option<PortRef>,
    master_id: u32,
    queue: VecDeque<Packet>,
    waiting_retry: bool,
    outstanding: usize,
    completions: Vec<Completion>,
    traffic: Option<Traffic>,
    issue_event: Option<EventHandle>,
    draining: bool,
    stats: TesterStats,
}

impl MemTester {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            id: None,
            port: None,
            master_id: 0,
            queue: VecDeque::new(),
            waiting_retry: false,
            outstanding: 0,
            completions: Vec::new(),
            traffic: None,
            issue_event: None,
            draining: false,
            stats: TesterStats::default(),
        }
    }

    /// Tester that generates random lane traffic once started
    pub fn with_traffic(name: &str, params: TrafficParams) -> Self {
        let mut tester = Self::new(name);
        tester.traffic = Some(Traffic::new(params));
        tester
    }

    pub fn set_master_id(&mut self, id: u32) {
        self.master_id = id;
    }

    pub fn stats(&self) -> &TesterStats {
        &self.stats
    }

    /// Completed timing accesses in arrival order
    pub fn completions(&self) -> &[Completion] {
        &self.completions
    }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    /// Timing accesses not yet answered (queued or in flight)
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Whether random traffic has issued and completed everything
    pub fn traffic_done(&self) -> bool {
        self.traffic
            .as_ref()
            .is_none_or(|t| t.done_issuing() && self.outstanding == 0)
    }

    fn object_id(&self) -> Result<ObjectId> {
        self.id
            .ok_or_else(|| SimError::Config(format!("{}: used before init", self.name)))
    }

    fn port(&self) -> Result<PortRef> {
        self.port.ok_or_else(|| SimError::UnboundPort {
            component: self.name.clone(),
            port: PORT.to_string(),
        })
    }

    fn build(&self, cmd: Command, addr: Addr, size: usize, flags: RequestFlags, now: Tick) -> Packet {
        let mut req = Request::new_physical(addr, size, flags, now);
        req.set_master_id(self.master_id);
        let mut pkt = Packet::new(cmd, req);
        pkt.allocate();
        pkt
    }

    // Timing accesses

    /// Queue a timing read
    pub fn read(&mut self, fabric: &mut Fabric, addr: Addr, size: usize) -> Result<()> {
        self.issue(fabric, Command::ReadReq, addr, size, 0, RequestFlags::empty(), PacketFlags::empty())
    }

    /// Queue a timing write of the low `size` bytes of `data`
    pub fn write(&mut self, fabric: &mut Fabric, addr: Addr, size: usize, data: u64) -> Result<()> {
        self.issue(fabric, Command::WriteReq, addr, size, data, RequestFlags::empty(), PacketFlags::empty())
    }

    /// Queue an arbitrary timing request
    #[allow(clippy::too_many_arguments)]
    pub fn issue(
        &mut self,
        fabric: &mut Fabric,
        cmd: Command,
        addr: Addr,
        size: usize,
        data: u64,
        req_flags: RequestFlags,
        pkt_flags: PacketFlags,
    ) -> Result<()> {
        let mut pkt = self.build(cmd, addr, size, req_flags, fabric.now());
        pkt.set_flags(pkt_flags);
        if cmd.is_write() {
            pkt.set_uint(data);
            self.stats.writes_issued += 1;
        } else {
            self.stats.reads_issued += 1;
        }
        if pkt.needs_response() {
            self.outstanding += 1;
        }
        log::trace!("{}: queue {} 0x{:08X}", self.name, cmd, addr);
        self.queue.push_back(pkt);
        self.send_queue(fabric)
    }

    fn send_queue(&mut self, fabric: &mut Fabric) -> Result<()> {
        let port = self.port()?;
        while !self.waiting_retry {
            let Some(pkt) = self.queue.pop_front() else {
                break;
            };
            match fabric.send_timing(port, pkt)? {
                Delivery::Accepted => {}
                Delivery::Refused(pkt) => {
                    log::debug!("{}: {} 0x{:08X} refused", self.name, pkt.cmd(), pkt.addr());
                    self.queue.push_front(pkt);
                    self.waiting_retry = true;
                    self.stats.retries += 1;
                }
            }
        }
        Ok(())
    }

    // Atomic and functional accesses

    /// Read through the atomic path
    ///
    /// # Returns
    ///
    /// The value read and the access latency
    pub fn atomic_read(&mut self, fabric: &mut Fabric, addr: Addr, size: usize) -> Result<(u64, Tick)> {
        let mut pkt = self.build(Command::ReadReq, addr, size, RequestFlags::empty(), fabric.now());
        let latency = fabric.send_atomic(self.port()?, &mut pkt)?;
        Ok((pkt.get_uint(), latency))
    }

    pub fn atomic_write(&mut self, fabric: &mut Fabric, addr: Addr, size: usize, data: u64) -> Result<Tick> {
        let mut pkt = self.build(Command::WriteReq, addr, size, RequestFlags::empty(), fabric.now());
        pkt.set_uint(data);
        fabric.send_atomic(self.port()?, &mut pkt)
    }

    /// Debug read that sees the newest value anywhere in the hierarchy
    pub fn functional_read(&mut self, fabric: &mut Fabric, addr: Addr, size: usize) -> Result<u64> {
        let mut pkt = self.build(Command::ReadReq, addr, size, RequestFlags::empty(), fabric.now());
        fabric.send_functional(self.port()?, &mut pkt)?;
        Ok(pkt.get_uint())
    }

    pub fn functional_write(&mut self, fabric: &mut Fabric, addr: Addr, size: usize, data: u64) -> Result<()> {
        let mut pkt = self.build(Command::WriteReq, addr, size, RequestFlags::empty(), fabric.now());
        pkt.set_uint(data);
        fabric.send_functional(self.port()?, &mut pkt)
    }

    // Random traffic

    /// Begin random traffic `delay` ticks from now
    pub fn start(&mut self, fabric: &mut Fabric, delay: Tick) -> Result<()> {
        if self.traffic.is_some() && self.issue_event.is_none() {
            let id = self.object_id()?;
            self.issue_event = Some(fabric.schedule(id, delay, ObjectEvent::Issue));
        }
        Ok(())
    }

    fn issue_random(&mut self, fabric: &mut Fabric) -> Result<()> {
        self.issue_event = None;
        if self.draining {
            return Ok(());
        }
        let Some(traffic) = self.traffic.as_mut() else {
            return Ok(());
        };
        if traffic.done_issuing() {
            return Ok(());
        }

        if self.outstanding < traffic.params.max_outstanding {
            let addr = traffic.pick_addr();
            if traffic.in_flight.insert(addr) {
                traffic.issued += 1;
                let write = traffic.rng.below(100) < traffic.params.percent_writes as u64;
                if write {
                    let value = traffic.rng.next() as u8;
                    traffic.shadow.insert(addr, value);
                    self.write(fabric, addr, 1, value as u64)?;
                } else {
                    self.read(fabric, addr, 1)?;
                }
            }
        }

        let interval = self
            .traffic
            .as_ref()
            .filter(|t| !t.done_issuing())
            .map(|t| t.params.interval.max(1));
        if let Some(interval) = interval {
            let id = self.object_id()?;
            self.issue_event = Some(fabric.schedule(id, interval, ObjectEvent::Issue));
        }
        Ok(())
    }

    fn check_response(&mut self, pkt: &Packet) {
        let Some(traffic) = self.traffic.as_mut() else {
            return;
        };
        traffic.in_flight.remove(&pkt.addr());
        if pkt.cmd() != Command::ReadResp {
            return;
        }
        let expected = traffic.shadow.get(&pkt.addr()).copied().unwrap_or(0);
        let got = pkt.get_uint() as u8;
        if got != expected {
            log::warn!(
                "{}: read 0x{:08X} returned 0x{:02X}, expected 0x{:02X}",
                self.name,
                pkt.addr(),
                got,
                expected
            );
            self.stats.data_errors += 1;
        }
    }

    fn check_drained(&mut self, fabric: &mut Fabric) {
        if self.draining && self.outstanding == 0 && self.queue.is_empty() {
            self.draining = false;
            fabric.signal_drained();
        }
    }
}

impl SimObject for MemTester {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_port(&mut self, name: &str, port: PortRef) -> Result<()> {
        if name != PORT {
            return Err(SimError::UnknownPort {
                component: self.name.clone(),
                port: name.to_string(),
            });
        }
        self.port = Some(port);
        Ok(())
    }

    fn init(&mut self, id: ObjectId, _fabric: &mut Fabric) -> Result<()> {
        self.id = Some(id);
        self.port()?;
        Ok(())
    }

    fn recv_timing(&mut self, fabric: &mut Fabric, _port: PortRef, pkt: Packet) -> Result<Delivery> {
        if !pkt.is_response() {
            // Upward invalidates carry nothing a tester keeps.
            return Ok(Delivery::Accepted);
        }
        if self.outstanding == 0 {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                "idle",
                "response with nothing outstanding",
            ));
        }
        self.outstanding -= 1;
        self.stats.completed += 1;
        self.check_response(&pkt);
        log::trace!("{}: {} 0x{:08X} = 0x{:X}", self.name, pkt.cmd(), pkt.addr(), pkt.get_uint());
        self.completions.push(Completion {
            tick: fabric.now(),
            cmd: pkt.cmd(),
            addr: pkt.addr(),
            data: pkt.get_uint(),
            result: pkt.result,
        });
        self.check_drained(fabric);
        Ok(Delivery::Accepted)
    }

    fn recv_retry(&mut self, fabric: &mut Fabric, _port: PortRef) -> Result<()> {
        self.waiting_retry = false;
        self.send_queue(fabric)?;
        self.check_drained(fabric);
        Ok(())
    }

    fn recv_atomic(&mut self, _fabric: &mut Fabric, _port: PortRef, pkt: &mut Packet) -> Result<Tick> {
        Err(SimError::Unsupported(format!(
            "{}: atomic {} 0x{:08X} sent to a tester",
            self.name,
            pkt.cmd(),
            pkt.addr()
        )))
    }

    fn recv_functional(&mut self, _fabric: &mut Fabric, _port: PortRef, _pkt: &mut Packet) -> Result<()> {
        Ok(())
    }

    fn process_event(&mut self, fabric: &mut Fabric, event: ObjectEvent) -> Result<()> {
        match event {
            ObjectEvent::Issue => self.issue_random(fabric),
            other => Err(SimError::Unsupported(format!(
                "{}: unexpected event {:?}",
                self.name, other
            ))),
        }
    }

    fn drain(&mut self, fabric: &mut Fabric) -> Result<usize> {
        if let Some(handle) = self.issue_event.take() {
            fabric.deschedule(handle);
        }
        if self.outstanding == 0 && self.queue.is_empty() {
            return Ok(0);
        }
        self.draining = true;
        Ok(1)
    }

    fn resume(&mut self, fabric: &mut Fabric) -> Result<()> {
        self.draining = false;
        if self.traffic.as_ref().is_some_and(|t| !t.done_issuing()) {
            self.start(fabric, 0)?;
        }
        Ok(())
    }

    fn dump_stats(&self, sink: &mut dyn StatsSink) {
        sink.record(&format!("{}.reads_issued", self.name), self.stats.reads_issued);
        sink.record(&format!("{}.writes_issued", self.name), self.stats.writes_issued);
        sink.record(&format!("{}.completed", self.name), self.stats.completed);
        sink.record(&format!("{}.retries", self.name), self.stats.retries);
        sink.record(&format!("{}.data_errors", self.name), self.stats.data_errors);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
