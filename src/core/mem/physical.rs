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

//! Backing memory
//!
//! A sparse byte store covering one address range. Pages are allocated on
//! first write; unwritten memory reads as zero.

use std::any::Any;
use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use super::packet::{Command, Packet, PacketResult};
use super::port::{Delivery, ObjectId, PortRef, StatusChange};
use super::Addr;
use crate::core::error::{Result, SimError};
use crate::core::sim::fabric::{Fabric, ObjectEvent, SimObject};
use crate::core::sim::stats::StatsSink;
use crate::core::timing::Tick;

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Name of the memory's only port
pub const PORT: &str = "port";

/// Memory statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bad_addresses: u64,
}

/// Flat memory with a fixed access latency
pub struct PhysicalMemory {
    name: String,
    id: Option<ObjectId>,
    port: Option<PortRef>,
    base: Addr,
    size: u64,
    latency: Tick,
    pages: HashMap<Addr, Box<[u8; PAGE_SIZE]>>,
    resp_queue: VecDeque<Packet>,
    responses_in_flight: usize,
    draining: bool,
    stats: MemoryStats,
}

impl PhysicalMemory {
    pub fn new(name: &str, base: Addr, size: u64, latency: Tick) -> Self {
        Self {
            name: name.to_string(),
            id: None,
            port: None,
            base,
            size,
            latency,
            pages: HashMap::new(),
            resp_queue: VecDeque::new(),
            responses_in_flight: 0,
            draining: false,
            stats: MemoryStats::default(),
        }
    }

    pub fn base(&self) -> Addr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn latency(&self) -> Tick {
        self.latency
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Whether `[addr, addr + len)` lies inside this memory
    pub fn contains(&self, addr: Addr, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.base + self.size)
    }

    /// Store bytes directly, bypassing timing and statistics
    ///
    /// # Errors
    ///
    /// Fails if the range lies outside the memory.
    pub fn load(&mut self, addr: Addr, bytes: &[u8]) -> Result<()> {
        if !self.contains(addr, bytes.len()) {
            return Err(SimError::Config(format!(
                "{}: cannot load {} bytes at 0x{:08X}",
                self.name,
                bytes.len(),
                addr
            )));
        }
        self.write_bytes(addr, bytes);
        Ok(())
    }

    /// Read bytes directly, bypassing timing and statistics
    pub fn peek(&self, addr: Addr, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read_bytes(addr, &mut buf);
        buf
    }

    pub fn peek_u32(&self, addr: Addr) -> u32 {
        let bytes = self.peek(addr, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn read_bytes(&self, addr: Addr, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr + i as Addr;
            let page = a >> PAGE_SHIFT;
            let offset = (a as usize) & (PAGE_SIZE - 1);
            *b = self.pages.get(&page).map(|p| p[offset]).unwrap_or(0);
        }
    }

    fn write_bytes(&mut self, addr: Addr, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            let a = addr + i as Addr;
            let page = a >> PAGE_SHIFT;
            let offset = (a as usize) & (PAGE_SIZE - 1);
            self.pages
                .entry(page)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]))[offset] = *b;
        }
    }

    /// Perform `pkt` against the store
    ///
    /// Requests that need a response are turned into one in place when
    /// `respond` is set.
    fn access(&mut self, pkt: &mut Packet, respond: bool) -> Result<()> {
        let addr = pkt.addr();
        let size = pkt.size();

        if !self.contains(addr, size) {
            log::debug!("{}: bad address {} 0x{:08X}", self.name, pkt.cmd(), addr);
            self.stats.bad_addresses += 1;
            pkt.result = PacketResult::BadAddress;
        } else {
            match pkt.cmd() {
                Command::ReadReq
                | Command::ReadExReq
                | Command::SoftPfReq
                | Command::HardPfReq => {
                    // A snooper that supplied the line owns the newest copy.
                    if !pkt.is_satisfied() {
                        let data = pkt.data_mut();
                        let n = data.len().min(size);
                        self.read_bytes(addr, &mut data[..n]);
                    }
                    self.stats.reads += 1;
                    self.stats.bytes_read += size as u64;
                }
                Command::WriteReq
                | Command::WriteReqNoAck
                | Command::Writeback
                | Command::WriteInvalidateReq => {
                    let n = pkt.data().len().min(size);
                    let bytes = pkt.data()[..n].to_vec();
                    self.write_bytes(addr, &bytes);
                    self.stats.writes += 1;
                    self.stats.bytes_written += n as u64;
                }
                Command::UpgradeReq | Command::InvalidateReq => {}
                cmd => {
                    return Err(SimError::violation(
                        &self.name,
                        addr,
                        cmd,
                        "idle",
                        "memory cannot service a response command",
                    ))
                }
            }
        }

        if respond && pkt.needs_response() {
            pkt.make_atomic_response()?;
        }
        Ok(())
    }

    fn send_responses(&mut self, fabric: &mut Fabric) -> Result<()> {
        let Some(port) = self.port else {
            return Ok(());
        };
        while let Some(pkt) = self.resp_queue.pop_front() {
            match fabric.send_timing(port, pkt)? {
                Delivery::Accepted => {}
                Delivery::Refused(pkt) => {
                    self.resp_queue.push_front(pkt);
                    break;
                }
            }
        }
        if self.draining && self.resp_queue.is_empty() && self.responses_in_flight == 0 {
            self.draining = false;
            fabric.signal_drained();
        }
        Ok(())
    }
}

impl SimObject for PhysicalMemory {
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

    fn init(&mut self, id: ObjectId, fabric: &mut Fabric) -> Result<()> {
        self.id = Some(id);
        log::debug!(
            "{}: 0x{:08X}..0x{:08X}, latency {}",
            self.name,
            self.base,
            self.base + self.size,
            self.latency
        );
        if let Some(port) = self.port {
            fabric.send_status_change(port, StatusChange::RangeChange)?;
        }
        Ok(())
    }

    fn recv_timing(&mut self, fabric: &mut Fabric, _port: PortRef, mut pkt: Packet) -> Result<Delivery> {
        let needs_response = pkt.needs_response();
        self.access(&mut pkt, false)?;
        if needs_response {
            pkt.make_timing_response()?;
            let id = self
                .id
                .ok_or_else(|| SimError::Config(format!("{}: used before init", self.name)))?;
            self.responses_in_flight += 1;
            fabric.schedule(id, self.latency, ObjectEvent::Respond(pkt));
        }
        Ok(Delivery::Accepted)
    }

    fn recv_retry(&mut self, fabric: &mut Fabric, _port: PortRef) -> Result<()> {
        self.send_responses(fabric)
    }

    fn recv_atomic(&mut self, _fabric: &mut Fabric, _port: PortRef, pkt: &mut Packet) -> Result<Tick> {
        self.access(pkt, true)?;
        Ok(self.latency)
    }

    fn recv_functional(&mut self, _fabric: &mut Fabric, _port: PortRef, pkt: &mut Packet) -> Result<()> {
        if !self.contains(pkt.addr(), pkt.size()) {
            pkt.result = PacketResult::BadAddress;
            return Ok(());
        }
        if pkt.is_write() {
            let n = pkt.data().len().min(pkt.size());
            let bytes = pkt.data()[..n].to_vec();
            self.write_bytes(pkt.addr(), &bytes);
        } else {
            let addr = pkt.addr();
            let size = pkt.size();
            let data = pkt.data_mut();
            let n = data.len().min(size);
            self.read_bytes(addr, &mut data[..n]);
        }
        pkt.result = PacketResult::Success;
        Ok(())
    }

    fn process_event(&mut self, fabric: &mut Fabric, event: ObjectEvent) -> Result<()> {
        match event {
            ObjectEvent::Respond(pkt) => {
                self.responses_in_flight = self.responses_in_flight.saturating_sub(1);
                self.resp_queue.push_back(pkt);
                self.send_responses(fabric)
            }
            other => Err(SimError::Unsupported(format!(
                "{}: unexpected event {:?}",
                self.name, other
            ))),
        }
    }

    fn drain(&mut self, _fabric: &mut Fabric) -> Result<usize> {
        if self.resp_queue.is_empty() && self.responses_in_flight == 0 {
            return Ok(0);
        }
        self.draining = true;
        Ok(1)
    }

    fn dump_stats(&self, sink: &mut dyn StatsSink) {
        sink.record(&format!("{}.reads", self.name), self.stats.reads);
        sink.record(&format!("{}.writes", self.name), self.stats.writes);
        sink.record(&format!("{}.bytes_read", self.name), self.stats.bytes_read);
        sink.record(&format!("{}.bytes_written", self.name), self.stats.bytes_written);
        sink.record(&format!("{}.bad_addresses", self.name), self.stats.bad_addresses);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
