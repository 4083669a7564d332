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

//! Timing CPU pipeline
//!
//! [`TimingCpu`] executes one instruction at a time and waits on the memory
//! system for every instruction fetch and data access. All memory traffic
//! goes through two links (`icache_port`, `dcache_port`) and every refused
//! send is parked until the peer signals a retry.
//!
//! ```text
//!   fetch ──> IcacheWaitResponse ──> complete_ifetch ──> execute ──> advance_inst ──> fetch
//!                                          │
//!                                          └─> initiate_acc ──> DcacheWaitResponse ──> complete_data_access
//! ```

pub mod isa;
pub mod mem_tester;
pub mod thread;

#[cfg(test)]
mod tests;

use std::any::Any;
use std::fmt;

use serde::Serialize;

use crate::core::error::{Fault, Result, SimError};
use crate::core::mem::port::{ObjectId, StatusChange};
use crate::core::mem::{
    Addr, Command, Delivery, Packet, PacketResult, PortRef, Request, RequestFlags, SnoopReply,
};
use crate::core::sim::fabric::{ExitReason, Fabric, ObjectEvent, SimObject};
use crate::core::sim::stats::StatsSink;
use crate::core::timing::{EventHandle, Tick};

pub use isa::{Decoder, ExecContext, MicroDecoder, MicroInst, StaticInst};
pub use mem_tester::MemTester;
pub use thread::{FlatTranslator, SimpleThread, ThreadStatus, Translator};

/// Instruction-side port name
pub const ICACHE_PORT: &str = "icache_port";
/// Data-side port name
pub const DCACHE_PORT: &str = "dcache_port";

/// Pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CpuStatus {
    Idle,
    Running,
    IcacheRetry,
    IcacheWaitResponse,
    DcacheRetry,
    DcacheWaitResponse,
    SwitchedOut,
}

impl fmt::Display for CpuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drain progress, orthogonal to [`CpuStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DrainState {
    Running,
    Draining,
    Drained,
}

/// CPU construction parameters
#[derive(Debug, Clone)]
pub struct CpuParams {
    pub name: String,
    pub cpu_id: u32,
    /// Ticks per CPU cycle
    pub clock: Tick,
    /// Exit the simulation after this many committed instructions
    pub max_insts: Option<u64>,
}

impl Default for CpuParams {
    fn default() -> Self {
        Self {
            name: "cpu".to_string(),
            cpu_id: 0,
            clock: 1,
            max_insts: None,
        }
    }
}

/// Per-CPU statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    pub num_cycles: u64,
    pub num_insts: u64,
    pub num_loads: u64,
    pub num_stores: u64,
    pub num_faults: u64,
    pub icache_retries: u64,
    pub dcache_retries: u64,
    pub sc_failures: u64,
    pub invalidations: u64,
}

/// Single-issue CPU that blocks on every memory access
pub struct TimingCpu {
    name: String,
    cpu_id: u32,
    clock: Tick,
    max_insts: Option<u64>,
    id: Option<ObjectId>,

    icache_port: Option<PortRef>,
    dcache_port: Option<PortRef>,

    status: CpuStatus,
    drain_state: DrainState,

    thread: Option<SimpleThread>,
    decoder: Box<dyn Decoder>,

    /// Memory instruction waiting for its data access
    cur_inst: Option<Box<dyn StaticInst>>,
    /// Fetch refused by the icache, waiting for a retry
    ifetch_pkt: Option<Packet>,
    /// Data access refused by the dcache, or a store-conditional that
    /// failed before reaching memory
    dcache_pkt: Option<Packet>,
    fetch_event: Option<EventHandle>,

    previous_tick: Tick,
    active_ticks: Tick,
    stats: CpuStats,
}

impl TimingCpu {
    /// Create a CPU
    ///
    /// # Arguments
    ///
    /// * `params` - Name, id, clock and instruction limit
    /// * `thread` - Thread to run, or `None` for a CPU that starts switched
    ///   out and waits for [`take_over`](Self::take_over)
    /// * `decoder` - Instruction decoder
    pub fn new(params: CpuParams, thread: Option<SimpleThread>, decoder: Box<dyn Decoder>) -> Self {
        let status = if thread.is_some() {
            CpuStatus::Idle
        } else {
            CpuStatus::SwitchedOut
        };
        Self {
            name: params.name,
            cpu_id: params.cpu_id,
            clock: params.clock.max(1),
            max_insts: params.max_insts,
            id: None,
            icache_port: None,
            dcache_port: None,
            status,
            drain_state: DrainState::Running,
            thread,
            decoder,
            cur_inst: None,
            ifetch_pkt: None,
            dcache_pkt: None,
            fetch_event: None,
            previous_tick: 0,
            active_ticks: 0,
            stats: CpuStats::default(),
        }
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    pub fn status(&self) -> CpuStatus {
        self.status
    }

    pub fn drain_state(&self) -> DrainState {
        self.drain_state
    }

    pub fn thread(&self) -> Option<&SimpleThread> {
        self.thread.as_ref()
    }

    pub fn thread_mut(&mut self) -> Option<&mut SimpleThread> {
        self.thread.as_mut()
    }

    pub fn stats(&self) -> &CpuStats {
        &self.stats
    }

    pub fn clock(&self) -> Tick {
        self.clock
    }

    /// First clock edge at or after `tick`
    pub fn next_cycle(&self, tick: Tick) -> Tick {
        tick.div_ceil(self.clock) * self.clock
    }

    fn object_id(&self) -> Result<ObjectId> {
        self.id
            .ok_or_else(|| SimError::Config(format!("{}: used before init", self.name)))
    }

    fn port(&self, port: Option<PortRef>, name: &str) -> Result<PortRef> {
        port.ok_or_else(|| SimError::UnboundPort {
            component: self.name.clone(),
            port: name.to_string(),
        })
    }

    fn thread_state(&mut self) -> Result<&mut SimpleThread> {
        let name = &self.name;
        self.thread
            .as_mut()
            .ok_or_else(|| SimError::Config(format!("{}: no thread attached", name)))
    }

    fn current_pc(&self) -> Addr {
        self.thread.as_ref().map_or(0, |t| t.pc())
    }

    fn violation(&self, cmd: Command, detail: impl Into<String>) -> SimError {
        SimError::violation(&self.name, self.current_pc(), cmd, self.status, detail)
    }

    fn account_cycles(&mut self, now: Tick) {
        self.active_ticks += now.saturating_sub(self.previous_tick);
        self.previous_tick = now;
        self.stats.num_cycles = self.active_ticks / self.clock;
    }

    // Thread control

    /// Start the thread `delay` cycles from now
    pub fn activate_context(&mut self, fabric: &mut Fabric, delay: u64) -> Result<()> {
        if self.status != CpuStatus::Idle {
            return Err(self.violation(Command::ReadReq, "activate while not idle"));
        }
        let id = self.object_id()?;
        self.thread_state()?.activate();
        self.status = CpuStatus::Running;
        self.previous_tick = fabric.now();
        log::debug!("{}: activate in {} cycles", self.name, delay);
        self.fetch_event = Some(fabric.schedule(id, delay * self.clock, ObjectEvent::Fetch));
        Ok(())
    }

    /// Stop fetching; an access already in flight still completes
    pub fn suspend_context(&mut self, fabric: &mut Fabric) -> Result<()> {
        if self.status != CpuStatus::Running {
            return Err(self.violation(Command::ReadReq, "suspend while not running"));
        }
        if let Some(handle) = self.fetch_event.take() {
            fabric.deschedule(handle);
        }
        self.thread_state()?.suspend();
        self.status = CpuStatus::Idle;
        log::debug!("{}: suspended", self.name);
        Ok(())
    }

    // Instruction side

    fn fetch(&mut self, fabric: &mut Fabric) -> Result<()> {
        self.fetch_event = None;
        let now = fabric.now();
        self.account_cycles(now);

        let cpu_id = self.cpu_id;
        let thread = self.thread_state()?;
        let pc = thread.pc();
        let mut req = Request::new_virtual(pc, 4, RequestFlags::INST_FETCH, pc, cpu_id, 0, now);
        if let Err(fault) = thread.translate(&mut req) {
            return self.advance_inst(fabric, Some(fault));
        }

        let mut pkt = Packet::new(Command::ReadReq, req);
        pkt.allocate();
        log::trace!("{}: fetch 0x{:08X}", self.name, pc);

        let port = self.port(self.icache_port, ICACHE_PORT)?;
        match fabric.send_timing(port, pkt)? {
            Delivery::Accepted => self.status = CpuStatus::IcacheWaitResponse,
            Delivery::Refused(pkt) => {
                log::debug!("{}: icache busy, fetch 0x{:08X} waits for retry", self.name, pc);
                self.status = CpuStatus::IcacheRetry;
                self.ifetch_pkt = Some(pkt);
                self.stats.icache_retries += 1;
            }
        }
        Ok(())
    }

    fn complete_ifetch(&mut self, fabric: &mut Fabric, pkt: Packet) -> Result<()> {
        if self.status != CpuStatus::IcacheWaitResponse {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                self.status,
                "unexpected instruction response",
            ));
        }
        self.status = CpuStatus::Running;
        self.account_cycles(fabric.now());

        // Draining drops the fetched instruction; it is fetched again on resume.
        if self.drain_state == DrainState::Draining {
            return self.complete_drain(fabric);
        }

        if pkt.result != PacketResult::Success {
            let fault = Fault::BadAddress { paddr: pkt.addr() };
            return self.advance_inst(fabric, Some(fault));
        }

        let word = pkt.get_uint() as u32;
        let thread = self.thread_state()?;
        let pc = thread.pc();
        thread.set_next_pc(pc.wrapping_add(4));
        let inst = self.decoder.decode(word, pc);
        log::trace!("{}: 0x{:08X}: {}", self.name, pc, inst);

        if inst.is_mem_ref() && !inst.is_data_prefetch() {
            let fault = inst.initiate_acc(&mut CpuExec::new(self, fabric))?;
            if self.status != CpuStatus::Running {
                // Finishes in complete_data_access.
                self.cur_inst = Some(inst);
                return Ok(());
            }

            // Faulted, or a store-conditional failed without an access.
            let mut fault = fault;
            if fault.is_none() {
                if let Some(pkt) = self.dcache_pkt.take() {
                    fault = inst.complete_acc(&pkt, &mut CpuExec::new(self, fabric))?;
                }
            }
            self.advance_inst(fabric, fault)
        } else {
            let fault = inst.execute(&mut CpuExec::new(self, fabric))?;
            self.advance_inst(fabric, fault)
        }
    }

    fn advance_inst(&mut self, fabric: &mut Fabric, fault: Option<Fault>) -> Result<()> {
        let thread = self.thread_state()?;
        if fault.is_none() {
            thread.count_inst();
        }
        thread.advance_pc(fault);
        let active = thread.is_active();

        match fault {
            Some(fault) => {
                self.stats.num_faults += 1;
                log::debug!("{}: {}", self.name, fault);
            }
            None => {
                self.stats.num_insts += 1;
                if self.max_insts == Some(self.stats.num_insts) {
                    fabric.exit_simulation(ExitReason::MaxInsts {
                        cpu: self.name.clone(),
                    });
                }
            }
        }

        if self.drain_state == DrainState::Draining {
            return self.complete_drain(fabric);
        }
        if !active && self.status == CpuStatus::Running {
            log::info!("{}: thread stopped at 0x{:08X}", self.name, self.current_pc());
            self.status = CpuStatus::Idle;
        }
        if self.status == CpuStatus::Running {
            self.fetch(fabric)?;
        }
        Ok(())
    }

    // Data side

    /// Issue a data read on behalf of the current instruction
    pub fn read(
        &mut self,
        fabric: &mut Fabric,
        vaddr: Addr,
        size: usize,
        flags: RequestFlags,
    ) -> Result<Option<Fault>> {
        let now = fabric.now();
        let cpu_id = self.cpu_id;
        let thread = self.thread_state()?;
        let mut req = Request::new_virtual(vaddr, size, flags, thread.pc(), cpu_id, 0, now);
        if let Err(fault) = thread.translate(&mut req) {
            return Ok(Some(fault));
        }

        let mut pkt = Packet::new(Command::ReadReq, req);
        pkt.allocate();
        self.stats.num_loads += 1;
        self.send_data(fabric, pkt)?;
        Ok(None)
    }

    /// Issue a data write on behalf of the current instruction
    ///
    /// A store-conditional without a reservation does not reach memory: its
    /// packet is kept with a failing result so the instruction completes at
    /// once.
    pub fn write(
        &mut self,
        fabric: &mut Fabric,
        vaddr: Addr,
        size: usize,
        data: u64,
        flags: RequestFlags,
    ) -> Result<Option<Fault>> {
        let now = fabric.now();
        let cpu_id = self.cpu_id;
        let thread = self.thread_state()?;
        let mut req = Request::new_virtual(vaddr, size, flags, thread.pc(), cpu_id, 0, now);
        if let Err(fault) = thread.translate(&mut req) {
            return Ok(Some(fault));
        }

        let mut pkt = Packet::new(Command::WriteReq, req);
        pkt.allocate();
        pkt.set_uint(data);
        self.stats.num_stores += 1;

        if pkt.req().is_locked() && !self.thread_state()?.handle_locked_write(pkt.req_mut()) {
            log::debug!("{}: store-conditional to 0x{:08X} failed early", self.name, pkt.addr());
            self.stats.sc_failures += 1;
            self.dcache_pkt = Some(pkt);
            return Ok(None);
        }
        self.send_data(fabric, pkt)?;
        Ok(None)
    }

    fn send_data(&mut self, fabric: &mut Fabric, pkt: Packet) -> Result<()> {
        let port = self.port(self.dcache_port, DCACHE_PORT)?;
        log::trace!("{}: {} 0x{:08X}", self.name, pkt.cmd(), pkt.addr());
        match fabric.send_timing(port, pkt)? {
            Delivery::Accepted => self.status = CpuStatus::DcacheWaitResponse,
            Delivery::Refused(pkt) => {
                log::debug!("{}: dcache busy, {} 0x{:08X} waits for retry", self.name, pkt.cmd(), pkt.addr());
                self.status = CpuStatus::DcacheRetry;
                self.dcache_pkt = Some(pkt);
                self.stats.dcache_retries += 1;
            }
        }
        Ok(())
    }

    fn complete_data_access(&mut self, fabric: &mut Fabric, pkt: Packet) -> Result<()> {
        if self.status != CpuStatus::DcacheWaitResponse {
            return Err(SimError::violation(
                &self.name,
                pkt.addr(),
                pkt.cmd(),
                self.status,
                "unexpected data response",
            ));
        }
        self.status = CpuStatus::Running;
        self.account_cycles(fabric.now());

        let inst = self
            .cur_inst
            .take()
            .ok_or_else(|| self.violation(pkt.cmd(), "data response without an instruction"))?;

        let fault = match pkt.result {
            PacketResult::Success => inst.complete_acc(&pkt, &mut CpuExec::new(self, fabric))?,
            _ => Some(Fault::BadAddress { paddr: pkt.addr() }),
        };
        if fault.is_none() && pkt.cmd() == Command::ReadResp && pkt.req().is_locked() {
            self.thread_state()?.handle_locked_read(pkt.req());
        }

        self.advance_inst(fabric, fault)
    }

    fn complete_drain(&mut self, fabric: &mut Fabric) -> Result<()> {
        log::debug!("{}: done draining", self.name);
        self.drain_state = DrainState::Drained;
        fabric.signal_drained();
        Ok(())
    }

    fn resend(&mut self, fabric: &mut Fabric, port: PortRef, pkt: Packet, icache: bool) -> Result<()> {
        match fabric.send_timing(port, pkt)? {
            Delivery::Accepted => {
                self.status = if icache {
                    CpuStatus::IcacheWaitResponse
                } else {
                    CpuStatus::DcacheWaitResponse
                };
            }
            Delivery::Refused(pkt) => {
                if icache {
                    self.ifetch_pkt = Some(pkt);
                } else {
                    self.dcache_pkt = Some(pkt);
                }
            }
        }
        Ok(())
    }

    fn snoop_invalidate(&mut self, pkt: &Packet) {
        if let Some(thread) = self.thread.as_mut() {
            if thread.invalidate_reservation(pkt.addr(), pkt.size()) {
                log::debug!("{}: reservation at 0x{:08X} lost", self.name, pkt.addr());
            }
        }
        self.stats.invalidations += 1;
    }

    /// Functional read through the data port, for inspection
    pub fn debug_read(&self, fabric: &mut Fabric, paddr: Addr, size: usize) -> Result<u64> {
        let port = self.port(self.dcache_port, DCACHE_PORT)?;
        let mut req = Request::new_physical(paddr, size, RequestFlags::empty(), fabric.now());
        req.set_master_id(self.cpu_id);
        let mut pkt = Packet::new(Command::ReadReq, req);
        pkt.allocate();
        fabric.send_functional(port, &mut pkt)?;
        Ok(pkt.get_uint())
    }

    // CPU switching

    /// Stop so that another CPU can take over
    pub fn switch_out(&mut self, fabric: &mut Fabric) -> Result<()> {
        if !matches!(self.status, CpuStatus::Running | CpuStatus::Idle) {
            return Err(self.violation(Command::ReadReq, "switch out with an access in flight"));
        }
        self.account_cycles(fabric.now());
        if let Some(handle) = self.fetch_event.take() {
            fabric.deschedule(handle);
        }
        self.status = CpuStatus::SwitchedOut;
        log::info!("{}: switched out", self.name);
        Ok(())
    }

    /// Give up the thread and both link endpoints after [`switch_out`](Self::switch_out)
    pub fn hand_over(&mut self) -> Result<(SimpleThread, PortRef, PortRef)> {
        if self.status != CpuStatus::SwitchedOut {
            return Err(self.violation(Command::ReadReq, "hand over while not switched out"));
        }
        let icache = self.port(self.icache_port, ICACHE_PORT)?;
        let dcache = self.port(self.dcache_port, DCACHE_PORT)?;
        let thread = self
            .thread
            .take()
            .ok_or_else(|| SimError::Config(format!("{}: no thread to hand over", self.name)))?;
        self.icache_port = None;
        self.dcache_port = None;
        Ok((thread, icache, dcache))
    }

    /// Adopt the thread and link endpoints of a switched-out CPU
    ///
    /// The fabric must already route both endpoints to this CPU. Fetching
    /// starts on the next [`resume`](SimObject::resume) if the thread is
    /// active.
    pub fn take_over(
        &mut self,
        fabric: &mut Fabric,
        thread: SimpleThread,
        icache: PortRef,
        dcache: PortRef,
    ) -> Result<()> {
        if self.status != CpuStatus::SwitchedOut {
            return Err(self.violation(Command::ReadReq, "take over while not switched out"));
        }
        self.status = if thread.is_active() {
            CpuStatus::Running
        } else {
            CpuStatus::Idle
        };
        log::info!("{}: took over thread at 0x{:08X} ({})", self.name, thread.pc(), self.status);
        self.thread = Some(thread);
        self.icache_port = Some(icache);
        self.dcache_port = Some(dcache);
        self.previous_tick = fabric.now();
        Ok(())
    }
}

/// The view an executing instruction has of its CPU
struct CpuExec<'a> {
    cpu: &'a mut TimingCpu,
    fabric: &'a mut Fabric,
}

impl<'a> CpuExec<'a> {
    fn new(cpu: &'a mut TimingCpu, fabric: &'a mut Fabric) -> Self {
        Self { cpu, fabric }
    }
}

impl ExecContext for CpuExec<'_> {
    fn read_reg(&self, reg: isa::RegIndex) -> u32 {
        self.cpu.thread.as_ref().map_or(0, |t| t.reg(reg))
    }

    fn set_reg(&mut self, reg: isa::RegIndex, value: u32) {
        if let Some(thread) = self.cpu.thread.as_mut() {
            thread.set_reg(reg, value);
        }
    }

    fn pc(&self) -> Addr {
        self.cpu.current_pc()
    }

    fn set_next_pc(&mut self, pc: Addr) {
        if let Some(thread) = self.cpu.thread.as_mut() {
            thread.set_next_pc(pc);
        }
    }

    fn read(&mut self, vaddr: Addr, size: usize, flags: RequestFlags) -> Result<Option<Fault>> {
        self.cpu.read(self.fabric, vaddr, size, flags)
    }

    fn write(
        &mut self,
        vaddr: Addr,
        size: usize,
        data: u64,
        flags: RequestFlags,
    ) -> Result<Option<Fault>> {
        self.cpu.write(self.fabric, vaddr, size, data, flags)
    }

    fn halt(&mut self) {
        if let Some(thread) = self.cpu.thread.as_mut() {
            thread.halt();
        }
    }
}

impl SimObject for TimingCpu {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_port(&mut self, name: &str, port: PortRef) -> Result<()> {
        match name {
            ICACHE_PORT => self.icache_port = Some(port),
            DCACHE_PORT => self.dcache_port = Some(port),
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
        if self.status != CpuStatus::SwitchedOut {
            self.port(self.icache_port, ICACHE_PORT)?;
            self.port(self.dcache_port, DCACHE_PORT)?;
        }
        Ok(())
    }

    fn recv_timing(&mut self, fabric: &mut Fabric, port: PortRef, pkt: Packet) -> Result<Delivery> {
        if pkt.is_response() {
            // Finish at the next clock edge.
            let id = self.object_id()?;
            let when = self.next_cycle(fabric.now());
            let event = if Some(port) == self.icache_port {
                ObjectEvent::CompleteIfetch(pkt)
            } else {
                ObjectEvent::CompleteDataAccess(pkt)
            };
            fabric.schedule_at(id, when, event)?;
        } else if pkt.is_invalidate() {
            self.snoop_invalidate(&pkt);
        }
        Ok(Delivery::Accepted)
    }

    fn recv_retry(&mut self, fabric: &mut Fabric, port: PortRef) -> Result<()> {
        if Some(port) == self.icache_port && self.status == CpuStatus::IcacheRetry {
            let pkt = self
                .ifetch_pkt
                .take()
                .ok_or_else(|| self.violation(Command::ReadReq, "icache retry without a parked fetch"))?;
            self.resend(fabric, port, pkt, true)
        } else if Some(port) == self.dcache_port && self.status == CpuStatus::DcacheRetry {
            let pkt = self
                .dcache_pkt
                .take()
                .ok_or_else(|| self.violation(Command::ReadReq, "dcache retry without a parked access"))?;
            self.resend(fabric, port, pkt, false)
        } else {
            Err(self.violation(Command::ReadReq, "retry with nothing to resend"))
        }
    }

    fn recv_atomic(&mut self, _fabric: &mut Fabric, _port: PortRef, pkt: &mut Packet) -> Result<Tick> {
        Err(SimError::Unsupported(format!(
            "{}: atomic {} 0x{:08X} sent to a timing CPU",
            self.name,
            pkt.cmd(),
            pkt.addr()
        )))
    }

    fn recv_functional(&mut self, _fabric: &mut Fabric, _port: PortRef, _pkt: &mut Packet) -> Result<()> {
        Ok(())
    }

    fn recv_snoop(&mut self, _fabric: &mut Fabric, _port: PortRef, pkt: &mut Packet) -> Result<SnoopReply> {
        if pkt.is_invalidate() {
            self.snoop_invalidate(pkt);
        }
        Ok(SnoopReply::Ignored)
    }

    fn recv_status_change(&mut self, _fabric: &mut Fabric, _port: PortRef, status: StatusChange) -> Result<()> {
        log::trace!("{}: {:?}", self.name, status);
        Ok(())
    }

    fn process_event(&mut self, fabric: &mut Fabric, event: ObjectEvent) -> Result<()> {
        match event {
            ObjectEvent::Fetch => self.fetch(fabric),
            ObjectEvent::CompleteIfetch(pkt) => self.complete_ifetch(fabric, pkt),
            ObjectEvent::CompleteDataAccess(pkt) => self.complete_data_access(fabric, pkt),
            other => Err(SimError::Unsupported(format!(
                "{}: unexpected event {:?}",
                self.name, other
            ))),
        }
    }

    fn drain(&mut self, fabric: &mut Fabric) -> Result<usize> {
        match self.status {
            CpuStatus::Idle | CpuStatus::Running | CpuStatus::SwitchedOut => {
                if let Some(handle) = self.fetch_event.take() {
                    fabric.deschedule(handle);
                }
                self.drain_state = DrainState::Drained;
                Ok(0)
            }
            _ => {
                log::debug!("{}: draining in {}", self.name, self.status);
                self.drain_state = DrainState::Draining;
                Ok(1)
            }
        }
    }

    fn resume(&mut self, fabric: &mut Fabric) -> Result<()> {
        if self.status == CpuStatus::Running {
            let id = self.object_id()?;
            if let Some(handle) = self.fetch_event.take() {
                fabric.deschedule(handle);
            }
            self.fetch_event = Some(fabric.schedule(id, 0, ObjectEvent::Fetch));
        }
        self.drain_state = DrainState::Running;
        self.previous_tick = fabric.now();
        Ok(())
    }

    fn dump_stats(&self, sink: &mut dyn StatsSink) {
        let s = &self.stats;
        sink.record(&format!("{}.num_cycles", self.name), s.num_cycles);
        sink.record(&format!("{}.num_insts", self.name), s.num_insts);
        sink.record(&format!("{}.num_loads", self.name), s.num_loads);
        sink.record(&format!("{}.num_stores", self.name), s.num_stores);
        sink.record(&format!("{}.num_faults", self.name), s.num_faults);
        sink.record(&format!("{}.icache_retries", self.name), s.icache_retries);
        sink.record(&format!("{}.dcache_retries", self.name), s.dcache_retries);
        sink.record(&format!("{}.sc_failures", self.name), s.sc_failures);
        sink.record(&format!("{}.invalidations", self.name), s.invalidations);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
