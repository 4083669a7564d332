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

//! Architectural thread state
//!
//! A [`SimpleThread`] is everything that moves between CPUs on a switch:
//! registers, program counter, the load-locked reservation and the address
//! translation used for its accesses.

use std::ops::Range;

use serde::Serialize;

use super::isa::RegIndex;
use crate::core::error::Fault;
use crate::core::mem::{Addr, Request, RequestFlags};

/// Virtual-to-physical translation
pub trait Translator {
    /// Set the physical address of `req`, possibly adding attribute flags
    fn translate(&self, req: &mut Request) -> std::result::Result<(), Fault>;
}

/// Offset-and-limit translation
///
/// Virtual address `v` maps to `v + offset` for `v < limit`. Ranges of
/// physical memory can be marked uncacheable.
#[derive(Debug, Clone)]
pub struct FlatTranslator {
    offset: Addr,
    limit: Addr,
    uncacheable: Vec<Range<Addr>>,
}

impl FlatTranslator {
    pub fn new(offset: Addr, limit: Addr) -> Self {
        Self {
            offset,
            limit,
            uncacheable: Vec::new(),
        }
    }

    /// Identity mapping over the whole address space
    pub fn identity() -> Self {
        Self::new(0, Addr::MAX)
    }

    /// Mark a physical range as uncacheable
    pub fn with_uncacheable(mut self, range: Range<Addr>) -> Self {
        self.uncacheable.push(range);
        self
    }
}

impl Translator for FlatTranslator {
    fn translate(&self, req: &mut Request) -> std::result::Result<(), Fault> {
        let vaddr = req.vaddr();
        let size = req.size();

        if size.is_power_of_two() && vaddr % size as Addr != 0 {
            return Err(Fault::Alignment { vaddr, size });
        }
        let in_range = vaddr
            .checked_add(size as Addr)
            .is_some_and(|end| end <= self.limit);
        if !in_range {
            return Err(Fault::PageFault { vaddr });
        }

        let paddr = vaddr.wrapping_add(self.offset);
        if self.uncacheable.iter().any(|r| r.contains(&paddr)) {
            req.set_flags(RequestFlags::UNCACHEABLE);
        }
        if !req.is_translated() {
            // Only a second translation can fail.
            req.set_paddr(paddr).map_err(|_| Fault::PageFault { vaddr })?;
        }
        Ok(())
    }
}

/// Thread run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadStatus {
    Active,
    Suspended,
    Halted,
}

/// One hardware thread
pub struct SimpleThread {
    regs: [u32; 32],
    pc: Addr,
    next_pc: Addr,
    status: ThreadStatus,
    lock_flag: bool,
    lock_addr: Addr,
    fault_vector: Option<Addr>,
    last_fault: Option<Fault>,
    num_insts: u64,
    context_id: Option<usize>,
    translator: Box<dyn Translator>,
}

impl SimpleThread {
    /// Create a suspended thread that will start at `entry`
    pub fn new(entry: Addr, translator: Box<dyn Translator>) -> Self {
        Self {
            regs: [0; 32],
            pc: entry,
            next_pc: entry.wrapping_add(4),
            status: ThreadStatus::Suspended,
            lock_flag: false,
            lock_addr: 0,
            fault_vector: None,
            last_fault: None,
            num_insts: 0,
            context_id: None,
            translator,
        }
    }

    /// Read a general purpose register (r0 is hardwired to zero)
    #[inline(always)]
    pub fn reg(&self, index: RegIndex) -> u32 {
        if index == 0 {
            0
        } else {
            self.regs[(index & 0x1F) as usize]
        }
    }

    /// Write a general purpose register (writes to r0 are ignored)
    #[inline(always)]
    pub fn set_reg(&mut self, index: RegIndex, value: u32) {
        if index != 0 {
            self.regs[(index & 0x1F) as usize] = value;
        }
    }

    pub fn pc(&self) -> Addr {
        self.pc
    }

    /// Jump to `pc` before the next fetch
    pub fn set_pc(&mut self, pc: Addr) {
        self.pc = pc;
        self.next_pc = pc.wrapping_add(4);
    }

    pub fn next_pc(&self) -> Addr {
        self.next_pc
    }

    pub fn set_next_pc(&mut self, pc: Addr) {
        self.next_pc = pc;
    }

    /// Move past the current instruction
    ///
    /// A fault goes to the fault vector if one is set. Without a vector the
    /// thread halts on the faulting instruction.
    pub fn advance_pc(&mut self, fault: Option<Fault>) {
        match fault {
            None => self.set_pc(self.next_pc),
            Some(fault) => {
                self.last_fault = Some(fault);
                match self.fault_vector {
                    Some(vector) => self.set_pc(vector),
                    None => {
                        log::warn!("Thread halted by {} at 0x{:08X}", fault, self.pc);
                        self.status = ThreadStatus::Halted;
                    }
                }
            }
        }
    }

    pub fn set_fault_vector(&mut self, vector: Option<Addr>) {
        self.fault_vector = vector;
    }

    pub fn last_fault(&self) -> Option<Fault> {
        self.last_fault
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == ThreadStatus::Active
    }

    pub fn activate(&mut self) {
        self.status = ThreadStatus::Active;
    }

    pub fn suspend(&mut self) {
        if self.status == ThreadStatus::Active {
            self.status = ThreadStatus::Suspended;
        }
    }

    pub fn halt(&mut self) {
        self.status = ThreadStatus::Halted;
    }

    pub fn num_insts(&self) -> u64 {
        self.num_insts
    }

    pub(crate) fn count_inst(&mut self) {
        self.num_insts += 1;
    }

    /// Slot of this thread in its system's context table
    pub fn context_id(&self) -> Option<usize> {
        self.context_id
    }

    pub fn set_context_id(&mut self, id: usize) {
        self.context_id = Some(id);
    }

    pub fn translate(&self, req: &mut Request) -> std::result::Result<(), Fault> {
        self.translator.translate(req)
    }

    // Load-locked / store-conditional

    pub fn lock_flag(&self) -> bool {
        self.lock_flag
    }

    pub fn lock_addr(&self) -> Addr {
        self.lock_addr
    }

    /// A load-locked completed: take the reservation
    pub fn handle_locked_read(&mut self, req: &Request) {
        self.lock_flag = true;
        self.lock_addr = req.paddr();
    }

    /// A store-conditional is about to issue
    ///
    /// # Returns
    ///
    /// true if the store should go to memory. On failure the request's
    /// store-conditional result is set to 0. The reservation is consumed
    /// either way.
    pub fn handle_locked_write(&mut self, req: &mut Request) -> bool {
        let held = self.lock_flag && self.lock_addr == req.paddr();
        self.lock_flag = false;
        if !held {
            req.set_sc_result(0);
        }
        held
    }

    /// Another agent invalidated `[addr, addr + size)`
    ///
    /// # Returns
    ///
    /// true if this dropped the reservation
    pub fn invalidate_reservation(&mut self, addr: Addr, size: usize) -> bool {
        if self.lock_flag && self.lock_addr >= addr && self.lock_addr < addr + size as Addr {
            self.lock_flag = false;
            return true;
        }
        false
    }
}

impl std::fmt::Debug for SimpleThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleThread")
            .field("pc", &format_args!("0x{:08X}", self.pc))
            .field("status", &self.status)
            .field("lock_flag", &self.lock_flag)
            .field("num_insts", &self.num_insts)
            .finish()
    }
}
