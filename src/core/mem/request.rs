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

//! Memory requests
//!
//! A [`Request`] is the identity of one memory access: who issued it, where it
//! goes and with which attributes. It is created by the requester, translated
//! exactly once, and then travels inside a [`Packet`](super::packet::Packet).

use bitflags::bitflags;

use super::Addr;
use crate::core::error::{Result, SimError};
use crate::core::mem::packet::Command;
use crate::core::timing::Tick;

bitflags! {
    /// Request attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u16 {
        /// Bypass every cache on the way to memory
        const UNCACHEABLE = 1 << 0;
        /// Load-locked / store-conditional access
        const LOCKED = 1 << 1;
        /// Software prefetch
        const PREFETCH = 1 << 2;
        /// Instruction fetch
        const INST_FETCH = 1 << 3;
        /// Suppress faults (speculative or debug access)
        const NO_FAULT = 1 << 4;
    }
}

/// Memory request
///
/// `Clone` so that a cache can stamp its bus-side packets with the identity
/// of the access that caused them. Packets themselves are never cloned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    vaddr: Addr,
    paddr: Addr,
    translated: bool,
    size: usize,
    flags: RequestFlags,
    pc: Addr,
    cpu_id: u32,
    thread_id: u32,
    master_id: u32,
    time: Tick,
    sc_result: Option<u64>,
}

impl Request {
    /// Create an untranslated request for a virtual address
    ///
    /// # Arguments
    ///
    /// * `vaddr` - Virtual address
    /// * `size` - Access size in bytes
    /// * `flags` - Request attributes
    /// * `pc` - Program counter of the issuing instruction
    /// * `cpu_id` - Issuing CPU
    /// * `thread_id` - Issuing hardware thread
    /// * `time` - Issue tick
    pub fn new_virtual(
        vaddr: Addr,
        size: usize,
        flags: RequestFlags,
        pc: Addr,
        cpu_id: u32,
        thread_id: u32,
        time: Tick,
    ) -> Self {
        Self {
            vaddr,
            paddr: 0,
            translated: false,
            size,
            flags,
            pc,
            cpu_id,
            thread_id,
            master_id: cpu_id,
            time,
            sc_result: None,
        }
    }

    /// Create an already translated request for a physical address
    pub fn new_physical(paddr: Addr, size: usize, flags: RequestFlags, time: Tick) -> Self {
        Self {
            vaddr: paddr,
            paddr,
            translated: true,
            size,
            flags,
            pc: 0,
            cpu_id: 0,
            thread_id: 0,
            master_id: 0,
            time,
            sc_result: None,
        }
    }

    /// Physical copy of `self` covering a different range
    ///
    /// Used for bus-side packets (line fills, writebacks) that act on behalf
    /// of this request.
    pub fn derive(&self, paddr: Addr, size: usize, flags: RequestFlags, time: Tick) -> Self {
        Self {
            vaddr: paddr,
            paddr,
            translated: true,
            size,
            flags,
            pc: self.pc,
            cpu_id: self.cpu_id,
            thread_id: self.thread_id,
            master_id: self.master_id,
            time,
            sc_result: None,
        }
    }

    /// Set the physical address
    ///
    /// # Errors
    ///
    /// A request can be translated only once; a second translation is a
    /// protocol violation.
    pub fn set_paddr(&mut self, paddr: Addr) -> Result<()> {
        if self.translated {
            return Err(SimError::violation(
                "request",
                self.vaddr,
                Command::ReadReq,
                "translated",
                format!("second translation to 0x{:08X}", paddr),
            ));
        }
        self.paddr = paddr;
        self.translated = true;
        Ok(())
    }

    pub fn vaddr(&self) -> Addr {
        self.vaddr
    }

    pub fn paddr(&self) -> Addr {
        self.paddr
    }

    pub fn is_translated(&self) -> bool {
        self.translated
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    /// Add attribute flags (translation may mark a page uncacheable)
    pub fn set_flags(&mut self, flags: RequestFlags) {
        self.flags |= flags;
    }

    pub fn is_uncacheable(&self) -> bool {
        self.flags.contains(RequestFlags::UNCACHEABLE)
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(RequestFlags::LOCKED)
    }

    pub fn is_inst_fetch(&self) -> bool {
        self.flags.contains(RequestFlags::INST_FETCH)
    }

    pub fn pc(&self) -> Addr {
        self.pc
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Requester identity used for statistics attribution
    pub fn master_id(&self) -> u32 {
        self.master_id
    }

    pub fn set_master_id(&mut self, id: u32) {
        self.master_id = id;
    }

    pub fn time(&self) -> Tick {
        self.time
    }

    /// Store-conditional outcome (1 = success, 0 = failure)
    pub fn sc_result(&self) -> Option<u64> {
        self.sc_result
    }

    pub fn set_sc_result(&mut self, result: u64) {
        self.sc_result = Some(result);
    }
}
