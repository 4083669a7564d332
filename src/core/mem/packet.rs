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

//! Memory packets
//!
//! A [`Packet`] is one memory transaction in flight: a command, the
//! [`Request`] it acts for, an optional data buffer, a result and a handful of
//! transient coherence flags.
//!
//! Packets are move-only. Handing one to a link consumes it; a link that cannot
//! accept it gives it back inside [`Delivery::Refused`](super::port::Delivery).
//!
//! # Example
//!
//! ```
//! use snoopsim::core::mem::packet::{Command, Packet};
//! use snoopsim::core::mem::request::{Request, RequestFlags};
//!
//! let req = Request::new_physical(0x1004, 4, RequestFlags::empty(), 0);
//! let mut pkt = Packet::new(Command::WriteReq, req);
//! pkt.set_uint(0xDEAD_BEEF);
//!
//! assert_eq!(pkt.block_addr(64), 0x1000);
//! assert_eq!(pkt.offset(64), 4);
//! assert_eq!(pkt.get_uint(), 0xDEAD_BEEF);
//! ```

use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

use super::request::Request;
use super::Addr;
use crate::core::cache::mshr::MshrId;
use crate::core::error::{Result, SimError};
use crate::core::timing::Tick;

bitflags! {
    /// Static attributes of a [`Command`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandAttrs: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const INVALIDATE = 1 << 2;
        const REQUEST = 1 << 3;
        const RESPONSE = 1 << 4;
        const NEEDS_RESPONSE = 1 << 5;
        const HAS_DATA = 1 << 6;
        const NEEDS_EXCLUSIVE = 1 << 7;
        const PREFETCH = 1 << 8;
        const WRITEBACK = 1 << 9;
    }
}

/// Packet command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Command {
    ReadReq,
    ReadResp,
    WriteReq,
    WriteReqNoAck,
    WriteResp,
    Writeback,
    SoftPfReq,
    HardPfReq,
    PfResp,
    InvalidateReq,
    WriteInvalidateReq,
    WriteInvalidateResp,
    UpgradeReq,
    UpgradeResp,
    ReadExReq,
    ReadExResp,
}

impl Command {
    /// Number of commands, for per-command statistics arrays
    pub const COUNT: usize = 16;

    /// Every command, in index order
    pub const ALL: [Command; Command::COUNT] = [
        Command::ReadReq,
        Command::ReadResp,
        Command::WriteReq,
        Command::WriteReqNoAck,
        Command::WriteResp,
        Command::Writeback,
        Command::SoftPfReq,
        Command::HardPfReq,
        Command::PfResp,
        Command::InvalidateReq,
        Command::WriteInvalidateReq,
        Command::WriteInvalidateResp,
        Command::UpgradeReq,
        Command::UpgradeResp,
        Command::ReadExReq,
        Command::ReadExResp,
    ];

    /// Position in [`Command::ALL`]
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn attrs(self) -> CommandAttrs {
        use CommandAttrs as A;
        match self {
            Command::ReadReq => A::READ | A::REQUEST | A::NEEDS_RESPONSE,
            Command::ReadResp => A::READ | A::RESPONSE | A::HAS_DATA,
            Command::WriteReq => A::WRITE | A::REQUEST | A::NEEDS_RESPONSE | A::HAS_DATA,
            Command::WriteReqNoAck => A::WRITE | A::REQUEST | A::HAS_DATA,
            Command::WriteResp => A::WRITE | A::RESPONSE,
            Command::Writeback => A::WRITE | A::REQUEST | A::HAS_DATA | A::WRITEBACK,
            Command::SoftPfReq | Command::HardPfReq => {
                A::READ | A::REQUEST | A::NEEDS_RESPONSE | A::PREFETCH
            }
            Command::PfResp => A::READ | A::RESPONSE | A::HAS_DATA | A::PREFETCH,
            Command::InvalidateReq => A::INVALIDATE | A::REQUEST,
            Command::WriteInvalidateReq => {
                A::WRITE | A::INVALIDATE | A::REQUEST | A::NEEDS_RESPONSE | A::HAS_DATA
            }
            Command::WriteInvalidateResp => A::WRITE | A::INVALIDATE | A::RESPONSE,
            Command::UpgradeReq => {
                A::INVALIDATE | A::REQUEST | A::NEEDS_RESPONSE | A::NEEDS_EXCLUSIVE
            }
            Command::UpgradeResp => A::INVALIDATE | A::RESPONSE | A::NEEDS_EXCLUSIVE,
            Command::ReadExReq => {
                A::READ | A::INVALIDATE | A::REQUEST | A::NEEDS_RESPONSE | A::NEEDS_EXCLUSIVE
            }
            Command::ReadExResp => {
                A::READ | A::INVALIDATE | A::RESPONSE | A::HAS_DATA | A::NEEDS_EXCLUSIVE
            }
        }
    }

    /// Matching response command, if this command expects one
    pub fn response(self) -> Option<Command> {
        match self {
            Command::ReadReq => Some(Command::ReadResp),
            Command::WriteReq => Some(Command::WriteResp),
            Command::SoftPfReq | Command::HardPfReq => Some(Command::PfResp),
            Command::WriteInvalidateReq => Some(Command::WriteInvalidateResp),
            Command::UpgradeReq => Some(Command::UpgradeResp),
            Command::ReadExReq => Some(Command::ReadExResp),
            _ => None,
        }
    }

    #[inline]
    pub fn is_read(self) -> bool {
        self.attrs().contains(CommandAttrs::READ)
    }

    #[inline]
    pub fn is_write(self) -> bool {
        self.attrs().contains(CommandAttrs::WRITE)
    }

    #[inline]
    pub fn is_invalidate(self) -> bool {
        self.attrs().contains(CommandAttrs::INVALIDATE)
    }

    #[inline]
    pub fn is_request(self) -> bool {
        self.attrs().contains(CommandAttrs::REQUEST)
    }

    #[inline]
    pub fn is_response(self) -> bool {
        self.attrs().contains(CommandAttrs::RESPONSE)
    }

    #[inline]
    pub fn needs_response(self) -> bool {
        self.attrs().contains(CommandAttrs::NEEDS_RESPONSE)
    }

    #[inline]
    pub fn has_data(self) -> bool {
        self.attrs().contains(CommandAttrs::HAS_DATA)
    }

    #[inline]
    pub fn needs_exclusive(self) -> bool {
        self.attrs().contains(CommandAttrs::NEEDS_EXCLUSIVE)
    }

    #[inline]
    pub fn is_prefetch(self) -> bool {
        self.attrs().contains(CommandAttrs::PREFETCH)
    }

    #[inline]
    pub fn is_writeback(self) -> bool {
        self.attrs().contains(CommandAttrs::WRITEBACK)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Transient per-packet coherence flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u16 {
        /// Some agent has already produced the data for this request
        const SATISFIED = 1 << 0;
        /// A snooper holds a copy of the line
        const SHARED_LINE = 1 << 1;
        /// A snooper could not handle the packet right now
        const NACKED_LINE = 1 << 2;
        /// Upward invalidate from a lower cache level
        const SNOOP_COMMIT = 1 << 3;
        /// Response fills a cache line
        const CACHE_LINE_FILL = 1 << 4;
        /// Do not allocate the line on fill
        const NO_ALLOCATE = 1 << 5;
    }
}

/// Outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PacketResult {
    #[default]
    Unknown,
    Success,
    Nacked,
    BadAddress,
}

/// Small accesses keep their data inline
pub const STATIC_DATA_BYTES: usize = 8;

/// Packet payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PacketData {
    #[default]
    None,
    /// Inline buffer for accesses of at most [`STATIC_DATA_BYTES`]
    Static {
        buf: [u8; STATIC_DATA_BYTES],
        len: usize,
    },
    /// Heap buffer, used for line-sized transfers
    Dynamic(Vec<u8>),
}

impl PacketData {
    fn with_len(len: usize) -> Self {
        if len <= STATIC_DATA_BYTES {
            PacketData::Static {
                buf: [0; STATIC_DATA_BYTES],
                len,
            }
        } else {
            PacketData::Dynamic(vec![0; len])
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            PacketData::None => &[],
            PacketData::Static { buf, len } => &buf[..*len],
            PacketData::Dynamic(v) => v,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            PacketData::None => &mut [],
            PacketData::Static { buf, len } => &mut buf[..*len],
            PacketData::Dynamic(v) => v,
        }
    }
}

/// Memory packet
///
/// Not `Clone`: a packet has exactly one owner at any time.
#[derive(Debug)]
pub struct Packet {
    cmd: Command,
    req: Request,
    addr: Addr,
    size: usize,
    data: PacketData,
    /// Outcome of the transaction
    pub result: PacketResult,
    flags: PacketFlags,
    /// Correlation token of the miss entry that issued this packet
    pub sender_state: Option<MshrId>,
    /// Bus port the packet entered on
    pub src: Option<usize>,
    /// Bus port a response must be routed to
    pub dest: Option<usize>,
    /// Tick at which the packet was last handed to a link
    pub time: Tick,
}

impl Packet {
    /// Create a packet covering exactly the range of `req`
    pub fn new(cmd: Command, req: Request) -> Self {
        let addr = req.paddr();
        let size = req.size();
        Self::with_range(cmd, req, addr, size)
    }

    /// Create a packet for a range other than the request's own
    ///
    /// Used for block-aligned bus transfers made on behalf of `req`.
    pub fn with_range(cmd: Command, req: Request, addr: Addr, size: usize) -> Self {
        debug_assert!(req.is_translated(), "packet built from untranslated request");
        Self {
            cmd,
            time: req.time(),
            req,
            addr,
            size,
            data: PacketData::None,
            result: PacketResult::Unknown,
            flags: PacketFlags::empty(),
            sender_state: None,
            src: None,
            dest: None,
        }
    }

    #[inline]
    pub fn cmd(&self) -> Command {
        self.cmd
    }

    /// Change the command (bus shaping, restore after a refused send)
    pub fn set_cmd(&mut self, cmd: Command) {
        self.cmd = cmd;
    }

    pub fn req(&self) -> &Request {
        &self.req
    }

    pub fn req_mut(&mut self) -> &mut Request {
        &mut self.req
    }

    #[inline]
    pub fn addr(&self) -> Addr {
        self.addr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address of the line containing this packet
    #[inline]
    pub fn block_addr(&self, blk_size: usize) -> Addr {
        self.addr & !(blk_size as Addr - 1)
    }

    /// Byte offset of this packet within its line
    #[inline]
    pub fn offset(&self, blk_size: usize) -> usize {
        (self.addr & (blk_size as Addr - 1)) as usize
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.flags |= flags;
    }

    pub fn clear_flags(&mut self, flags: PacketFlags) {
        self.flags &= !flags;
    }

    pub fn has_flags(&self, flags: PacketFlags) -> bool {
        self.flags.contains(flags)
    }

    pub fn is_satisfied(&self) -> bool {
        self.flags.contains(PacketFlags::SATISFIED)
    }

    /// Record that some agent has produced this packet's result
    ///
    /// # Errors
    ///
    /// A packet can be satisfied once. Satisfying it a second time is a
    /// protocol violation reported against `component`.
    pub fn mark_satisfied(&mut self, component: &str) -> Result<()> {
        if self.is_satisfied() {
            return Err(SimError::violation(
                component,
                self.addr,
                self.cmd,
                "satisfied",
                "packet satisfied twice",
            ));
        }
        self.flags |= PacketFlags::SATISFIED;
        Ok(())
    }

    pub fn is_cache_fill(&self) -> bool {
        self.flags.contains(PacketFlags::CACHE_LINE_FILL)
    }

    pub fn is_no_allocate(&self) -> bool {
        self.flags.contains(PacketFlags::NO_ALLOCATE)
    }

    pub fn is_uncacheable(&self) -> bool {
        self.req.is_uncacheable()
    }

    #[inline]
    pub fn is_read(&self) -> bool {
        self.cmd.is_read()
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.cmd.is_write()
    }

    #[inline]
    pub fn is_invalidate(&self) -> bool {
        self.cmd.is_invalidate()
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.cmd.is_request()
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.cmd.is_response()
    }

    #[inline]
    pub fn needs_response(&self) -> bool {
        self.cmd.needs_response()
    }

    /// Whether `self` and `other` touch at least one common byte
    pub fn intersects(&self, other: &Packet) -> bool {
        self.addr < other.addr + other.size as Addr && other.addr < self.addr + self.size as Addr
    }

    /// Turn a timing request into its response, routed back to its source
    ///
    /// An unset result becomes [`PacketResult::Success`].
    pub fn make_timing_response(&mut self) -> Result<()> {
        self.make_atomic_response()?;
        self.dest = self.src;
        self.src = None;
        Ok(())
    }

    /// Turn an atomic request into its response in place
    pub fn make_atomic_response(&mut self) -> Result<()> {
        let Some(resp) = self.cmd.response() else {
            return Err(SimError::violation(
                "packet",
                self.addr,
                self.cmd,
                format!("{:?}", self.result),
                "command has no response",
            ));
        };
        self.cmd = resp;
        if self.result == PacketResult::Unknown {
            self.result = PacketResult::Success;
        }
        Ok(())
    }

    /// Reset a response back into a fresh request with command `cmd`
    ///
    /// Keeps the data buffer and the correlation token.
    pub fn reinit_request(&mut self, cmd: Command) {
        self.cmd = cmd;
        self.result = PacketResult::Unknown;
        self.flags &= PacketFlags::CACHE_LINE_FILL | PacketFlags::NO_ALLOCATE;
        self.dest = None;
    }

    // Data access

    /// Make sure the packet carries a zeroed buffer of `size()` bytes
    pub fn allocate(&mut self) {
        if self.data.as_slice().len() != self.size {
            self.data = PacketData::with_len(self.size);
        }
    }

    pub fn has_data_buffer(&self) -> bool {
        !matches!(self.data, PacketData::None)
    }

    pub fn data_kind(&self) -> &PacketData {
        &self.data
    }

    /// Packet payload (empty if no buffer is attached)
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Mutable payload, allocating the buffer on first use
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.allocate();
        self.data.as_mut_slice()
    }

    /// Copy `bytes` into the payload, starting at offset 0
    pub fn set_data(&mut self, bytes: &[u8]) {
        let dst = self.data_mut();
        let n = dst.len().min(bytes.len());
        dst[..n].copy_from_slice(&bytes[..n]);
    }

    /// Read the payload as a little-endian integer of `size()` bytes (at most 8)
    pub fn get_uint(&self) -> u64 {
        self.data()
            .iter()
            .take(8)
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc | (*b as u64) << (8 * i))
    }

    /// Store a little-endian integer into the payload
    pub fn set_uint(&mut self, value: u64) {
        for (i, b) in self.data_mut().iter_mut().take(8).enumerate() {
            *b = (value >> (8 * i)) as u8;
        }
    }

    /// Patch a functional packet against an overlapping timing packet
    ///
    /// A functional read picks up the bytes the timing packet is carrying.
    /// A functional write pushes its bytes into the timing packet, so the
    /// pending transaction delivers the newest value.
    ///
    /// # Returns
    ///
    /// true if the two packets overlapped and data was exchanged
    pub fn fix_packet(&mut self, timing: &mut Packet) -> bool {
        if !self.intersects(timing) || !timing.has_data_buffer() {
            return false;
        }
        self.allocate();

        let start = self.addr.max(timing.addr);
        let end = (self.addr + self.size as Addr).min(timing.addr + timing.size as Addr);
        let len = (end - start) as usize;
        let func_off = (start - self.addr) as usize;
        let timing_off = (start - timing.addr) as usize;

        if !timing.cmd.has_data() {
            return false;
        }
        if self.cmd.is_write() {
            let src = self.data()[func_off..func_off + len].to_vec();
            timing.data_mut()[timing_off..timing_off + len].copy_from_slice(&src);
            true
        } else {
            let src = timing.data()[timing_off..timing_off + len].to_vec();
            self.data_mut()[func_off..func_off + len].copy_from_slice(&src);
            true
        }
    }
}
