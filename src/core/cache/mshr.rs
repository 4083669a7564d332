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

//! Miss status holding registers

use std::collections::VecDeque;

use crate::core::mem::packet::{Command, Packet};
use crate::core::mem::Addr;
use crate::core::timing::Tick;

/// Correlation token carried by bus-side packets
///
/// Identifies a slot in the miss queue plus the generation of the entry
/// occupying it, so a response for a freed and reused slot is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MshrId {
    index: u32,
    generation: u32,
}

impl MshrId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// What an entry is tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MshrKind {
    /// Cacheable line miss; may collect several targets
    Miss,
    /// Uncacheable access; exactly one target
    Uncacheable,
    /// Dirty data on its way to the next level
    Writeback,
}

/// One outstanding transaction
#[derive(Debug)]
pub struct Mshr {
    pub(crate) id: MshrId,
    pub kind: MshrKind,
    /// Line address (exact address for uncacheable entries)
    pub addr: Addr,
    pub size: usize,
    /// Command of the access that allocated the entry
    pub orig_cmd: Command,
    /// Command last put on the bus for this entry
    pub bus_cmd: Command,
    /// Whether the bus packet will fill a line
    pub cache_fill: bool,
    /// Outgoing packet; `None` while it is in service
    pub pkt: Option<Packet>,
    pub in_service: bool,
    /// Accesses waiting on this entry, oldest first
    pub targets: VecDeque<Packet>,
    /// Earliest tick the bus packet may be sent
    pub ready_time: Tick,
    /// Allocation order, for FIFO tie-breaking
    pub(crate) order: u64,
}

impl Mshr {
    pub fn id(&self) -> MshrId {
        self.id
    }

    pub fn is_writeback(&self) -> bool {
        self.kind == MshrKind::Writeback
    }

    pub fn is_uncacheable(&self) -> bool {
        self.kind == MshrKind::Uncacheable
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Whether the outgoing transaction expects a response
    pub fn needs_response(&self) -> bool {
        self.bus_cmd.needs_response()
    }
}
