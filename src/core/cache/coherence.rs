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

//! Coherence engine
//!
//! A [`CoherenceProtocol`] decides three things for a cache:
//!
//! - which command to put on the bus for a miss ([`get_bus_cmd`])
//! - which state a line takes when a fill arrives ([`get_new_state`])
//! - how to react to a peer's snoop ([`handle_bus_request`])
//!
//! Implementations keep no state apart from statistics.
//!
//! # Snoop table ([`SnoopingCoherence`])
//!
//! | Line | Read snoop                              | ReadEx snoop          | Upgrade / invalidate |
//! |------|-----------------------------------------|-----------------------|----------------------|
//! | S    | assert shared, stay S                   | go I                  | go I                 |
//! | E    | assert shared, go S                     | go I                  | go I (Upgrade: error)|
//! | O    | supply, assert shared, stay O           | supply, go I          | go I                 |
//! | M    | supply, assert shared, go O (MOSI/MOESI) or S with writeback (MSI/MESI) | supply, go I | go I (Upgrade: error)|
//!
//! [`get_bus_cmd`]: CoherenceProtocol::get_bus_cmd
//! [`get_new_state`]: CoherenceProtocol::get_new_state
//! [`handle_bus_request`]: CoherenceProtocol::handle_bus_request

use serde::{Deserialize, Serialize};

use super::blk::{BlkStatus, CacheBlk};
use super::mshr::Mshr;
use crate::core::error::{Result, SimError};
use crate::core::mem::packet::{Command, Packet, PacketFlags};

/// Protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Single agent, no snooping protocol
    None,
    Msi,
    #[default]
    Mesi,
    Mosi,
    Moesi,
}

impl ProtocolKind {
    /// Build the coherence engine for this protocol
    pub fn build(self, propagate_invalidates: bool) -> Box<dyn CoherenceProtocol> {
        match self {
            ProtocolKind::None => Box::new(UniCoherence::new(propagate_invalidates)),
            kind => Box::new(SnoopingCoherence {
                kind,
                propagate_invalidates,
                stats: CoherenceStats::default(),
            }),
        }
    }

    /// Whether a clean fill with no other sharer may be taken exclusive
    fn has_exclusive(self) -> bool {
        matches!(self, ProtocolKind::Mesi | ProtocolKind::Moesi)
    }

    /// Whether a dirty line may be shared without writing it back
    fn has_owned(self) -> bool {
        matches!(self, ProtocolKind::Mosi | ProtocolKind::Moesi)
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "uni" => Ok(ProtocolKind::None),
            "msi" => Ok(ProtocolKind::Msi),
            "mesi" => Ok(ProtocolKind::Mesi),
            "mosi" => Ok(ProtocolKind::Mosi),
            "moesi" => Ok(ProtocolKind::Moesi),
            other => Err(SimError::Config(format!("unknown coherence protocol '{}'", other))),
        }
    }
}

/// Result of a snoop decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnoopDecision {
    /// This cache supplies the data
    pub satisfy: bool,
    /// State the line must take
    pub new_state: BlkStatus,
    /// The line's dirty data must be written back before it is downgraded
    pub writeback: bool,
}

impl SnoopDecision {
    fn keep(state: BlkStatus) -> Self {
        Self {
            satisfy: false,
            new_state: state,
            writeback: false,
        }
    }
}

/// Coherence statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoherenceStats {
    pub snoops: u64,
    pub supplies: u64,
    pub invalidations: u64,
    pub shared_asserted: u64,
}

/// Coherence policy used by a cache
pub trait CoherenceProtocol {
    fn name(&self) -> &'static str;

    /// Whether peers are kept coherent by snooping
    fn has_protocol(&self) -> bool;

    /// Whether a full-line write may allocate without fetching the line
    fn allow_fast_writes(&self) -> bool;

    /// Bus command for a miss of `cmd` against a line in `state`
    fn get_bus_cmd(&self, cmd: Command, state: BlkStatus) -> Command;

    /// State a line takes when the fill response `pkt` arrives
    fn get_new_state(&self, pkt: &Packet, old: BlkStatus) -> Result<BlkStatus>;

    /// Decide how to answer a snoop
    ///
    /// May set [`PacketFlags::SHARED_LINE`] on `pkt`. Supplying the data is
    /// left to the caller.
    fn handle_bus_request(
        &mut self,
        pkt: &mut Packet,
        blk: Option<&CacheBlk>,
        mshr: Option<&Mshr>,
    ) -> Result<SnoopDecision>;

    /// Invalidate to pass to upper cache levels, if any
    fn propagate_invalidate(&self, pkt: &Packet, timing: bool) -> Option<Packet>;

    fn stats(&self) -> &CoherenceStats;
}

impl<P: CoherenceProtocol + ?Sized> CoherenceProtocol for Box<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn has_protocol(&self) -> bool {
        (**self).has_protocol()
    }

    fn allow_fast_writes(&self) -> bool {
        (**self).allow_fast_writes()
    }

    fn get_bus_cmd(&self, cmd: Command, state: BlkStatus) -> Command {
        (**self).get_bus_cmd(cmd, state)
    }

    fn get_new_state(&self, pkt: &Packet, old: BlkStatus) -> Result<BlkStatus> {
        (**self).get_new_state(pkt, old)
    }

    fn handle_bus_request(
        &mut self,
        pkt: &mut Packet,
        blk: Option<&CacheBlk>,
        mshr: Option<&Mshr>,
    ) -> Result<SnoopDecision> {
        (**self).handle_bus_request(pkt, blk, mshr)
    }

    fn propagate_invalidate(&self, pkt: &Packet, timing: bool) -> Option<Packet> {
        (**self).propagate_invalidate(pkt, timing)
    }

    fn stats(&self) -> &CoherenceStats {
        (**self).stats()
    }
}

fn miss_bus_cmd(cmd: Command, state: BlkStatus) -> Command {
    match cmd {
        Command::ReadReq | Command::SoftPfReq | Command::HardPfReq => Command::ReadReq,
        Command::WriteReq | Command::WriteReqNoAck | Command::ReadExReq | Command::UpgradeReq => {
            if state.is_valid() && !state.is_writable() {
                Command::UpgradeReq
            } else {
                Command::ReadExReq
            }
        }
        other => other,
    }
}

fn build_invalidate(pkt: &Packet, propagate: bool) -> Option<Packet> {
    if !propagate || !pkt.is_invalidate() {
        return None;
    }
    let mut inval = Packet::with_range(
        Command::InvalidateReq,
        pkt.req().clone(),
        pkt.addr(),
        pkt.size(),
    );
    inval.set_flags(PacketFlags::SNOOP_COMMIT);
    Some(inval)
}

/// Coherence for a cache that is the only agent on its bus
///
/// Fills are always exclusive and full-line writes may allocate directly.
/// Invalidations from other requesters (e.g. DMA) are still honored.
#[derive(Debug, Clone, Default)]
pub struct UniCoherence {
    propagate_invalidates: bool,
    stats: CoherenceStats,
}

impl UniCoherence {
    pub fn new(propagate_invalidates: bool) -> Self {
        Self {
            propagate_invalidates,
            stats: CoherenceStats::default(),
        }
    }
}

impl CoherenceProtocol for UniCoherence {
    fn name(&self) -> &'static str {
        "uni"
    }

    fn has_protocol(&self) -> bool {
        false
    }

    fn allow_fast_writes(&self) -> bool {
        true
    }

    fn get_bus_cmd(&self, cmd: Command, state: BlkStatus) -> Command {
        miss_bus_cmd(cmd, state)
    }

    fn get_new_state(&self, pkt: &Packet, _old: BlkStatus) -> Result<BlkStatus> {
        match pkt.cmd() {
            Command::ReadResp | Command::PfResp => Ok(BlkStatus::EXCLUSIVE),
            Command::ReadExResp | Command::UpgradeResp | Command::WriteInvalidateResp => {
                Ok(BlkStatus::MODIFIED)
            }
            cmd => Err(SimError::violation(
                "uni-coherence",
                pkt.addr(),
                cmd,
                "fill",
                "response does not fill a line",
            )),
        }
    }

    fn handle_bus_request(
        &mut self,
        pkt: &mut Packet,
        blk: Option<&CacheBlk>,
        _mshr: Option<&Mshr>,
    ) -> Result<SnoopDecision> {
        self.stats.snoops += 1;
        let state = blk.map(|b| b.status.state()).unwrap_or(BlkStatus::INVALID);
        if pkt.is_invalidate() && state.is_valid() {
            self.stats.invalidations += 1;
            return Ok(SnoopDecision::keep(BlkStatus::INVALID));
        }
        Ok(SnoopDecision::keep(state))
    }

    fn propagate_invalidate(&self, pkt: &Packet, _timing: bool) -> Option<Packet> {
        build_invalidate(pkt, self.propagate_invalidates)
    }

    fn stats(&self) -> &CoherenceStats {
        &self.stats
    }
}

/// Snooping MSI / MESI / MOSI / MOESI coherence
#[derive(Debug, Clone)]
pub struct SnoopingCoherence {
    kind: ProtocolKind,
    propagate_invalidates: bool,
    stats: CoherenceStats,
}

impl SnoopingCoherence {
    /// # Errors
    ///
    /// [`ProtocolKind::None`] is not a snooping protocol.
    pub fn new(kind: ProtocolKind, propagate_invalidates: bool) -> Result<Self> {
        if kind == ProtocolKind::None {
            return Err(SimError::Config(
                "snooping coherence needs a protocol other than 'none'".into(),
            ));
        }
        Ok(Self {
            kind,
            propagate_invalidates,
            stats: CoherenceStats::default(),
        })
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn invalid_transition(&self, pkt: &Packet, state: BlkStatus) -> SimError {
        SimError::violation(
            self.name(),
            pkt.addr(),
            pkt.cmd(),
            state.state_name(),
            "invalid snoop transition",
        )
    }
}

impl CoherenceProtocol for SnoopingCoherence {
    fn name(&self) -> &'static str {
        match self.kind {
            ProtocolKind::None => "none",
            ProtocolKind::Msi => "msi",
            ProtocolKind::Mesi => "mesi",
            ProtocolKind::Mosi => "mosi",
            ProtocolKind::Moesi => "moesi",
        }
    }

    fn has_protocol(&self) -> bool {
        true
    }

    fn allow_fast_writes(&self) -> bool {
        false
    }

    fn get_bus_cmd(&self, cmd: Command, state: BlkStatus) -> Command {
        miss_bus_cmd(cmd, state)
    }

    fn get_new_state(&self, pkt: &Packet, _old: BlkStatus) -> Result<BlkStatus> {
        match pkt.cmd() {
            Command::ReadResp | Command::PfResp => {
                if pkt.has_flags(PacketFlags::SHARED_LINE) || !self.kind.has_exclusive() {
                    Ok(BlkStatus::SHARED)
                } else {
                    Ok(BlkStatus::EXCLUSIVE)
                }
            }
            Command::ReadExResp | Command::UpgradeResp | Command::WriteInvalidateResp => {
                Ok(BlkStatus::MODIFIED)
            }
            cmd => Err(SimError::violation(
                self.name(),
                pkt.addr(),
                cmd,
                "fill",
                "response does not fill a line",
            )),
        }
    }

    fn handle_bus_request(
        &mut self,
        pkt: &mut Packet,
        blk: Option<&CacheBlk>,
        _mshr: Option<&Mshr>,
    ) -> Result<SnoopDecision> {
        self.stats.snoops += 1;

        let state = match blk {
            Some(b) if b.is_valid() => b.status.state(),
            _ => return Ok(SnoopDecision::keep(BlkStatus::INVALID)),
        };

        let decision = match pkt.cmd() {
            Command::ReadReq | Command::SoftPfReq | Command::HardPfReq => {
                pkt.set_flags(PacketFlags::SHARED_LINE);
                self.stats.shared_asserted += 1;
                if state == BlkStatus::MODIFIED {
                    if self.kind.has_owned() {
                        SnoopDecision {
                            satisfy: true,
                            new_state: BlkStatus::OWNED,
                            writeback: false,
                        }
                    } else {
                        SnoopDecision {
                            satisfy: true,
                            new_state: BlkStatus::SHARED,
                            writeback: true,
                        }
                    }
                } else if state == BlkStatus::OWNED {
                    SnoopDecision {
                        satisfy: true,
                        new_state: BlkStatus::OWNED,
                        writeback: false,
                    }
                } else {
                    SnoopDecision::keep(BlkStatus::SHARED)
                }
            }
            Command::ReadExReq => SnoopDecision {
                satisfy: state.is_dirty(),
                new_state: BlkStatus::INVALID,
                writeback: false,
            },
            Command::UpgradeReq => {
                if state.is_writable() {
                    return Err(self.invalid_transition(pkt, state));
                }
                SnoopDecision::keep(BlkStatus::INVALID)
            }
            Command::InvalidateReq | Command::WriteInvalidateReq => {
                SnoopDecision::keep(BlkStatus::INVALID)
            }
            _ => SnoopDecision::keep(state),
        };

        if decision.satisfy {
            self.stats.supplies += 1;
        }
        if !decision.new_state.is_valid() {
            self.stats.invalidations += 1;
        }
        Ok(decision)
    }

    fn propagate_invalidate(&self, pkt: &Packet, _timing: bool) -> Option<Packet> {
        build_invalidate(pkt, self.propagate_invalidates)
    }

    fn stats(&self) -> &CoherenceStats {
        &self.stats
    }
}
