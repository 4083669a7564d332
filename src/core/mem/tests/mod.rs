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

//! Memory transport tests
//!
//! - `packet`: command attributes, responses and payload handling
//! - `request`: translation and derived requests
//! - `link`: flow control between two endpoints
//! - `bus`: arbitration, snooping and response routing
//! - `physical`: the backing store on its own

use std::any::Any;

use crate::core::error::Result;
use crate::core::mem::port::{Delivery, PortRef, SnoopReply};
use crate::core::mem::{Addr, Command, Packet, Request, RequestFlags};
use crate::core::sim::fabric::{Fabric, ObjectEvent, SimObject};
use crate::core::timing::Tick;

mod bus;
mod link;

pub(super) fn request(addr: Addr, size: usize) -> Request {
    Request::new_physical(addr, size, RequestFlags::empty(), 0)
}

pub(super) fn read_pkt(addr: Addr, size: usize) -> Packet {
    let mut pkt = Packet::new(Command::ReadReq, request(addr, size));
    pkt.allocate();
    pkt
}

pub(super) fn write_pkt(addr: Addr, size: usize, value: u64) -> Packet {
    let mut pkt = Packet::new(Command::WriteReq, request(addr, size));
    pkt.set_uint(value);
    pkt
}

/// How a [`Stub`] answers snoops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SnoopMode {
    Ignore,
    /// Supply `value` `delay` ticks from now
    Supply { value: u64, delay: Tick },
    /// NACK the next snoop, then ignore
    NackOnce,
}

/// Endpoint with scripted behavior
pub(super) struct Stub {
    name: String,
    pub port: Option<PortRef>,
    pub accept: bool,
    pub snoop: SnoopMode,
    /// Packets offered to this endpoint, accepted or not
    pub offers: usize,
    pub received: Vec<Packet>,
    pub retries: usize,
    pub snooped: Vec<Command>,
}

impl Stub {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            port: None,
            accept: true,
            snoop: SnoopMode::Ignore,
            offers: 0,
            received: Vec::new(),
            retries: 0,
            snooped: Vec::new(),
        }
    }

    pub fn refusing(name: &str) -> Self {
        Self {
            accept: false,
            ..Self::new(name)
        }
    }
}

impl SimObject for Stub {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_port(&mut self, _name: &str, port: PortRef) -> Result<()> {
        self.port = Some(port);
        Ok(())
    }

    fn recv_timing(&mut self, _fabric: &mut Fabric, _port: PortRef, pkt: Packet) -> Result<Delivery> {
        self.offers += 1;
        if !self.accept {
            return Ok(Delivery::Refused(pkt));
        }
        self.received.push(pkt);
        Ok(Delivery::Accepted)
    }

    fn recv_retry(&mut self, _fabric: &mut Fabric, _port: PortRef) -> Result<()> {
        self.retries += 1;
        Ok(())
    }

    fn recv_atomic(&mut self, _fabric: &mut Fabric, _port: PortRef, pkt: &mut Packet) -> Result<Tick> {
        if pkt.needs_response() {
            pkt.make_atomic_response()?;
        }
        Ok(7)
    }

    fn recv_functional(&mut self, _fabric: &mut Fabric, _port: PortRef, _pkt: &mut Packet) -> Result<()> {
        Ok(())
    }

    fn recv_snoop(&mut self, fabric: &mut Fabric, _port: PortRef, pkt: &mut Packet) -> Result<SnoopReply> {
        self.snooped.push(pkt.cmd());
        match self.snoop {
            SnoopMode::Ignore => Ok(SnoopReply::Ignored),
            SnoopMode::Supply { value, delay } => {
                pkt.mark_satisfied(&self.name)?;
                pkt.set_uint(value);
                Ok(SnoopReply::Supplied {
                    ready: fabric.now() + delay,
                })
            }
            SnoopMode::NackOnce => {
                self.snoop = SnoopMode::Ignore;
                Ok(SnoopReply::Nacked)
            }
        }
    }

    fn process_event(&mut self, _fabric: &mut Fabric, _event: ObjectEvent) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
