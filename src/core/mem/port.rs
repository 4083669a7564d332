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

//! Link endpoints
//!
//! Two components talk through a *link*: a bidirectional, flow-controlled
//! channel with one endpoint on each side. A [`PortRef`] names one endpoint;
//! its peer is the other side of the same link.
//!
//! Each endpoint tracks whether it is owed a retry. A timing send that the peer
//! refuses leaves the sender in [`PortState::WaitingForRetry`] until the peer
//! signals capacity, and until then any further send from that endpoint is
//! refused without reaching the peer. That keeps the refused packet first in
//! line.

use serde::Serialize;

use super::packet::Packet;
use crate::core::timing::Tick;

/// Index of a link in the fabric
pub type LinkId = usize;

/// Index of a simulation object in the fabric
pub type ObjectId = usize;

/// One of the two ends of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    #[inline]
    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

/// Reference to a link endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub link: LinkId,
    pub side: Side,
}

impl PortRef {
    pub fn new(link: LinkId, side: Side) -> Self {
        Self { link, side }
    }

    /// The endpoint at the other side of the same link
    #[inline]
    pub fn peer(self) -> PortRef {
        PortRef {
            link: self.link,
            side: self.side.peer(),
        }
    }
}

/// Per-direction flow-control state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PortState {
    #[default]
    Idle,
    WaitingForRetry,
}

/// Outcome of a timing send
#[derive(Debug)]
pub enum Delivery {
    /// The peer took ownership of the packet
    Accepted,
    /// The peer could not take the packet; ownership returns to the sender
    Refused(Packet),
}

impl Delivery {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Delivery::Accepted)
    }
}

/// Outcome of a snoop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoopReply {
    /// Nothing to supply; the snooper may have changed its own line state
    Ignored,
    /// The snooper supplied the data, ready at `ready`
    Supplied { ready: Tick },
    /// The snooper cannot handle the packet right now
    Nacked,
}

/// Link status notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The address ranges served behind the sending endpoint changed
    RangeChange,
}

/// One end of a link
#[derive(Debug, Clone)]
pub struct LinkEnd {
    /// Component owning this end
    pub object: ObjectId,
    /// Name of the port on the owning component
    pub port: String,
    /// Flow-control state for packets sent *from* this end
    pub state: PortState,
    /// A retry event is already scheduled for this end
    pub(crate) retry_scheduled: bool,
    /// Packets accepted by the peer
    pub sent: u64,
    /// Packets refused by the peer (including auto-refusals while waiting)
    pub refused: u64,
}

impl LinkEnd {
    fn new(object: ObjectId, port: &str) -> Self {
        Self {
            object,
            port: port.to_string(),
            state: PortState::Idle,
            retry_scheduled: false,
            sent: 0,
            refused: 0,
        }
    }
}

/// A point-to-point link between two component ports
#[derive(Debug, Clone)]
pub struct Link {
    name: String,
    ends: [LinkEnd; 2],
}

impl Link {
    pub fn new(a: (ObjectId, &str), b: (ObjectId, &str), name: String) -> Self {
        Self {
            name,
            ends: [LinkEnd::new(a.0, a.1), LinkEnd::new(b.0, b.1)],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn end(&self, side: Side) -> &LinkEnd {
        &self.ends[side.index()]
    }

    pub fn end_mut(&mut self, side: Side) -> &mut LinkEnd {
        &mut self.ends[side.index()]
    }
}
