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

//! Memory transport: requests, packets, links, the snooping bus and the
//! backing store

pub mod bus;
pub mod packet;
pub mod physical;
pub mod port;
pub mod request;

#[cfg(test)]
mod tests;

/// Physical or virtual address
pub type Addr = u64;

pub use bus::{BusParams, CoherentBus};
pub use packet::{Command, Packet, PacketFlags, PacketResult};
pub use physical::PhysicalMemory;
pub use port::{Delivery, PortRef, SnoopReply};
pub use request::{Request, RequestFlags};
