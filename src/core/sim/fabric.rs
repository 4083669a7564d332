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

//! Simulation fabric
//!
//! The [`Fabric`] owns every simulation object, every link between them and
//! the event queue. Components never hold references to each other: they talk
//! through the fabric, naming the endpoint they send from.
//!
//! While a component is handling a call it is taken out of its slot. A call
//! that would re-enter it (A calls B which synchronously calls A) fails with
//! [`SimError::Reentrant`]. Components therefore defer anything that would
//! loop back to an event.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::stats::StatsSink;
use crate::core::error::{Result, SimError};
use crate::core::mem::packet::Packet;
use crate::core::mem::port::{
    Delivery, Link, LinkId, ObjectId, PortRef, PortState, Side, SnoopReply, StatusChange,
};
use crate::core::timing::{EventHandle, Tick, TimingEventManager};

/// How the memory system is being accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Synchronous accesses through the caches
    Atomic,
    /// Event-driven accesses with retries
    #[default]
    Timing,
    /// Synchronous accesses that bypass the caches
    AtomicNoncaching,
}

impl MemoryMode {
    pub fn is_atomic_mode(self) -> bool {
        matches!(self, MemoryMode::Atomic | MemoryMode::AtomicNoncaching)
    }

    pub fn is_timing_mode(self) -> bool {
        self == MemoryMode::Timing
    }

    pub fn bypass_caches(self) -> bool {
        self == MemoryMode::AtomicNoncaching
    }
}

/// Why the simulation loop stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    /// A CPU committed its instruction limit
    MaxInsts { cpu: String },
    /// A cache hit its miss limit
    MaxMissCount { cache: String },
    /// The requested tick limit was reached
    TickLimit,
    /// Every drainable object reported drained
    Drained,
    /// Nothing left to simulate
    EventQueueEmpty,
    /// Requested by a component
    User(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::MaxInsts { cpu } => write!(f, "{}: a thread reached the max instruction count", cpu),
            ExitReason::MaxMissCount { cache } => write!(f, "{}: a cache reached the maximum miss count", cache),
            ExitReason::TickLimit => write!(f, "simulate() limit reached"),
            ExitReason::Drained => write!(f, "drained"),
            ExitReason::EventQueueEmpty => write!(f, "event queue empty"),
            ExitReason::User(msg) => write!(f, "{}", msg),
        }
    }
}

/// Component-local events
#[derive(Debug)]
pub enum ObjectEvent {
    /// Fetch the next instruction
    Fetch,
    /// Finish an instruction fetch at the clock edge
    CompleteIfetch(Packet),
    /// Finish a data access at the clock edge
    CompleteDataAccess(Packet),
    /// Send queued requests downstream
    SendRequests,
    /// Deliver a response toward the requester
    Respond(Packet),
    /// The bus is free again
    BusIdle,
    /// Issue the next generated access
    Issue,
}

/// Fabric-level events
#[derive(Debug)]
pub enum Event {
    /// Deliver a retry to the endpoint that is waiting for one
    Retry(PortRef),
    /// Deliver a local event to its component
    Object {
        object: ObjectId,
        event: ObjectEvent,
    },
}

/// A simulation component
///
/// Every callback receives the fabric so the component can send, schedule
/// and query time. `port` is always the component's own endpoint.
pub trait SimObject: Any {
    fn name(&self) -> &str;

    /// Attach one of this component's named ports to a link endpoint
    fn bind_port(&mut self, name: &str, port: PortRef) -> Result<()>;

    /// Called once after all links are connected
    fn init(&mut self, _id: ObjectId, _fabric: &mut Fabric) -> Result<()> {
        Ok(())
    }

    fn recv_timing(&mut self, fabric: &mut Fabric, port: PortRef, pkt: Packet) -> Result<Delivery>;

    fn recv_retry(&mut self, fabric: &mut Fabric, port: PortRef) -> Result<()>;

    fn recv_atomic(&mut self, fabric: &mut Fabric, port: PortRef, pkt: &mut Packet) -> Result<Tick>;

    fn recv_functional(&mut self, fabric: &mut Fabric, port: PortRef, pkt: &mut Packet)
        -> Result<()>;

    fn recv_snoop(&mut self, _fabric: &mut Fabric, _port: PortRef, _pkt: &mut Packet) -> Result<SnoopReply> {
        Ok(SnoopReply::Ignored)
    }

    fn recv_status_change(&mut self, _fabric: &mut Fabric, _port: PortRef, _status: StatusChange) -> Result<()> {
        Ok(())
    }

    fn process_event(&mut self, fabric: &mut Fabric, event: ObjectEvent) -> Result<()>;

    /// Start draining
    ///
    /// # Returns
    ///
    /// Number of [`Fabric::signal_drained`] calls this object will make
    /// before it is drained (0 if it is drained already)
    fn drain(&mut self, _fabric: &mut Fabric) -> Result<usize> {
        Ok(0)
    }

    fn resume(&mut self, _fabric: &mut Fabric) -> Result<()> {
        Ok(())
    }

    fn dump_stats(&self, _sink: &mut dyn StatsSink) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Slot {
    name: String,
    object: Option<Box<dyn SimObject>>,
}

/// Objects, links and the event queue
pub struct Fabric {
    timing: TimingEventManager<Event>,
    objects: Vec<Slot>,
    links: Vec<Link>,
    memory_mode: MemoryMode,
    exit: Option<ExitReason>,
    drain_outstanding: usize,
}

impl Fabric {
    pub fn new(memory_mode: MemoryMode) -> Self {
        Self {
            timing: TimingEventManager::new(),
            objects: Vec::new(),
            links: Vec::new(),
            memory_mode,
            exit: None,
            drain_outstanding: 0,
        }
    }

    // Objects and links

    pub fn add_object(&mut self, object: Box<dyn SimObject>) -> ObjectId {
        let id = self.objects.len();
        log::debug!("Fabric: object {} = {}", id, object.name());
        self.objects.push(Slot {
            name: object.name().to_string(),
            object: Some(object),
        });
        id
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn object_name(&self, id: ObjectId) -> Option<&str> {
        self.objects.get(id).map(|s| s.name.as_str())
    }

    /// Connect port `a_port` of `a` to port `b_port` of `b`
    pub fn connect(&mut self, a: ObjectId, a_port: &str, b: ObjectId, b_port: &str) -> Result<LinkId> {
        let link = self.links.len();
        let name = format!(
            "{}.{}<->{}.{}",
            self.object_name(a).ok_or(SimError::UnknownObject(a))?,
            a_port,
            self.object_name(b).ok_or(SimError::UnknownObject(b))?,
            b_port
        );
        log::debug!("Fabric: link {} = {}", link, name);

        self.links.push(Link::new((a, a_port), (b, b_port), name));
        self.with_object(a, |obj, _| obj.bind_port(a_port, PortRef::new(link, Side::A)))?;
        self.with_object(b, |obj, _| obj.bind_port(b_port, PortRef::new(link, Side::B)))?;
        Ok(link)
    }

    pub fn link(&self, id: LinkId) -> Result<&Link> {
        self.links.get(id).ok_or(SimError::UnknownLink(id))
    }

    fn link_mut(&mut self, id: LinkId) -> Result<&mut Link> {
        self.links.get_mut(id).ok_or(SimError::UnknownLink(id))
    }

    /// Hand one end of a link to a different component
    ///
    /// The peer end and the flow-control state are left untouched, so
    /// in-flight transactions stay routed to whoever now owns the end.
    pub fn rebind_port(&mut self, port: PortRef, new_owner: ObjectId) -> Result<()> {
        if new_owner >= self.objects.len() {
            return Err(SimError::UnknownObject(new_owner));
        }
        let end = self.link_mut(port.link)?.end_mut(port.side);
        log::debug!("Fabric: rebinding {}:{} from {} to {}", port.link, end.port, end.object, new_owner);
        end.object = new_owner;
        Ok(())
    }

    pub fn port_state(&self, port: PortRef) -> Result<PortState> {
        Ok(self.link(port.link)?.end(port.side).state)
    }

    /// Run `f` on object `id` with the object temporarily taken out
    pub fn with_object<R>(
        &mut self,
        id: ObjectId,
        f: impl FnOnce(&mut dyn SimObject, &mut Fabric) -> Result<R>,
    ) -> Result<R> {
        let slot = self.objects.get_mut(id).ok_or(SimError::UnknownObject(id))?;
        let mut object = slot
            .object
            .take()
            .ok_or_else(|| SimError::Reentrant(slot.name.clone()))?;
        let result = f(object.as_mut(), self);
        self.objects[id].object = Some(object);
        result
    }

    /// Typed variant of [`with_object`](Self::with_object)
    pub fn with<T: SimObject, R>(
        &mut self,
        id: ObjectId,
        f: impl FnOnce(&mut T, &mut Fabric) -> Result<R>,
    ) -> Result<R> {
        self.with_object(id, |obj, fabric| {
            let name = obj.name().to_string();
            match obj.as_any_mut().downcast_mut::<T>() {
                Some(typed) => f(typed, fabric),
                None => Err(SimError::Config(format!(
                    "{} is not a {}",
                    name,
                    std::any::type_name::<T>()
                ))),
            }
        })
    }

    /// Borrow object `id` as a `T`
    ///
    /// Returns `None` if the object is of another type or is busy.
    pub fn object<T: SimObject>(&self, id: ObjectId) -> Option<&T> {
        self.objects
            .get(id)?
            .object
            .as_ref()?
            .as_any()
            .downcast_ref::<T>()
    }

    pub fn object_mut<T: SimObject>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.objects
            .get_mut(id)?
            .object
            .as_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    pub fn object_dyn(&self, id: ObjectId) -> Option<&dyn SimObject> {
        self.objects.get(id)?.object.as_deref()
    }

    /// Remove an object from its slot (see [`put_object`](Self::put_object))
    pub(crate) fn take_object(&mut self, id: ObjectId) -> Result<Box<dyn SimObject>> {
        let slot = self.objects.get_mut(id).ok_or(SimError::UnknownObject(id))?;
        slot.object
            .take()
            .ok_or_else(|| SimError::Reentrant(slot.name.clone()))
    }

    pub(crate) fn put_object(&mut self, id: ObjectId, object: Box<dyn SimObject>) {
        if let Some(slot) = self.objects.get_mut(id) {
            slot.object = Some(object);
        }
    }

    // Time and events

    #[inline]
    pub fn now(&self) -> Tick {
        self.timing.now()
    }

    pub fn schedule(&mut self, object: ObjectId, delay: Tick, event: ObjectEvent) -> EventHandle {
        self.timing.schedule(delay, Event::Object { object, event })
    }

    pub fn schedule_at(&mut self, object: ObjectId, when: Tick, event: ObjectEvent) -> Result<EventHandle> {
        self.timing.schedule_at(when, Event::Object { object, event })
    }

    pub fn deschedule(&mut self, handle: EventHandle) -> bool {
        self.timing.deschedule(handle)
    }

    pub fn is_scheduled(&self, handle: EventHandle) -> bool {
        self.timing.is_scheduled(handle)
    }

    pub fn next_event_time(&mut self) -> Option<Tick> {
        self.timing.next_event_time()
    }

    pub fn pending_events(&self) -> usize {
        self.timing.pending()
    }

    pub(crate) fn advance_to(&mut self, tick: Tick) {
        self.timing.advance_to(tick);
    }

    /// Run the next event
    ///
    /// # Returns
    ///
    /// Tick of the event that ran, or `None` if the queue was empty
    pub fn step(&mut self) -> Result<Option<Tick>> {
        let Some((when, event)) = self.timing.pop_next() else {
            return Ok(None);
        };
        self.dispatch(event)?;
        Ok(Some(when))
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Retry(port) => {
                let end = self.link_mut(port.link)?.end_mut(port.side);
                end.retry_scheduled = false;
                if end.state != PortState::WaitingForRetry {
                    return Ok(());
                }
                end.state = PortState::Idle;
                let owner = end.object;
                self.with_object(owner, |obj, fabric| obj.recv_retry(fabric, port))
            }
            Event::Object { object, event } => {
                self.with_object(object, |obj, fabric| obj.process_event(fabric, event))
            }
        }
    }

    // Global state

    pub fn memory_mode(&self) -> MemoryMode {
        self.memory_mode
    }

    pub(crate) fn set_memory_mode(&mut self, mode: MemoryMode) {
        self.memory_mode = mode;
    }

    /// Ask the simulation loop to stop after the current event
    ///
    /// The first request wins.
    pub fn exit_simulation(&mut self, reason: ExitReason) {
        log::info!("Exiting @ tick {}: {}", self.now(), reason);
        if self.exit.is_none() {
            self.exit = Some(reason);
        }
    }

    pub(crate) fn take_exit(&mut self) -> Option<ExitReason> {
        self.exit.take()
    }

    pub(crate) fn begin_drain(&mut self, outstanding: usize) {
        self.drain_outstanding = outstanding;
    }

    pub fn is_draining(&self) -> bool {
        self.drain_outstanding > 0
    }

    /// Report that one drainable object finished draining
    pub fn signal_drained(&mut self) {
        if self.drain_outstanding == 0 {
            return;
        }
        self.drain_outstanding -= 1;
        if self.drain_outstanding == 0 {
            self.exit_simulation(ExitReason::Drained);
        }
    }

    // Link transport

    fn peer_owner(&self, from: PortRef) -> Result<ObjectId> {
        Ok(self.link(from.link)?.end(from.side.peer()).object)
    }

    /// Offer `pkt` to the peer of `from`
    ///
    /// While `from` is waiting for a retry, the packet is refused without
    /// reaching the peer.
    pub fn send_timing(&mut self, from: PortRef, mut pkt: Packet) -> Result<Delivery> {
        let waiting = self.port_state(from)? == PortState::WaitingForRetry;
        if waiting {
            log::trace!("Fabric: {:?} waiting for retry, refusing {} 0x{:08X}", from, pkt.cmd(), pkt.addr());
            self.link_mut(from.link)?.end_mut(from.side).refused += 1;
            return Ok(Delivery::Refused(pkt));
        }

        let owner = self.peer_owner(from)?;
        let to = from.peer();
        pkt.time = self.now();
        let delivery = self.with_object(owner, |obj, fabric| obj.recv_timing(fabric, to, pkt))?;

        let end = self.link_mut(from.link)?.end_mut(from.side);
        match &delivery {
            Delivery::Accepted => end.sent += 1,
            Delivery::Refused(_) => {
                end.refused += 1;
                end.state = PortState::WaitingForRetry;
            }
        }
        Ok(delivery)
    }

    /// Tell the peer of `from` that it may resend its refused packet
    ///
    /// The retry is delivered by an event, never synchronously. Nothing
    /// happens if the peer is not waiting.
    pub fn send_retry(&mut self, from: PortRef) -> Result<()> {
        let to = from.peer();
        let end = self.link_mut(to.link)?.end_mut(to.side);
        if end.state != PortState::WaitingForRetry || end.retry_scheduled {
            return Ok(());
        }
        end.retry_scheduled = true;
        self.timing.schedule(0, Event::Retry(to));
        Ok(())
    }

    pub fn send_atomic(&mut self, from: PortRef, pkt: &mut Packet) -> Result<Tick> {
        let owner = self.peer_owner(from)?;
        let to = from.peer();
        self.with_object(owner, |obj, fabric| obj.recv_atomic(fabric, to, pkt))
    }

    pub fn send_functional(&mut self, from: PortRef, pkt: &mut Packet) -> Result<()> {
        let owner = self.peer_owner(from)?;
        let to = from.peer();
        self.with_object(owner, |obj, fabric| obj.recv_functional(fabric, to, pkt))
    }

    pub fn send_snoop(&mut self, from: PortRef, pkt: &mut Packet) -> Result<SnoopReply> {
        let owner = self.peer_owner(from)?;
        let to = from.peer();
        self.with_object(owner, |obj, fabric| obj.recv_snoop(fabric, to, pkt))
    }

    pub fn send_status_change(&mut self, from: PortRef, status: StatusChange) -> Result<()> {
        let owner = self.peer_owner(from)?;
        let to = from.peer();
        self.with_object(owner, |obj, fabric| obj.recv_status_change(fabric, to, status))
    }

    /// Every object id, in registration order
    pub fn object_ids(&self) -> std::ops::Range<ObjectId> {
        0..self.objects.len()
    }

    /// Collect statistics from every object that is not busy
    pub fn dump_stats(&self, sink: &mut dyn StatsSink) {
        for slot in &self.objects {
            if let Some(object) = &slot.object {
                object.dump_stats(sink);
            }
        }
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("now", &self.now())
            .field("objects", &self.objects.len())
            .field("links", &self.links.len())
            .field("memory_mode", &self.memory_mode)
            .finish()
    }
}
