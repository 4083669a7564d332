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

use super::*;
use crate::core::error::SimError;
use crate::core::mem::port::PortState;
use crate::core::sim::MemoryMode;

/// `a` connected to `b`; returns the fabric, both ids and a's endpoint
fn pair(b: Stub) -> (Fabric, usize, usize, PortRef) {
    let mut fabric = Fabric::new(MemoryMode::Timing);
    let a = fabric.add_object(Box::new(Stub::new("a")));
    let b = fabric.add_object(Box::new(b));
    fabric.connect(a, "out", b, "in").unwrap();
    let port = fabric.object::<Stub>(a).unwrap().port.unwrap();
    (fabric, a, b, port)
}

fn stub(fabric: &Fabric, id: usize) -> &Stub {
    fabric.object::<Stub>(id).unwrap()
}

#[test]
fn test_accepted_send_transfers_ownership() {
    let (mut fabric, _, b, port) = pair(Stub::new("b"));

    let delivery = fabric.send_timing(port, read_pkt(0x40, 4)).unwrap();
    assert!(delivery.is_accepted());
    assert_eq!(stub(&fabric, b).received.len(), 1);
    assert_eq!(stub(&fabric, b).received[0].addr(), 0x40);
    assert_eq!(fabric.link(port.link).unwrap().end(port.side).sent, 1);
    assert_eq!(fabric.port_state(port).unwrap(), PortState::Idle);
}

#[test]
fn test_refused_packet_comes_back() {
    let (mut fabric, _, b, port) = pair(Stub::refusing("b"));

    match fabric.send_timing(port, read_pkt(0x40, 4)).unwrap() {
        Delivery::Refused(pkt) => assert_eq!(pkt.addr(), 0x40),
        Delivery::Accepted => panic!("refusing peer accepted"),
    }
    assert_eq!(fabric.port_state(port).unwrap(), PortState::WaitingForRetry);
    assert_eq!(stub(&fabric, b).offers, 1);
}

#[test]
fn test_waiting_sender_is_refused_locally() {
    let (mut fabric, _, b, port) = pair(Stub::refusing("b"));
    let _ = fabric.send_timing(port, read_pkt(0x40, 4)).unwrap();

    fabric.object_mut::<Stub>(b).unwrap().accept = true;
    let delivery = fabric.send_timing(port, read_pkt(0x80, 4)).unwrap();
    assert!(!delivery.is_accepted());
    // The peer never saw the second packet
    assert_eq!(stub(&fabric, b).offers, 1);
    assert_eq!(fabric.link(port.link).unwrap().end(port.side).refused, 2);
}

#[test]
fn test_retry_is_delivered_by_event() {
    let (mut fabric, a, b, port) = pair(Stub::refusing("b"));
    let _ = fabric.send_timing(port, read_pkt(0x40, 4)).unwrap();

    let b_port = stub(&fabric, b).port.unwrap();
    fabric.send_retry(b_port).unwrap();
    fabric.send_retry(b_port).unwrap();
    assert_eq!(stub(&fabric, a).retries, 0);
    assert_eq!(fabric.pending_events(), 1);

    fabric.step().unwrap();
    assert_eq!(stub(&fabric, a).retries, 1);
    assert_eq!(fabric.port_state(port).unwrap(), PortState::Idle);
}

#[test]
fn test_retry_without_waiter_is_dropped() {
    let (mut fabric, a, b, _) = pair(Stub::new("b"));
    let b_port = stub(&fabric, b).port.unwrap();

    fabric.send_retry(b_port).unwrap();
    assert_eq!(fabric.pending_events(), 0);
    assert_eq!(stub(&fabric, a).retries, 0);
}

#[test]
fn test_atomic_send_returns_latency() {
    let (mut fabric, _, _, port) = pair(Stub::new("b"));
    let mut pkt = read_pkt(0x40, 4);
    assert_eq!(fabric.send_atomic(port, &mut pkt).unwrap(), 7);
    assert_eq!(pkt.cmd(), Command::ReadResp);
}

#[test]
fn test_reentry_is_an_error() {
    let (mut fabric, a, _, _) = pair(Stub::new("b"));
    let err = fabric
        .with_object(a, |_, fabric| fabric.with_object(a, |_, _| Ok(())))
        .unwrap_err();
    assert!(matches!(err, SimError::Reentrant(name) if name == "a"));
    // The object is back in its slot afterwards
    assert!(fabric.object::<Stub>(a).is_some());
}

#[test]
fn test_unknown_ids() {
    let (mut fabric, a, _, _) = pair(Stub::new("b"));
    assert!(matches!(
        fabric.connect(a, "x", 42, "y"),
        Err(SimError::UnknownObject(42))
    ));
    assert!(matches!(fabric.link(9), Err(SimError::UnknownLink(9))));
    assert!(fabric.object::<crate::core::mem::PhysicalMemory>(a).is_none());
}
