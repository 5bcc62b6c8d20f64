/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use common::*;
use rstest::rstest;

use rs_matter_session::error::ErrorCode;
use rs_matter_session::transport::core::TransportConfig;
use rs_matter_session::transport::exchange::{CloseReason, MessageMeta};
use rs_matter_session::transport::session::SessionHandle;

/// A PASE session between nodes 0 and 1, with an echo server on node 1
fn paired() -> (Sim, SessionHandle, SessionHandle, Inbox) {
    let mut sim = Sim::new(2);
    let (a, b) = sim.pase(0, 1);

    let server = EchoServer::default();
    sim.mgr(1)
        .register_unsolicited(ECHO_PROTO, Box::new(server.clone()))
        .unwrap();

    (sim, a, b, server.0)
}

#[rstest]
#[case::empty(&[])]
#[case::short(b"P1")]
#[case::large(&[0xa5; 1000])]
fn request_response_then_close(#[case] payload: &[u8]) {
    let (mut sim, a, _, server) = paired();

    let inbox = Inbox::default();
    let exch = sim.mgr(0).new_exchange(a, Box::new(inbox.clone())).unwrap();
    assert_eq!(sim.mgr(0).exchange_session(exch), Some(a));

    let (meta, p1) = request(payload);
    sim.mgr(0).send_message(exch, meta, &p1).unwrap();
    sim.run(Duration::from_secs(2));

    assert_eq!(server.payloads(), vec![payload.to_vec()]);
    assert_eq!(inbox.payloads(), vec![payload.to_vec()]);
    assert_eq!(inbox.0.borrow().messages[0].0.proto_opcode, 2);
    // The echo side closed its end right after answering
    assert_eq!(server.closed(), vec![CloseReason::Closed]);
    assert!(inbox.closed().is_empty());

    sim.mgr(0).close_exchange(exch);
    assert_eq!(inbox.closed(), vec![CloseReason::Closed]);
    assert_eq!(
        sim.mgr(0).send_message(exch, meta, &p1).map_err(|e| e.code()),
        Err(ErrorCode::InvalidState)
    );

    sim.run(Duration::from_secs(2));
    assert_eq!(sim.mgr(0).exchange_count(), 0);
    assert_eq!(sim.mgr(1).exchange_count(), 0);
    // Everything was acknowledged on the first attempt
    assert_eq!(sim.mgr(0).stats().retransmissions, 0);
    assert_eq!(sim.mgr(1).stats().retransmissions, 0);
}

#[test]
fn concurrent_exchanges_are_isolated() {
    let (mut sim, a, _, server) = paired();

    let first = Inbox::default();
    let second = Inbox::default();
    let x1 = sim.mgr(0).new_exchange(a, Box::new(first.clone())).unwrap();
    let x2 = sim.mgr(0).new_exchange(a, Box::new(second.clone())).unwrap();
    assert_ne!(x1, x2);

    let (meta, _) = request(b"");
    sim.mgr(0).send_message(x1, meta, b"A").unwrap();
    sim.mgr(0).send_message(x2, meta, b"B").unwrap();
    sim.run(Duration::from_secs(2));

    assert_eq!(first.payloads(), vec![b"A".to_vec()]);
    assert_eq!(second.payloads(), vec![b"B".to_vec()]);
    assert_eq!(server.payloads().len(), 2);
}

#[test]
fn out_of_order_responses_reach_their_exchanges() {
    let (mut sim, a, _, server) = paired();

    let inboxes: Vec<Inbox> = (0..3).map(|_| Inbox::default()).collect();
    let (meta, _) = request(b"");

    for (inbox, payload) in inboxes.iter().zip([b"A", b"B", b"C"]) {
        let exch = sim.mgr(0).new_exchange(a, Box::new(inbox.clone())).unwrap();
        sim.mgr(0).send_message(exch, meta, payload).unwrap();
    }

    // The requests arrive last first, and every answer is queued behind the
    // requests still in flight, so the answers come back in reverse too
    sim.reverse_in_flight();
    for _ in 0..3 {
        assert!(sim.deliver_one());
    }
    assert_eq!(
        server.payloads(),
        vec![b"C".to_vec(), b"B".to_vec(), b"A".to_vec()]
    );

    sim.run(Duration::from_secs(2));

    assert_eq!(inboxes[0].payloads(), vec![b"A".to_vec()]);
    assert_eq!(inboxes[1].payloads(), vec![b"B".to_vec()]);
    assert_eq!(inboxes[2].payloads(), vec![b"C".to_vec()]);
    assert_eq!(sim.mgr(0).stats().retransmissions, 0);
}

#[test]
fn one_unacknowledged_message_per_exchange() {
    let (mut sim, a, _, _) = paired();

    let exch = sim.mgr(0).new_exchange(a, Box::new(Inbox::default())).unwrap();
    let (meta, payload) = request(b"P1");

    sim.mgr(0).send_message(exch, meta, &payload).unwrap();
    assert_eq!(
        sim.mgr(0)
            .send_message(exch, meta, &payload)
            .map_err(|e| e.code()),
        Err(ErrorCode::InvalidState)
    );
}

#[test]
fn unanswered_request_times_out() {
    let (mut sim, a, _, _) = paired();

    let inbox = Inbox::default();
    let exch = sim.mgr(0).new_exchange(a, Box::new(inbox.clone())).unwrap();
    sim.mgr(0)
        .set_response_timeout(exch, Some(Duration::from_secs(2)))
        .unwrap();

    // Nobody on node 1 handles this protocol: the request is acknowledged, never answered
    sim.mgr(0)
        .send_message(exch, MessageMeta::new(0xfff2, 1, true), b"ping")
        .unwrap();

    sim.run(Duration::from_secs(1));
    assert!(inbox.closed().is_empty());

    sim.run(Duration::from_secs(2));
    assert_eq!(inbox.timeouts(), 1);
    assert_eq!(inbox.closed(), vec![CloseReason::ResponseTimeout]);
    assert_eq!(sim.mgr(0).exchange_count(), 0);
    assert_eq!(sim.mgr(0).stats().retransmissions, 0);
}

#[test]
fn lost_messages_are_retransmitted() {
    let (mut sim, a, _, server) = paired();

    let inbox = Inbox::default();
    let exch = sim.mgr(0).new_exchange(a, Box::new(inbox.clone())).unwrap();

    // Lose the request and the first answer
    let start = sim.wire.borrow().sent;
    sim.set_drop(move |idx, _| idx == start || idx == start + 2);

    let (meta, payload) = request(b"P1");
    sim.mgr(0).send_message(exch, meta, &payload).unwrap();
    sim.run(Duration::from_secs(10));

    assert_eq!(server.payloads(), vec![b"P1".to_vec()]);
    assert_eq!(inbox.payloads(), vec![b"P1".to_vec()]);
    assert!(sim.mgr(0).stats().retransmissions >= 1);
    assert!(sim.mgr(1).stats().retransmissions >= 1);
}

#[test]
fn every_third_packet_lost() {
    let (mut sim, a, _, server) = paired();

    sim.set_drop(|idx, _| idx % 3 == 2);

    let mut exchanges = Vec::new();
    for i in 0..20u8 {
        let inbox = Inbox::default();
        let exch = sim.mgr(0).new_exchange(a, Box::new(inbox.clone())).unwrap();

        let (meta, payload) = request(&[i]);
        sim.mgr(0).send_message(exch, meta, &payload).unwrap();

        let answered = inbox.clone();
        assert!(sim.run_until(Duration::from_secs(30), move |_| {
            !answered.payloads().is_empty()
        }));

        exchanges.push((exch, inbox));
    }

    for (exch, _) in &exchanges {
        sim.mgr(0).close_exchange(*exch);
    }
    sim.run(Duration::from_secs(30));

    let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
    assert_eq!(server.payloads(), expected);

    for (i, (_, inbox)) in exchanges.iter().enumerate() {
        assert_eq!(inbox.payloads(), vec![vec![i as u8]]);
        assert_eq!(inbox.closed(), vec![CloseReason::Closed]);
    }

    assert!(sim.wire.borrow().dropped > 0);
    assert!(sim.mgr(0).session(a).unwrap().is_active());
    assert_eq!(sim.mgr(0).exchange_count(), 0);
    assert_eq!(sim.mgr(1).exchange_count(), 0);
}

#[test]
fn retransmissions_give_up() {
    let (mut sim, a, _, _) = paired();

    let inbox = Inbox::default();
    let exch = sim.mgr(0).new_exchange(a, Box::new(inbox.clone())).unwrap();
    let retransmissions = sim.mgr(0).stats().retransmissions;

    sim.set_drop(|_, _| true);

    let (meta, payload) = request(b"P1");
    sim.mgr(0).send_message(exch, meta, &payload).unwrap();
    sim.run(Duration::from_secs(60));

    let max = sim.mgr(0).config().mrp.max_transmissions as u64;
    assert_eq!(
        sim.mgr(0).stats().retransmissions - retransmissions,
        max - 1
    );
    assert_eq!(inbox.closed(), vec![CloseReason::TransportFailure]);
    assert_eq!(inbox.timeouts(), 0);

    // The session is of no use anymore
    assert!(sim.mgr(0).session(a).is_none());
    assert_eq!(
        sim.mgr(0)
            .new_exchange(a, Box::new(Inbox::default()))
            .map_err(|e| e.code()),
        Err(ErrorCode::NoSession)
    );
}

#[test]
fn duplicates_are_acknowledged_not_delivered() {
    let (mut sim, a, _, server) = paired();

    let exch = sim.mgr(0).new_exchange(a, Box::new(Inbox::default())).unwrap();

    // Lose the answer: the request gets retransmitted and arrives twice
    let start = sim.wire.borrow().sent;
    sim.set_drop(move |idx, _| idx == start + 1);

    let (meta, payload) = request(b"P1");
    sim.mgr(0).send_message(exch, meta, &payload).unwrap();
    sim.run(Duration::from_secs(10));

    assert_eq!(server.payloads(), vec![b"P1".to_vec()]);
    assert!(sim.mgr(1).stats().rx_duplicates >= 1);
}

#[test]
fn closing_a_session_reaches_the_peer() {
    let (mut sim, a, b, _) = paired();

    let inbox = Inbox::default();
    sim.mgr(0).new_exchange(a, Box::new(inbox.clone())).unwrap();

    let holder = sim.mgr(1).session_holder(b).unwrap();

    sim.mgr(0).close_session(a).unwrap();
    assert_eq!(inbox.closed(), vec![CloseReason::SessionReleased]);
    assert!(sim.mgr(0).session(a).is_none());

    sim.run(Duration::from_secs(1));

    // Kept around for as long as someone holds on to it
    assert!(!sim.mgr(1).session(b).unwrap().is_active());
    assert!(holder.is_valid());

    holder.release();
    sim.run(Duration::from_secs(1));
    sim.mgr(1).poll_timers();
    assert!(sim.mgr(1).session(b).is_none());
}

#[test]
fn counter_exhaustion_retires_the_session() {
    let (mut sim, a, _, _) = paired();

    let first = Inbox::default();
    let second = Inbox::default();
    let x1 = sim.mgr(0).new_exchange(a, Box::new(first.clone())).unwrap();
    let x2 = sim.mgr(0).new_exchange(a, Box::new(second.clone())).unwrap();

    sim.mgr(0).session_mut(a).unwrap().set_tx_ctr(u32::MAX - 1);

    let (meta, payload) = request(b"last");
    sim.mgr(0).send_message(x1, meta, &payload).unwrap();
    assert_eq!(
        sim.mgr(0)
            .send_message(x2, meta, &payload)
            .map_err(|e| e.code()),
        Err(ErrorCode::CounterExhausted)
    );

    assert_eq!(first.closed(), vec![CloseReason::SessionReleased]);
    assert_eq!(second.closed(), vec![CloseReason::SessionReleased]);
    assert!(sim.mgr(0).session(a).is_none());
}

#[test]
fn handshake_leaves_no_unsecured_session() {
    let mut sim = Sim::new(2);
    let (a, b) = sim.pase(0, 1);

    assert!(sim.mgr(0).sessions().all(|sess| sess.is_encrypted()));
    assert!(sim.mgr(0).new_exchange(a, Box::new(Inbox::default())).is_ok());

    sim.run(Duration::from_secs(1));
    assert!(sim.mgr(1).sessions().all(|sess| sess.is_encrypted()));
    assert!(sim.mgr(1).session(b).unwrap().is_active());
}

#[test]
fn counter_exhaustion_while_acknowledging_a_duplicate() {
    let mut sim = Sim::new(2);
    let (a, b) = sim.pase(0, 1);

    let sink = Sink::default();
    sim.mgr(1)
        .register_unsolicited(ECHO_PROTO, Box::new(sink.clone()))
        .unwrap();

    let exch = sim.mgr(0).new_exchange(a, Box::new(Inbox::default())).unwrap();

    let start = sim.wire.borrow().sent;
    let (meta, payload) = request(b"P1");
    sim.mgr(0).send_message(exch, meta, &payload).unwrap();
    sim.run(Duration::from_secs(1));

    assert_eq!(sink.0.payloads(), vec![b"P1".to_vec()]);
    assert_eq!(sim.mgr(1).exchange_count(), 1);

    sim.mgr(1).session_mut(b).unwrap().set_tx_ctr(u32::MAX);

    // The request once more: the acknowledgement needs a counter there is none left of
    let replay = sim.wire.borrow().history[start].clone();
    sim.mgr(1).handle_rx(replay.from, &mut replay.data.clone());

    assert_eq!(sink.0.payloads(), vec![b"P1".to_vec()]);
    assert_eq!(sink.0.closed(), vec![CloseReason::SessionReleased]);
    assert_eq!(sim.mgr(1).exchange_count(), 0);
    assert!(sim.mgr(1).session(b).is_none());
}

#[test]
fn evicted_session_goes_through_teardown() {
    let mut sim = Sim::with_configs(vec![
        config(),
        TransportConfig {
            max_sessions: 2,
            ..config()
        },
    ]);
    let (a, b) = sim.pase(0, 1);

    let holder = sim.mgr(1).session_holder(b).unwrap();
    let released = Rc::new(Cell::new(None));
    let released2 = released.clone();
    holder.on_release(move |handle| released2.set(Some(handle)));

    sim.mgr(0).close_session(a).unwrap();
    sim.run(Duration::from_secs(1));

    // Defunct, but held
    assert!(!sim.mgr(1).session(b).unwrap().is_active());
    assert!(holder.is_valid());

    // A second PASE needs both slots of node 1: the Defunct session makes room
    let (iev, rev) = sim.start_pase(0, 1, PASSCODE);
    assert!(sim.run_until(Duration::from_secs(30), |_| iev.done() && rev.done()));

    let c = rev.established().unwrap();
    assert_ne!(c, b);
    assert!(sim.mgr(1).session(b).is_none());
    assert!(!holder.is_valid());
    assert_eq!(released.get(), Some(b));

    let inbox = Inbox::default();
    let exch = sim
        .mgr(0)
        .new_exchange(iev.established().unwrap(), Box::new(inbox.clone()))
        .unwrap();
    assert!(sim.mgr(0).exchange_session(exch).is_some());
}
