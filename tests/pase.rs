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

use std::time::Duration;

use common::*;

use rs_matter_session::error::ErrorCode;
use rs_matter_session::transport::session::{SessionMode, SessionState};

#[test]
fn pase_establishes_a_session() {
    let mut sim = Sim::new(2);

    let (a, b) = sim.pase(0, 1);

    let sa = sim.mgr(0).session(a).unwrap();
    assert_eq!(sa.mode(), SessionMode::Pase);
    assert_eq!(sa.state(), SessionState::Active);
    let (a_local, a_peer) = (sa.local_sess_id(), sa.peer_sess_id());

    let sb = sim.mgr(1).session(b).unwrap();
    assert_eq!(sb.mode(), SessionMode::Pase);
    assert_eq!(sb.state(), SessionState::Active);
    assert_eq!(sb.peer_sess_id(), a_local);
    assert_eq!(sb.local_sess_id(), a_peer);

    // Once the dust settles, the unsecured sessions of the handshake are gone
    sim.run(Duration::from_secs(5));
    assert_eq!(sim.mgr(0).sessions().count(), 1);
    assert_eq!(sim.mgr(1).sessions().count(), 1);
    assert_eq!(sim.mgr(0).exchange_count(), 0);
    assert_eq!(sim.mgr(1).exchange_count(), 0);
}

#[test]
fn wrong_passcode_fails_on_both_sides() {
    let mut sim = Sim::new(2);

    let (iev, rev) = sim.start_pase(0, 1, PASSCODE + 1);
    assert!(sim.run_until(Duration::from_secs(30), |_| iev.done() && rev.done()));

    assert!(iev.established().is_none());
    assert!(rev.established().is_none());
    assert!(iev.failed().is_some());
    assert!(rev.failed().is_some());

    sim.run(Duration::from_secs(5));
    assert_eq!(sim.mgr(0).sessions().count(), 0);
    assert_eq!(sim.mgr(1).sessions().count(), 0);
}

#[test]
fn pase_survives_packet_loss() {
    let mut sim = Sim::new(2);

    // The request, the first response and one more message in each direction
    sim.set_drop(|idx, _| matches!(idx, 0 | 2 | 5 | 6));

    let (iev, rev) = sim.start_pase(0, 1, PASSCODE);
    assert!(sim.run_until(Duration::from_secs(60), |_| iev.done() && rev.done()));

    assert!(iev.established().is_some());
    assert!(rev.established().is_some());
    assert!(sim.wire.borrow().dropped >= 4);
    assert!(sim.mgr(0).stats().retransmissions + sim.mgr(1).stats().retransmissions > 0);
}

#[test]
fn responder_without_free_sessions_answers_busy() {
    let mut configs = vec![config(), config(), config()];
    // Room for one handshake plus the unsecured session of a second one
    configs[1].max_sessions = 3;

    let mut sim = Sim::with_configs(configs);

    let peer = sim.addr(1);
    let first = SessionEvents::default();
    let second = SessionEvents::default();

    sim.mgr(1).set_pase_passcode(PASSCODE).unwrap();
    sim.mgr(0)
        .establish_pase(peer, PASSCODE, Box::new(first.clone()))
        .unwrap();
    // Get the first handshake going before the second one shows up
    assert!(sim.deliver_one());
    sim.mgr(2)
        .establish_pase(peer, PASSCODE, Box::new(second.clone()))
        .unwrap();

    assert!(sim.run_until(Duration::from_secs(30), |_| first.done() && second.done()));

    assert!(first.established().is_some());
    assert_eq!(second.all(), vec![Err(ErrorCode::Busy)]);
}

#[test]
fn duplicate_initiation_is_refused_locally() {
    let mut sim = Sim::new(2);

    let (iev, _) = sim.start_pase(0, 1, PASSCODE);

    let peer = sim.addr(1);
    let again = SessionEvents::default();
    assert_eq!(
        sim.mgr(0)
            .establish_pase(peer, PASSCODE, Box::new(again.clone()))
            .map_err(|e| e.code()),
        Err(ErrorCode::Busy)
    );

    assert!(sim.run_until(Duration::from_secs(30), |_| iev.done()));
    assert!(iev.established().is_some());
    assert!(!again.done());
}

#[test]
fn no_commissioning_window_no_pase() {
    let mut sim = Sim::new(2);

    let peer = sim.addr(1);
    let iev = SessionEvents::default();
    sim.mgr(0)
        .establish_pase(peer, PASSCODE, Box::new(iev.clone()))
        .unwrap();

    assert!(sim.run_until(Duration::from_secs(30), |_| iev.done()));
    assert_eq!(iev.all(), vec![Err(ErrorCode::HandshakeFailed)]);
}

#[test]
fn silent_responder_times_the_handshake_out() {
    let mut configs = vec![config(), config()];
    // Well before the retransmissions would give up
    configs[0].handshake_timeout = Duration::from_secs(2);

    let mut sim = Sim::with_configs(configs);

    // Only the PBKDFParamRequest gets through
    let start = sim.wire.borrow().sent;
    sim.set_drop(move |idx, _| idx > start);

    let (iev, _) = sim.start_pase(0, 1, PASSCODE);

    sim.run(Duration::from_millis(1900));
    assert!(!iev.done());
    assert!(sim.mgr(0).stats().retransmissions > 0);

    sim.run(Duration::from_millis(200));
    assert_eq!(iev.all(), vec![Err(ErrorCode::Timeout)]);
    assert_eq!(sim.mgr(0).sessions().count(), 0);
    assert_eq!(sim.mgr(0).exchange_count(), 0);
}
