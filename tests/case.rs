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
use rs_matter_session::secure_channel::credentials::RootAuthority;
use rs_matter_session::transport::session::{SessionMode, SessionState};
use rs_matter_session::utils::rand::sys_rand;

fn case(sim: &mut Sim, fabric_idx: u8) -> (SessionEvents, SessionEvents) {
    let (iev, rev) = sim.start_case(0, 1, fabric_idx);
    assert!(sim.run_until(Duration::from_secs(30), |_| iev.done() && rev.done()));

    (iev, rev)
}

#[test]
fn case_establishes_an_operational_session() {
    let mut sim = Sim::new(2);
    let ca = RootAuthority::new(0xfab1, sys_rand).unwrap();
    let idx = sim.commission(&ca, &[0, 1]);

    let (iev, rev) = case(&mut sim, idx[0]);
    let a = iev.established().unwrap();
    let b = rev.established().unwrap();

    let sa = sim.mgr(0).session(a).unwrap();
    assert_eq!(sa.state(), SessionState::Active);
    assert_eq!(sa.mode(), SessionMode::Case { fabric_idx: idx[0] });
    assert_eq!(sa.peer_nodeid(), Some(node_id(1)));
    assert_eq!(sa.local_nodeid(), node_id(0));

    let sb = sim.mgr(1).session(b).unwrap();
    assert_eq!(sb.mode(), SessionMode::Case { fabric_idx: idx[1] });
    assert_eq!(sb.peer_nodeid(), Some(node_id(0)));
    assert_eq!(sb.local_nodeid(), node_id(1));
}

#[test]
fn second_case_resumes() {
    let mut sim = Sim::new(2);
    let ca = RootAuthority::new(0xfab1, sys_rand).unwrap();
    let idx = sim.commission(&ca, &[0, 1]);

    let sent = sim.mgr(1).stats().tx_messages;
    let (iev, _) = case(&mut sim, idx[0]);
    // Sigma2 and the final status
    assert_eq!(sim.mgr(1).stats().tx_messages - sent, 2);

    sim.mgr(0).close_session(iev.established().unwrap()).unwrap();
    sim.run(Duration::from_secs(2));
    assert_eq!(sim.mgr(0).sessions().count(), 0);
    assert_eq!(sim.mgr(1).sessions().count(), 0);

    let sent = sim.mgr(1).stats().tx_messages;
    let (iev, rev) = case(&mut sim, idx[0]);
    // Sigma2_Resume only
    assert_eq!(sim.mgr(1).stats().tx_messages - sent, 1);

    let a = iev.established().unwrap();
    let b = rev.established().unwrap();
    assert_eq!(sim.mgr(0).session(a).unwrap().peer_nodeid(), Some(node_id(1)));
    assert_eq!(sim.mgr(1).session(b).unwrap().peer_nodeid(), Some(node_id(0)));
}

#[test]
fn foreign_fabric_is_refused() {
    let mut sim = Sim::new(2);
    let ours = RootAuthority::new(0xfab1, sys_rand).unwrap();
    let theirs = RootAuthority::new(0xfab2, sys_rand).unwrap();
    let idx = sim.commission(&ours, &[0]);
    sim.commission(&theirs, &[1]);

    let (iev, rev) = case(&mut sim, idx[0]);

    assert_eq!(iev.all(), vec![Err(ErrorCode::NoSharedTrustRoots)]);
    assert!(rev.failed().is_some());

    sim.run(Duration::from_secs(5));
    assert_eq!(sim.mgr(0).sessions().count(), 0);
    assert_eq!(sim.mgr(1).sessions().count(), 0);
}

#[test]
fn unknown_fabric_index() {
    let mut sim = Sim::new(2);
    let peer = sim.addr(1);

    assert_eq!(
        sim.mgr(0)
            .establish_case(peer, 7, node_id(1), Box::new(SessionEvents::default()))
            .map_err(|e| e.code()),
        Err(ErrorCode::NotFound)
    );
    assert_eq!(sim.mgr(0).sessions().count(), 0);
}

#[test]
fn pase_and_case_coexist() {
    let mut sim = Sim::new(2);

    let (pase_a, _) = sim.pase(0, 1);

    let ca = RootAuthority::new(0xfab1, sys_rand).unwrap();
    let idx = sim.commission(&ca, &[0, 1]);
    let (iev, _) = case(&mut sim, idx[0]);
    let case_a = iev.established().unwrap();

    assert_ne!(pase_a, case_a);
    assert_eq!(sim.mgr(0).session(pase_a).unwrap().mode(), SessionMode::Pase);
    assert!(sim.mgr(0).session(case_a).unwrap().is_active());
}
