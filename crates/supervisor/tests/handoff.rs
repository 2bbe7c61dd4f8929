#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(unix)]

mod common;

use std::future::pending;

use warden_supervisor::{HostExit, SupervisorState, handoff};

use common::{client, config, eventually, harness, harness_on, peer, recv_text, wait_state};

#[tokio::test]
async fn connections_survive_a_handoff() {
    let cfg = config(vec![client("main", "warden", &["echo"])]);
    let old = harness(cfg.clone());
    old.host.start(None).await.unwrap();
    wait_state(&old.handle("main"), SupervisorState::Running).await;
    eventually("bot in #ops", || old.network.members("#ops") == ["warden"]).await;

    let package = handoff::collect(old.host.table()).await.unwrap();
    assert_eq!(package.connections.len(), 1);
    assert!(old.host.table().is_empty());
    assert!(!old.enabled_on("echo", "main"));
    assert_eq!(old.network.parked_count(), 1);

    let new = harness_on(&old.network, cfg);
    new.host.start(Some(package)).await.unwrap();
    wait_state(&new.handle("main"), SupervisorState::Running).await;
    assert_eq!(new.network.dial_count(), 1);
    assert_eq!(new.network.parked_count(), 0);
    assert_eq!(new.network.members("#ops"), ["warden"]);

    let (alice, mut events) = peer(&new.network, "alice").await;
    alice.send("#ops", "warden: echo still here").await.unwrap();
    assert_eq!(recv_text(&mut events).await, "still here");
}

#[tokio::test]
async fn inherited_connections_without_a_client_are_released() {
    let old = harness(config(vec![
        client("main", "warden", &[]),
        client("retired", "oldbot", &[]),
    ]));
    old.host.start(None).await.unwrap();
    wait_state(&old.handle("main"), SupervisorState::Running).await;
    wait_state(&old.handle("retired"), SupervisorState::Running).await;
    let package = handoff::collect(old.host.table()).await.unwrap();
    assert_eq!(package.connections.len(), 2);

    let new = harness_on(&old.network, config(vec![client("main", "warden", &[])]));
    new.host.start(Some(package)).await.unwrap();
    wait_state(&new.handle("main"), SupervisorState::Running).await;
    assert_eq!(new.network.parked_count(), 0);
    assert!(!new.network.is_online("oldbot"));
    assert!(new.network.is_online("warden"));
}

#[tokio::test]
async fn unusable_package_falls_back_to_a_fresh_dial() {
    let cfg = config(vec![client("main", "warden", &[])]);
    let old = harness(cfg.clone());
    old.host.start(None).await.unwrap();
    wait_state(&old.handle("main"), SupervisorState::Running).await;
    let mut package = handoff::collect(old.host.table()).await.unwrap();
    // Point the package at a session the network does not know.
    for state in package.connections.values_mut() {
        state.fd += 1;
    }

    let new = harness_on(&old.network, cfg);
    new.host.start(Some(package)).await.unwrap();
    wait_state(&new.handle("main"), SupervisorState::Running).await;
    assert_eq!(new.network.dial_count(), 2);
}

#[tokio::test]
async fn handoff_command_packages_every_client() {
    let h = harness(config(vec![
        client("main", "warden", &["processops"]),
        client("backup", "keeper", &[]),
    ]));
    h.host.start(None).await.unwrap();
    wait_state(&h.handle("main"), SupervisorState::Running).await;
    wait_state(&h.handle("backup"), SupervisorState::Running).await;
    let (alice, mut events) = peer(&h.network, "alice").await;

    let (exit, reply) = tokio::join!(h.host.run(pending()), async {
        alice.send("warden", "warden: process handoff").await.unwrap();
        recv_text(&mut events).await
    });
    assert_eq!(reply, "Handing off to a new process image");
    let HostExit::HandedOff(package) = exit.unwrap() else {
        panic!("expected a handoff");
    };
    assert_eq!(
        package.connections.keys().collect::<Vec<_>>(),
        ["backup", "main"]
    );
    assert_eq!(package.connections["main"].identity, "warden");
    assert_eq!(package.connections["backup"].channels, ["#ops"]);
    assert!(h.host.table().is_empty());
}
