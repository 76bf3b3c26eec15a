//! Hardware tests for the btleplug transport.
//!
//! These tests require a Bluetooth adapter and a peripheral exposing the
//! configured notify characteristic. Run them with:
//! `cargo test --package blelink-core --test hardware_tests -- --ignored --nocapture`
//!
//! Set BLELINK_PERIPHERAL to the identifier of the peripheral to use; if unset,
//! the strongest matching peripheral found by a scan is used.

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use blelink_core::btle::{BtleTransport, StrongestSignal};
use blelink_core::mock::{MemoryStore, RecordingSink};
use blelink_core::{
    ConnectOptions, ConnectionStateMachine, LinkConfig, PeripheralRef, ReconnectionPolicy,
    SessionState, Transport,
};

/// Time allowed for payloads to arrive once subscribed.
const LISTEN: Duration = Duration::from_secs(10);

fn configured_peripheral() -> Option<PeripheralRef> {
    env::var("BLELINK_PERIPHERAL")
        .ok()
        .and_then(|id| PeripheralRef::parse(&id).ok())
}

async fn transport() -> Arc<BtleTransport> {
    let transport = BtleTransport::new(LinkConfig::default(), Arc::new(StrongestSignal))
        .await
        .expect("Bluetooth adapter available");
    Arc::new(transport)
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_enumerate_known_peripherals() {
    let transport = transport().await;
    let known = transport.enumerate_granted().await.unwrap();
    println!("Adapter knows {} peripherals", known.len());
    for peripheral in known {
        println!("  {}", peripheral);
    }
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_connect_and_receive_payloads() {
    let transport = transport().await;
    let peripheral = match configured_peripheral() {
        Some(peripheral) => peripheral,
        None => transport
            .request_interactive(&LinkConfig::default().selection_filter())
            .await
            .expect("a matching peripheral in range"),
    };

    let received = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&received);
    let machine = ConnectionStateMachine::new(
        transport.clone(),
        Arc::new(RecordingSink::new()),
        LinkConfig::default(),
        Arc::new(move |payload: &[u8]| {
            println!("payload: {:02x?}", payload);
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let result = machine
        .attempt_connect(peripheral, ConnectOptions::default())
        .await;
    assert!(result.is_ok(), "connect failed: {}", result);

    tokio::time::sleep(LISTEN).await;
    println!("Received {} payloads", received.load(Ordering::SeqCst));

    machine.disconnect().await;
    assert_eq!(machine.state(), SessionState::Disconnected);
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_startup_reconnects_remembered_peripheral() {
    let Some(peripheral) = configured_peripheral() else {
        println!("BLELINK_PERIPHERAL not set, skipping");
        return;
    };

    let transport = transport().await;
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(MemoryStore::with_value(
        &LinkConfig::default().store_key,
        &peripheral.id,
    ));
    let machine = Arc::new(ConnectionStateMachine::new(
        transport.clone(),
        sink.clone(),
        LinkConfig::default(),
        Arc::new(|_: &[u8]| {}),
    ));
    let policy = ReconnectionPolicy::new(machine.clone(), transport, store, sink.clone());

    policy.connect_on_startup().await;

    for line in sink.lines() {
        println!("{}", line);
    }
    assert_eq!(machine.state(), SessionState::Connected);
    machine.disconnect().await;
}
