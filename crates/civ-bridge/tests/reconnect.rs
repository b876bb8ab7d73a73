//! State replayed to the native side after the connection comes back

mod common;

use civ_bridge::pause::NoopPauseLock;
use civ_bridge::{BridgeServices, ExternalFunctionSpec, MemoryDialer, NativeMessage};
use common::{NativePeer, config, wait_for_event};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn spec(name: &str) -> ExternalFunctionSpec {
    ExternalFunctionSpec {
        name: name.into(),
        url: "http://localhost:9999/execute".into(),
        is_async: true,
        timeout_ms: None,
        description: None,
    }
}

#[tokio::test]
async fn test_reconnect_replays_registrations_exactly_once() {
    let (dialer, mut listener) = MemoryDialer::pair();
    let services = BridgeServices::with_parts(config(), Arc::new(dialer), Box::new(NoopPauseLock));
    let mut events = services.subscribe_events();

    assert_ok!(services.connect().await);
    let first = NativePeer::accept(&mut listener).await;
    wait_for_event(&mut events, "dll_connected").await;

    assert_ok!(services.register_external(spec("notify")).await);
    assert_ok!(services.register_auto_pause(1).await);

    // Native side goes away and forgets its auto-pause state
    drop(first);
    wait_for_event(&mut events, "dll_disconnected").await;
    assert!(services.list_auto_pause().is_empty());
    assert!(!services.is_connected());

    assert_ok!(services.register_auto_pause(3).await);
    assert_ok!(services.register_auto_pause(5).await);
    assert_eq!(services.list_auto_pause(), vec![3, 5]);

    assert_ok!(services.reconnect().await);
    let mut second = NativePeer::accept(&mut listener).await;
    wait_for_event(&mut events, "dll_connected").await;

    let mut replayed = Vec::new();
    while let Some(message) = second.recv_within(Duration::from_millis(300)).await {
        replayed.push(message);
    }

    let registrations: Vec<_> = replayed
        .iter()
        .filter_map(|m| match m {
            NativeMessage::ExternalRegister { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(registrations, vec!["notify"]);

    let mut paused: Vec<u32> = replayed
        .iter()
        .filter_map(|m| match m {
            NativeMessage::PausePlayer { player_id } => Some(*player_id),
            _ => None,
        })
        .collect();
    paused.sort_unstable();
    assert_eq!(paused, vec![3, 5]);
    assert_eq!(replayed.len(), 3);
}

#[tokio::test]
async fn test_lua_calls_flow_through_services() {
    let (dialer, mut listener) = MemoryDialer::pair();
    let services = Arc::new(BridgeServices::with_parts(
        config(),
        Arc::new(dialer),
        Box::new(NoopPauseLock),
    ));
    assert_ok!(services.connect().await);
    let mut peer = NativePeer::accept(&mut listener).await;

    let call = tokio::spawn({
        let services = services.clone();
        async move {
            services
                .call_lua("GetPlayerGold", vec![Value::from(0)])
                .await
        }
    });

    match peer.recv().await {
        NativeMessage::LuaCall { id, function, args } => {
            assert_eq!(function, "GetPlayerGold");
            assert_eq!(args, vec![Value::from(0)]);
            peer.send(&NativeMessage::LuaResponse {
                id,
                success: true,
                result: Some(Value::from(340)),
                error: None,
            })
            .await;
        }
        other => panic!("Wrong message type: {:?}", other),
    }

    let result = call.await.unwrap();
    assert!(result.success);
    assert_eq!(result.result, Some(Value::from(340)));

    // Drop the native side: the next call fails fast
    let mut events = services.subscribe_events();
    drop(peer);
    wait_for_event(&mut events, "dll_disconnected").await;
    let offline = services.call_lua("GetPlayerGold", vec![]).await;
    assert_eq!(offline.error.unwrap().code, "DLL_DISCONNECTED");
    assert!(!services.health().connection.connected);
}
