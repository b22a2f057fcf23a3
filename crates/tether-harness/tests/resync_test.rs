//! A client whose last known time order fell out of the server's update
//! cache receives a full-state resynchronization on reconnect.

use std::sync::Arc;
use std::time::Duration;

use tether_core::{Backend, Client};
use tether_harness::wait_until;
use tether_proto::{GameState, StateChanges, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_client_resynchronizes_exactly() {
    tether_harness::init_tracing();
    let mut initial = GameState::new();
    initial.set("hp", 100i64);
    initial.set("zone", "keep");
    // A fast-stepping simulation that counts its steps.
    let backend = Arc::new(
        Backend::new(initial, |state, _dt| {
            let tick = state.get("tick").and_then(Value::as_int).unwrap_or(0);
            let mut changes = StateChanges::new();
            changes.insert("tick".into(), Value::Int(tick + 1));
            changes
        })
        .with_step_interval(Duration::from_millis(2)),
    );

    let runner = {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move { backend.run("127.0.0.1", 0).await })
    };
    assert!(
        wait_until(Duration::from_secs(5), || backend
            .server()
            .local_addr()
            .is_some())
        .await
    );
    let addr = backend.server().local_addr().unwrap();

    let mut client = Client::new();
    client.connect(addr.port(), "127.0.0.1").await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            !client.access_game_state().time_order.is_never()
        })
        .await,
        "mirror never synchronized"
    );

    // Go away while the simulation keeps producing updates.
    let stale_time_order = client.access_game_state().time_order;
    client.disconnect(false).await;

    let advanced = wait_until(Duration::from_secs(10), || {
        backend
            .store()
            .game_state()
            .time_order
            .dist(stale_time_order)
            > 150
    })
    .await;
    assert!(advanced, "simulation did not outrun the update cache");

    // Reconnect with the stale mirror: far outside the 100-update window,
    // so the first delta must be a full snapshot.
    client.connect(addr.port(), "127.0.0.1").await.unwrap();
    let resynced = wait_until(Duration::from_secs(5), || {
        client.access_game_state().time_order.dist(stale_time_order) > 150
    })
    .await;
    assert!(resynced, "mirror never caught back up");

    {
        let state = client.access_game_state();
        // Attributes only obtainable from a full snapshot are back.
        assert_eq!(state.get("hp"), Some(&Value::Int(100)));
        assert_eq!(state.get("zone"), Some(&Value::Str("keep".into())));
        let mirror_tick = state.get("tick").and_then(Value::as_int).unwrap();
        drop(state);

        // And the mirror tracks the authoritative state going forward.
        let caught_up = wait_until(Duration::from_secs(2), || {
            let authoritative = backend
                .store()
                .game_state()
                .get("tick")
                .and_then(Value::as_int)
                .unwrap();
            let mirrored = client
                .access_game_state()
                .get("tick")
                .and_then(Value::as_int)
                .unwrap();
            authoritative - mirrored < 100 && mirrored >= mirror_tick
        })
        .await;
        assert!(caught_up, "mirror lags the authoritative state");
    }

    client.disconnect(false).await;
    backend.shutdown().await;
    runner.await.unwrap().unwrap();
}
