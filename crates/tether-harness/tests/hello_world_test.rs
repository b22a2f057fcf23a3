//! A backend serves its initial state; a connecting client's mirror
//! converges to it.

use std::sync::Arc;
use std::time::Duration;

use tether_core::{Backend, Client};
use tether_harness::wait_until;
use tether_proto::{GameState, GameStatus, StateChanges, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_mirror_converges_to_initial_state() {
    tether_harness::init_tracing();
    let mut initial = GameState::new();
    initial.set("hp", 100i64);
    let backend = Arc::new(Backend::new(initial, |_, _| StateChanges::new()));

    let runner = {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move { backend.run("127.0.0.1", 0).await })
    };
    assert!(
        wait_until(Duration::from_secs(5), || backend
            .server()
            .local_addr()
            .is_some())
        .await,
        "server did not come up"
    );
    let addr = backend.server().local_addr().unwrap();

    let mut client = Client::new();
    client.connect(addr.port(), "127.0.0.1").await.unwrap();

    let synced = wait_until(Duration::from_secs(5), || {
        let state = client.access_game_state();
        !state.time_order.is_never() && state.get("hp").is_some()
    })
    .await;
    assert!(synced, "mirror never synchronized");

    {
        let state = client.access_game_state();
        assert_eq!(state.get("hp"), Some(&Value::Int(100)));
        assert_eq!(state.game_status, GameStatus::Active);
        assert!(!state.time_order.is_never());
    }

    client.disconnect(false).await;
    backend.shutdown().await;
    runner.await.unwrap().unwrap();
}
