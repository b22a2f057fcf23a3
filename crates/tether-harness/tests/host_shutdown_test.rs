//! Only the host client, the first peer to connect, may shut the
//! server down with the reserved shutdown event.

use std::sync::Arc;
use std::time::Duration;

use tether_core::{Backend, Client, ConnectionStatus};
use tether_harness::wait_until;
use tether_proto::{GameState, StateChanges};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_the_host_client_may_shut_down() {
    tether_harness::init_tracing();
    let backend = Arc::new(Backend::new(GameState::new(), |_, _| StateChanges::new()));

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

    // First connector becomes the host.
    let mut host = Client::new();
    host.connect(addr.port(), "127.0.0.1").await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || backend
            .server()
            .connection_count()
            == 1)
        .await,
        "host never connected"
    );

    let mut guest = Client::new();
    guest.connect(addr.port(), "127.0.0.1").await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || backend
            .server()
            .connection_count()
            == 2)
        .await,
        "guest never connected"
    );
    assert_ne!(backend.server().host_client(), None);

    // The guest's shutdown request is refused.
    guest.disconnect(true).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        backend.server().local_addr().is_some(),
        "guest must not be able to shut the server down"
    );
    assert_eq!(guest.connection_status(), ConnectionStatus::Disconnected);

    // The host's is honored.
    host.disconnect(true).await;
    let stopped = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("server did not stop within a second or two")
        .unwrap();
    stopped.unwrap();
    assert_eq!(host.connection_status(), ConnectionStatus::Disconnected);
    assert!(backend.store().game_state().is_paused());
}
