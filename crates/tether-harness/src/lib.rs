//! Deterministic test support for tether.
//!
//! The harness provides an in-memory datagram network with seeded packet
//! loss and injected latency ([`SimNet`]), so the end-to-end suite in
//! `tests/` can drive real backends and clients over links it fully
//! controls. Production code never depends on this crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod sim_net;

pub use sim_net::{SimNet, SimSocket};

use std::time::{Duration, Instant};

/// Install a `RUST_LOG`-driven tracing subscriber, once per process.
/// Harmless to call from every test.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Poll `condition` every few milliseconds until it holds or `deadline`
/// elapses. Returns whether it held.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while !condition() {
        if Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
