//! In-memory datagram network with fault injection.
//!
//! `SimNet` is a tiny virtual internet: sockets bound on the same net
//! exchange datagrams through in-process queues, with a seeded RNG
//! deciding packet loss and an optional fixed one-way latency. Because it
//! implements [`DatagramSocket`], every façade runs on it unchanged:
//! tests exercise the real connection engine, retry machinery, and state
//! synchronization against a link they fully control.
//!
//! Loss decisions come from a `ChaCha20Rng` with an explicit seed, so a
//! failing run is reproducible by rerunning with the same seed.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::sync::mpsc;

use tether_core::DatagramSocket;

type Datagram = (Vec<u8>, SocketAddr);

struct NetInner {
    hosts: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    rng: ChaCha20Rng,
    /// Probability that any datagram is silently dropped.
    loss: f64,
    /// Fixed one-way delivery delay.
    latency: Duration,
    next_port: u16,
}

/// A simulated datagram network.
#[derive(Clone)]
pub struct SimNet {
    inner: Arc<Mutex<NetInner>>,
}

impl SimNet {
    /// A lossless, zero-latency network with a seeded RNG.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        SimNet {
            inner: Arc::new(Mutex::new(NetInner {
                hosts: HashMap::new(),
                rng: ChaCha20Rng::seed_from_u64(seed),
                loss: 0.0,
                latency: Duration::ZERO,
                next_port: 40_000,
            })),
        }
    }

    /// Drop each datagram with this probability, in both directions.
    pub fn set_loss(&self, probability: f64) {
        self.lock().loss = probability.clamp(0.0, 1.0);
    }

    /// Delay each delivered datagram by this much.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Bind a new socket on this network.
    #[must_use]
    pub fn bind(&self) -> Arc<SimSocket> {
        let mut inner = self.lock();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), inner.next_port);
        inner.next_port += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.hosts.insert(addr, tx);
        Arc::new(SimSocket {
            addr,
            net: Arc::clone(&self.inner),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetInner> {
        self.inner.lock().expect("sim net mutex poisoned")
    }
}

/// A socket bound on a [`SimNet`].
pub struct SimSocket {
    addr: SocketAddr,
    net: Arc<Mutex<NetInner>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl DatagramSocket for SimSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let (delivery, latency) = {
            let mut inner = self.net.lock().expect("sim net mutex poisoned");
            let dropped = inner.loss > 0.0 && inner.rng.gen::<f64>() < inner.loss;
            let delivery = if dropped {
                None
            } else {
                inner.hosts.get(&target).cloned()
            };
            (delivery, inner.latency)
        };

        // Like UDP: a send succeeds whether or not anyone hears it.
        if let Some(tx) = delivery {
            let datagram = (buf.to_vec(), self.addr);
            if latency.is_zero() {
                let _ = tx.send(datagram);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    let _ = tx.send(datagram);
                });
            }
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        let (data, from) = rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sim socket closed"))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_between_sockets() {
        let net = SimNet::new(0);
        let a = net.bind();
        let b = net.bind();

        a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn total_loss_delivers_nothing() {
        let net = SimNet::new(7);
        net.set_loss(1.0);
        let a = net.bind();
        let b = net.bind();

        a.send_to(b"void", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 16];
        let received = tokio::time::timeout(
            Duration::from_millis(100),
            b.recv_from(&mut buf),
        )
        .await;
        assert!(received.is_err(), "nothing should arrive");
    }

    #[tokio::test]
    async fn partial_loss_is_deterministic_per_seed() {
        let delivered = |seed: u64| async move {
            let net = SimNet::new(seed);
            net.set_loss(0.5);
            let a = net.bind();
            let b = net.bind();
            let b_addr = b.local_addr().unwrap();

            for i in 0..32u8 {
                a.send_to(&[i], b_addr).await.unwrap();
            }
            let mut got = Vec::new();
            let mut buf = [0u8; 4];
            while let Ok(Ok((len, _))) = tokio::time::timeout(
                Duration::from_millis(50),
                b.recv_from(&mut buf),
            )
            .await
            {
                got.extend_from_slice(&buf[..len]);
            }
            got
        };

        let first = delivered(123).await;
        let second = delivered(123).await;
        assert_eq!(first, second, "same seed, same losses");
        assert!(!first.is_empty() && first.len() < 32, "loss should be partial");
    }

    #[tokio::test]
    async fn latency_delays_delivery() {
        let net = SimNet::new(0);
        net.set_latency(Duration::from_millis(50));
        let a = net.bind();
        let b = net.bind();

        let sent_at = std::time::Instant::now();
        a.send_to(b"slow", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 16];
        b.recv_from(&mut buf).await.unwrap();
        assert!(sent_at.elapsed() >= Duration::from_millis(45));
    }
}
