//! In-process datagram network with seeded fault injection.
//!
//! Stands in for UDP in tests and local clusters. Faults are drawn from a
//! seeded RNG so a failing run can be replayed with the same seed.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::trace;

use crate::datagram::Datagram;

type Inbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

/// Fault model applied to every datagram.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability in `[0, 1]` that a datagram is lost.
    pub drop_probability: f64,
    /// Probability in `[0, 1]` that a delivered datagram arrives twice.
    pub duplicate_probability: f64,
    /// Each copy is delayed by a uniform draw from `[0, max_delay]`, which
    /// reorders datagrams.
    pub max_delay: Duration,
}

impl FaultConfig {
    /// Lossy, duplicating, reordering network.
    pub fn unreliable() -> Self {
        Self {
            drop_probability: 0.3,
            duplicate_probability: 0.2,
            max_delay: Duration::from_millis(20),
        }
    }
}

struct NetworkState {
    endpoints: HashMap<SocketAddr, Inbox>,
    isolated: HashSet<SocketAddr>,
    faults: FaultConfig,
    rng: StdRng,
}

impl NetworkState {
    /// Decides what happens to one datagram: zero, one or two deliveries.
    fn route(&mut self, from: SocketAddr, to: SocketAddr) -> Vec<(Duration, Inbox)> {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return Vec::new();
        }
        let Some(inbox) = self.endpoints.get(&to).cloned() else {
            return Vec::new();
        };

        if self.rng.gen_bool(self.faults.drop_probability.clamp(0.0, 1.0)) {
            trace!(%from, %to, "datagram dropped");
            return Vec::new();
        }

        let copies = if self
            .rng
            .gen_bool(self.faults.duplicate_probability.clamp(0.0, 1.0))
        {
            2
        } else {
            1
        };

        (0..copies)
            .map(|_| (self.delay(), inbox.clone()))
            .collect()
    }

    fn delay(&mut self) -> Duration {
        let max_ms = u64::try_from(self.faults.max_delay.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(0..=max_ms))
        }
    }
}

/// Shared in-memory network. Clones refer to the same network.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Perfectly reliable network.
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, FaultConfig::default())
    }

    pub fn with_faults(seed: u64, faults: FaultConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                endpoints: HashMap::new(),
                isolated: HashSet::new(),
                faults,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    /// Attaches an endpoint at `addr`, replacing any previous one.
    pub fn bind(&self, addr: SocketAddr) -> MemorySocket {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().endpoints.insert(addr, tx);
        MemorySocket {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        self.lock().faults = faults;
    }

    /// Drops all traffic to and from `addr` until [`heal`](Self::heal).
    pub fn isolate(&self, addr: SocketAddr) {
        self.lock().isolated.insert(addr);
    }

    pub fn heal(&self, addr: SocketAddr) {
        self.lock().isolated.remove(&addr);
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One endpoint on a [`MemoryNetwork`].
pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl Datagram for MemorySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<()> {
        let deliveries = self.network.lock().route(self.addr, target);
        for (delay, inbox) in deliveries {
            let datagram = (buf.to_vec(), self.addr);
            if delay.is_zero() {
                let _ = inbox.send(datagram);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send(datagram);
                });
            }
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        let (bytes, from) = inbox.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "memory endpoint was rebound")
        })?;
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
