//! Request deduplication table.
//!
//! A `(client, nonce)` pair is admitted exactly once. The first caller gets
//! a [`Ticket`] and drives consensus; every later caller gets a receiver
//! that resolves to the instance the first one ends up with.
//!
//! Check-and-insert happens under one per-client lock, so two concurrent
//! copies of a request can never both be admitted.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tessera_types::{ClientId, InstanceNumber, Nonce};
use tokio::sync::watch;

type NonceMap = HashMap<Nonce, watch::Receiver<Option<InstanceNumber>>>;

/// Outcome of [`DedupTable::admit`].
#[derive(Debug)]
pub enum Admission {
    /// First sighting. The holder must start consensus.
    New(Ticket),
    /// Already admitted. Resolves once the first holder publishes.
    Duplicate(watch::Receiver<Option<InstanceNumber>>),
}

impl Admission {
    pub fn is_new(&self) -> bool {
        matches!(self, Admission::New(_))
    }
}

/// Right and duty to answer one `(client, nonce)` pair.
///
/// Dropping a ticket without publishing keeps the pair admitted; duplicates
/// waiting on it then give up. Use [`Ticket::abandon`] to let a retry in.
#[derive(Debug)]
pub struct Ticket {
    nonce: Nonce,
    nonces: Arc<Mutex<NonceMap>>,
    instance: watch::Sender<Option<InstanceNumber>>,
}

impl Ticket {
    /// Announces the instance holding the request to every duplicate.
    pub fn publish(self, instance: InstanceNumber) {
        self.instance.send_replace(Some(instance));
    }

    /// Forgets the pair so that a retransmission is admitted again.
    pub fn abandon(self) {
        lock(&self.nonces).remove(&self.nonce);
    }
}

/// Concurrent `(client, nonce)` admission table.
#[derive(Debug, Default)]
pub struct DedupTable {
    clients: RwLock<HashMap<ClientId, Arc<Mutex<NonceMap>>>>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically checks and records `(client, nonce)`.
    pub fn admit(&self, client: &ClientId, nonce: Nonce) -> Admission {
        let nonces = self.nonces_of(client);
        let mut map = lock(&nonces);
        match map.entry(nonce) {
            Entry::Occupied(existing) => Admission::Duplicate(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (instance, rx) = watch::channel(None);
                slot.insert(rx);
                drop(map);
                Admission::New(Ticket {
                    nonce,
                    nonces,
                    instance,
                })
            }
        }
    }

    /// True exactly once per `(client, nonce)`.
    pub fn is_new_request(&self, client: &ClientId, nonce: Nonce) -> bool {
        self.admit(client, nonce).is_new()
    }

    /// Number of admitted pairs across all clients.
    pub fn len(&self) -> usize {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        clients.values().map(|nonces| lock(nonces).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn nonces_of(&self, client: &ClientId) -> Arc<Mutex<NonceMap>> {
        {
            let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(nonces) = clients.get(client) {
                return Arc::clone(nonces);
            }
        }
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(clients.entry(client.clone()).or_default())
    }
}

fn lock(nonces: &Mutex<NonceMap>) -> MutexGuard<'_, NonceMap> {
    nonces.lock().unwrap_or_else(PoisonError::into_inner)
}
