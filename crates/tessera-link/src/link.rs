//! The perfect link: retransmission, acknowledgement and deduplication on
//! top of a [`Datagram`] channel.
//!
//! One listener task per link owns the receive path. Each outbound data
//! frame gets its own retransmission task, aborted when the matching ack
//! arrives or the link shuts down.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tessera_crypto::SigningKey;
use tessera_types::{MessageId, PeerId, Roster};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::datagram::Datagram;
use crate::envelope::{Envelope, Frame, Payload};
use crate::error::{LinkError, LinkResult};
use crate::metrics::{LinkMetrics, LinkMetricsSnapshot};
use crate::seen::SeenWindow;
use crate::settings::LinkSettings;

/// A payload surfaced by [`PerfectLink::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<P> {
    /// Authenticated sender.
    pub sender: PeerId,
    pub message_id: MessageId,
    pub payload: P,
}

/// Authenticated perfect link endpoint.
///
/// Cloning yields another handle to the same endpoint. Must be created
/// inside a tokio runtime; [`shutdown`](Self::shutdown) stops the
/// background tasks.
pub struct PerfectLink<P, D = UdpSocket> {
    inner: Arc<Inner<D>>,
    inbox: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery<P>>>>,
}

impl<P, D> Clone for PerfectLink<P, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            inbox: Arc::clone(&self.inbox),
        }
    }
}

struct Inner<D> {
    local: PeerId,
    incarnation: u64,
    key: SigningKey,
    roster: Arc<Roster>,
    socket: D,
    settings: LinkSettings,
    next_message_id: AtomicU64,
    /// Unacknowledged data frames, keyed by destination and id.
    outstanding: Mutex<HashMap<(PeerId, MessageId), AbortHandle>>,
    metrics: LinkMetrics,
    shutdown: watch::Sender<bool>,
}

/// Incarnations per sender whose dedup state is kept.
const RETAINED_INCARNATIONS: usize = 4;

/// Receive-side dedup state for one sender, one window per incarnation.
///
/// Incarnations are random, so they are matched, never ordered. Stale
/// datagrams from an earlier incarnation still hit their own window.
#[derive(Debug, Default)]
struct PeerWindows {
    /// Oldest first.
    windows: VecDeque<(u64, SeenWindow)>,
}

impl PeerWindows {
    /// Window of `incarnation`, created on first sight. Returns whether it
    /// is new alongside the window.
    fn window(&mut self, incarnation: u64) -> (bool, &mut SeenWindow) {
        let (fresh, position) = match self.windows.iter().position(|(i, _)| *i == incarnation) {
            Some(position) => (false, position),
            None => {
                if self.windows.len() == RETAINED_INCARNATIONS {
                    self.windows.pop_front();
                }
                self.windows.push_back((incarnation, SeenWindow::new()));
                (true, self.windows.len() - 1)
            }
        };
        (fresh, &mut self.windows[position].1)
    }

    fn incarnations(&self) -> usize {
        self.windows.len()
    }
}

impl<P: Payload> PerfectLink<P, UdpSocket> {
    /// Binds a UDP socket at the local roster address and starts the link.
    pub async fn bind(
        local: PeerId,
        key: SigningKey,
        roster: Arc<Roster>,
        settings: LinkSettings,
    ) -> LinkResult<Self> {
        let (address, _) = roster
            .peer(&local)
            .ok_or_else(|| LinkError::UnknownPeer(local.clone()))?;
        let socket = UdpSocket::bind(address).await?;
        Self::new(local, key, roster, socket, settings)
    }
}

impl<P: Payload, D: Datagram> PerfectLink<P, D> {
    /// Starts a link over an already bound datagram socket.
    pub fn new(
        local: PeerId,
        key: SigningKey,
        roster: Arc<Roster>,
        socket: D,
        settings: LinkSettings,
    ) -> LinkResult<Self> {
        let (_, public_key) = roster
            .peer(&local)
            .ok_or_else(|| LinkError::UnknownPeer(local.clone()))?;
        if *public_key != key.verifying_key() {
            return Err(LinkError::KeyMismatch(local));
        }

        let (deliveries, inbox) = mpsc::channel(settings.receive_queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            peer = %local,
            address = ?socket.local_addr().ok(),
            "perfect link started"
        );

        let inner = Arc::new(Inner {
            local,
            incarnation: new_incarnation(),
            key,
            roster,
            socket,
            settings,
            next_message_id: AtomicU64::new(1),
            outstanding: Mutex::new(HashMap::new()),
            metrics: LinkMetrics::new(),
            shutdown,
        });

        tokio::spawn(listen::<P, D>(Arc::clone(&inner), deliveries, shutdown_rx));

        Ok(Self {
            inner,
            inbox: Arc::new(tokio::sync::Mutex::new(inbox)),
        })
    }

    /// Queues `payload` for reliable delivery to `to` and returns its id.
    ///
    /// Returns immediately; retransmission continues in the background
    /// until `to` acknowledges.
    pub fn send(&self, to: &PeerId, payload: P) -> LinkResult<MessageId> {
        if *self.inner.shutdown.borrow() {
            return Err(LinkError::Closed);
        }
        let (address, _) = self
            .inner
            .roster
            .peer(to)
            .ok_or_else(|| LinkError::UnknownPeer(to.clone()))?;

        let message_id = MessageId::new(self.inner.next_message_id.fetch_add(1, Ordering::Relaxed));
        let bytes = self.inner.seal(message_id, Frame::Data(payload))?;

        let mut outstanding = lock(&self.inner.outstanding);
        let task = tokio::spawn(retransmit(
            Arc::clone(&self.inner),
            to.clone(),
            message_id,
            address,
            bytes,
        ));
        outstanding.insert((to.clone(), message_id), task.abort_handle());
        self.inner.metrics.increment_data_sent();

        trace!(to = %to, id = %message_id, "data queued");
        Ok(message_id)
    }

    /// Sends `payload` to every replica in the roster except this process.
    pub fn broadcast(&self, payload: &P) -> LinkResult<()>
    where
        P: Clone,
    {
        let targets: Vec<PeerId> = self
            .inner
            .roster
            .node_ids()
            .map(PeerId::from)
            .filter(|peer| *peer != self.inner.local)
            .collect();
        for peer in &targets {
            self.send(peer, payload.clone())?;
        }
        Ok(())
    }

    /// Next authenticated, deduplicated payload.
    ///
    /// Returns `None` once the link has shut down and the queue is drained.
    pub async fn receive(&self) -> Option<Delivery<P>> {
        self.inbox.lock().await.recv().await
    }

    /// Stops the listener and abandons all pending retransmissions.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let pending: Vec<AbortHandle> = lock(&self.inner.outstanding)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in pending {
            handle.abort();
        }
        info!(peer = %self.inner.local, "perfect link shut down");
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.inner.roster
    }

    /// Data frames still awaiting acknowledgement.
    pub fn pending_acks(&self) -> usize {
        lock(&self.inner.outstanding).len()
    }

    pub fn metrics(&self) -> LinkMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl<D: Datagram> Inner<D> {
    /// Signs and encodes one frame from this process.
    fn seal<P: Payload>(&self, message_id: MessageId, frame: Frame<P>) -> LinkResult<Vec<u8>> {
        let envelope = Envelope::sign(
            self.local.clone(),
            self.incarnation,
            message_id,
            frame,
            &self.key,
        )?;
        let bytes = envelope.encode()?;
        if bytes.len() > self.settings.max_datagram_size {
            return Err(LinkError::Oversized {
                size: bytes.len(),
                limit: self.settings.max_datagram_size,
            });
        }
        Ok(bytes)
    }

    async fn on_datagram<P: Payload>(
        &self,
        bytes: &[u8],
        deliveries: &mpsc::Sender<Delivery<P>>,
        peers: &mut HashMap<PeerId, PeerWindows>,
    ) {
        let envelope = match Envelope::<P>::decode(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.metrics.increment_decode_failures();
                debug!(%error, "dropping undecodable datagram");
                return;
            }
        };

        let Some((address, public_key)) = self.roster.peer(&envelope.sender) else {
            self.metrics.increment_unknown_senders();
            warn!(sender = %envelope.sender, "dropping envelope from unknown sender");
            return;
        };
        if let Err(error) = envelope.verify(public_key) {
            self.metrics.increment_authentication_failures();
            warn!(sender = %envelope.sender, %error, "dropping unauthenticated envelope");
            return;
        }

        let Envelope {
            sender,
            incarnation,
            message_id,
            frame,
            ..
        } = envelope;

        let payload = match frame {
            Frame::Ack {
                incarnation: acked_incarnation,
            } => {
                self.on_ack(sender, acked_incarnation, message_id);
                return;
            }
            Frame::Data(payload) => payload,
        };

        let windows = peers.entry(sender.clone()).or_default();
        let known = windows.incarnations();
        let (fresh, window) = windows.window(incarnation);
        if fresh && known > 0 {
            info!(%sender, "peer restarted, new dedup window");
        }

        if window.contains(message_id) {
            self.metrics.increment_duplicates_ignored();
            trace!(%sender, id = %message_id, "duplicate data, re-acknowledging");
            self.send_ack::<P>(address, incarnation, message_id).await;
            return;
        }

        let permit = match deliveries.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                // Left unacknowledged: the sender's retransmission retries.
                self.metrics.increment_backpressure_drops();
                debug!(%sender, id = %message_id, "receive queue full, dropping data");
                return;
            }
            Err(TrySendError::Closed(())) => return,
        };

        window.insert(message_id);
        permit.send(Delivery {
            sender,
            message_id,
            payload,
        });
        self.metrics.increment_delivered();
        self.send_ack::<P>(address, incarnation, message_id).await;
    }

    fn on_ack(&self, from: PeerId, acked_incarnation: u64, message_id: MessageId) {
        if acked_incarnation != self.incarnation {
            return;
        }
        if let Some(task) = lock(&self.outstanding).remove(&(from, message_id)) {
            task.abort();
            self.metrics.increment_acks_received();
        }
    }

    async fn send_ack<P: Payload>(
        &self,
        address: SocketAddr,
        acked_incarnation: u64,
        message_id: MessageId,
    ) {
        let frame = Frame::<P>::Ack {
            incarnation: acked_incarnation,
        };
        match self.seal(message_id, frame) {
            Ok(bytes) => {
                if let Err(error) = self.socket.send_to(&bytes, address).await {
                    debug!(%error, %address, "ack send failed");
                }
            }
            Err(error) => warn!(%error, "failed to seal ack"),
        }
    }
}

async fn listen<P: Payload, D: Datagram>(
    inner: Arc<Inner<D>>,
    deliveries: mpsc::Sender<Delivery<P>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; inner.settings.max_datagram_size];
    let mut peers: HashMap<PeerId, PeerWindows> = HashMap::new();

    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = inner.socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, _)) => inner.on_datagram(&buf[..len], &deliveries, &mut peers).await,
            Err(error) if error.kind() == std::io::ErrorKind::NotConnected => {
                warn!(%error, "datagram socket closed");
                break;
            }
            Err(error) => debug!(%error, "datagram receive failed"),
        }
    }

    debug!(peer = %inner.local, "link listener stopped");
}

async fn retransmit<D: Datagram>(
    inner: Arc<Inner<D>>,
    to: PeerId,
    message_id: MessageId,
    address: SocketAddr,
    bytes: Vec<u8>,
) {
    let mut delay = inner.settings.retransmit_initial;
    let mut attempts: u32 = 0;

    loop {
        if let Err(error) = inner.socket.send_to(&bytes, address).await {
            debug!(%error, %address, "datagram send failed");
        }
        tokio::time::sleep(delay).await;

        if let Some(limit) = inner.settings.max_retransmissions
            && attempts >= limit
        {
            lock(&inner.outstanding).remove(&(to.clone(), message_id));
            inner.metrics.increment_retransmissions_abandoned();
            warn!(%to, id = %message_id, attempts, "giving up on unacknowledged data");
            return;
        }

        attempts += 1;
        inner.metrics.increment_retransmissions();
        trace!(%to, id = %message_id, attempts, "retransmitting");
        delay = inner.settings.backoff(delay);
    }
}

fn new_incarnation() -> u64 {
    rand::thread_rng().r#gen()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> MessageId {
        MessageId::new(n)
    }

    #[test]
    fn restart_with_a_lower_incarnation_starts_a_fresh_window() {
        let mut windows = PeerWindows::default();
        let (fresh, window) = windows.window(900);
        assert!(fresh);
        window.insert(id(1));

        // A restarted peer drew a smaller incarnation and reuses id 1.
        let (fresh, window) = windows.window(100);
        assert!(fresh);
        assert!(!window.contains(id(1)));
    }

    #[test]
    fn late_datagrams_from_a_previous_incarnation_stay_deduplicated() {
        let mut windows = PeerWindows::default();
        windows.window(7).1.insert(id(1));
        windows.window(8).1.insert(id(1));

        let (fresh, window) = windows.window(7);
        assert!(!fresh);
        assert!(window.contains(id(1)));
    }

    #[test]
    fn oldest_incarnation_is_forgotten_first() {
        let mut windows = PeerWindows::default();
        for incarnation in 0..RETAINED_INCARNATIONS as u64 {
            windows.window(incarnation).1.insert(id(1));
        }
        windows.window(99);
        assert_eq!(windows.incarnations(), RETAINED_INCARNATIONS);

        let (fresh, window) = windows.window(0);
        assert!(fresh);
        assert!(!window.contains(id(1)));
        assert!(windows.window(RETAINED_INCARNATIONS as u64 - 1).1.contains(id(1)));
    }

    #[test]
    fn incarnations_are_not_reused() {
        assert_ne!(new_incarnation(), new_incarnation());
    }
}
