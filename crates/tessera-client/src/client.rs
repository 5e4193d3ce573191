//! Ledger client.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tessera_config::TesseraConfig;
use tessera_consensus::Quorum;
use tessera_crypto::SigningKey;
use tessera_link::{Datagram, Delivery, LinkSettings, PerfectLink};
use tessera_node::NodeMessage;
use tessera_types::{
    Block, ClientId, ClientRequest, Hash, Nonce, PayloadKind, PeerId, Roster,
};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};
use crate::tally::{Answer, ResponseTally};

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub link: LinkSettings,
    /// Resend the request to every replica after this long without an
    /// accepted answer.
    pub request_timeout: Duration,
    /// Give up after this many sends. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            link: LinkSettings::default(),
            request_timeout: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ClientSettings {
    pub fn from_config(config: &TesseraConfig) -> Self {
        Self {
            link: config.link.settings(),
            request_timeout: config.client.request_timeout(),
            max_attempts: None,
        }
    }
}

/// Appends to and reads the replicated ledger.
///
/// Requests are issued one at a time. The client keeps its own copy of
/// the ledger prefix it has seen and only accepts blocks that extend it.
pub struct LedgerClient<D = UdpSocket> {
    id: ClientId,
    key: SigningKey,
    roster: Arc<Roster>,
    link: PerfectLink<NodeMessage, D>,
    settings: ClientSettings,
    quorum: Quorum,
    next_nonce: u64,
    view: Vec<Block>,
}

impl LedgerClient<UdpSocket> {
    /// Binds the roster address of `id` over UDP.
    pub async fn bind(
        id: ClientId,
        key: SigningKey,
        roster: Arc<Roster>,
        settings: ClientSettings,
    ) -> ClientResult<Self> {
        let link = PerfectLink::bind(
            PeerId::from(&id),
            key.clone(),
            Arc::clone(&roster),
            settings.link.clone(),
        )
        .await?;
        Ok(Self::with_link(id, key, roster, link, settings))
    }
}

impl<D: Datagram> LedgerClient<D> {
    /// Starts a client over an already bound datagram socket.
    pub fn new(
        id: ClientId,
        key: SigningKey,
        roster: Arc<Roster>,
        socket: D,
        settings: ClientSettings,
    ) -> ClientResult<Self> {
        let link = PerfectLink::new(
            PeerId::from(&id),
            key.clone(),
            Arc::clone(&roster),
            socket,
            settings.link.clone(),
        )?;
        Ok(Self::with_link(id, key, roster, link, settings))
    }

    fn with_link(
        id: ClientId,
        key: SigningKey,
        roster: Arc<Roster>,
        link: PerfectLink<NodeMessage, D>,
        settings: ClientSettings,
    ) -> Self {
        let quorum = Quorum::new(roster.node_count());
        // Random start so a restarted client does not reuse old nonces.
        let next_nonce = u64::from(rand::random::<u32>()) << 32;
        Self {
            id,
            key,
            roster,
            link,
            settings,
            quorum,
            next_nonce,
            view: Vec::new(),
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Blocks accepted so far, starting at instance 1.
    pub fn view(&self) -> &[Block] {
        &self.view
    }

    /// Appends `payload` and returns the blocks learned along the way,
    /// ending at or after the one holding it.
    pub async fn append(&mut self, payload: impl Into<Bytes>) -> ClientResult<Vec<Block>> {
        self.submit(PayloadKind::APPEND, payload.into()).await
    }

    /// Orders a read behind every earlier write and returns the blocks
    /// the local view was missing.
    pub async fn read(&mut self) -> ClientResult<Vec<Block>> {
        self.submit(PayloadKind::READ, Bytes::new()).await
    }

    /// Sends a request with an application-defined kind.
    pub async fn submit(&mut self, kind: PayloadKind, payload: Bytes) -> ClientResult<Vec<Block>> {
        let nonce = Nonce::new(self.next_nonce);
        self.next_nonce = self.next_nonce.wrapping_add(1);

        let known = self.view.len() as u64;
        let request =
            ClientRequest::new(self.id.clone(), nonce, kind, payload, known).sign(&self.key);

        let answer = self.exchange(&request).await?;
        let fresh = self.extend_view(answer)?;
        info!(
            client = %self.id,
            nonce = %nonce,
            kind = kind.name(),
            new_blocks = fresh.len(),
            "request accepted"
        );
        Ok(fresh)
    }

    /// Stops the link.
    pub fn shutdown(&self) {
        self.link.shutdown();
    }

    async fn exchange(&self, request: &ClientRequest) -> ClientResult<Answer> {
        let mut tally = ResponseTally::new(self.quorum.weak_size());
        let mut attempts = 0;
        loop {
            if self.settings.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(ClientError::Timeout {
                    nonce: request.nonce,
                    attempts,
                });
            }
            attempts += 1;
            self.send_to_replicas(request)?;

            let deadline = Instant::now() + self.settings.request_timeout;
            loop {
                let delivery = match timeout_at(deadline, self.link.receive()).await {
                    Err(_) => break,
                    Ok(None) => return Err(ClientError::Closed),
                    Ok(Some(delivery)) => delivery,
                };
                if let Some(answer) = self.accept(request, &mut tally, delivery) {
                    return Ok(answer);
                }
            }
            debug!(
                nonce = %request.nonce,
                attempt = attempts,
                responders = tally.responders(),
                "request timed out, resending"
            );
        }
    }

    fn send_to_replicas(&self, request: &ClientRequest) -> ClientResult<()> {
        for node in self.roster.node_ids() {
            self.link
                .send(&PeerId::from(node), NodeMessage::Request(request.clone()))?;
        }
        Ok(())
    }

    fn accept(
        &self,
        request: &ClientRequest,
        tally: &mut ResponseTally,
        delivery: Delivery<NodeMessage>,
    ) -> Option<Answer> {
        let NodeMessage::Response(response) = delivery.payload else {
            debug!(from = %delivery.sender, "non-response message ignored");
            return None;
        };
        if response.node_id.as_str() != delivery.sender.as_str() {
            warn!(
                from = %delivery.sender,
                claimed = %response.node_id,
                "response with mismatched sender dropped"
            );
            return None;
        }
        if response.nonce != request.nonce {
            debug!(nonce = %response.nonce, "response to an earlier request ignored");
            return None;
        }
        tally.record(response)
    }

    fn extend_view(&mut self, answer: Answer) -> ClientResult<Vec<Block>> {
        let mut fresh = Vec::new();
        for block in answer.blocks {
            if block.instance.as_index() < self.view.len() {
                continue;
            }
            let extends = match self.view.last() {
                Some(tail) => block.follows(tail),
                None => block.instance.as_index() == 0 && block.previous_hash == Hash::GENESIS,
            };
            if !extends {
                return Err(ClientError::ChainMismatch {
                    instance: block.instance,
                });
            }
            self.view.push(block.clone());
            fresh.push(block);
        }
        Ok(fresh)
    }
}
