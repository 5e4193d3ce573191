//! Node runtime: one receive loop, a bounded pool of request workers.
//!
//! Only a request seen for the first time takes a worker permit.
//! Duplicates are resolved inline from the dedup table.

use std::sync::{Arc, Mutex, PoisonError};

use tessera_config::TesseraConfig;
use tessera_consensus::{ConsensusEngine, ConsensusSettings, METRICS, MetricsSnapshot};
use tessera_crypto::SigningKey;
use tessera_link::{Datagram, Delivery, LinkMetricsSnapshot, LinkSettings, PerfectLink};
use tessera_types::{LedgerResponse, NodeId, PeerId, Roster};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::dedup::Admission;
use crate::error::{NodeError, NodeResult};
use crate::handler::RequestHandler;
use crate::message::NodeMessage;
use crate::network::LinkNetwork;
use crate::request::SignedRequestValidator;

/// Everything a replica needs besides its identity.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub link: LinkSettings,
    pub consensus: ConsensusSettings,
    /// Client requests handled concurrently. Requests arriving while all
    /// permits are taken are dropped; the client retries.
    pub worker_permits: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            link: LinkSettings::default(),
            consensus: ConsensusSettings::default(),
            worker_permits: 64,
        }
    }
}

impl NodeSettings {
    pub fn from_config(config: &TesseraConfig) -> Self {
        Self {
            link: config.link.settings(),
            consensus: config.consensus.settings(),
            worker_permits: config.service.worker_permits,
        }
    }
}

/// A running replica.
pub struct Node<D = UdpSocket> {
    id: NodeId,
    link: PerfectLink<NodeMessage, D>,
    handler: Arc<RequestHandler>,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Node<UdpSocket> {
    /// Binds the roster address of `id` over UDP and starts the replica.
    pub async fn bind(
        id: NodeId,
        signing_key: SigningKey,
        roster: Arc<Roster>,
        settings: NodeSettings,
    ) -> NodeResult<Self> {
        let link = PerfectLink::bind(
            PeerId::from(&id),
            signing_key.clone(),
            Arc::clone(&roster),
            settings.link.clone(),
        )
        .await?;
        Self::with_link(id, signing_key, roster, link, settings)
    }
}

impl<D: Datagram> Node<D> {
    /// Starts a replica over an already bound datagram socket.
    pub fn start(
        id: NodeId,
        signing_key: SigningKey,
        roster: Arc<Roster>,
        socket: D,
        settings: NodeSettings,
    ) -> NodeResult<Self> {
        let link = PerfectLink::new(
            PeerId::from(&id),
            signing_key.clone(),
            Arc::clone(&roster),
            socket,
            settings.link.clone(),
        )?;
        Self::with_link(id, signing_key, roster, link, settings)
    }

    fn with_link(
        id: NodeId,
        signing_key: SigningKey,
        roster: Arc<Roster>,
        link: PerfectLink<NodeMessage, D>,
        settings: NodeSettings,
    ) -> NodeResult<Self> {
        let engine = ConsensusEngine::builder(
            id.clone(),
            signing_key,
            Arc::clone(&roster),
            Arc::new(LinkNetwork::new(link.clone())),
        )
        .settings(settings.consensus)
        .validator(SignedRequestValidator::new(Arc::clone(&roster)))
        .build()
        .inspect_err(|_| link.shutdown())?;

        let handler = Arc::new(RequestHandler::new(engine, roster));
        let permits = Arc::new(Semaphore::new(settings.worker_permits.max(1)));
        let receive_loop = tokio::spawn(receive_loop(
            link.clone(),
            Arc::clone(&handler),
            permits,
        ));

        info!(node = %id, workers = settings.worker_permits, "node started");
        Ok(Self {
            id,
            link,
            handler,
            receive_loop: Mutex::new(Some(receive_loop)),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn engine(&self) -> &ConsensusEngine {
        self.handler.engine()
    }

    pub fn link_metrics(&self) -> LinkMetricsSnapshot {
        self.link.metrics()
    }

    pub fn consensus_metrics(&self) -> MetricsSnapshot {
        METRICS.snapshot()
    }

    /// Stops the receive loop, in-flight requests, timers and the link.
    pub fn shutdown(&self) {
        let receive_loop = self
            .receive_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receive_loop) = receive_loop else {
            return;
        };
        receive_loop.abort();
        self.handler.engine().shutdown();
        self.link.shutdown();
        info!(node = %self.id, "node shut down");
    }
}

impl<D> Drop for Node<D> {
    fn drop(&mut self) {
        if let Some(receive_loop) = self
            .receive_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            receive_loop.abort();
        }
    }
}

async fn receive_loop<D: Datagram>(
    link: PerfectLink<NodeMessage, D>,
    handler: Arc<RequestHandler>,
    permits: Arc<Semaphore>,
) {
    // Dropping the set on abort cancels every in-flight request.
    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            delivery = link.receive() => {
                let Some(delivery) = delivery else { break };
                dispatch(&link, &handler, &permits, &mut workers, delivery);
            }
            Some(_) = workers.join_next(), if !workers.is_empty() => {}
        }
    }
}

fn dispatch<D: Datagram>(
    link: &PerfectLink<NodeMessage, D>,
    handler: &Arc<RequestHandler>,
    permits: &Arc<Semaphore>,
    workers: &mut JoinSet<()>,
    delivery: Delivery<NodeMessage>,
) {
    let Delivery {
        sender, payload, ..
    } = delivery;
    match payload {
        NodeMessage::Consensus(message) => {
            if sender.as_str() != message.sender.as_str() {
                warn!(
                    error = %NodeError::SenderMismatch {
                        link: sender.to_string(),
                        claimed: message.sender.to_string(),
                    },
                    "consensus message dropped"
                );
                return;
            }
            // Verification and state transitions are synchronous and short.
            if let Err(e) = handler.engine().handle_message(message) {
                debug!(from = %sender, error = %e, "consensus message not applied");
            }
        }
        NodeMessage::Request(request) => {
            if sender.as_str() != request.client_id.as_str() {
                warn!(
                    error = %NodeError::SenderMismatch {
                        link: sender.to_string(),
                        claimed: request.client_id.to_string(),
                    },
                    "request dropped"
                );
                return;
            }
            let ticket = match handler.admit(&request) {
                Ok(Admission::New(ticket)) => ticket,
                Ok(Admission::Duplicate(original)) => {
                    if let Some(response) = handler.answer_duplicate(&request, &original) {
                        send_response(link, &sender, response);
                    }
                    return;
                }
                Err(e) => {
                    warn!(client = %request.client_id, nonce = %request.nonce, error = %e, "request dropped");
                    return;
                }
            };
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                ticket.abandon();
                warn!(client = %request.client_id, nonce = %request.nonce, "worker pool full, request dropped");
                return;
            };
            let link = link.clone();
            let handler = Arc::clone(handler);
            workers.spawn(async move {
                let _permit = permit;
                if let Some(response) = handler.handle(request, ticket).await {
                    send_response(&link, &sender, response);
                }
            });
        }
        NodeMessage::Response(_) => {
            debug!(from = %sender, "unexpected response at a replica, dropped");
        }
    }
}

fn send_response<D: Datagram>(
    link: &PerfectLink<NodeMessage, D>,
    client: &PeerId,
    response: LedgerResponse,
) {
    if let Err(e) = link.send(client, NodeMessage::Response(response)) {
        warn!(client = %client, error = %e, "failed to send response");
    }
}
