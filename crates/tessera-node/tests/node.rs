//! End-to-end replica behaviour over the in-memory network.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tessera_consensus::ConsensusSettings;
use tessera_crypto::SigningKey;
use tessera_link::{LinkSettings, MemoryNetwork, MemorySocket, PerfectLink};
use tessera_node::{Node, NodeError, NodeMessage, NodeSettings};
use tessera_types::{
    ClientId, ClientRequest, InstanceNumber, LedgerResponse, NodeId, Nonce, PayloadKind, PeerId,
    Roster, RosterEntry, Value,
};
use tokio::time::timeout;

type ClientLink = PerfectLink<NodeMessage, MemorySocket>;

struct Harness {
    roster: Arc<Roster>,
    nodes: Vec<Node<MemorySocket>>,
    client: ClientLink,
    client_key: SigningKey,
}

fn node_address(i: usize) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 7001 + i as u16))
}

fn settings() -> NodeSettings {
    NodeSettings {
        link: LinkSettings {
            retransmit_initial: Duration::from_millis(20),
            retransmit_max: Duration::from_millis(100),
            ..LinkSettings::default()
        },
        consensus: ConsensusSettings {
            round_timeout: Duration::from_millis(300),
            max_round_timeout: Duration::from_secs(2),
            ..ConsensusSettings::default()
        },
        worker_permits: 16,
    }
}

impl Harness {
    fn start(n: usize) -> Self {
        let network = MemoryNetwork::new(7);
        let keys: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate()).collect();
        let client_key = SigningKey::generate();
        let client_address = SocketAddr::from(([10, 0, 1, 1], 8001));
        let roster = Arc::new(
            Roster::new(
                keys.iter()
                    .enumerate()
                    .map(|(i, key)| {
                        RosterEntry::new(
                            NodeId::new(format!("R{}", i + 1)),
                            node_address(i),
                            key.verifying_key(),
                        )
                    })
                    .collect(),
                vec![RosterEntry::new(
                    ClientId::new("C1"),
                    client_address,
                    client_key.verifying_key(),
                )],
            )
            .unwrap(),
        );

        let nodes = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| {
                Node::start(
                    NodeId::new(format!("R{}", i + 1)),
                    key,
                    Arc::clone(&roster),
                    network.bind(node_address(i)),
                    settings(),
                )
                .unwrap()
            })
            .collect();

        let client = PerfectLink::new(
            PeerId::new("C1"),
            client_key.clone(),
            Arc::clone(&roster),
            network.bind(client_address),
            settings().link,
        )
        .unwrap();

        Self {
            roster,
            nodes,
            client,
            client_key,
        }
    }

    fn request(&self, nonce: u64, kind: PayloadKind, payload: &'static str) -> ClientRequest {
        ClientRequest::new(ClientId::new("C1"), Nonce::new(nonce), kind, payload, 0)
            .sign(&self.client_key)
    }

    fn send_to_all(&self, request: &ClientRequest) {
        for id in self.roster.node_ids() {
            self.client
                .send(&PeerId::from(id), NodeMessage::Request(request.clone()))
                .unwrap();
        }
    }

    async fn responses(&self, count: usize) -> Vec<LedgerResponse> {
        let mut responses = Vec::new();
        while responses.len() < count {
            let delivery = timeout(Duration::from_secs(20), self.client.receive())
                .await
                .expect("timed out waiting for responses")
                .expect("client link closed");
            if let NodeMessage::Response(response) = delivery.payload {
                responses.push(response);
            }
        }
        responses
    }

    fn shutdown(&self) {
        self.client.shutdown();
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn append_is_answered_by_every_replica() {
    let harness = Harness::start(4);
    let request = harness.request(1, PayloadKind::APPEND, "tx1");
    harness.send_to_all(&request);

    let responses = harness.responses(4).await;
    let senders: HashSet<NodeId> = responses.iter().map(|r| r.node_id.clone()).collect();
    assert_eq!(senders.len(), 4);
    for response in &responses {
        assert_eq!(response.nonce, Nonce::new(1));
        assert_eq!(response.decided_instance, InstanceNumber::FIRST);
        assert_eq!(response.slice.len(), 1);
        assert_eq!(response.slice[0].instance, InstanceNumber::FIRST);
    }
    for node in &harness.nodes {
        assert!(node.engine().ledger().verify_chain());
    }
    harness.shutdown();
}

#[tokio::test(start_paused = true)]
async fn duplicate_request_is_decided_once() {
    let harness = Harness::start(4);
    let request = harness.request(7, PayloadKind::APPEND, "tx7");
    harness.send_to_all(&request);
    harness.send_to_all(&request);
    let first = harness.responses(4).await;

    // A retry after the decision is answered with the same instance.
    harness.send_to_all(&request);
    let retry = harness.responses(4).await;

    let instances: HashSet<InstanceNumber> = first
        .iter()
        .chain(&retry)
        .map(|r| r.decided_instance)
        .collect();
    assert_eq!(instances, HashSet::from([InstanceNumber::FIRST]));

    // Give any stray second instance a chance to show up.
    tokio::time::sleep(Duration::from_millis(500)).await;
    for node in &harness.nodes {
        assert_eq!(node.engine().ledger_length(), 1);
    }
    harness.shutdown();
}

#[tokio::test(start_paused = true)]
async fn duplicates_of_a_stalled_request_leave_workers_free() {
    let harness = Harness::start(4);
    // Two replicas down: no instance can decide.
    harness.nodes[0].shutdown();
    harness.nodes[1].shutdown();

    let r3 = PeerId::new("R3");
    let stalled = harness.request(1, PayloadKind::APPEND, "stalled");
    for _ in 0..settings().worker_permits + 4 {
        harness
            .client
            .send(&r3, NodeMessage::Request(stalled.clone()))
            .unwrap();
    }
    let next = harness.request(2, PayloadKind::APPEND, "next");
    harness.client.send(&r3, NodeMessage::Request(next)).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Both requests are queued for proposal, so a third value lands behind
    // them.
    let engine = harness.nodes[2].engine();
    assert_eq!(engine.ledger_length(), 0);
    assert_eq!(
        engine.start_consensus(Value::from("marker")).unwrap(),
        InstanceNumber::new(3)
    );
    harness.shutdown();
}

#[tokio::test(start_paused = true)]
async fn read_observes_earlier_appends() {
    let harness = Harness::start(4);
    harness.send_to_all(&harness.request(1, PayloadKind::APPEND, "tx1"));
    harness.responses(4).await;

    harness.send_to_all(&harness.request(2, PayloadKind::READ, ""));
    let responses = harness.responses(4).await;
    for response in &responses {
        assert_eq!(response.decided_instance, InstanceNumber::new(2));
        assert!(response.slice.len() >= 2);
        assert!(response.slice[1].follows(&response.slice[0]));
    }
    harness.shutdown();
}

#[tokio::test(start_paused = true)]
async fn forged_request_gets_no_response() {
    let harness = Harness::start(4);
    let forged = ClientRequest::new(
        ClientId::new("C1"),
        Nonce::new(1),
        PayloadKind::APPEND,
        "forged",
        0,
    )
    .sign(&SigningKey::generate());
    harness.send_to_all(&forged);

    let answer = timeout(Duration::from_secs(1), harness.client.receive()).await;
    assert!(answer.is_err(), "forged request was answered");
    for node in &harness.nodes {
        assert_eq!(node.engine().ledger_length(), 0);
        assert!(node.engine().instance_round(InstanceNumber::FIRST).is_none());
    }
    harness.shutdown();
}

#[tokio::test(start_paused = true)]
async fn progress_with_one_replica_down() {
    let harness = Harness::start(4);
    harness.nodes[0].shutdown();

    harness.send_to_all(&harness.request(1, PayloadKind::APPEND, "tx1"));
    let responses = harness.responses(3).await;
    for response in &responses {
        assert_eq!(response.decided_instance, InstanceNumber::FIRST);
    }
    harness.shutdown();
}

#[tokio::test(start_paused = true)]
async fn node_rejects_key_outside_roster() {
    let harness = Harness::start(4);
    let network = MemoryNetwork::new(1);
    let result = Node::start(
        NodeId::new("R1"),
        SigningKey::generate(),
        Arc::clone(&harness.roster),
        network.bind(node_address(0)),
        settings(),
    );
    assert!(matches!(result, Err(NodeError::Link(_))));
    harness.shutdown();
}
