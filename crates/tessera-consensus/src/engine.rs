//! Consensus engine: owns every instance, the ledger and the round timers.
//!
//! # Design
//!
//! - Instances live in a table behind an `RwLock`; each has its own
//!   `Mutex`, so unrelated instances never serialize on one lock. Lock
//!   order is table, then instance slot. No lock is held across an await.
//! - Handlers run on the pure [`InstanceState`] machine. The engine signs
//!   the resulting messages, hands them to the [`ConsensusNetwork`] and
//!   loops broadcasts back to itself so this replica's own votes count.
//! - Round timers are tokio tasks, one per instance, aborted on rearm and
//!   on decision.
//! - Client values wait in a proposal queue. The head of the queue is the
//!   input of the lowest undecided instance; once a value is decided it
//!   leaves the queue and the next one moves up.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tessera_crypto::SigningKey;
use tessera_types::{Block, Hash, InstanceNumber, NodeId, Roster, Round, Value};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{ConsensusError, ConsensusResult};
use crate::instance::{InstanceContext, InstanceOutput, InstanceState, TimerCommand};
use crate::instrumentation::METRICS;
use crate::leader::{LeaderPolicy, RoundRobin};
use crate::ledger::Ledger;
use crate::message::{CommitCertificate, SignedConsensus};
use crate::quorum::Quorum;
use crate::settings::ConsensusSettings;
use crate::validator::{AcceptAll, ValueValidator};
use crate::verify::MessageVerifier;

// ============================================================================
// Network seam
// ============================================================================

/// Outbound side of the replica-to-replica transport.
///
/// Implementations queue and return immediately. Reliable delivery is the
/// transport's job; the engine never retries.
pub trait ConsensusNetwork: Send + Sync + 'static {
    /// Sends to every replica except this one.
    fn broadcast(&self, message: &SignedConsensus);

    /// Sends to one replica.
    fn send(&self, to: &NodeId, message: &SignedConsensus);
}

// ============================================================================
// Builder
// ============================================================================

/// Configures a [`ConsensusEngine`].
pub struct ConsensusEngineBuilder {
    local: NodeId,
    signing_key: SigningKey,
    roster: Arc<Roster>,
    network: Arc<dyn ConsensusNetwork>,
    settings: ConsensusSettings,
    leader_policy: Box<dyn LeaderPolicy>,
    validator: Box<dyn ValueValidator>,
}

impl ConsensusEngineBuilder {
    pub fn settings(mut self, settings: ConsensusSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn leader_policy(mut self, policy: impl LeaderPolicy) -> Self {
        self.leader_policy = Box::new(policy);
        self
    }

    pub fn validator(mut self, validator: impl ValueValidator) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// Builds the engine. Must run inside a tokio runtime.
    pub fn build(self) -> ConsensusResult<ConsensusEngine> {
        let entry = self
            .roster
            .node(&self.local)
            .ok_or_else(|| ConsensusError::NotAReplica(self.local.clone()))?;
        if entry.public_key != self.signing_key.verifying_key() {
            return Err(ConsensusError::NotAReplica(self.local));
        }
        let runtime = Handle::try_current()?;

        let replicas: Vec<NodeId> = self.roster.node_ids().cloned().collect();
        let quorum = Quorum::new(replicas.len());
        tracing::info!(
            node = %self.local,
            replicas = quorum.replicas(),
            max_faulty = quorum.max_faulty(),
            quorum = quorum.size(),
            "consensus engine starting"
        );

        let inner = Arc::new_cyclic(|me| EngineInner {
            me: me.clone(),
            local: self.local,
            signing_key: self.signing_key,
            roster: self.roster,
            replicas,
            quorum,
            settings: self.settings,
            leader_policy: self.leader_policy,
            validator: self.validator,
            network: self.network,
            runtime,
            ledger: Ledger::new(),
            instances: RwLock::new(BTreeMap::new()),
            proposals: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
        });
        Ok(ConsensusEngine { inner })
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Drives consensus instances for one replica. Cheap to clone.
#[derive(Clone)]
pub struct ConsensusEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("local", &self.inner.local)
            .field("ledger_length", &self.inner.ledger.len())
            .finish_non_exhaustive()
    }
}

impl ConsensusEngine {
    pub fn builder(
        local: NodeId,
        signing_key: SigningKey,
        roster: Arc<Roster>,
        network: Arc<dyn ConsensusNetwork>,
    ) -> ConsensusEngineBuilder {
        ConsensusEngineBuilder {
            local,
            signing_key,
            roster,
            network,
            settings: ConsensusSettings::default(),
            leader_policy: Box::new(RoundRobin),
            validator: Box::new(AcceptAll),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.inner.local
    }

    pub fn quorum(&self) -> Quorum {
        self.inner.quorum
    }

    pub fn settings(&self) -> &ConsensusSettings {
        &self.inner.settings
    }

    /// Queues `value` for ordering and returns immediately.
    ///
    /// A value already decided returns its instance. Otherwise the result
    /// is the instance the value is currently aimed at: the lowest
    /// undecided instance plus its place in the queue. Another replica's
    /// proposal may win that instance, in which case the value moves to the
    /// next one; [`ConsensusEngine::wait_for_value`] reports where it lands.
    pub fn start_consensus(&self, value: Value) -> ConsensusResult<InstanceNumber> {
        self.inner.ensure_running()?;
        Ok(self.inner.start_consensus(value))
    }

    /// Authenticates and applies one inbound message.
    ///
    /// Errors describe why the message was dropped; they are for logging
    /// only and never affect other instances.
    pub fn handle_message(&self, message: SignedConsensus) -> ConsensusResult<()> {
        self.inner.ensure_running()?;
        self.inner.handle_message(message)
    }

    /// Round timer for `(instance, round)` expired.
    pub fn on_timeout(&self, instance: InstanceNumber, round: Round) {
        if self.inner.ensure_running().is_ok() {
            self.inner.drive(instance, Event::Timeout(round));
        }
    }

    /// Number of decided, contiguous instances.
    pub fn ledger_length(&self) -> u64 {
        self.inner.ledger.len()
    }

    /// Decided blocks from `from` to the tail; empty past the tail.
    pub fn ledger_slice(&self, from: InstanceNumber) -> Vec<Block> {
        self.inner.ledger.slice(from)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    /// Resolves once `instance` is decided and published.
    pub async fn wait_for_instance(&self, instance: InstanceNumber) {
        self.inner.ledger.wait_for_length(instance.as_u64()).await;
    }

    /// Resolves with the first instance that decided a value with this
    /// digest.
    pub async fn wait_for_value(&self, digest: &Hash) -> InstanceNumber {
        self.inner.ledger.wait_for_value(digest).await
    }

    /// Value decided by `instance` at this replica, published or not.
    pub fn decided_value(&self, instance: InstanceNumber) -> Option<Value> {
        let slot = self.inner.existing_slot(instance)?;
        let slot = lock(&slot);
        slot.state.decided_value().cloned()
    }

    /// Current round of `instance`, if this replica has seen it.
    pub fn instance_round(&self, instance: InstanceNumber) -> Option<Round> {
        let slot = self.inner.existing_slot(instance)?;
        let round = lock(&slot).state.round();
        Some(round)
    }

    /// Stops all timers. Later calls are rejected with
    /// [`ConsensusError::ShutDown`].
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let instances = read(&self.inner.instances);
        for slot in instances.values() {
            if let Some(timer) = lock(slot).timer.take() {
                timer.abort();
            }
        }
        tracing::info!(node = %self.inner.local, "consensus engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

// ============================================================================
// Internals
// ============================================================================

enum Event {
    Start(Value),
    Message(SignedConsensus),
    Timeout(Round),
}

struct Slot {
    state: InstanceState,
    timer: Option<AbortHandle>,
}

struct EngineInner {
    me: Weak<EngineInner>,
    local: NodeId,
    signing_key: SigningKey,
    roster: Arc<Roster>,
    replicas: Vec<NodeId>,
    quorum: Quorum,
    settings: ConsensusSettings,
    leader_policy: Box<dyn LeaderPolicy>,
    validator: Box<dyn ValueValidator>,
    network: Arc<dyn ConsensusNetwork>,
    runtime: Handle,
    ledger: Ledger,
    instances: RwLock<BTreeMap<InstanceNumber, Arc<Mutex<Slot>>>>,
    proposals: Mutex<VecDeque<Value>>,
    shutdown: AtomicBool,
}

type Work = VecDeque<(InstanceNumber, Event)>;

impl EngineInner {
    fn ensure_running(&self) -> ConsensusResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            Err(ConsensusError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn context(&self) -> InstanceContext<'_> {
        InstanceContext {
            local: &self.local,
            replicas: &self.replicas,
            quorum: self.quorum,
            leader_policy: self.leader_policy.as_ref(),
            validator: self.validator.as_ref(),
            settings: &self.settings,
        }
    }

    // ------------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------------

    fn start_consensus(&self, value: Value) -> InstanceNumber {
        let digest = value.digest();
        let position = {
            let mut proposals = lock(&self.proposals);
            // Checked under the queue lock: a decision removes its value
            // from the queue only after recording it in the ledger.
            if let Some(instance) = self.ledger.decided_instance_of(&digest) {
                return instance;
            }
            match proposals.iter().position(|queued| queued.digest() == digest) {
                Some(position) => position,
                None => {
                    proposals.push_back(value);
                    proposals.len() - 1
                }
            }
        };

        let instance =
            InstanceNumber::new(self.ledger.first_undecided().as_u64() + position as u64);
        tracing::debug!(
            node = %self.local,
            instance = %instance,
            queued = position + 1,
            "value queued for consensus"
        );

        let mut work = Work::new();
        self.seed_next(&mut work);
        self.run(work);
        instance
    }

    /// Gives the queue head to the lowest undecided instance.
    fn seed_next(&self, work: &mut Work) {
        let head = lock(&self.proposals).front().cloned();
        if let Some(value) = head {
            work.push_back((self.ledger.first_undecided(), Event::Start(value)));
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn handle_message(&self, signed: SignedConsensus) -> ConsensusResult<()> {
        let kind = signed.kind();
        METRICS.increment_messages_received(kind);
        let instance = signed.message.instance();

        if let Err(error) = self.check_window(instance) {
            METRICS.increment_outside_window();
            tracing::debug!(
                node = %self.local,
                from = %signed.sender,
                kind = %kind,
                %error,
                "dropping message"
            );
            return Err(error);
        }

        if let Err(error) = MessageVerifier::new(&self.roster, self.quorum).verify(&signed) {
            match &error {
                ConsensusError::UnknownSender(_) => METRICS.increment_unknown_senders(),
                ConsensusError::AuthenticationFailure(_) => {
                    METRICS.increment_authentication_failures();
                }
                _ => METRICS.increment_invalid_justifications(),
            }
            tracing::warn!(
                node = %self.local,
                from = %signed.sender,
                kind = %kind,
                instance = %instance,
                %error,
                "rejecting consensus message"
            );
            return Err(error);
        }

        if instance.as_u64() <= self.ledger.len() && self.existing_slot(instance).is_none() {
            METRICS.increment_stale_messages();
            return Err(ConsensusError::StaleMessage(instance));
        }

        self.drive(instance, Event::Message(signed));
        Ok(())
    }

    /// Bounds how far above the ledger tail peers may open instances.
    fn check_window(&self, instance: InstanceNumber) -> ConsensusResult<()> {
        let ledger_length = self.ledger.len();
        let window = self.settings.max_pending_instances;
        if instance.as_u64() == 0 || instance.as_u64() > ledger_length.saturating_add(window) {
            return Err(ConsensusError::OutsideWindow {
                instance,
                ledger_length,
                window,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Driving instances
    // ------------------------------------------------------------------------

    fn drive(&self, instance: InstanceNumber, event: Event) {
        let mut work = Work::new();
        work.push_back((instance, event));
        self.run(work);
    }

    /// Processes events until no instance has anything left to do.
    fn run(&self, mut work: Work) {
        while let Some((instance, event)) = work.pop_front() {
            let output = self.step(instance, event);
            self.apply(instance, output, &mut work);
        }
    }

    /// Runs one handler under the instance lock.
    fn step(&self, instance: InstanceNumber, event: Event) -> InstanceOutput {
        let slot = self.slot(instance);
        let mut slot = lock(&slot);

        let state = std::mem::replace(&mut slot.state, InstanceState::new(instance, self.quorum));
        let ctx = self.context();
        let (state, mut output) = match event {
            Event::Start(value) => state.start(&ctx, value),
            Event::Message(signed) => state.on_message(&ctx, signed),
            Event::Timeout(round) => state.on_timeout(&ctx, round),
        };
        slot.state = state;

        // Applied under the lock so timer commands keep their order.
        if let Some(command) = output.timer.take() {
            self.apply_timer(&mut slot, instance, command);
        }
        output
    }

    fn apply(&self, instance: InstanceNumber, output: InstanceOutput, work: &mut Work) {
        for outbound in output.messages {
            let kind = outbound.message.kind();
            let signed =
                match SignedConsensus::sign(self.local.clone(), outbound.message, &self.signing_key)
                {
                    Ok(signed) => signed,
                    Err(error) => {
                        tracing::error!(node = %self.local, %error, "failed to sign message");
                        continue;
                    }
                };
            METRICS.increment_messages_sent(kind);

            match outbound.to {
                None => {
                    self.network.broadcast(&signed);
                    work.push_back((instance, Event::Message(signed)));
                }
                Some(to) if to == self.local => {
                    work.push_back((instance, Event::Message(signed)));
                }
                Some(to) => self.network.send(&to, &signed),
            }
        }

        if let Some(cert) = output.decided {
            self.on_decided(instance, cert, work);
        }
    }

    fn on_decided(&self, instance: InstanceNumber, cert: CommitCertificate, work: &mut Work) {
        let digest = cert.value.digest();
        self.ledger.record_decision(instance, cert.value);
        lock(&self.proposals).retain(|queued| queued.digest() != digest);
        self.seed_next(work);
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn apply_timer(&self, slot: &mut Slot, instance: InstanceNumber, command: TimerCommand) {
        if let Some(previous) = slot.timer.take() {
            previous.abort();
        }
        let TimerCommand::Arm { round, after } = command else {
            return;
        };
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        let engine = self.me.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = engine.upgrade()
                && inner.ensure_running().is_ok()
            {
                inner.drive(instance, Event::Timeout(round));
            }
        });
        slot.timer = Some(task.abort_handle());
    }

    // ------------------------------------------------------------------------
    // Instance table
    // ------------------------------------------------------------------------

    fn existing_slot(&self, instance: InstanceNumber) -> Option<Arc<Mutex<Slot>>> {
        read(&self.instances).get(&instance).cloned()
    }

    fn slot(&self, instance: InstanceNumber) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.existing_slot(instance) {
            return slot;
        }
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(instances.entry(instance).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                state: InstanceState::new(instance, self.quorum),
                timer: None,
            }))
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use tessera_types::RosterEntry;

    use crate::message::{ConsensusMessage, MessageKind, Vote};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Option<NodeId>, SignedConsensus)>>,
    }

    impl ConsensusNetwork for Recorder {
        fn broadcast(&self, message: &SignedConsensus) {
            lock(&self.sent).push((None, message.clone()));
        }

        fn send(&self, to: &NodeId, message: &SignedConsensus) {
            lock(&self.sent).push((Some(to.clone()), message.clone()));
        }
    }

    fn roster(keys: &[SigningKey]) -> Arc<Roster> {
        let nodes = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let address: SocketAddr = format!("127.0.0.1:{}", 7000 + i).parse().unwrap();
                RosterEntry::new(NodeId::new(format!("R{}", i + 1)), address, key.verifying_key())
            })
            .collect();
        Arc::new(Roster::new(nodes, Vec::new()).unwrap())
    }

    #[tokio::test]
    async fn build_rejects_identity_outside_roster() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate()).collect();
        let network = Arc::new(Recorder::default());

        let stranger = ConsensusEngine::builder(
            NodeId::new("R9"),
            keys[0].clone(),
            roster(&keys),
            network.clone(),
        )
        .build();
        assert!(matches!(stranger, Err(ConsensusError::NotAReplica(_))));

        let wrong_key = ConsensusEngine::builder(
            NodeId::new("R1"),
            keys[1].clone(),
            roster(&keys),
            network,
        )
        .build();
        assert!(matches!(wrong_key, Err(ConsensusError::NotAReplica(_))));
    }

    #[test]
    fn build_requires_a_runtime() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate()).collect();
        let result = ConsensusEngine::builder(
            NodeId::new("R1"),
            keys[0].clone(),
            roster(&keys),
            Arc::new(Recorder::default()),
        )
        .build();
        assert!(matches!(result, Err(ConsensusError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn leader_broadcasts_proposal_and_counts_its_own_vote() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate()).collect();
        let network = Arc::new(Recorder::default());
        let engine = ConsensusEngine::builder(
            NodeId::new("R1"),
            keys[0].clone(),
            roster(&keys),
            network.clone(),
        )
        .build()
        .unwrap();

        let instance = engine.start_consensus(Value::from("tx1")).unwrap();
        assert_eq!(instance, InstanceNumber::FIRST);

        let kinds: Vec<_> = lock(&network.sent).iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds, [MessageKind::PrePrepare, MessageKind::Prepare]);
        engine.shutdown();
    }

    #[tokio::test]
    async fn queued_values_aim_at_successive_instances() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate()).collect();
        let engine = ConsensusEngine::builder(
            NodeId::new("R2"),
            keys[1].clone(),
            roster(&keys),
            Arc::new(Recorder::default()),
        )
        .build()
        .unwrap();

        assert_eq!(engine.start_consensus(Value::from("a")).unwrap(), InstanceNumber::new(1));
        assert_eq!(engine.start_consensus(Value::from("b")).unwrap(), InstanceNumber::new(2));
        // Same value again keeps its place.
        assert_eq!(engine.start_consensus(Value::from("a")).unwrap(), InstanceNumber::new(1));
        engine.shutdown();
    }

    #[tokio::test]
    async fn rejects_instances_outside_the_window() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate()).collect();
        let engine = ConsensusEngine::builder(
            NodeId::new("R2"),
            keys[1].clone(),
            roster(&keys),
            Arc::new(Recorder::default()),
        )
        .settings(ConsensusSettings {
            max_pending_instances: 8,
            ..ConsensusSettings::default()
        })
        .build()
        .unwrap();

        let far = SignedConsensus::sign(
            NodeId::new("R1"),
            ConsensusMessage::Prepare(Vote {
                instance: InstanceNumber::new(9),
                round: Round::FIRST,
                value: Value::from("x"),
            }),
            &keys[0],
        )
        .unwrap();
        assert!(matches!(
            engine.handle_message(far),
            Err(ConsensusError::OutsideWindow { .. })
        ));
        assert!(engine.instance_round(InstanceNumber::new(9)).is_none());
    }

    #[tokio::test]
    async fn rejects_forged_vote_without_touching_state() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate()).collect();
        let engine = ConsensusEngine::builder(
            NodeId::new("R3"),
            keys[2].clone(),
            roster(&keys),
            Arc::new(Recorder::default()),
        )
        .build()
        .unwrap();

        // Signed with R4's key but claims to be R2.
        let forged = SignedConsensus::sign(
            NodeId::new("R2"),
            ConsensusMessage::Commit(Vote {
                instance: InstanceNumber::FIRST,
                round: Round::FIRST,
                value: Value::from("evil"),
            }),
            &keys[3],
        )
        .unwrap();
        assert!(matches!(
            engine.handle_message(forged),
            Err(ConsensusError::AuthenticationFailure(_))
        ));
        assert!(engine.instance_round(InstanceNumber::FIRST).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_round_times_out_into_round_change() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate()).collect();
        let network = Arc::new(Recorder::default());
        let engine = ConsensusEngine::builder(
            NodeId::new("R3"),
            keys[2].clone(),
            roster(&keys),
            network.clone(),
        )
        .settings(ConsensusSettings {
            round_timeout: Duration::from_millis(100),
            ..ConsensusSettings::default()
        })
        .build()
        .unwrap();

        engine.start_consensus(Value::from("tx")).unwrap();
        assert!(lock(&network.sent).is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.instance_round(InstanceNumber::FIRST), Some(Round::new(2)));
        let kinds: Vec<_> = lock(&network.sent).iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds, [MessageKind::RoundChange]);
        engine.shutdown();
    }

    #[tokio::test]
    async fn shut_down_engine_rejects_work() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate()).collect();
        let engine = ConsensusEngine::builder(
            NodeId::new("R1"),
            keys[0].clone(),
            roster(&keys),
            Arc::new(Recorder::default()),
        )
        .build()
        .unwrap();
        engine.shutdown();
        assert!(engine.is_shut_down());
        assert!(matches!(
            engine.start_consensus(Value::from("tx")),
            Err(ConsensusError::ShutDown)
        ));
    }
}
