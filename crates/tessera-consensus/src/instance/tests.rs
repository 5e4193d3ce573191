//! State machine tests.
//!
//! Each test drives [`InstanceState`] handlers directly and inspects the
//! returned outputs. No engine, no timers, no network.

use std::collections::VecDeque;
use std::time::Duration;

use tessera_crypto::SigningKey;
use tessera_types::{InstanceNumber, NodeId, Round, Value};

use super::*;
use crate::leader::RoundRobin;
use crate::message::{MessageKind, PrePrepare, RoundChange, Vote};
use crate::validator::AcceptAll;

// ============================================================================
// Helper Functions
// ============================================================================

struct Harness {
    nodes: Vec<NodeId>,
    keys: Vec<SigningKey>,
    settings: ConsensusSettings,
}

impl Harness {
    fn new(n: usize) -> Self {
        Self {
            nodes: (1..=n).map(|i| NodeId::new(format!("R{i}"))).collect(),
            keys: (0..n).map(|_| SigningKey::generate()).collect(),
            settings: ConsensusSettings {
                round_timeout: Duration::from_millis(100),
                max_round_timeout: Duration::from_secs(10),
                ..ConsensusSettings::default()
            },
        }
    }

    fn quorum(&self) -> Quorum {
        Quorum::new(self.nodes.len())
    }

    fn ctx(&self, i: usize) -> InstanceContext<'_> {
        self.ctx_with(i, &AcceptAll)
    }

    fn ctx_with<'a>(&'a self, i: usize, validator: &'a dyn ValueValidator) -> InstanceContext<'a> {
        InstanceContext {
            local: &self.nodes[i],
            replicas: &self.nodes,
            quorum: self.quorum(),
            leader_policy: &RoundRobin,
            validator,
            settings: &self.settings,
        }
    }

    fn state(&self) -> InstanceState {
        InstanceState::new(InstanceNumber::FIRST, self.quorum())
    }

    fn sign(&self, i: usize, message: ConsensusMessage) -> SignedConsensus {
        SignedConsensus::sign(self.nodes[i].clone(), message, &self.keys[i]).unwrap()
    }

    fn pre_prepare(&self, i: usize, round: u64, value: &'static str) -> SignedConsensus {
        self.sign(
            i,
            ConsensusMessage::PrePrepare(PrePrepare {
                instance: InstanceNumber::FIRST,
                round: Round::new(round),
                value: Value::from(value),
                justification: Vec::new(),
            }),
        )
    }

    fn prepare(&self, i: usize, round: u64, value: &'static str) -> SignedConsensus {
        self.sign(i, ConsensusMessage::Prepare(vote(round, value)))
    }

    fn commit(&self, i: usize, round: u64, value: &'static str) -> SignedConsensus {
        self.sign(i, ConsensusMessage::Commit(vote(round, value)))
    }

    fn round_change(
        &self,
        i: usize,
        round: u64,
        prepared: Option<PreparedCertificate>,
    ) -> SignedConsensus {
        self.sign(
            i,
            ConsensusMessage::RoundChange(RoundChange {
                instance: InstanceNumber::FIRST,
                round: Round::new(round),
                prepared,
            }),
        )
    }

    fn prepared_cert(&self, round: u64, value: &'static str) -> PreparedCertificate {
        PreparedCertificate {
            round: Round::new(round),
            value: Value::from(value),
            prepares: (0..self.quorum().size())
                .map(|i| self.prepare(i, round, value))
                .collect(),
        }
    }

    /// Delivers every broadcast to every live replica, in FIFO order,
    /// until the network is quiet. Returns the decisions.
    fn run(
        &self,
        states: &mut [InstanceState],
        initial: Vec<(usize, InstanceOutput)>,
        crashed: &[usize],
    ) -> Vec<Option<Value>> {
        let mut queue: VecDeque<(Option<NodeId>, SignedConsensus)> = VecDeque::new();
        let enqueue = |from: usize, output: InstanceOutput, queue: &mut VecDeque<_>| {
            for outbound in output.messages {
                queue.push_back((outbound.to, self.sign(from, outbound.message)));
            }
        };
        for (from, output) in initial {
            enqueue(from, output, &mut queue);
        }

        while let Some((to, signed)) = queue.pop_front() {
            for i in 0..states.len() {
                if crashed.contains(&i) || to.as_ref().is_some_and(|to| *to != self.nodes[i]) {
                    continue;
                }
                let (state, output) = states[i].clone().on_message(&self.ctx(i), signed.clone());
                states[i] = state;
                enqueue(i, output, &mut queue);
            }
        }

        states.iter().map(|s| s.decided_value().cloned()).collect()
    }
}

fn vote(round: u64, value: &'static str) -> Vote {
    Vote {
        instance: InstanceNumber::FIRST,
        round: Round::new(round),
        value: Value::from(value),
    }
}

fn only_message(output: &InstanceOutput) -> &ConsensusMessage {
    assert_eq!(output.messages.len(), 1, "expected one message: {output:?}");
    &output.messages[0].message
}

// ============================================================================
// Normal Case
// ============================================================================

#[test]
fn leader_proposes_on_start() {
    let h = Harness::new(4);
    let (state, output) = h.state().start(&h.ctx(0), Value::from("tx1"));

    match only_message(&output) {
        ConsensusMessage::PrePrepare(pp) => {
            assert_eq!(pp.round, Round::FIRST);
            assert_eq!(pp.value, Value::from("tx1"));
            assert!(pp.justification.is_empty());
        }
        other => panic!("expected PRE_PREPARE, got {other:?}"),
    }
    assert_eq!(
        output.timer,
        Some(TimerCommand::Arm {
            round: Round::FIRST,
            after: Duration::from_millis(100),
        })
    );
    assert!(state.has_input());
}

#[test]
fn follower_start_only_arms_timer() {
    let h = Harness::new(4);
    let (state, output) = h.state().start(&h.ctx(1), Value::from("tx1"));

    assert!(output.messages.is_empty());
    assert!(matches!(output.timer, Some(TimerCommand::Arm { .. })));
    assert_eq!(state.phase(), Phase::Idle);
}

#[test]
fn first_input_sticks() {
    let h = Harness::new(4);
    let (state, _) = h.state().start(&h.ctx(1), Value::from("first"));
    let (state, _) = state.start(&h.ctx(1), Value::from("second"));
    assert_eq!(state.input(), Some(&Value::from("first")));
}

#[test]
fn four_replicas_decide_the_same_value() {
    let h = Harness::new(4);
    let mut states: Vec<InstanceState> = (0..4).map(|_| h.state()).collect();

    let mut initial = Vec::new();
    for (i, value) in ["tx1", "tx2", "tx3", "tx4"].into_iter().enumerate() {
        let (state, output) = states[i].clone().start(&h.ctx(i), Value::from(value));
        states[i] = state;
        initial.push((i, output));
    }

    let decisions = h.run(&mut states, initial, &[]);
    assert!(decisions.iter().all(|d| d.as_ref() == Some(&Value::from("tx1"))));
    assert!(states.iter().all(|s| s.phase() == Phase::Committed));
}

#[test]
fn decides_with_one_crashed_follower() {
    let h = Harness::new(4);
    let mut states: Vec<InstanceState> = (0..4).map(|_| h.state()).collect();
    let (state, output) = states[0].clone().start(&h.ctx(0), Value::from("tx1"));
    states[0] = state;

    let decisions = h.run(&mut states, vec![(0, output)], &[3]);
    for decision in &decisions[..3] {
        assert_eq!(decision.as_ref(), Some(&Value::from("tx1")));
    }
    assert!(decisions[3].is_none());
}

#[test]
fn accepting_a_proposal_sends_prepare() {
    let h = Harness::new(4);
    let (state, output) = h.state().on_message(&h.ctx(1), h.pre_prepare(0, 1, "tx1"));

    assert_eq!(only_message(&output), &ConsensusMessage::Prepare(vote(1, "tx1")));
    assert_eq!(state.phase(), Phase::PrePrepared);
    assert!(matches!(output.timer, Some(TimerCommand::Arm { .. })));
}

#[test]
fn rejects_proposal_from_non_leader() {
    let h = Harness::new(4);
    // R3 does not lead (instance 1, round 1).
    let (state, output) = h.state().on_message(&h.ctx(1), h.pre_prepare(2, 1, "tx1"));

    assert!(output.is_empty());
    assert_eq!(state.phase(), Phase::Idle);
}

#[test]
fn rejects_invalid_value() {
    let h = Harness::new(4);
    let reject_bad = |value: &Value| value.as_bytes() != b"bad";
    let (state, output) = h
        .state()
        .on_message(&h.ctx_with(1, &reject_bad), h.pre_prepare(0, 1, "bad"));

    assert!(output.is_empty());
    assert_eq!(state.phase(), Phase::Idle);
}

#[test]
fn second_proposal_in_a_round_is_ignored() {
    let h = Harness::new(4);
    let ctx = h.ctx(1);
    let (state, _) = h.state().on_message(&ctx, h.pre_prepare(0, 1, "tx1"));
    let (_, output) = state.on_message(&ctx, h.pre_prepare(0, 1, "other"));
    assert!(output.messages.is_empty());
}

#[test]
fn prepare_quorum_sends_commit_once() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let mut state = h.state();

    for i in 0..2 {
        let (next, output) = state.on_message(&ctx, h.prepare(i, 1, "tx1"));
        assert!(output.messages.is_empty());
        state = next;
    }

    let (state, output) = state.on_message(&ctx, h.prepare(2, 1, "tx1"));
    assert_eq!(only_message(&output), &ConsensusMessage::Commit(vote(1, "tx1")));
    assert_eq!(state.phase(), Phase::Prepared);
    let prepared = state.prepared().unwrap();
    assert_eq!(prepared.round, Round::FIRST);
    assert_eq!(prepared.prepares.len(), 3);

    let (_, output) = state.on_message(&ctx, h.prepare(3, 1, "tx1"));
    assert!(output.messages.is_empty());
}

#[test]
fn equivocating_prepares_do_not_count_twice() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let (state, _) = h.state().on_message(&ctx, h.prepare(0, 1, "tx1"));
    let (state, _) = state.on_message(&ctx, h.prepare(0, 1, "tx2"));
    let (state, _) = state.on_message(&ctx, h.prepare(1, 1, "tx2"));
    let (state, output) = state.on_message(&ctx, h.prepare(2, 1, "tx2"));

    // R1's second PREPARE was dropped, so tx2 has only two votes.
    assert!(output.messages.is_empty());
    assert!(state.prepared().is_none());
}

#[test]
fn commit_quorum_decides() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let (state, _) = h.state().on_message(&ctx, h.commit(0, 1, "tx1"));
    let (state, output) = state.on_message(&ctx, h.commit(1, 1, "tx1"));
    assert!(output.decided.is_none());

    let (state, output) = state.on_message(&ctx, h.commit(2, 1, "tx1"));
    let cert = output.decided.unwrap();
    assert_eq!(cert.value, Value::from("tx1"));
    assert_eq!(cert.commits.len(), 3);
    assert_eq!(output.timer, Some(TimerCommand::Cancel));
    assert_eq!(state.decided_value(), Some(&Value::from("tx1")));
}

#[test]
fn decided_instance_ignores_further_votes() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let mut state = h.state();
    for i in 0..3 {
        state = state.on_message(&ctx, h.commit(i, 1, "tx1")).0;
    }
    let (state, output) = state.on_message(&ctx, h.commit(3, 1, "tx1"));
    assert!(output.is_empty());
    assert!(state.is_decided());
}

#[test]
fn commit_quorum_from_a_left_round_still_decides() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let (state, _) = h.state().start(&ctx, Value::from("tx1"));
    let (state, _) = state.on_message(&ctx, h.commit(0, 1, "tx1"));

    // The round timer fires before the remaining COMMITs arrive.
    let (state, _) = state.on_timeout(&ctx, Round::FIRST);
    assert_eq!(state.round(), Round::new(2));

    let (state, output) = state.on_message(&ctx, h.commit(1, 1, "tx1"));
    assert!(output.decided.is_none());
    let (state, output) = state.on_message(&ctx, h.commit(2, 1, "tx1"));
    let cert = output.decided.unwrap();
    assert_eq!(cert.round, Round::FIRST);
    assert_eq!(cert.commits.len(), 3);
    assert_eq!(state.decided_value(), Some(&Value::from("tx1")));
}

// ============================================================================
// Round Change
// ============================================================================

#[test]
fn timeout_broadcasts_round_change_with_prepared_certificate() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let mut state = h.state().on_message(&ctx, h.pre_prepare(0, 1, "tx1")).0;
    for i in 0..3 {
        state = state.on_message(&ctx, h.prepare(i, 1, "tx1")).0;
    }
    assert_eq!(state.phase(), Phase::Prepared);

    let (state, output) = state.on_timeout(&ctx, Round::FIRST);
    match only_message(&output) {
        ConsensusMessage::RoundChange(rc) => {
            assert_eq!(rc.round, Round::new(2));
            let prepared = rc.prepared.as_ref().unwrap();
            assert_eq!(prepared.round, Round::FIRST);
            assert_eq!(prepared.value, Value::from("tx1"));
        }
        other => panic!("expected ROUND_CHANGE, got {other:?}"),
    }
    assert_eq!(state.round(), Round::new(2));
    assert_eq!(state.phase(), Phase::Idle);
    assert_eq!(
        output.timer,
        Some(TimerCommand::Arm {
            round: Round::new(2),
            after: Duration::from_millis(200),
        })
    );
}

#[test]
fn stale_timeout_is_ignored() {
    let h = Harness::new(4);
    let ctx = h.ctx(1);
    let (state, _) = h.state().start(&ctx, Value::from("tx"));
    let (state, _) = state.on_timeout(&ctx, Round::FIRST);
    let (state, output) = state.on_timeout(&ctx, Round::FIRST);
    assert!(output.is_empty());
    assert_eq!(state.round(), Round::new(2));
}

#[test]
fn timeout_without_a_running_timer_is_ignored() {
    let h = Harness::new(4);
    let (state, output) = h.state().on_timeout(&h.ctx(1), Round::FIRST);
    assert!(output.is_empty());
    assert_eq!(state.round(), Round::FIRST);
}

#[test]
fn new_leader_reproposes_highest_prepared_value() {
    let h = Harness::new(4);
    // R2 leads (instance 1, round 2).
    let ctx = h.ctx(1);
    let (state, _) = h.state().start(&ctx, Value::from("mine"));
    let (state, _) = state.on_timeout(&ctx, Round::FIRST);

    // Our own ROUND_CHANGE comes back through the engine loopback.
    let (state, _) = state.on_message(&ctx, h.round_change(1, 2, None));
    let (state, output) =
        state.on_message(&ctx, h.round_change(0, 2, Some(h.prepared_cert(1, "tx1"))));
    assert!(output.messages.is_empty());

    let (state, output) = state.on_message(&ctx, h.round_change(2, 2, None));
    match only_message(&output) {
        ConsensusMessage::PrePrepare(pp) => {
            assert_eq!(pp.round, Round::new(2));
            assert_eq!(pp.value, Value::from("tx1"));
            assert_eq!(pp.justification.len(), 3);
        }
        other => panic!("expected PRE_PREPARE, got {other:?}"),
    }
    assert_eq!(state.round(), Round::new(2));
}

#[test]
fn new_leader_proposes_own_input_without_prepared_certificates() {
    let h = Harness::new(4);
    let ctx = h.ctx(1);
    let (state, _) = h.state().start(&ctx, Value::from("mine"));
    let (state, _) = state.on_timeout(&ctx, Round::FIRST);
    let (state, _) = state.on_message(&ctx, h.round_change(1, 2, None));
    let (state, _) = state.on_message(&ctx, h.round_change(0, 2, None));
    let (_, output) = state.on_message(&ctx, h.round_change(3, 2, None));

    match only_message(&output) {
        ConsensusMessage::PrePrepare(pp) => assert_eq!(pp.value, Value::from("mine")),
        other => panic!("expected PRE_PREPARE, got {other:?}"),
    }
}

#[test]
fn weak_quorum_of_round_changes_pulls_replica_forward() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let (state, output) = h.state().on_message(&ctx, h.round_change(0, 3, None));
    assert!(output.is_empty());
    assert_eq!(state.round(), Round::FIRST);

    let (state, output) = state.on_message(&ctx, h.round_change(1, 4, None));
    match only_message(&output) {
        ConsensusMessage::RoundChange(rc) => assert_eq!(rc.round, Round::new(3)),
        other => panic!("expected ROUND_CHANGE, got {other:?}"),
    }
    assert_eq!(state.round(), Round::new(3));
}

#[test]
fn duplicate_round_change_does_not_count() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let (state, _) = h.state().on_message(&ctx, h.round_change(0, 3, None));
    let (state, output) = state.on_message(&ctx, h.round_change(0, 3, None));
    assert!(output.is_empty());
    assert_eq!(state.round(), Round::FIRST);
}

#[test]
fn justified_proposal_moves_replica_to_its_round() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let justification: Vec<SignedConsensus> = (0..3).map(|i| h.round_change(i, 2, None)).collect();
    let pp = h.sign(
        1,
        ConsensusMessage::PrePrepare(PrePrepare {
            instance: InstanceNumber::FIRST,
            round: Round::new(2),
            value: Value::from("tx9"),
            justification,
        }),
    );

    let (state, output) = h.state().on_message(&ctx, pp);
    assert_eq!(state.round(), Round::new(2));
    assert_eq!(only_message(&output), &ConsensusMessage::Prepare(vote(2, "tx9")));
}

#[test]
fn held_prepare_quorum_applies_on_round_entry() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let mut state = h.state().start(&ctx, Value::from("x")).0;
    for i in 0..3 {
        let (next, output) = state.on_message(&ctx, h.prepare(i, 2, "tx2"));
        assert!(output.messages.is_empty());
        state = next;
    }

    let (state, output) = state.on_timeout(&ctx, Round::FIRST);
    let kinds: Vec<_> = output.messages.iter().map(|m| m.message.kind()).collect();
    assert_eq!(kinds, [MessageKind::RoundChange, MessageKind::Commit]);
    assert_eq!(state.phase(), Phase::Prepared);
}

#[test]
fn round_change_stalls_recover_after_leader_crash() {
    let h = Harness::new(4);
    let mut states: Vec<InstanceState> = (0..4).map(|_| h.state()).collect();

    // R1 (round-1 leader) is down. Everyone else times out.
    let mut initial = Vec::new();
    for i in 1..4 {
        let (state, _) = states[i].clone().start(&h.ctx(i), Value::from("tx-late"));
        let (state, output) = state.on_timeout(&h.ctx(i), Round::FIRST);
        states[i] = state;
        initial.push((i, output));
    }

    let decisions = h.run(&mut states, initial, &[0]);
    for decision in &decisions[1..] {
        assert_eq!(decision.as_ref(), Some(&Value::from("tx-late")));
    }
}

// ============================================================================
// Catch-up
// ============================================================================

#[test]
fn decided_replica_answers_round_change_with_certificate() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let mut state = h.state();
    for i in 0..3 {
        state = state.on_message(&ctx, h.commit(i, 1, "tx1")).0;
    }

    let (_, output) = state.on_message(&ctx, h.round_change(2, 2, None));
    assert_eq!(output.messages.len(), 1);
    assert_eq!(output.messages[0].to, Some(NodeId::new("R3")));
    match &output.messages[0].message {
        ConsensusMessage::Decided(cert) => assert_eq!(cert.value, Value::from("tx1")),
        other => panic!("expected DECIDED, got {other:?}"),
    }
}

#[test]
fn decided_replica_does_not_answer_itself() {
    let h = Harness::new(4);
    let ctx = h.ctx(3);
    let mut state = h.state();
    for i in 0..3 {
        state = state.on_message(&ctx, h.commit(i, 1, "tx1")).0;
    }
    let (_, output) = state.on_message(&ctx, h.round_change(3, 2, None));
    assert!(output.is_empty());
}

#[test]
fn adopts_certificate_from_peer() {
    let h = Harness::new(4);
    let cert = CommitCertificate {
        instance: InstanceNumber::FIRST,
        round: Round::FIRST,
        value: Value::from("tx1"),
        commits: (0..3).map(|i| h.commit(i, 1, "tx1")).collect(),
    };
    let decided = h.sign(0, ConsensusMessage::Decided(cert));

    let (state, output) = h.state().on_message(&h.ctx(3), decided);
    assert!(output.decided.is_some());
    assert_eq!(state.decided_value(), Some(&Value::from("tx1")));
}

#[test]
fn messages_far_ahead_are_ignored() {
    let h = Harness::new(4);
    let far = h.settings.max_round_lookahead + 2;
    let (state, output) = h.state().on_message(&h.ctx(3), h.round_change(0, far, None));
    assert!(output.is_empty());
    assert_eq!(state.round(), Round::FIRST);
}
