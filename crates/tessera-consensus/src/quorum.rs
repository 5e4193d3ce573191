//! Quorum arithmetic and vote counting.
//!
//! For `n` replicas the protocol tolerates `f = ⌊(n-1)/3⌋` Byzantine ones
//! and needs `q = 2f+1` matching votes for a phase transition. Any two
//! quorums intersect in at least one correct replica.

use std::collections::BTreeMap;

use tessera_types::{Hash, NodeId, Round};

/// Fault-tolerance parameters for a replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    n: usize,
    f: usize,
}

impl Quorum {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            f: n.saturating_sub(1) / 3,
        }
    }

    /// Number of replicas.
    pub fn replicas(&self) -> usize {
        self.n
    }

    /// Tolerated Byzantine replicas.
    pub fn max_faulty(&self) -> usize {
        self.f
    }

    /// Votes needed for a phase transition (`2f+1`).
    pub fn size(&self) -> usize {
        2 * self.f + 1
    }

    /// Votes that include at least one correct replica (`f+1`).
    pub fn weak_size(&self) -> usize {
        self.f + 1
    }

    pub fn is_reached(&self, votes: usize) -> bool {
        votes >= self.size()
    }
}

/// Outcome of recording one vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tally<V> {
    /// Counted; this many matching votes so far.
    Pending(usize),
    /// This vote completed the quorum. Reported once per (round, digest).
    Reached(Vec<V>),
    /// Counted toward a quorum that was already reported.
    AlreadyReached,
    /// Voter already voted for the same value in this round.
    Duplicate,
    /// Voter already voted for a different value in this round. Ignored.
    Equivocation,
}

/// Counts votes per (round, value digest) with one vote per voter per round.
#[derive(Debug, Clone)]
pub struct QuorumTracker<V> {
    quorum: Quorum,
    ballots: BTreeMap<Round, BTreeMap<NodeId, (Hash, V)>>,
    reached: BTreeMap<(Round, Hash), Vec<V>>,
}

impl<V: Clone> QuorumTracker<V> {
    pub fn new(quorum: Quorum) -> Self {
        Self {
            quorum,
            ballots: BTreeMap::new(),
            reached: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, round: Round, digest: Hash, voter: NodeId, vote: V) -> Tally<V> {
        let ballots = self.ballots.entry(round).or_default();
        if let Some((existing, _)) = ballots.get(&voter) {
            return if *existing == digest {
                Tally::Duplicate
            } else {
                Tally::Equivocation
            };
        }
        ballots.insert(voter, (digest, vote));

        if self.reached.contains_key(&(round, digest)) {
            return Tally::AlreadyReached;
        }

        let matching: Vec<V> = ballots
            .values()
            .filter(|(d, _)| *d == digest)
            .map(|(_, v)| v.clone())
            .collect();
        if self.quorum.is_reached(matching.len()) {
            self.reached.insert((round, digest), matching.clone());
            Tally::Reached(matching)
        } else {
            Tally::Pending(matching.len())
        }
    }

    /// Matching votes for (round, digest).
    pub fn count(&self, round: Round, digest: Hash) -> usize {
        self.ballots
            .get(&round)
            .map_or(0, |b| b.values().filter(|(d, _)| *d == digest).count())
    }

    /// Forgets every round below `round`.
    pub fn retain_from(&mut self, round: Round) {
        self.ballots = self.ballots.split_off(&round);
        self.reached = self.reached.split_off(&(round, Hash::GENESIS));
    }

    pub fn clear(&mut self) {
        self.ballots.clear();
        self.reached.clear();
    }

    /// Quorums already reached in `round`.
    pub fn reached_in(&self, round: Round) -> impl Iterator<Item = (Hash, &[V])> {
        self.reached
            .range((round, Hash::GENESIS)..)
            .take_while(move |((r, _), _)| *r == round)
            .map(|((_, digest), votes)| (*digest, votes.as_slice()))
    }
}
