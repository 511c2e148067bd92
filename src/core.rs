//! Pure state machine core for the synod protocol - no I/O, no async
//!
//! This module contains the per-process state transition logic that is shared
//! between:
//! - The tokio runtime implementation (`process.rs`)
//! - The Stateright model checker tests
//!
//! Every handler is a pure transition: it mutates the local state and returns
//! the batch of outbound messages as data. Delivering those messages -
//! including self-delivery during a broadcast - is the caller's job, which
//! keeps run-to-completion semantics intact.

use std::collections::BTreeSet;

use tracing::error;

use crate::config::CrashCoin;
use crate::messages::{Ballot, Message, ProcessId, Value};

/// Outbound batch produced by a state transition: `(recipient, message)`.
pub type Outbound = Vec<(ProcessId, Message)>;

// =============================================================================
// DECISION
// =============================================================================

/// Outcome of a process's consensus participation.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Decision {
    /// No proposal attempt has concluded yet.
    #[default]
    Undecided,
    /// The latest attempt was rejected by a higher ballot; a retry may be
    /// in flight unless the process is held.
    Aborted,
    /// A value reached quorum and was decided.
    Decided(Value),
}

impl Decision {
    /// Whether a value has been decided.
    #[must_use]
    pub fn is_decided(&self) -> bool {
        matches!(self, Self::Decided(_))
    }

    /// The decided value, if any.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        match self {
            Self::Decided(value) => Some(*value),
            Self::Undecided | Self::Aborted => None,
        }
    }
}

// =============================================================================
// PROCESS CORE
// =============================================================================

/// Pure per-process state - no I/O, no async, no clock, no RNG ownership.
///
/// A process is symmetric: it acts as proposer for its own value and as
/// acceptor for everyone's ballots. The two quorum latches (`impose_sent`,
/// `decide_sent`) stay set until the next [`propose`](Self::propose) advances
/// the ballot, so duplicate or late replies within a round cannot re-fire a
/// broadcast.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ProcessCore {
    id: ProcessId,
    n: usize,
    /// Current proposer ballot; always ≡ `id` (mod `n`) once launched.
    ballot: Ballot,
    /// The value this process is currently trying to impose.
    proposal: Value,
    /// Largest ballot answered with a GATHER.
    read_ballot: Ballot,
    /// Largest ballot accepted with an ACK.
    impose_ballot: Ballot,
    /// Value accepted with `impose_ballot`.
    estimate: Value,
    /// Gather replies for the current ballot, indexed by sender id.
    states: Vec<Option<(Value, Ballot)>>,
    received_states: usize,
    impose_sent: bool,
    /// Senders that acknowledged the current ballot.
    acks: BTreeSet<ProcessId>,
    decide_sent: bool,
    decision: Decision,
    launched: bool,
    should_crash: bool,
    crashed: bool,
    hold: bool,
}

impl ProcessCore {
    /// Create a process knowing only its own id. The process is inert until
    /// [`membership`](Self::membership) sizes the peer set.
    #[must_use]
    pub fn new(id: ProcessId) -> Self {
        Self {
            id,
            n: 0,
            ballot: 0,
            proposal: 0,
            read_ballot: 0,
            impose_ballot: 0,
            estimate: 0,
            states: Vec::new(),
            received_states: 0,
            impose_sent: false,
            acks: BTreeSet::new(),
            decide_sent: false,
            decision: Decision::Undecided,
            launched: false,
            should_crash: false,
            crashed: false,
            hold: false,
        }
    }

    /// Install the membership size and reset every protocol field to its
    /// starting value.
    pub fn membership(&mut self, n: usize) {
        self.n = n;
        self.ballot = self.id_ballot() - self.stride();
        self.proposal = 0;
        self.read_ballot = 0;
        self.impose_ballot = self.id_ballot() - self.stride();
        self.estimate = 0;
        self.states = vec![None; n];
        self.received_states = 0;
        self.impose_sent = false;
        self.acks.clear();
        self.decide_sent = false;
        self.decision = Decision::Undecided;
        self.crashed = false;
        self.hold = false;
    }

    /// Begin proposing `initial`. Only the first launch has any effect.
    pub fn launch(&mut self, initial: Value, coin: &mut impl CrashCoin) -> Outbound {
        if self.launched {
            return Vec::new();
        }
        self.launched = true;
        self.propose(initial, coin)
    }

    /// Arm the probabilistic crash. The process does not crash immediately;
    /// it draws the coin at each subsequent handler entry.
    pub fn arm_crash(&mut self) {
        self.should_crash = true;
    }

    /// Inhibit re-proposal after an abort. The process still answers ballots
    /// and still adopts a late DECIDE.
    pub fn hold(&mut self) {
        self.hold = true;
    }

    /// Handle one protocol message from `from`, to completion.
    ///
    /// Applies the common guard first: a crashed process drops everything;
    /// a decided process drops READ/GATHER/IMPOSE/ACK; an armed process may
    /// crash on the coin draw before handling anything.
    pub fn receive(
        &mut self,
        from: ProcessId,
        message: Message,
        coin: &mut impl CrashCoin,
    ) -> Outbound {
        if self.crashed {
            return Vec::new();
        }
        if self.decision.is_decided()
            && matches!(
                message,
                Message::Read { .. }
                    | Message::Gather { .. }
                    | Message::Impose { .. }
                    | Message::Ack { .. }
            )
        {
            return Vec::new();
        }
        if self.should_crash && coin.fires() {
            self.crashed = true;
            return Vec::new();
        }

        match message {
            Message::Read { ballot } => self.on_read(from, ballot),
            Message::Abort { ballot } => self.on_abort(ballot, coin),
            Message::Gather {
                ballot,
                impose_ballot,
                estimate,
            } => self.on_gather(from, ballot, impose_ballot, estimate),
            Message::Impose { ballot, proposal } => self.on_impose(from, ballot, proposal),
            Message::Ack { ballot } => self.on_ack(from, ballot),
            Message::Decide { proposal } => self.on_decide(proposal),
        }
    }

    /// Start a proposal attempt: advance the ballot by `n` (keeping it in
    /// this process's residue class), clear the round state, broadcast READ.
    fn propose(&mut self, value: Value, coin: &mut impl CrashCoin) -> Outbound {
        if self.crashed {
            return Vec::new();
        }
        if self.should_crash && coin.fires() {
            self.crashed = true;
            return Vec::new();
        }
        self.proposal = value;
        self.ballot += self.stride();
        for slot in &mut self.states {
            *slot = None;
        }
        self.received_states = 0;
        self.impose_sent = false;
        self.acks.clear();
        self.decide_sent = false;
        self.decision = Decision::Undecided;
        self.broadcast(Message::Read {
            ballot: self.ballot,
        })
    }

    fn on_read(&mut self, from: ProcessId, ballot: Ballot) -> Outbound {
        if self.read_ballot > ballot || self.impose_ballot > ballot {
            return vec![(from, Message::Abort { ballot })];
        }
        self.read_ballot = ballot;
        vec![(
            from,
            Message::Gather {
                ballot,
                impose_ballot: self.impose_ballot,
                estimate: self.estimate,
            },
        )]
    }

    fn on_abort(&mut self, _ballot: Ballot, coin: &mut impl CrashCoin) -> Outbound {
        // A late abort must not clobber a decision.
        if self.decision.is_decided() {
            return Vec::new();
        }
        self.decision = Decision::Aborted;
        if self.hold {
            Vec::new()
        } else {
            let value = self.proposal;
            self.propose(value, coin)
        }
    }

    fn on_gather(
        &mut self,
        from: ProcessId,
        ballot: Ballot,
        impose_ballot: Ballot,
        estimate: Value,
    ) -> Outbound {
        // Replies for any other ballot are stale; the latch holds until the
        // next propose() advances the ballot.
        if ballot != self.ballot || self.impose_sent {
            return Vec::new();
        }
        let Some(slot) = self.states.get_mut(from) else {
            return Vec::new();
        };
        if slot.is_none() {
            self.received_states += 1;
        }
        *slot = Some((estimate, impose_ballot));

        if self.received_states <= self.n / 2 {
            return Vec::new();
        }
        self.impose_sent = true;

        // Adopt the value accepted under the highest positive ballot, if any
        // acceptor has accepted at all; otherwise keep our own proposal.
        if let Some((value, _)) = self
            .states
            .iter()
            .flatten()
            .copied()
            .filter(|&(_, accepted)| accepted > 0)
            .max_by_key(|&(_, accepted)| accepted)
        {
            self.proposal = value;
        }
        self.broadcast(Message::Impose {
            ballot: self.ballot,
            proposal: self.proposal,
        })
    }

    fn on_impose(&mut self, from: ProcessId, ballot: Ballot, proposal: Value) -> Outbound {
        if self.read_ballot > ballot || self.impose_ballot > ballot {
            return vec![(from, Message::Abort { ballot })];
        }
        self.estimate = proposal;
        self.impose_ballot = ballot;
        vec![(from, Message::Ack { ballot })]
    }

    fn on_ack(&mut self, from: ProcessId, ballot: Ballot) -> Outbound {
        if ballot != self.ballot || self.decide_sent {
            return Vec::new();
        }
        self.acks.insert(from);
        if self.acks.len() <= self.n / 2 {
            return Vec::new();
        }
        self.decide_sent = true;
        self.broadcast(Message::Decide {
            proposal: self.proposal,
        })
    }

    fn on_decide(&mut self, proposal: Value) -> Outbound {
        if let Decision::Decided(previous) = self.decision
            && previous != proposal
        {
            // Cannot happen unless the protocol itself is broken; keep
            // last-writer-wins but make the divergence loud.
            error!(previous, proposal, "conflicting decide for a settled value");
        }
        self.decision = Decision::Decided(proposal);
        Vec::new()
    }

    fn broadcast(&self, message: Message) -> Outbound {
        (0..self.n).map(|to| (to, message)).collect()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// This process's id.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// The membership size, 0 before the membership message arrives.
    #[must_use]
    pub fn n(&self) -> usize {
        self.n
    }

    /// Current proposer ballot.
    #[must_use]
    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    /// Largest ballot answered with a GATHER.
    #[must_use]
    pub fn read_ballot(&self) -> Ballot {
        self.read_ballot
    }

    /// Largest ballot accepted with an ACK.
    #[must_use]
    pub fn impose_ballot(&self) -> Ballot {
        self.impose_ballot
    }

    /// Value accepted with the impose ballot.
    #[must_use]
    pub fn estimate(&self) -> Value {
        self.estimate
    }

    /// Current decision state.
    #[must_use]
    pub fn decision(&self) -> Decision {
        self.decision
    }

    /// Whether the simulated crash has fired. Absorbing.
    #[must_use]
    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// Whether this process has begun proposing.
    #[must_use]
    pub fn is_launched(&self) -> bool {
        self.launched
    }

    /// Whether abort-retry is inhibited.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.hold
    }

    #[expect(
        clippy::cast_possible_wrap,
        reason = "memberships are far below i64::MAX"
    )]
    fn stride(&self) -> Ballot {
        self.n as Ballot
    }

    #[expect(
        clippy::cast_possible_wrap,
        reason = "process ids are far below i64::MAX"
    )]
    fn id_ballot(&self) -> Ballot {
        self.id as Ballot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NeverCrash;

    struct AlwaysCrash;

    impl CrashCoin for AlwaysCrash {
        fn fires(&mut self) -> bool {
            true
        }
    }

    fn launched(id: ProcessId, n: usize, initial: Value) -> (ProcessCore, Outbound) {
        let mut core = ProcessCore::new(id);
        core.membership(n);
        let out = core.launch(initial, &mut NeverCrash);
        (core, out)
    }

    fn count<F: Fn(&Message) -> bool>(out: &Outbound, pred: F) -> usize {
        out.iter().filter(|(_, m)| pred(m)).count()
    }

    #[test]
    fn launch_broadcasts_read_to_everyone() {
        let (core, out) = launched(1, 3, 1);
        assert_eq!(core.ballot(), 1);
        assert_eq!(
            out,
            vec![
                (0, Message::Read { ballot: 1 }),
                (1, Message::Read { ballot: 1 }),
                (2, Message::Read { ballot: 1 }),
            ]
        );
    }

    #[test]
    fn second_launch_is_ignored() {
        let (mut core, _) = launched(1, 3, 1);
        assert!(core.launch(0, &mut NeverCrash).is_empty());
        assert_eq!(core.ballot(), 1);
    }

    #[test]
    fn ballots_stay_in_residue_class() {
        let (mut core, _) = launched(2, 5, 0);
        let mut ballots = vec![core.ballot()];
        for _ in 0..3 {
            let ballot = core.ballot();
            core.receive(0, Message::Abort { ballot }, &mut NeverCrash);
            ballots.push(core.ballot());
        }
        assert_eq!(ballots, vec![2, 7, 12, 17]);
    }

    #[test]
    fn fresh_read_is_answered_with_gather() {
        let mut core = ProcessCore::new(0);
        core.membership(3);
        let out = core.receive(1, Message::Read { ballot: 1 }, &mut NeverCrash);
        assert_eq!(
            out,
            vec![(
                1,
                Message::Gather {
                    ballot: 1,
                    impose_ballot: -3,
                    estimate: 0,
                }
            )]
        );
        assert_eq!(core.read_ballot(), 1);
    }

    #[test]
    fn stale_read_is_aborted() {
        let mut core = ProcessCore::new(0);
        core.membership(3);
        core.receive(1, Message::Read { ballot: 4 }, &mut NeverCrash);
        let out = core.receive(2, Message::Read { ballot: 1 }, &mut NeverCrash);
        assert_eq!(out, vec![(2, Message::Abort { ballot: 1 })]);
        assert_eq!(core.read_ballot(), 4);
    }

    #[test]
    fn impose_is_acknowledged_and_recorded() {
        let mut core = ProcessCore::new(0);
        core.membership(3);
        let out = core.receive(
            1,
            Message::Impose {
                ballot: 1,
                proposal: 1,
            },
            &mut NeverCrash,
        );
        assert_eq!(out, vec![(1, Message::Ack { ballot: 1 })]);
        assert_eq!(core.impose_ballot(), 1);
        assert_eq!(core.estimate(), 1);
    }

    #[test]
    fn stale_impose_is_aborted() {
        let mut core = ProcessCore::new(0);
        core.membership(3);
        core.receive(2, Message::Read { ballot: 5 }, &mut NeverCrash);
        let out = core.receive(
            1,
            Message::Impose {
                ballot: 1,
                proposal: 1,
            },
            &mut NeverCrash,
        );
        assert_eq!(out, vec![(1, Message::Abort { ballot: 1 })]);
        assert_eq!(core.estimate(), 0);
    }

    #[test]
    fn gather_quorum_broadcasts_impose_exactly_once() {
        let (mut core, _) = launched(0, 5, 1);
        let ballot = core.ballot();
        let mut imposes = 0;
        for sender in 0..5 {
            let out = core.receive(
                sender,
                Message::Gather {
                    ballot,
                    impose_ballot: -5,
                    estimate: 0,
                },
                &mut NeverCrash,
            );
            imposes += count(&out, |m| matches!(m, Message::Impose { .. }));
        }
        assert_eq!(imposes, 5, "one impose per peer, broadcast once");
    }

    #[test]
    fn gather_adopts_highest_positive_estimate() {
        let (mut core, _) = launched(0, 3, 0);
        let ballot = core.ballot();
        core.receive(
            0,
            Message::Gather {
                ballot,
                impose_ballot: -3,
                estimate: 0,
            },
            &mut NeverCrash,
        );
        let out = core.receive(
            1,
            Message::Gather {
                ballot,
                impose_ballot: 7,
                estimate: 1,
            },
            &mut NeverCrash,
        );
        assert_eq!(count(&out, |m| matches!(m, Message::Impose { .. })), 3);
        assert!(out.iter().all(|(_, m)| *m
            == Message::Impose {
                ballot,
                proposal: 1,
            }));
    }

    #[test]
    fn gather_for_another_ballot_is_ignored() {
        let (mut core, _) = launched(0, 3, 1);
        let stale = core.ballot() - 3;
        for sender in 0..3 {
            let out = core.receive(
                sender,
                Message::Gather {
                    ballot: stale,
                    impose_ballot: -3,
                    estimate: 0,
                },
                &mut NeverCrash,
            );
            assert!(out.is_empty());
        }
    }

    #[test]
    fn duplicate_gather_from_one_sender_counts_once() {
        let (mut core, _) = launched(0, 3, 1);
        let ballot = core.ballot();
        for _ in 0..2 {
            let out = core.receive(
                1,
                Message::Gather {
                    ballot,
                    impose_ballot: -3,
                    estimate: 0,
                },
                &mut NeverCrash,
            );
            assert!(out.is_empty(), "a single sender is not a quorum");
        }
        let out = core.receive(
            2,
            Message::Gather {
                ballot,
                impose_ballot: -3,
                estimate: 0,
            },
            &mut NeverCrash,
        );
        assert_eq!(count(&out, |m| matches!(m, Message::Impose { .. })), 3);
    }

    #[test]
    fn ack_quorum_broadcasts_decide_exactly_once() {
        let (mut core, _) = launched(0, 5, 1);
        let ballot = core.ballot();
        let mut decides = 0;
        for sender in 0..5 {
            let out = core.receive(sender, Message::Ack { ballot }, &mut NeverCrash);
            decides += count(&out, |m| matches!(m, Message::Decide { .. }));
        }
        assert_eq!(decides, 5, "one decide per peer, broadcast once");
    }

    #[test]
    fn duplicate_ack_from_one_sender_counts_once() {
        let (mut core, _) = launched(0, 3, 1);
        let ballot = core.ballot();
        for _ in 0..3 {
            let out = core.receive(1, Message::Ack { ballot }, &mut NeverCrash);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn stale_ack_is_ignored() {
        let (mut core, _) = launched(0, 3, 1);
        let stale = core.ballot() - 3;
        for sender in 0..3 {
            let out = core.receive(sender, Message::Ack { ballot: stale }, &mut NeverCrash);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn abort_triggers_retry_with_higher_ballot() {
        let (mut core, _) = launched(0, 3, 1);
        let first = core.ballot();
        let out = core.receive(1, Message::Abort { ballot: first }, &mut NeverCrash);
        assert_eq!(core.ballot(), first + 3);
        assert_eq!(
            count(&out, |m| matches!(m, Message::Read { .. })),
            3,
            "retry re-reads everyone"
        );
        assert_eq!(core.decision(), Decision::Undecided);
    }

    #[test]
    fn late_decide_lands_after_abort() {
        let (mut core, _) = launched(0, 3, 1);
        let ballot = core.ballot();
        core.hold();
        core.receive(1, Message::Abort { ballot }, &mut NeverCrash);
        assert_eq!(core.decision(), Decision::Aborted);
        core.receive(2, Message::Decide { proposal: 0 }, &mut NeverCrash);
        assert_eq!(core.decision(), Decision::Decided(0));
    }

    #[test]
    fn hold_suppresses_retry() {
        let (mut core, _) = launched(0, 3, 1);
        let ballot = core.ballot();
        core.hold();
        let out = core.receive(1, Message::Abort { ballot }, &mut NeverCrash);
        assert!(out.is_empty(), "no second read while held");
        assert_eq!(core.ballot(), ballot);
        assert_eq!(core.decision(), Decision::Aborted);
    }

    #[test]
    fn decided_process_drops_protocol_traffic() {
        let mut core = ProcessCore::new(0);
        core.membership(3);
        core.receive(1, Message::Decide { proposal: 1 }, &mut NeverCrash);
        let out = core.receive(2, Message::Read { ballot: 2 }, &mut NeverCrash);
        assert!(out.is_empty());
        assert_eq!(core.decision(), Decision::Decided(1));
    }

    #[test]
    fn abort_cannot_clobber_a_decision() {
        let (mut core, _) = launched(0, 3, 1);
        core.receive(1, Message::Decide { proposal: 1 }, &mut NeverCrash);
        core.receive(2, Message::Abort { ballot: 0 }, &mut NeverCrash);
        assert_eq!(core.decision(), Decision::Decided(1));
    }

    #[test]
    fn conflicting_decide_is_last_writer_wins() {
        let mut core = ProcessCore::new(0);
        core.membership(3);
        core.receive(1, Message::Decide { proposal: 0 }, &mut NeverCrash);
        core.receive(2, Message::Decide { proposal: 1 }, &mut NeverCrash);
        assert_eq!(core.decision(), Decision::Decided(1));
    }

    #[test]
    fn armed_crash_fires_before_first_read() {
        let mut core = ProcessCore::new(2);
        core.membership(5);
        core.arm_crash();
        let out = core.launch(0, &mut AlwaysCrash);
        assert!(out.is_empty(), "no outbound once crashed");
        assert!(core.is_crashed());
    }

    #[test]
    fn crash_is_absorbing() {
        let mut core = ProcessCore::new(0);
        core.membership(3);
        core.arm_crash();
        core.launch(1, &mut AlwaysCrash);
        assert!(core.is_crashed());
        for sender in 0..3 {
            let out = core.receive(sender, Message::Read { ballot: 1 }, &mut NeverCrash);
            assert!(out.is_empty());
        }
        let out = core.receive(1, Message::Decide { proposal: 1 }, &mut NeverCrash);
        assert!(out.is_empty());
        assert_eq!(core.decision(), Decision::Undecided);
    }

    #[test]
    fn armed_process_survives_a_cold_coin() {
        let mut core = ProcessCore::new(0);
        core.membership(3);
        core.arm_crash();
        let out = core.launch(1, &mut NeverCrash);
        assert!(!core.is_crashed());
        assert_eq!(count(&out, |m| matches!(m, Message::Read { .. })), 3);
    }

    #[test]
    fn membership_resets_protocol_state() {
        let (mut core, _) = launched(1, 3, 1);
        core.receive(0, Message::Decide { proposal: 1 }, &mut NeverCrash);
        core.membership(3);
        assert_eq!(core.ballot(), -2);
        assert_eq!(core.impose_ballot(), -2);
        assert_eq!(core.read_ballot(), 0);
        assert_eq!(core.estimate(), 0);
        assert_eq!(core.decision(), Decision::Undecided);
        assert!(!core.is_crashed());
    }
}
