//! Protocol messages exchanged between peer processes

/// Identifies a process within the fixed membership, in `[0, N)`.
pub type ProcessId = usize;

/// Ballot number tagging a proposal attempt.
///
/// Ballots are partitioned by process id: every ballot used by process `i`
/// satisfies `ballot ≡ i (mod N)`, so two distinct processes never use the
/// same ballot. Pre-launch ballots are negative (`i − N`).
pub type Ballot = i64;

/// A binary consensus value, `0` or `1`.
pub type Value = u8;

/// Messages of the two-phase synod protocol.
///
/// The sender identity travels in the transport envelope, not in the message;
/// handlers receive the sender id alongside the message.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Message {
    /// Phase 1: proposer solicits each acceptor's last accepted state.
    Read {
        /// The proposer's current ballot.
        ballot: Ballot,
    },
    /// Acceptor rejection of a stale ballot; triggers proposer retry.
    Abort {
        /// The rejected ballot.
        ballot: Ballot,
    },
    /// Phase 1 reply: the acceptor's last accepted (value, ballot) pair.
    Gather {
        /// The ballot being answered.
        ballot: Ballot,
        /// Largest ballot for which this acceptor has sent an ACK.
        impose_ballot: Ballot,
        /// Value accepted with `impose_ballot`.
        estimate: Value,
    },
    /// Phase 2: proposer asks acceptors to accept `proposal` under `ballot`.
    Impose {
        /// The proposer's current ballot.
        ballot: Ballot,
        /// The value being imposed.
        proposal: Value,
    },
    /// Phase 2 reply: the acceptor accepted the imposed value.
    Ack {
        /// The ballot being acknowledged.
        ballot: Ballot,
    },
    /// The proposer reached an ACK quorum; everyone may decide `proposal`.
    Decide {
        /// The decided value.
        proposal: Value,
    },
}
