//! Tokio actor runtime for a single process
//!
//! Each process runs as one spawned task owning its [`ProcessCore`]. Inputs
//! arrive on an unbounded mpsc inbox and are handled strictly one at a time,
//! to completion; outbound messages - self-sends included - are enqueued to
//! peer inboxes only after the handler returns, so a broadcast is never
//! observed mid-handler. The decision state is published on a watch channel.

use std::time::Instant;

use rand::Rng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::CrashCoin;
use crate::core::{Decision, Outbound, ProcessCore};
use crate::messages::{Message, ProcessId, Value};

/// Inputs a process consumes: bootstrap commands and protocol envelopes.
#[derive(Clone, Debug)]
pub enum Input {
    /// One-shot peer table, ordered by process id. Resets protocol state.
    Membership(Vec<ProcessHandle>),
    /// Begin proposing. `None` draws the initial value uniformly from {0, 1};
    /// `Some` injects it, which deterministic tests rely on.
    Launch(Option<Value>),
    /// Arm the probabilistic crash.
    Crash,
    /// Inhibit re-proposal after aborts.
    Hold,
    /// A protocol message delivered by the transport.
    Protocol {
        /// Sender id, taken from the transport envelope.
        from: ProcessId,
        /// The protocol message itself.
        message: Message,
    },
}

/// Cheap cloneable handle to a running process: its inbox plus a watch on
/// its decision state.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    id: ProcessId,
    inbox: mpsc::UnboundedSender<Input>,
    decision: watch::Receiver<Decision>,
}

impl ProcessHandle {
    /// The process id this handle addresses.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Deliver the one-shot membership table.
    pub fn membership(&self, peers: Vec<ProcessHandle>) {
        self.send(Input::Membership(peers));
    }

    /// Launch with a randomly drawn initial proposal.
    pub fn launch(&self) {
        self.send(Input::Launch(None));
    }

    /// Launch with an injected initial proposal.
    pub fn launch_with(&self, value: Value) {
        self.send(Input::Launch(Some(value)));
    }

    /// Arm the probabilistic crash.
    pub fn crash(&self) {
        self.send(Input::Crash);
    }

    /// Inhibit re-proposal after aborts.
    pub fn hold(&self) {
        self.send(Input::Hold);
    }

    /// Deliver one protocol message from `from`.
    pub fn deliver(&self, from: ProcessId, message: Message) {
        self.send(Input::Protocol { from, message });
    }

    /// Current decision state.
    #[must_use]
    pub fn decision(&self) -> Decision {
        *self.decision.borrow()
    }

    /// Wait until this process has decided. Returns `None` if the process
    /// task went away first; a crashed process never resolves.
    pub async fn decided(&mut self) -> Option<Value> {
        let decision = *self.decision.wait_for(Decision::is_decided).await.ok()?;
        decision.value()
    }

    fn send(&self, input: Input) {
        if self.inbox.send(input).is_err() {
            warn!(id = self.id, "dropping input: process departed");
        }
    }
}

/// A single consensus process: the pure core plus its runtime collaborators.
pub struct Process<C> {
    core: ProcessCore,
    coin: C,
    rng: StdRng,
    peers: Vec<ProcessHandle>,
    inbox: mpsc::UnboundedReceiver<Input>,
    decision_tx: watch::Sender<Decision>,
    started_at: Option<Instant>,
}

impl<C: CrashCoin> Process<C> {
    /// Create a process and the handle addressing it. The process does
    /// nothing until [`run`](Self::run) is awaited.
    #[must_use]
    pub fn new(id: ProcessId, coin: C, rng: StdRng) -> (Self, ProcessHandle) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (decision_tx, decision_rx) = watch::channel(Decision::Undecided);
        let process = Self {
            core: ProcessCore::new(id),
            coin,
            rng,
            peers: Vec::new(),
            inbox: inbox_rx,
            decision_tx,
            started_at: None,
        };
        let handle = ProcessHandle {
            id,
            inbox: inbox_tx,
            decision: decision_rx,
        };
        (process, handle)
    }

    /// Consume inputs until every handle is dropped. A crashed process keeps
    /// draining its inbox; the core drops everything it receives.
    #[instrument(skip_all, name = "process", fields(id = self.core.id()))]
    pub async fn run(mut self) {
        trace!("process started");
        while let Some(input) = self.inbox.recv().await {
            self.step(input);
        }
        trace!("process stopping: all handles dropped");
    }

    fn step(&mut self, input: Input) {
        let outbound = self.dispatch(input);

        let decided_value = outbound.iter().find_map(|(_, m)| match m {
            Message::Decide { proposal } => Some(*proposal),
            _ => None,
        });
        if let Some(value) = decided_value
            && let Some(started_at) = self.started_at
        {
            info!(value, elapsed = ?started_at.elapsed(), "reached decision quorum");
        }

        for (to, message) in outbound {
            match self.peers.get(to) {
                Some(peer) => peer.deliver(self.core.id(), message),
                None => warn!(to, "dropping message to unknown peer"),
            }
        }

        let decision = self.core.decision();
        self.decision_tx.send_if_modified(|current| {
            if *current == decision {
                false
            } else {
                *current = decision;
                true
            }
        });
    }

    fn dispatch(&mut self, input: Input) -> Outbound {
        match input {
            Input::Membership(peers) => {
                debug!(n = peers.len(), "membership installed");
                self.core.membership(peers.len());
                self.peers = peers;
                Vec::new()
            }
            Input::Launch(value) => {
                if !self.core.is_launched() {
                    self.started_at = Some(Instant::now());
                }
                let initial = value.unwrap_or_else(|| self.rng.random_range(0..=1));
                debug!(initial, "launching");
                self.core.launch(initial, &mut self.coin)
            }
            Input::Crash => {
                debug!("crash armed");
                self.core.arm_crash();
                Vec::new()
            }
            Input::Hold => {
                debug!("hold set");
                self.core.hold();
                Vec::new()
            }
            Input::Protocol { from, message } => {
                trace!(from, ?message, "received");
                self.core.receive(from, message, &mut self.coin)
            }
        }
    }
}
