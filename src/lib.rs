//! Crash-tolerant leaderless binary consensus
//!
//! This library implements a synod-style binary consensus protocol among N
//! symmetric peer processes communicating only by asynchronous messages.
//! Every process proposes a value in {0, 1}; correct processes that decide,
//! decide the same proposed value.
//!
//! # Architecture
//!
//! - **Core**: a pure per-process state machine ([`ProcessCore`]) with no
//!   I/O, shared between the runtime and the model checker tests
//! - **Runtime**: one tokio task per process ([`Process`]), consuming typed
//!   inputs from an unbounded inbox, run-to-completion per message
//! - **Bootstrap**: [`Cluster`] wires a fully connected set, installs
//!   membership and drives launch/crash/hold
//!
//! Ballots are partitioned by process id (`ballot ≡ id mod N`), so no two
//! processes ever share one. The protocol is obstruction-free: competing
//! proposers abort each other and retry with higher ballots, and may in
//! principle never terminate under adversarial scheduling.
//!
//! # Quick Start
//!
//! ```ignore
//! use synod::{Cluster, SimulationConfig};
//!
//! let cluster = Cluster::spawn(3, &SimulationConfig::with_seed(7));
//! cluster.launch_all();
//! let decisions = cluster.all_decided().await;
//! ```

#![warn(clippy::pedantic)]

pub mod cluster;
pub mod config;
pub mod core;
mod messages;
pub mod process;

pub use cluster::Cluster;
pub use config::{CrashCoin, DEFAULT_CRASH_PROBABILITY, NeverCrash, RandomCoin, SimulationConfig};
pub use self::core::{Decision, Outbound, ProcessCore};
pub use messages::{Ballot, Message, ProcessId, Value};
pub use process::{Input, Process, ProcessHandle};
