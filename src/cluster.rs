//! Bootstrap orchestration for a fully connected process set
//!
//! The cluster plays the bootstrapper role: it spawns N wired processes,
//! delivers each its one-shot membership table, and exposes the launch,
//! crash and hold commands plus decision observation.

use futures::future::join_all;
use tokio_util::task::JoinMap;
use tracing::debug;

use crate::config::SimulationConfig;
use crate::core::Decision;
use crate::messages::{ProcessId, Value};
use crate::process::{Process, ProcessHandle};

/// A running set of processes. Dropping the cluster aborts the process tasks.
pub struct Cluster {
    handles: Vec<ProcessHandle>,
    tasks: JoinMap<ProcessId, ()>,
}

impl Cluster {
    /// Spawn `n` fully connected processes and install membership on each.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(n: usize, config: &SimulationConfig) -> Self {
        let mut processes = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for id in 0..n {
            let (process, handle) = Process::new(id, config.coin_for(id), config.proposal_rng(id));
            processes.push(process);
            handles.push(handle);
        }
        for handle in &handles {
            handle.membership(handles.clone());
        }
        let mut tasks = JoinMap::new();
        for (id, process) in processes.into_iter().enumerate() {
            tasks.spawn(id, process.run());
        }
        debug!(n, "cluster spawned");
        Self { handles, tasks }
    }

    /// Handle to one process.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the membership.
    #[must_use]
    pub fn handle(&self, id: ProcessId) -> &ProcessHandle {
        &self.handles[id]
    }

    /// Handles to every process, ordered by id.
    #[must_use]
    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    /// Snapshot of every process's current decision state, ordered by id.
    /// Non-blocking; see [`all_decided`](Self::all_decided) to wait instead.
    #[must_use]
    pub fn decisions(&self) -> Vec<Decision> {
        self.handles.iter().map(ProcessHandle::decision).collect()
    }

    /// Launch every process with a randomly drawn initial proposal.
    pub fn launch_all(&self) {
        for handle in &self.handles {
            handle.launch();
        }
    }

    /// Launch every process with an injected initial proposal.
    ///
    /// # Panics
    ///
    /// Panics if `values` does not provide one value per process.
    pub fn launch_all_with(&self, values: &[Value]) {
        assert_eq!(values.len(), self.handles.len());
        for (handle, &value) in self.handles.iter().zip(values) {
            handle.launch_with(value);
        }
    }

    /// Arm the probabilistic crash on one process.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the membership.
    pub fn crash(&self, id: ProcessId) {
        self.handles[id].crash();
    }

    /// Inhibit abort-retry on one process.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the membership.
    pub fn hold(&self, id: ProcessId) {
        self.handles[id].hold();
    }

    /// Wait for one process to decide.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the membership.
    pub async fn decided(&self, id: ProcessId) -> Option<Value> {
        self.handles[id].clone().decided().await
    }

    /// Wait for every process to decide, in id order. Never resolves if any
    /// process crashed before deciding; pair with a timeout or await
    /// [`decided`](Self::decided) per live process instead.
    pub async fn all_decided(&self) -> Vec<Option<Value>> {
        join_all(
            self.handles
                .iter()
                .cloned()
                .map(|mut handle| async move { handle.decided().await }),
        )
        .await
    }

    /// Abort every process task and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}
