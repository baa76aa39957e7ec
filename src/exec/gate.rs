// src/exec/gate.rs

//! Per-task pause gates.
//!
//! A gate is a binary open/closed primitive registered at spawn and removed
//! when the execution ends. Log readers and the memory sampler await the
//! gate each iteration, so draining work stops while a task is paused; the
//! child itself is additionally suspended with SIGSTOP because the OS may
//! still hold buffered output.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::types::TaskId;

/// One task's gate. Open (`true`) by default.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl PauseGate {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }

    fn set(&self, open: bool) {
        // Send only fails when every waiter is gone, which is fine.
        let _ = self.tx.send(open);
    }

    fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    fn waiter(&self) -> GateWaiter {
        GateWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

/// Held by worker loops; `wait_open` parks until the gate is open.
#[derive(Debug, Clone)]
pub struct GateWaiter {
    rx: watch::Receiver<bool>,
}

impl GateWaiter {
    pub async fn wait_open(&mut self) {
        while !*self.rx.borrow() {
            // A dropped gate means the execution is being torn down;
            // unblock so the worker can observe EOF and exit.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Registry of gates keyed by task id. Only the supervisor creates and
/// destroys entries.
#[derive(Debug, Default)]
pub struct GateMap {
    gates: Mutex<HashMap<TaskId, PauseGate>>,
}

impl GateMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, PauseGate>> {
        self.gates.lock().expect("gate map lock poisoned")
    }

    /// Register a fresh, open gate and return a waiter for it.
    pub fn register(&self, task_id: TaskId) -> GateWaiter {
        let mut gates = self.lock();
        let gate = gates.entry(task_id).or_insert_with(PauseGate::new);
        gate.set(true);
        gate.waiter()
    }

    /// Extra waiter for an existing gate (e.g. the sampler).
    pub fn waiter(&self, task_id: TaskId) -> Option<GateWaiter> {
        self.lock().get(&task_id).map(PauseGate::waiter)
    }

    pub fn close(&self, task_id: TaskId) {
        if let Some(gate) = self.lock().get(&task_id) {
            gate.set(false);
        }
    }

    pub fn open(&self, task_id: TaskId) {
        if let Some(gate) = self.lock().get(&task_id) {
            gate.set(true);
        }
    }

    /// True when the task has a gate and it is currently closed.
    pub fn is_paused(&self, task_id: TaskId) -> bool {
        self.lock()
            .get(&task_id)
            .map(|gate| !gate.is_open())
            .unwrap_or(false)
    }

    pub fn remove(&self, task_id: TaskId) {
        self.lock().remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiter_blocks_while_closed_and_releases_on_open() {
        let gates = GateMap::new();
        let mut waiter = gates.register(1);

        gates.close(1);
        assert!(gates.is_paused(1));

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), waiter.wait_open()).await;
        assert!(blocked.is_err(), "waiter should park while gate is closed");

        gates.open(1);
        tokio::time::timeout(Duration::from_millis(200), waiter.wait_open())
            .await
            .expect("waiter should release once gate reopens");
        assert!(!gates.is_paused(1));
    }

    #[tokio::test]
    async fn removed_gate_unblocks_waiters() {
        let gates = GateMap::new();
        let mut waiter = gates.register(2);
        gates.close(2);
        gates.remove(2);

        tokio::time::timeout(Duration::from_millis(200), waiter.wait_open())
            .await
            .expect("waiter should release when the gate is dropped");
    }
}
