// src/repo/mod.rs

//! In-memory task repository, persisted through the persistence layer.
//!
//! Access disciplines:
//! 1. read operations hand out deep copies, never references into the state;
//! 2. mutations commit under the mutex, then persist *outside* the lock from
//!    a snapshot taken while it was held;
//! 3. `next_task_id` is persisted with the task set and recomputed on load
//!    as `max(persisted, max(task_id) + 1)` so ids stay strictly monotonic.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{Result, TaskRef, TaskforgeError};
use crate::model::Task;
use crate::persist::Persistence;
use crate::types::{TaskId, TaskStatus};

/// Persisted shape of `config/tasks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksSnapshot {
    pub tasks: Vec<Task>,
    pub next_task_id: TaskId,
}

struct RepoState {
    tasks: Vec<Task>,
    next_task_id: TaskId,
}

impl RepoState {
    fn snapshot(&self) -> TasksSnapshot {
        TasksSnapshot {
            tasks: self.tasks.clone(),
            next_task_id: self.next_task_id,
        }
    }

    fn find_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }
}

pub struct TaskRepository {
    persistence: Arc<Persistence>,
    state: Mutex<RepoState>,
}

impl TaskRepository {
    /// Load the persisted task set, or start empty when none exists.
    pub fn load(persistence: Arc<Persistence>) -> Result<Self> {
        let snapshot: Option<TasksSnapshot> = persistence.load_tasks_config()?;

        let (tasks, mut next_task_id) = match snapshot {
            Some(snap) => (snap.tasks, snap.next_task_id),
            None => (Vec::new(), 1),
        };

        let max_id = tasks.iter().map(|t| t.task_id).max().unwrap_or(0);
        next_task_id = next_task_id.max(max_id + 1).max(1);

        if !tasks.is_empty() {
            info!(count = tasks.len(), next_task_id, "loaded persisted tasks");
        }

        Ok(Self {
            persistence,
            state: Mutex::new(RepoState {
                tasks,
                next_task_id,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RepoState> {
        self.state.lock().expect("task repository lock poisoned")
    }

    /// Persist a snapshot taken under the lock. Called with the lock
    /// released so file IO never stalls other callers.
    fn persist(&self, snapshot: TasksSnapshot) -> Result<()> {
        if let Err(err) = self.persistence.save_tasks_config(&snapshot) {
            warn!(error = %err, "failed to persist task configuration");
            return Err(err);
        }
        Ok(())
    }

    /// Assign an id and admit a new task. The `task_id` on the passed task
    /// is overwritten.
    pub fn add_task(&self, mut task: Task) -> Result<TaskId> {
        let (task_id, snapshot) = {
            let mut state = self.lock();
            let task_id = state.next_task_id;
            state.next_task_id += 1;
            task.task_id = task_id;
            state.tasks.push(task);
            (task_id, state.snapshot())
        };

        debug!(task_id, "task admitted");
        self.persist(snapshot)?;
        Ok(task_id)
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.lock().tasks.iter().find(|t| t.task_id == task_id).cloned()
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    pub fn get_task_by_name(&self, task_name: &str) -> Option<Task> {
        self.lock()
            .tasks
            .iter()
            .find(|t| t.task_name == task_name)
            .cloned()
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.lock()
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Apply `mutate` to the task under the lock and persist the result.
    /// Returns the updated copy.
    pub fn update_task<F>(&self, task_id: TaskId, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let (updated, snapshot) = {
            let mut state = self.lock();
            let task = state
                .find_mut(task_id)
                .ok_or(TaskforgeError::TaskNotFound(task_id))?;
            mutate(task);
            let updated = task.clone();
            (updated, state.snapshot())
        };

        self.persist(snapshot)?;
        Ok(updated)
    }

    pub fn delete_task(&self, task_id: TaskId) -> Result<Task> {
        let (removed, snapshot) = {
            let mut state = self.lock();
            let idx = state
                .tasks
                .iter()
                .position(|t| t.task_id == task_id)
                .ok_or(TaskforgeError::TaskNotFound(task_id))?;
            let removed = state.tasks.remove(idx);
            (removed, state.snapshot())
        };

        debug!(task_id, "task deleted");
        self.persist(snapshot)?;
        Ok(removed)
    }

    /// Tasks whose `conda_env` is `env_name` (the environment reverse index).
    pub fn tasks_referencing_env(&self, env_name: &str) -> Vec<TaskRef> {
        self.lock()
            .tasks
            .iter()
            .filter(|t| t.conda_env == env_name)
            .map(|t| TaskRef {
                task_id: t.task_id,
                task_name: t.task_name.clone(),
            })
            .collect()
    }

    /// Rewrite every `conda_env = old` reference to `new` in one critical
    /// section, so a rename never leaves a mixed state observable.
    pub fn rewrite_env_references(&self, old: &str, new: &str) -> Result<usize> {
        let (updated, snapshot) = {
            let mut state = self.lock();
            let mut updated = 0usize;
            for task in state.tasks.iter_mut().filter(|t| t.conda_env == old) {
                task.conda_env = new.to_string();
                updated += 1;
            }
            (updated, state.snapshot())
        };

        if updated > 0 {
            info!(old, new, updated, "rewrote environment references");
            self.persist(snapshot)?;
        }
        Ok(updated)
    }

    /// The id the next admitted task will receive.
    pub fn peek_next_task_id(&self) -> TaskId {
        self.lock().next_task_id
    }
}
