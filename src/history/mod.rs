// src/history/mod.rs

//! Per-task execution history: ordered record lists, streaming log capture
//! and retention pruning.
//!
//! The in-memory state is always authoritative for readers in this process;
//! disk is a recovery copy. Log appends persist selectively (see
//! [`should_flush`]) to bound IO volume while a chatty child is running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{Result, TaskforgeError};
use crate::model::ExecutionRecord;
use crate::persist::Persistence;
use crate::types::{LogStream, TaskId};

/// Log chunks below this size do not force a persistence write on their own.
const FLUSH_SIZE_BYTES: usize = 100;

/// Substrings (matched case-insensitively) that force a flush regardless of
/// chunk size, so the interesting tail of a log survives a crash.
const FLUSH_MARKERS: &[&str] = &["error", "exception", "completed"];

/// Whether appending `chunk` should trigger a write-through to disk.
fn should_flush(chunk: &str) -> bool {
    if chunk.len() > FLUSH_SIZE_BYTES {
        return true;
    }
    let lowered = chunk.to_lowercase();
    FLUSH_MARKERS.iter().any(|marker| lowered.contains(marker))
}

pub struct HistoryStore {
    persistence: Arc<Persistence>,
    state: Mutex<HashMap<TaskId, Vec<ExecutionRecord>>>,
}

impl HistoryStore {
    /// Load every persisted per-task history file.
    pub fn load(persistence: Arc<Persistence>) -> Result<Self> {
        let histories = persistence.load_all_task_histories()?;
        if !histories.is_empty() {
            info!(tasks = histories.len(), "loaded persisted task histories");
        }
        Ok(Self {
            persistence,
            state: Mutex::new(histories),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Vec<ExecutionRecord>>> {
        self.state.lock().expect("history store lock poisoned")
    }

    /// Persist one task's records from a snapshot taken under the lock.
    fn persist(&self, task_id: TaskId, records: &[ExecutionRecord]) {
        if let Err(err) = self.persistence.save_task_history(task_id, records) {
            warn!(task_id, error = %err, "failed to persist task history");
        }
    }

    /// Append a record to the task's history, in start order.
    pub fn add_execution_record(&self, task_id: TaskId, record: ExecutionRecord) {
        let snapshot = {
            let mut state = self.lock();
            let records = state.entry(task_id).or_default();
            records.push(record);
            records.clone()
        };
        self.persist(task_id, &snapshot);
    }

    /// Mutate the matching record in place and re-persist the task's file.
    pub fn update_execution_record<F>(
        &self,
        task_id: TaskId,
        execution_id: Uuid,
        mutate: F,
    ) -> Result<ExecutionRecord>
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        let (updated, snapshot) = {
            let mut state = self.lock();
            let records = state
                .get_mut(&task_id)
                .ok_or(TaskforgeError::TaskNotFound(task_id))?;
            let record = records
                .iter_mut()
                .find(|r| r.execution_id == execution_id)
                .ok_or(TaskforgeError::ExecutionNotFound {
                    task_id,
                    execution_id,
                })?;
            mutate(record);
            (record.clone(), records.clone())
        };

        self.persist(task_id, &snapshot);
        Ok(updated)
    }

    /// Concatenate `chunk` onto the named log field.
    ///
    /// Persistence happens only when the chunk is large or contains one of
    /// the flush markers; the in-memory record always has the full log.
    pub fn append_to_execution_log(
        &self,
        task_id: TaskId,
        execution_id: Uuid,
        chunk: &str,
        stream: LogStream,
    ) -> Result<()> {
        let snapshot = {
            let mut state = self.lock();
            let records = state
                .get_mut(&task_id)
                .ok_or(TaskforgeError::TaskNotFound(task_id))?;
            let record = records
                .iter_mut()
                .find(|r| r.execution_id == execution_id)
                .ok_or(TaskforgeError::ExecutionNotFound {
                    task_id,
                    execution_id,
                })?;
            record.stream_mut(stream).push_str(chunk);
            should_flush(chunk).then(|| records.clone())
        };

        if let Some(records) = snapshot {
            self.persist(task_id, &records);
        }
        Ok(())
    }

    /// Append one RSS sample without persisting.
    ///
    /// Samples arrive every 500 ms; they reach disk with the next flushing
    /// log append or the record's finalisation.
    pub fn append_memory_sample(&self, task_id: TaskId, execution_id: Uuid, sample_mb: f64) {
        let mut state = self.lock();
        if let Some(record) = state
            .get_mut(&task_id)
            .and_then(|records| records.iter_mut().find(|r| r.execution_id == execution_id))
        {
            record.memory_usage.push(sample_mb);
        }
    }

    pub fn get_execution_record(
        &self,
        task_id: TaskId,
        execution_id: Uuid,
    ) -> Option<ExecutionRecord> {
        self.lock()
            .get(&task_id)?
            .iter()
            .find(|r| r.execution_id == execution_id)
            .cloned()
    }

    /// Current live log text for polling callers.
    ///
    /// Reads the in-memory record, never disk, so a running task shows
    /// freshly buffered output.
    pub fn get_execution_logs(
        &self,
        task_id: TaskId,
        execution_id: Uuid,
        stream: LogStream,
    ) -> Option<String> {
        self.lock()
            .get(&task_id)?
            .iter()
            .find(|r| r.execution_id == execution_id)
            .map(|r| r.stream(stream).to_string())
    }

    /// All records of one task, in append order.
    pub fn task_history(&self, task_id: TaskId) -> Vec<ExecutionRecord> {
        self.lock().get(&task_id).cloned().unwrap_or_default()
    }

    /// Deep copy of every task's history, for stats roll-ups.
    pub fn all_histories(&self) -> HashMap<TaskId, Vec<ExecutionRecord>> {
        self.lock().clone()
    }

    /// Drop records whose `start_time` is older than `retention_days` and
    /// persist every task whose list actually shrank. Returns how many
    /// task lists shrank.
    pub fn clean_old_records(&self, retention_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(retention_days);

        let shrunk: Vec<(TaskId, Vec<ExecutionRecord>)> = {
            let mut state = self.lock();
            let mut shrunk = Vec::new();
            for (task_id, records) in state.iter_mut() {
                let before = records.len();
                records.retain(|r| r.start_time >= cutoff);
                if records.len() < before {
                    shrunk.push((*task_id, records.clone()));
                }
            }
            shrunk
        };

        let mut removed = 0usize;
        for (task_id, records) in &shrunk {
            self.persist(*task_id, records);
            debug!(task_id, kept = records.len(), "pruned old execution records");
            removed += 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_plain_chunks_do_not_flush() {
        assert!(!should_flush("hello world\n"));
    }

    #[test]
    fn large_chunks_flush() {
        let chunk = "x".repeat(FLUSH_SIZE_BYTES + 1);
        assert!(should_flush(&chunk));
    }

    #[test]
    fn marker_chunks_flush_case_insensitively() {
        assert!(should_flush("Traceback: ValueError Exception\n"));
        assert!(should_flush("task COMPLETED\n"));
        assert!(should_flush("an ERROR occurred\n"));
    }
}
