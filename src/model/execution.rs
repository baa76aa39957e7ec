// src/model/execution.rs

//! One run of a task, with its logs, memory samples and outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ExecutionStatus, LogStream};

/// A single attempt to run a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub start_time: DateTime<Utc>,
    /// Null while the execution is running.
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Seconds, `end_time - start_time`.
    pub duration: Option<f64>,
    /// RSS samples in MB, one roughly every 500 ms.
    #[serde(default)]
    pub memory_usage: Vec<f64>,
    pub peak_memory: Option<f64>,
    pub avg_memory: Option<f64>,
    /// Merged stdout+stderr in write order.
    #[serde(default)]
    pub logs: String,
    /// Per-stream side-channels, populated only by stream-aware appenders.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl ExecutionRecord {
    /// A fresh record for an execution that is starting now.
    pub fn started(execution_id: Uuid, start_time: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            start_time,
            end_time: None,
            status: ExecutionStatus::Running,
            exit_code: None,
            duration: None,
            memory_usage: Vec::new(),
            peak_memory: None,
            avg_memory: None,
            logs: String::new(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// `(peak, avg)` over the collected samples, if any exist.
    pub fn memory_summary(&self) -> Option<(f64, f64)> {
        if self.memory_usage.is_empty() {
            return None;
        }
        let peak = self.memory_usage.iter().cloned().fold(f64::MIN, f64::max);
        let avg = self.memory_usage.iter().sum::<f64>() / self.memory_usage.len() as f64;
        Some((peak, avg))
    }

    pub fn stream_mut(&mut self, stream: LogStream) -> &mut String {
        match stream {
            LogStream::Logs => &mut self.logs,
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        }
    }

    pub fn stream(&self, stream: LogStream) -> &str {
        match stream {
            LogStream::Logs => &self.logs,
            LogStream::Stdout => &self.stdout,
            LogStream::Stderr => &self.stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_summary_reports_peak_and_mean() {
        let mut record = ExecutionRecord::started(Uuid::new_v4(), Utc::now());
        assert_eq!(record.memory_summary(), None);

        record.memory_usage = vec![10.0, 30.0, 20.0];
        let (peak, avg) = record.memory_summary().unwrap();
        assert_eq!(peak, 30.0);
        assert_eq!(avg, 20.0);
    }
}
