// src/model/environment.rs

//! Metadata about a Conda environment known to the system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One installed package inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
}

/// Persisted per-environment metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub name: String,
    pub python_version: Option<String>,
    #[serde(default)]
    pub packages: Vec<PackageInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentRecord {
    pub fn new(
        name: impl Into<String>,
        python_version: Option<String>,
        packages: Vec<PackageInfo>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            python_version,
            packages,
            created_at: now,
            updated_at: now,
        }
    }
}
