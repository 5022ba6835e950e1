//! Core domain types shared across bibsync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for the provisioning state record.
pub const STATE_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 identifier for one pipeline invocation (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ProvisionState
// ---------------------------------------------------------------------------

/// Whether the dependency environment is ready, as persisted in the marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisionState {
    /// No usable state record exists.
    NotProvisioned,
    /// Every install command succeeded for the recorded dependency set.
    Provisioned {
        provisioned_at: DateTime<Utc>,
        /// SHA-256 over the requirement files' names and contents.
        dependency_hash: String,
    },
}

impl ProvisionState {
    /// True when the environment was provisioned for exactly `hash`.
    pub fn is_current(&self, hash: &str) -> bool {
        matches!(self, Self::Provisioned { dependency_hash, .. } if dependency_hash == hash)
    }
}

/// On-disk envelope for [`ProvisionState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub state: ProvisionState,
}

impl StateRecord {
    pub fn new(state: ProvisionState) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            state,
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The stages of a pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Provision,
    Scrape,
    Update,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Scrape => "scrape",
            Self::Update => "update",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the scraper fetches fresh remote data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrapeMode {
    /// Reuse local or cached data only.
    #[default]
    Local,
    /// Fetch fresh remote data.
    Download,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_serializes_transparently() {
        let id = RunId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn state_record_serialization() {
        let record = StateRecord::new(ProvisionState::Provisioned {
            provisioned_at: Utc::now(),
            dependency_hash: "abc123".into(),
        });

        let json = serde_json::to_string_pretty(&record).expect("serialize");
        assert!(json.contains("\"status\": \"provisioned\""));

        let parsed: StateRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.schema_version, STATE_SCHEMA_VERSION);
        assert!(parsed.state.is_current("abc123"));
        assert!(!parsed.state.is_current("def456"));
    }

    #[test]
    fn not_provisioned_is_never_current() {
        assert!(!ProvisionState::NotProvisioned.is_current(""));
    }

    #[test]
    fn step_kind_display() {
        assert_eq!(StepKind::Scrape.to_string(), "scrape");
        assert_eq!(StepKind::Update.as_str(), "update");
    }
}
