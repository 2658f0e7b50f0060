//! Hash-chained audit records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// `previous_checksum` of the first record in the chain
pub const GENESIS_CHECKSUM: &str = "GENESIS";

/// Audit row before the store places it in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDraft {
    pub action: String,
    pub actor: String,
    pub entity_type: String,
    pub entity_id: String,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
}

impl AuditDraft {
    pub fn new(
        action: impl Into<String>,
        actor: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            action: action.into(),
            actor: actor.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            correlation_id: Uuid::new_v4(),
            payload,
        }
    }

    /// Attach the record to an existing correlation id
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Seal the draft as the record following `previous_checksum`
    pub fn seal(self, sequence: i64, previous_checksum: &str, created_at: DateTime<Utc>) -> AuditRecord {
        let mut record = AuditRecord {
            sequence,
            action: self.action,
            actor: self.actor,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            correlation_id: self.correlation_id,
            payload: self.payload,
            previous_checksum: previous_checksum.to_string(),
            checksum: String::new(),
            created_at,
        };
        record.checksum = record.compute_checksum();
        record
    }
}

/// Append-only audit row; `checksum = sha256(content + previous_checksum)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: i64,
    pub action: String,
    pub actor: String,
    pub entity_type: String,
    pub entity_id: String,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
    pub previous_checksum: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Hash every field except `checksum` itself
    pub fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.action.as_bytes());
        hasher.update(self.actor.as_bytes());
        hasher.update(self.entity_type.as_bytes());
        hasher.update(self.entity_id.as_bytes());
        hasher.update(self.correlation_id.as_bytes());
        // serde_json maps are sorted, so this is stable across a JSONB round trip
        hasher.update(self.payload.to_string().as_bytes());
        hasher.update(self.created_at.timestamp_micros().to_le_bytes());
        hasher.update(self.previous_checksum.as_bytes());

        hex::encode(hasher.finalize())
    }
}
