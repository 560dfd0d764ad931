//! Promotion records and the artifacts exchanged with the external apply
//! step.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::candidate::Candidate;
use crate::domain::digest::sha256_hex;
use crate::domain::instance::InstanceId;

/// `promo-<16 hex>`, derived from the champion so re-promotion is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromotionId(String);

impl PromotionId {
    pub fn for_champion(instance_id: &InstanceId, manifest_digest: &str) -> Self {
        let digest = sha256_hex(format!("{instance_id}\n{manifest_digest}").as_bytes());
        Self(format!("promo-{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PromotionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PromotionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    Pending,
    Applied,
    Acknowledged,
    RolledBack,
}

impl PromotionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotionStatus::Pending => "pending",
            PromotionStatus::Applied => "applied",
            PromotionStatus::Acknowledged => "acknowledged",
            PromotionStatus::RolledBack => "rolled_back",
        }
    }

    /// Acknowledged records only move again on drift; rolled-back is final.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            PromotionStatus::Acknowledged | PromotionStatus::RolledBack
        )
    }

    pub fn can_transition_to(self, next: PromotionStatus) -> bool {
        use PromotionStatus::*;
        matches!(
            (self, next),
            (Pending, Applied)
                | (Applied, Acknowledged)
                | (Pending, RolledBack)
                | (Applied, RolledBack)
                | (Acknowledged, RolledBack)
        )
    }
}

impl fmt::Display for PromotionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PromotionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PromotionStatus::Pending),
            "applied" => Ok(PromotionStatus::Applied),
            "acknowledged" => Ok(PromotionStatus::Acknowledged),
            "rolled_back" | "rolled-back" => Ok(PromotionStatus::RolledBack),
            other => Err(format!("unknown promotion status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PromotionStatus,
    pub to: PromotionStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// `<id>.json` under the promotion directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub promotion_id: PromotionId,
    pub instance_id: InstanceId,
    pub candidate: Candidate,
    pub fitness: f64,
    pub created_at: DateTime<Utc>,
    pub ack_deadline: DateTime<Utc>,
    pub status: PromotionStatus,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Applied,
    Acknowledged,
    Failed,
}

impl std::str::FromStr for AckStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "applied" => Ok(AckStatus::Applied),
            "acknowledged" => Ok(AckStatus::Acknowledged),
            "failed" => Ok(AckStatus::Failed),
            other => Err(format!("unknown ack status: {other}")),
        }
    }
}

/// `<id>.ack.json`, written by the external apply step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub promotion_id: PromotionId,
    pub applied_at: DateTime<Utc>,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    AckTimeout,
    ApplyFailed,
    Drift,
}

/// `<id>.rollback.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackMarker {
    pub promotion_id: PromotionId,
    pub reason: RollbackReason,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// `current.json`: the acknowledged production configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductionPointer {
    pub current: Option<PromotionId>,
    pub previous: Option<PromotionId>,
    pub updated_at: Option<DateTime<Utc>>,
}
