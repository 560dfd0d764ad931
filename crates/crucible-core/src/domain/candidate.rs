//! Candidate parameter configurations.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::search_space::Params;

/// Unique candidate identifier (uuid v4, simple form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CandidateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a candidate came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Uniform draw under the pure-random policy.
    Random,
    /// Perturbation of a prior winner.
    Mutation,
    /// Uniform draw injected under the mutation policy to keep exploring.
    FreshInjection,
    /// Pinned by configuration (`[[generator.seeds]]`).
    Seeded,
}

/// A proposed parameter configuration, not yet materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub params: Params,
    pub generation: u32,
    pub parent: Option<CandidateId>,
    pub origin: CandidateOrigin,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn new(
        params: Params,
        generation: u32,
        parent: Option<CandidateId>,
        origin: CandidateOrigin,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CandidateId::new(),
            params,
            generation,
            parent,
            origin,
            created_at,
        }
    }
}
