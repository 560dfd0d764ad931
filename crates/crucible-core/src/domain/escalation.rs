//! Escalation flags, gates, and the controller's persisted state.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagState {
    Quiet,
    Armed,
}

impl fmt::Display for FlagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlagState::Quiet => "quiet",
            FlagState::Armed => "armed",
        })
    }
}

/// Why an armed flag went quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    ValidatedImprovement,
    Expired,
}

/// Per-symptom escalation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationFlag {
    pub symptom: String,
    pub state: FlagState,
    /// Counted occurrences inside the sliding window.
    pub occurrences: Vec<DateTime<Utc>>,
    pub armed_at: Option<DateTime<Utc>>,
    pub ttl_secs: i64,
    /// Armed flags clear on a validated improvement; this records the last
    /// way the flag actually cleared.
    pub last_cleared: Option<ClearReason>,
}

impl EscalationFlag {
    pub fn quiet(symptom: &str, ttl_secs: i64) -> Self {
        Self {
            symptom: symptom.to_string(),
            state: FlagState::Quiet,
            occurrences: Vec::new(),
            armed_at: None,
            ttl_secs,
            last_cleared: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state == FlagState::Armed
    }

    pub fn occurrence_count(&self) -> usize {
        self.occurrences.len()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.armed_at
            .map(|t| t + chrono::Duration::seconds(self.ttl_secs))
    }
}

/// Gates a cycle must pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Window,
    Budget,
    Cooldown,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Gate::Window => "window",
            Gate::Budget => "budget",
            Gate::Cooldown => "cooldown",
        })
    }
}

/// Result of one controller tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TickDecision {
    Idle,
    Deferred {
        blocked: Vec<Gate>,
        symptoms: Vec<String>,
    },
    RunCycle {
        symptoms: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeveritySample {
    pub at: DateTime<Utc>,
    pub severity: f64,
}

/// Usage of the current night's budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NightBudget {
    pub night: NaiveDate,
    pub cycles_started: u32,
    pub minutes_used: f64,
}

/// Everything the controller persists to `escalation/state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationState {
    #[serde(default)]
    pub flags: BTreeMap<String, EscalationFlag>,
    #[serde(default)]
    pub samples: BTreeMap<String, Vec<SeveritySample>>,
    #[serde(default)]
    pub budget: Option<NightBudget>,
    #[serde(default)]
    pub last_cycle_started: Option<DateTime<Utc>>,
    /// Ids applied to this state, kept so a crash between persisting and
    /// marking processed cannot double-count a redelivered record.
    #[serde(default)]
    pub recent_ids: VecDeque<String>,
}
