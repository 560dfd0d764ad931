//! Bracket records: matches, rounds, and the tournament result.

use serde::{Deserialize, Serialize};

use crate::domain::evaluation::EvaluationResult;
use crate::domain::instance::InstanceId;

/// One pairwise comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub round: usize,
    pub left: EvaluationResult,
    pub right: EvaluationResult,
    pub winner: InstanceId,
    pub loser: InstanceId,
    /// Absolute fitness difference.
    pub margin: f64,
    /// Set whenever fitness alone did not decide the match.
    pub tie_break: Option<String>,
}

impl Match {
    pub fn involves(&self, id: &InstanceId) -> bool {
        &self.left.instance_id == id || &self.right.instance_id == id
    }

    pub fn winner_result(&self) -> &EvaluationResult {
        if self.left.instance_id == self.winner {
            &self.left
        } else {
            &self.right
        }
    }
}

/// One elimination level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub index: usize,
    pub matches: Vec<Match>,
    /// Entrant that advanced without playing.
    pub bye: Option<InstanceId>,
    pub duration_ms: u64,
}

/// Final placement of one entrant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub instance_id: InstanceId,
    /// Round the entrant lost in; `None` for the champion.
    pub eliminated_in: Option<usize>,
    /// Best raw evaluator fitness observed, if it ever played.
    pub best_fitness: Option<f64>,
    /// Depth reached in the bracket, normalized so the champion gets 1.0.
    pub bracket_fitness: f64,
}

/// Complete bracket history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentResult {
    pub rounds: Vec<Round>,
    pub champion: InstanceId,
    pub duration_ms: u64,
    pub match_count: usize,
    /// Sorted best first.
    pub standings: Vec<Standing>,
}

impl TournamentResult {
    pub fn final_match(&self) -> Option<&Match> {
        self.rounds.iter().rev().find_map(|r| r.matches.last())
    }

    pub fn standing(&self, id: &InstanceId) -> Option<&Standing> {
        self.standings.iter().find(|s| &s.instance_id == id)
    }

    /// Best raw fitness the champion achieved, `None` for an uncontested
    /// single-entrant bracket.
    pub fn champion_fitness(&self) -> Option<f64> {
        self.standing(&self.champion).and_then(|s| s.best_fitness)
    }
}
