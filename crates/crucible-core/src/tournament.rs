//! Tournament Orchestrator: single-elimination bracket over spawned
//! instances.
//!
//! Each round is a hard barrier. Its matches run on a `JoinSet` bounded by
//! a semaphore, both evaluations of a match run concurrently, and the next
//! round starts only after every match has finished or timed out. Round
//! wall time is therefore bounded by one evaluation timeout regardless of
//! how many matches the round holds (given enough permits).
//!
//! Byes: when a round has an odd number of entrants, the first one in
//! bracket order advances without playing and is placed last in the next
//! round, so the same entrant does not collect consecutive byes.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::audit::{AuditEntry, AuditLog};
use crate::domain::error::{CrucibleError, Result};
use crate::domain::evaluation::{EvalContext, EvaluationResult};
use crate::domain::instance::{Instance, InstanceId};
use crate::domain::tournament::{Match, Round, Standing, TournamentResult};
use crate::evaluator::FitnessEvaluator;
use crate::lease::HeldLease;
use crate::metrics::METRICS;
use crate::obs;

/// Compare two evaluations of one match and record why the winner won.
///
/// Higher fitness wins. On exactly equal fitness the faster evaluation
/// wins; if that is equal too the lexicographically smaller instance id
/// wins. Either tie-break is written to `tie_break`.
pub fn decide(round: usize, left: EvaluationResult, right: EvaluationResult) -> Match {
    let by_fitness = left
        .fitness
        .partial_cmp(&right.fitness)
        .unwrap_or(Ordering::Equal);

    let (left_wins, tie_break) = match by_fitness {
        Ordering::Greater => (true, None),
        Ordering::Less => (false, None),
        Ordering::Equal => match left.duration_ms.cmp(&right.duration_ms) {
            Ordering::Less | Ordering::Greater => {
                let left_wins = left.duration_ms < right.duration_ms;
                let (fast, slow) = if left_wins {
                    (left.duration_ms, right.duration_ms)
                } else {
                    (right.duration_ms, left.duration_ms)
                };
                (
                    left_wins,
                    Some(format!(
                        "equal fitness {:.6}; lower evaluation duration {fast}ms vs {slow}ms",
                        left.fitness
                    )),
                )
            }
            Ordering::Equal => (
                left.instance_id <= right.instance_id,
                Some(format!(
                    "equal fitness {:.6}; equal evaluation duration {}ms; smaller instance id",
                    left.fitness, left.duration_ms
                )),
            ),
        },
    };

    let (winner, loser) = if left_wins {
        (left.instance_id.clone(), right.instance_id.clone())
    } else {
        (right.instance_id.clone(), left.instance_id.clone())
    };
    let margin = (left.fitness - right.fitness).abs();
    Match {
        round,
        left,
        right,
        winner,
        loser,
        margin,
        tie_break,
    }
}

pub struct TournamentOrchestrator {
    evaluator: Arc<FitnessEvaluator>,
    concurrency: usize,
    parallel: bool,
    audit: Option<(Arc<AuditLog>, String)>,
    lease: Option<HeldLease>,
}

impl TournamentOrchestrator {
    pub fn new(evaluator: Arc<FitnessEvaluator>, concurrency: usize, parallel: bool) -> Self {
        Self {
            evaluator,
            concurrency: concurrency.max(1),
            parallel,
            audit: None,
            lease: None,
        }
    }

    /// Renew `lease` at every round start and after every match; the
    /// bracket stops with `LeaseLost` once it is gone.
    pub fn with_lease(mut self, lease: HeldLease) -> Self {
        self.lease = Some(lease);
        self
    }

    fn renew_lease(&self) -> Result<()> {
        if let Some(lease) = &self.lease {
            lease.renew()?;
        }
        Ok(())
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>, cycle_id: &str) -> Self {
        self.audit = Some((audit, cycle_id.to_string()));
        self
    }

    /// Run the bracket to a single champion.
    pub async fn run(&self, entrants: Vec<Instance>) -> Result<TournamentResult> {
        if entrants.is_empty() {
            return Err(CrucibleError::NoEntrants);
        }
        let started = tokio::time::Instant::now();

        let mut field = entrants;
        field.sort_by(|a, b| a.id.cmp(&b.id));
        field.dedup_by(|a, b| a.id == b.id);
        let all_ids: Vec<InstanceId> = field.iter().map(|i| i.id.clone()).collect();

        let mut rounds = Vec::new();
        let mut eliminated: HashMap<InstanceId, usize> = HashMap::new();
        let mut best: HashMap<InstanceId, f64> = HashMap::new();

        while field.len() > 1 {
            let index = rounds.len();
            self.renew_lease()?;
            let round_started = tokio::time::Instant::now();
            let entrants = field.len();

            let bye = (field.len() % 2 == 1).then(|| field.remove(0));
            let mut pairs = Vec::with_capacity(field.len() / 2);
            let mut rest = field.into_iter();
            while let (Some(a), Some(b)) = (rest.next(), rest.next()) {
                pairs.push((a, b));
            }

            let matches = if self.parallel {
                self.play_parallel(index, &pairs).await?
            } else {
                self.play_sequential(index, &pairs).await?
            };

            let mut next = Vec::with_capacity(pairs.len() + 1);
            for ((a, b), m) in pairs.into_iter().zip(&matches) {
                for r in [&m.left, &m.right] {
                    let entry = best.entry(r.instance_id.clone()).or_insert(r.fitness);
                    if r.fitness > *entry {
                        *entry = r.fitness;
                    }
                }
                eliminated.insert(m.loser.clone(), index);
                next.push(if m.winner == a.id { a } else { b });
                self.record_match(m);
            }
            if let Some(b) = &bye {
                debug!(round = index, instance_id = %b.id, "bye");
            }
            next.extend(bye.clone());

            let round = Round {
                index,
                matches,
                bye: bye.map(|b| b.id),
                duration_ms: round_started.elapsed().as_millis() as u64,
            };
            self.record_round(&round, entrants, &next);
            rounds.push(round);
            field = next;
        }

        let champion = field
            .pop()
            .map(|i| i.id)
            .ok_or_else(|| CrucibleError::Internal("bracket ended without a champion".into()))?;

        let depth_total = (rounds.len() + 1) as f64;
        let mut standings: Vec<Standing> = all_ids
            .into_iter()
            .map(|id| {
                let eliminated_in = eliminated.get(&id).copied();
                let depth = eliminated_in.map_or(depth_total, |r| (r + 1) as f64);
                Standing {
                    best_fitness: best.get(&id).copied(),
                    bracket_fitness: depth / depth_total,
                    eliminated_in,
                    instance_id: id,
                }
            })
            .collect();
        standings.sort_by(|a, b| {
            b.bracket_fitness
                .partial_cmp(&a.bracket_fitness)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.best_fitness
                        .unwrap_or(f64::NEG_INFINITY)
                        .partial_cmp(&a.best_fitness.unwrap_or(f64::NEG_INFINITY))
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });

        let match_count = rounds.iter().map(|r| r.matches.len()).sum();
        Ok(TournamentResult {
            rounds,
            champion,
            duration_ms: started.elapsed().as_millis() as u64,
            match_count,
            standings,
        })
    }

    async fn play_parallel(&self, round: usize, pairs: &[(Instance, Instance)]) -> Result<Vec<Match>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for (slot, (a, b)) in pairs.iter().enumerate() {
            let evaluator = Arc::clone(&self.evaluator);
            let semaphore = Arc::clone(&semaphore);
            let (a, b) = (a.clone(), b.clone());
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| CrucibleError::Internal(format!("semaphore closed: {e}")))?;
                let ctx = EvalContext::Match { round };
                let (left, right) =
                    tokio::join!(evaluator.evaluate(&a, &ctx), evaluator.evaluate(&b, &ctx));
                Ok::<_, CrucibleError>((slot, decide(round, left, right)))
            });
        }

        let mut decided: Vec<Option<Match>> = vec![None; pairs.len()];
        while let Some(joined) = set.join_next().await {
            let (slot, m) =
                joined.map_err(|e| CrucibleError::Internal(format!("match task failed: {e}")))??;
            decided[slot] = Some(m);
            self.renew_lease()?;
        }
        decided
            .into_iter()
            .map(|m| m.ok_or_else(|| CrucibleError::Internal("match result missing".into())))
            .collect()
    }

    async fn play_sequential(&self, round: usize, pairs: &[(Instance, Instance)]) -> Result<Vec<Match>> {
        let ctx = EvalContext::Match { round };
        let mut out = Vec::with_capacity(pairs.len());
        for (a, b) in pairs {
            self.renew_lease()?;
            let left = self.evaluator.evaluate(a, &ctx).await;
            let right = self.evaluator.evaluate(b, &ctx).await;
            out.push(decide(round, left, right));
        }
        Ok(out)
    }

    fn record_match(&self, m: &Match) {
        METRICS.inc_matches();
        obs::emit_match_decided(
            m.round,
            m.winner.as_str(),
            m.loser.as_str(),
            m.margin,
            m.tie_break.as_deref(),
        );
        if let Some((audit, cycle_id)) = &self.audit {
            let (w, l) = if m.left.instance_id == m.winner {
                (&m.left, &m.right)
            } else {
                (&m.right, &m.left)
            };
            audit.record(
                Some(cycle_id),
                Utc::now(),
                AuditEntry::Match {
                    round: m.round,
                    winner: m.winner.clone(),
                    loser: m.loser.clone(),
                    winner_fitness: w.fitness,
                    loser_fitness: l.fitness,
                    tie_break: m.tie_break.clone(),
                },
            );
        }
    }

    fn record_round(&self, round: &Round, entrants: usize, advanced: &[Instance]) {
        METRICS.inc_rounds();
        obs::emit_round_finished(
            round.index,
            round.matches.len(),
            round.bye.as_ref().map(InstanceId::as_str),
            round.duration_ms,
        );
        if let Some((audit, cycle_id)) = &self.audit {
            audit.record(
                Some(cycle_id),
                Utc::now(),
                AuditEntry::Round {
                    round: round.index,
                    entrants,
                    matches: round.matches.len(),
                    bye: round.bye.clone(),
                    advanced: advanced.iter().map(|i| i.id.clone()).collect(),
                    duration_ms: round.duration_ms,
                },
            );
        }
    }
}
