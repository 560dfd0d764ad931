//! Candidate Generator.
//!
//! Draws parameter sets from a bounded search space. Under the
//! mutation-biased policy the first slot is always a fresh random injection
//! and the rest are perturbations of the top-K prior winners. Every
//! candidate, generated, seeded or inherited, is checked against the search
//! space and discarded on violation; nothing is clamped.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use chrono::{DateTime, Utc};

use crate::domain::candidate::{Candidate, CandidateId, CandidateOrigin};
use crate::domain::search_space::{ParamSpec, ParamValue, Params, SearchSpace};
use crate::winners::WinnerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationPolicy {
    Random,
    MutationBiased { top_k: usize, mutation_rate: f64 },
}

/// A candidate that failed the bounds check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub candidate_id: CandidateId,
    pub origin: CandidateOrigin,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub candidates: Vec<Candidate>,
    pub rejected: Vec<Rejection>,
}

pub struct CandidateGenerator<'a> {
    space: &'a SearchSpace,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(space: &'a SearchSpace) -> Self {
        Self { space }
    }

    /// Produce up to `n` admitted candidates.
    ///
    /// `seeds` take the first slots; rejected seeds do not consume a slot.
    /// `winners` feed the mutation policy; winners that no longer fit the
    /// space are reported as rejections and never used as parents.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        seeds: &[Params],
        winners: &[WinnerRecord],
        policy: GenerationPolicy,
        n: usize,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> GenerationReport {
        let mut report = GenerationReport::default();

        for params in seeds {
            if report.candidates.len() >= n {
                break;
            }
            let seeded = Candidate::new(params.clone(), 0, None, CandidateOrigin::Seeded, now);
            self.admit(seeded, &mut report);
        }

        match policy {
            GenerationPolicy::Random => {
                while report.candidates.len() < n {
                    let fresh = self.random_candidate(CandidateOrigin::Random, rng, now);
                    if !self.admit(fresh, &mut report) {
                        break;
                    }
                }
            }
            GenerationPolicy::MutationBiased {
                top_k,
                mutation_rate,
            } => {
                if report.candidates.len() < n {
                    let fresh = self.random_candidate(CandidateOrigin::FreshInjection, rng, now);
                    self.admit(fresh, &mut report);
                }

                let parents = self.eligible_parents(winners, top_k, &mut report);
                let mut slot = 0usize;
                while report.candidates.len() < n {
                    let child = if parents.is_empty() {
                        self.random_candidate(CandidateOrigin::Random, rng, now)
                    } else {
                        let parent = parents[slot % parents.len()];
                        slot += 1;
                        self.mutate(&parent.candidate, mutation_rate, rng, now)
                    };
                    if !self.admit(child, &mut report) {
                        break;
                    }
                }
            }
        }

        report
    }

    /// Bounds-check `candidate`; push it to `candidates` or `rejected`.
    fn admit(&self, candidate: Candidate, report: &mut GenerationReport) -> bool {
        match self.space.validate_candidate(&candidate) {
            Ok(()) => {
                report.candidates.push(candidate);
                true
            }
            Err(err) => {
                warn!(candidate_id = %candidate.id, origin = ?candidate.origin, error = %err, "candidate rejected");
                report.rejected.push(Rejection {
                    candidate_id: candidate.id,
                    origin: candidate.origin,
                    reason: err.to_string(),
                });
                false
            }
        }
    }

    fn eligible_parents<'w>(
        &self,
        winners: &'w [WinnerRecord],
        top_k: usize,
        report: &mut GenerationReport,
    ) -> Vec<&'w WinnerRecord> {
        let mut eligible: Vec<&WinnerRecord> = Vec::new();
        for winner in winners {
            match self.space.validate_candidate(&winner.candidate) {
                Ok(()) => eligible.push(winner),
                Err(err) => {
                    warn!(candidate_id = %winner.candidate.id, error = %err, "prior winner no longer fits the search space");
                    report.rejected.push(Rejection {
                        candidate_id: winner.candidate.id.clone(),
                        origin: winner.candidate.origin,
                        reason: err.to_string(),
                    });
                }
            }
        }
        eligible.sort_by(|a, b| {
            b.fitness
                .total_cmp(&a.fitness)
                .then_with(|| b.promoted_at.cmp(&a.promoted_at))
        });
        eligible.truncate(top_k);
        eligible
    }

    fn random_candidate<R: Rng + ?Sized>(
        &self,
        origin: CandidateOrigin,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Candidate {
        let params = self
            .space
            .params()
            .iter()
            .map(|(name, spec)| (name.clone(), draw(spec, rng)))
            .collect();
        Candidate::new(params, 0, None, origin, now)
    }

    fn mutate<R: Rng + ?Sized>(
        &self,
        parent: &Candidate,
        mutation_rate: f64,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Candidate {
        let names: Vec<&String> = self.space.params().keys().collect();
        let mut chosen: Vec<&String> = names
            .iter()
            .copied()
            .filter(|_| rng.gen_bool(mutation_rate))
            .collect();
        if chosen.is_empty() {
            if let Some(one) = names.choose(rng) {
                chosen.push(*one);
            }
        }

        let mut params = parent.params.clone();
        for name in chosen {
            let Some(spec) = self.space.get(name) else {
                continue;
            };
            let next = match params.get(name) {
                Some(current) => perturb(spec, current, rng),
                None => draw(spec, rng),
            };
            params.insert(name.clone(), next);
        }

        Candidate::new(
            params,
            parent.generation + 1,
            Some(parent.id.clone()),
            CandidateOrigin::Mutation,
            now,
        )
    }
}

/// Uniform draw within `spec`.
fn draw<R: Rng + ?Sized>(spec: &ParamSpec, rng: &mut R) -> ParamValue {
    match spec {
        ParamSpec::Choice { values } => values
            .choose(rng)
            .cloned()
            .unwrap_or(ParamValue::Bool(false)),
        ParamSpec::IntRange { min, max } => ParamValue::Int(rng.gen_range(*min..=*max)),
        ParamSpec::FloatRange { min, max } => {
            if min == max {
                ParamValue::Float(*min)
            } else {
                ParamValue::Float(rng.gen_range(*min..=*max))
            }
        }
    }
}

/// Step `current` to a nearby in-bounds value. Steps that would leave the
/// range are reflected to the other side; a zero-width range stays put.
fn perturb<R: Rng + ?Sized>(spec: &ParamSpec, current: &ParamValue, rng: &mut R) -> ParamValue {
    match spec {
        ParamSpec::Choice { values } => {
            let others: Vec<&ParamValue> = values.iter().filter(|v| *v != current).collect();
            others
                .choose(rng)
                .map(|v| (*v).clone())
                .unwrap_or_else(|| current.clone())
        }
        ParamSpec::IntRange { min, max } => {
            let ParamValue::Int(cur) = current else {
                return draw(spec, rng);
            };
            let span = max.saturating_sub(*min);
            if span == 0 {
                return current.clone();
            }
            let step = rng.gen_range(1..=(span / 4).max(1));
            let (up, down) = (cur.saturating_add(step), cur.saturating_sub(step));
            let first_up = rng.gen_bool(0.5);
            let pick = |v: i64| (*min..=*max).contains(&v).then_some(v);
            let next = if first_up {
                pick(up).or_else(|| pick(down))
            } else {
                pick(down).or_else(|| pick(up))
            };
            ParamValue::Int(next.unwrap_or(*cur))
        }
        ParamSpec::FloatRange { min, max } => {
            let Some(cur) = current.as_f64() else {
                return draw(spec, rng);
            };
            let span = max - min;
            if span <= 0.0 {
                return ParamValue::Float(cur);
            }
            // Triangular step centred on zero, at most span/4 each way.
            let step = (rng.gen::<f64>() + rng.gen::<f64>() - 1.0) * span / 4.0;
            let inside = |v: f64| v >= *min && v <= *max;
            let next = if inside(cur + step) {
                cur + step
            } else if inside(cur - step) {
                cur - step
            } else {
                cur
            };
            ParamValue::Float(next)
        }
    }
}
