//! Search-space schema: the bounded set of parameter values a candidate may
//! take. Loaded from `[search_space]` in `crucible.toml`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::candidate::Candidate;
use crate::domain::error::{CrucibleError, Result};

/// One parameter value. Untagged so configs read naturally
/// (`values = [8, 16, 32]`, `values = ["q4", "q8"]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl ParamValue {
    /// Numeric view, used for range checks and mutation.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Text(s) => write!(f, "{s}"),
            ParamValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Parameter assignment of one candidate.
pub type Params = BTreeMap<String, ParamValue>;

/// Declared domain of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamSpec {
    /// Enumerated values.
    Choice { values: Vec<ParamValue> },
    /// Inclusive integer range.
    IntRange { min: i64, max: i64 },
    /// Inclusive float range. Integer values are accepted.
    FloatRange { min: f64, max: f64 },
}

impl ParamSpec {
    fn check_declaration(&self, name: &str) -> Result<()> {
        let bad = |why: String| -> Result<()> {
            Err(CrucibleError::InvalidConfig(format!(
                "search_space.{name}: {why}"
            )))
        };
        match self {
            ParamSpec::Choice { values } if values.is_empty() => bad("empty choice list".into()),
            ParamSpec::Choice { values } => {
                if values
                    .iter()
                    .any(|v| matches!(v, ParamValue::Float(f) if !f.is_finite()))
                {
                    return bad("non-finite choice".into());
                }
                Ok(())
            }
            ParamSpec::IntRange { min, max } if min > max => {
                bad(format!("inverted range {min}..={max}"))
            }
            ParamSpec::FloatRange { min, max } if !min.is_finite() || !max.is_finite() => {
                bad("non-finite bound".into())
            }
            ParamSpec::FloatRange { min, max } if min > max => {
                bad(format!("inverted range {min}..={max}"))
            }
            _ => Ok(()),
        }
    }

    /// Why `value` falls outside this domain, or `None` if it is inside.
    pub fn violation(&self, value: &ParamValue) -> Option<String> {
        match (self, value) {
            (ParamSpec::Choice { values }, v) => {
                (!values.contains(v)).then(|| format!("{v} is not one of the declared choices"))
            }
            (ParamSpec::IntRange { min, max }, ParamValue::Int(i)) => {
                if i < min {
                    Some(format!("{i} below min {min}"))
                } else if i > max {
                    Some(format!("{i} above max {max}"))
                } else {
                    None
                }
            }
            (ParamSpec::FloatRange { min, max }, v @ (ParamValue::Int(_) | ParamValue::Float(_))) => {
                let x = v.as_f64().unwrap_or(f64::NAN);
                if !x.is_finite() {
                    Some(format!("{v} is not finite"))
                } else if x < *min {
                    Some(format!("{v} below min {min}"))
                } else if x > *max {
                    Some(format!("{v} above max {max}"))
                } else {
                    None
                }
            }
            (ParamSpec::IntRange { .. }, v) => Some(format!("{v} is not an integer")),
            (ParamSpec::FloatRange { .. }, v) => Some(format!("{v} is not numeric")),
        }
    }
}

/// Mapping of parameter name to its declared domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    params: BTreeMap<String, ParamSpec>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, spec: ParamSpec) -> Self {
        self.params.insert(name.to_string(), spec);
        self
    }

    pub fn params(&self) -> &BTreeMap<String, ParamSpec> {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Reject malformed declarations at load time.
    pub fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(CrucibleError::InvalidConfig(
                "search_space declares no parameters".to_string(),
            ));
        }
        for (name, spec) in &self.params {
            spec.check_declaration(name)?;
        }
        Ok(())
    }

    /// Check that `candidate` assigns every declared parameter, nothing
    /// else, and only in-bounds values. Never clamps.
    pub fn validate_candidate(&self, candidate: &Candidate) -> Result<()> {
        let reject = |reason: String| CrucibleError::InvalidCandidate {
            candidate_id: candidate.id.to_string(),
            reason,
        };

        for (name, spec) in &self.params {
            let value = candidate
                .params
                .get(name)
                .ok_or_else(|| reject(format!("missing parameter {name}")))?;
            if let Some(why) = spec.violation(value) {
                return Err(reject(format!("{name}: {why}")));
            }
        }
        if let Some(extra) = candidate
            .params
            .keys()
            .find(|k| !self.params.contains_key(k.as_str()))
        {
            return Err(reject(format!("undeclared parameter {extra}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candidate::{Candidate, CandidateOrigin};
    use chrono::Utc;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .with("batch", ParamSpec::IntRange { min: 1, max: 256 })
            .with("ratio", ParamSpec::FloatRange { min: 0.1, max: 0.9 })
            .with(
                "quant",
                ParamSpec::Choice {
                    values: vec![
                        ParamValue::Text("q4".into()),
                        ParamValue::Text("q8".into()),
                    ],
                },
            )
    }

    fn candidate(batch: i64, ratio: ParamValue, quant: &str) -> Candidate {
        let mut params = Params::new();
        params.insert("batch".into(), ParamValue::Int(batch));
        params.insert("ratio".into(), ratio);
        params.insert("quant".into(), ParamValue::Text(quant.into()));
        Candidate::new(params, 0, None, CandidateOrigin::Random, Utc::now())
    }

    #[test]
    fn in_bounds_candidate_passes() {
        let c = candidate(64, ParamValue::Float(0.5), "q4");
        space().validate_candidate(&c).unwrap();
    }

    #[test]
    fn above_max_is_rejected_not_clamped() {
        let c = candidate(512, ParamValue::Float(0.5), "q4");
        let err = space().validate_candidate(&c).unwrap_err();
        assert!(err.to_string().contains("above max 256"), "{err}");
        assert_eq!(c.params["batch"], ParamValue::Int(512));
    }

    #[test]
    fn float_range_accepts_int_and_rejects_text() {
        let spec = ParamSpec::FloatRange { min: 0.0, max: 2.0 };
        assert!(spec.violation(&ParamValue::Int(1)).is_none());
        assert!(spec.violation(&ParamValue::Text("1".into())).is_some());
        assert!(spec.violation(&ParamValue::Float(f64::NAN)).is_some());
    }

    #[test]
    fn unknown_choice_and_extra_param_rejected() {
        let c = candidate(8, ParamValue::Float(0.5), "q16");
        assert!(space().validate_candidate(&c).is_err());

        let mut c = candidate(8, ParamValue::Float(0.5), "q8");
        c.params.insert("bogus".into(), ParamValue::Bool(true));
        let err = space().validate_candidate(&c).unwrap_err();
        assert!(err.to_string().contains("undeclared"));
    }

    #[test]
    fn declarations_are_validated() {
        assert!(SearchSpace::new().validate().is_err());
        let inverted = SearchSpace::new().with("x", ParamSpec::IntRange { min: 5, max: 1 });
        assert!(inverted.validate().is_err());
        let empty = SearchSpace::new().with("x", ParamSpec::Choice { values: vec![] });
        assert!(empty.validate().is_err());
        space().validate().unwrap();
    }

    #[test]
    fn toml_declaration_parses() {
        let raw = r#"
            [batch]
            kind = "int_range"
            min = 1
            max = 64

            [quant]
            kind = "choice"
            values = ["q4", "q8"]

            [ratio]
            kind = "float_range"
            min = 0.25
            max = 0.75
        "#;
        let space: SearchSpace = toml::from_str(raw).unwrap();
        assert_eq!(space.len(), 3);
        assert_eq!(
            space.get("quant"),
            Some(&ParamSpec::Choice {
                values: vec![ParamValue::Text("q4".into()), ParamValue::Text("q8".into())]
            })
        );
    }
}
