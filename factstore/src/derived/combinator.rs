use crate::StoreError;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Row-wise function combining the input values of a derived metric, in input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    /// `a - b`
    Difference,
    /// `a / b`
    Ratio,
    /// `a + b + ...`
    Sum,
}

impl Combinator {
    pub fn name(&self) -> &'static str {
        match self {
            Combinator::Difference => "difference",
            Combinator::Ratio => "ratio",
            Combinator::Sum => "sum",
        }
    }

    pub fn check_arity(&self, inputs: usize) -> Result<(), StoreError> {
        let ok = match self {
            Combinator::Difference | Combinator::Ratio => inputs == 2,
            Combinator::Sum => inputs >= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::config(format!("{} does not accept {} inputs", self.name(), inputs)))
        }
    }

    /// Non-finite results (division by zero, overflow) produce no value.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        let out = match (self, values) {
            (Combinator::Difference, [a, b]) => a - b,
            (Combinator::Ratio, [a, b]) => a / b,
            (Combinator::Sum, vs) if !vs.is_empty() => vs.iter().sum(),
            _ => return None,
        };
        out.is_finite().then_some(out)
    }
}

impl FromStr for Combinator {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "difference" | "diff" => Ok(Combinator::Difference),
            "ratio" => Ok(Combinator::Ratio),
            "sum" => Ok(Combinator::Sum),
            other => Err(StoreError::config(format!("unknown combining function `{other}`"))),
        }
    }
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
