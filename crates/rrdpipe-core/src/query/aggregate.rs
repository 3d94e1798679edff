//! Column statistics over exported rows. Unknown values are skipped.

use std::fmt;
use std::str::FromStr;

use crate::error::ReportingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Min,
    Mean,
    Max,
}

impl Aggregation {
    pub fn name(self) -> &'static str {
        match self {
            Aggregation::Min => "min",
            Aggregation::Mean => "mean",
            Aggregation::Max => "max",
        }
    }

    /// Parses every name, failing on the first unsupported one.
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<Aggregation>, ReportingError> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }

    /// One value per column; `None` where a column has no known value.
    pub fn apply<'a, I>(self, rows: I, columns: usize) -> Vec<Option<f64>>
    where
        I: IntoIterator<Item = &'a [Option<f64>]>,
    {
        let mut acc: Vec<Accumulator> = vec![Accumulator::default(); columns];
        for row in rows {
            for (slot, value) in acc.iter_mut().zip(row) {
                if let Some(v) = value.filter(|v| !v.is_nan()) {
                    slot.push(v);
                }
            }
        }
        acc.into_iter().map(|a| a.finish(self)).collect()
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Aggregation {
    type Err = ReportingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(Aggregation::Min),
            "mean" => Ok(Aggregation::Mean),
            "max" => Ok(Aggregation::Max),
            other => Err(ReportingError::InvalidAggregation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn push(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
    }

    fn finish(self, agg: Aggregation) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(match agg {
            Aggregation::Min => self.min,
            Aggregation::Mean => self.sum / self.count as f64,
            Aggregation::Max => self.max,
        })
    }
}
