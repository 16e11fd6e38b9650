//! Combination of the unmasked sum into the result of a round.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CombineError {
    #[error("no contributions to combine")]
    NoContributions,
    #[error("the summed weight {0} is not positive")]
    InvalidWeight(f64),
    #[error("expected at least {expected} element(s) but got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Turns the decoded sum of the contributions into the result of the round.
pub trait Combiner: fmt::Debug + Send + Sync {
    /// The number of elements each update carries beyond the model itself.
    fn extra_elements(&self) -> usize {
        0
    }

    fn combine(&self, sum: Vec<f64>, contributors: usize) -> Result<Vec<f64>, CombineError>;
}

/// The arithmetic mean of the contributions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mean;

impl Combiner for Mean {
    fn combine(&self, sum: Vec<f64>, contributors: usize) -> Result<Vec<f64>, CombineError> {
        if contributors == 0 {
            return Err(CombineError::NoContributions);
        }
        let n = contributors as f64;
        Ok(sum.into_iter().map(|value| value / n).collect())
    }
}

/// The plain sum of the contributions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Combiner for Sum {
    fn combine(&self, sum: Vec<f64>, contributors: usize) -> Result<Vec<f64>, CombineError> {
        if contributors == 0 {
            return Err(CombineError::NoContributions);
        }
        Ok(sum)
    }
}

/// The weighted mean of the contributions.
///
/// A participant with weight `w` (e.g. its number of training samples) submits `w * update`
/// followed by `w` itself. The result is the summed scaled updates divided by the summed weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedMean;

impl Combiner for WeightedMean {
    fn extra_elements(&self) -> usize {
        1
    }

    fn combine(&self, mut sum: Vec<f64>, contributors: usize) -> Result<Vec<f64>, CombineError> {
        if contributors == 0 {
            return Err(CombineError::NoContributions);
        }
        let weight = sum.pop().ok_or(CombineError::LengthMismatch {
            expected: 1,
            actual: 0,
        })?;
        if weight <= 0. {
            return Err(CombineError::InvalidWeight(weight));
        }
        Ok(sum.into_iter().map(|value| value / weight).collect())
    }
}

/// The configurable combination kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combination {
    #[default]
    Mean,
    Sum,
    WeightedMean,
}

impl Combination {
    pub fn combiner(self) -> Box<dyn Combiner> {
        match self {
            Combination::Mean => Box::new(Mean),
            Combination::Sum => Box::new(Sum),
            Combination::WeightedMean => Box::new(WeightedMean),
        }
    }
}
