//! Masked vectors, their aggregation and the fixed point encoding of updates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A vector of elements of `Z_(2^64)`.
///
/// Updates are encoded with [`FixedPoint`] and masked into a `MaskObject`. Addition wraps, so
/// masks which cancel pairwise across the cohort leave the exact sum of the encoded updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskObject {
    pub data: Vec<u64>,
}

impl MaskObject {
    pub fn new(data: Vec<u64>) -> Self {
        Self { data }
    }

    /// Creates the neutral element of the given length.
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Adds another object element-wise.
    pub fn add_assign(&mut self, other: &MaskObject) {
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a = a.wrapping_add(*b);
        }
    }

    /// Subtracts another object element-wise.
    pub fn sub_assign(&mut self, other: &MaskObject) {
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a = a.wrapping_sub(*b);
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AggregationError {
    #[error("the object to aggregate has length {actual} but {expected} is required")]
    LengthMismatch { expected: usize, actual: usize },
}

/// The running sum of masked objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    nb_objects: usize,
    object: MaskObject,
}

impl Aggregation {
    /// Creates an empty aggregation of objects of the given length.
    pub fn new(len: usize) -> Self {
        Self {
            nb_objects: 0,
            object: MaskObject::zeroed(len),
        }
    }

    /// The number of aggregated objects.
    pub fn nb_objects(&self) -> usize {
        self.nb_objects
    }

    pub fn len(&self) -> usize {
        self.object.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object.is_empty()
    }

    pub fn validate_aggregation(&self, object: &MaskObject) -> Result<(), AggregationError> {
        if object.len() != self.object.len() {
            return Err(AggregationError::LengthMismatch {
                expected: self.object.len(),
                actual: object.len(),
            });
        }
        Ok(())
    }

    /// Adds an object. It must have been validated with
    /// [`validate_aggregation()`](Self::validate_aggregation).
    pub fn aggregate(&mut self, object: &MaskObject) {
        self.object.add_assign(object);
        self.nb_objects += 1;
    }

    pub fn object(&self) -> &MaskObject {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut MaskObject {
        &mut self.object
    }
}

impl From<Aggregation> for MaskObject {
    fn from(aggregation: Aggregation) -> Self {
        aggregation.object
    }
}

/// Fixed point encoding of real numbers into `Z_(2^64)`.
///
/// A value `x` is encoded as the two's complement of `round(x * 2^frac_bits)`. Sums stay exact as
/// long as the absolute value of the real sum stays below `2^(63 - frac_bits)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPoint {
    pub frac_bits: u32,
}

impl FixedPoint {
    pub fn new(frac_bits: u32) -> Self {
        Self { frac_bits }
    }

    fn scale(&self) -> f64 {
        (1_u64 << self.frac_bits) as f64
    }

    pub fn encode(&self, value: f64) -> u64 {
        ((value * self.scale()).round() as i64) as u64
    }

    pub fn decode(&self, value: u64) -> f64 {
        (value as i64) as f64 / self.scale()
    }

    pub fn encode_all(&self, values: &[f64]) -> MaskObject {
        MaskObject::new(values.iter().map(|value| self.encode(*value)).collect())
    }

    pub fn decode_all(&self, object: &MaskObject) -> Vec<f64> {
        object.data.iter().map(|value| self.decode(*value)).collect()
    }
}
