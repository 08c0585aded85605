//! Aggregation operators that merge per-site contributions.
//!
//! A contribution is a plain number, a numeric array, or an ordered list of further
//! contributions. [`SumUp`] adds contributions of identical shape element-wise and is
//! what makes `(XtX, Xty, nobs)` federation work. [`Intersect`] keeps the elements of the
//! first array that occur in every other array, in first-array order, each once; it is
//! defined for arrays only.

use ahash::AHashSet;
use ndarray::{Array, Array1, ArrayD, Dimension};
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("{operation} is not implemented for {kind} contributions.")]
    NotImplemented {
        operation: &'static str,
        kind: &'static str,
    },

    #[error("{operation} needs at least one contribution.")]
    Empty { operation: &'static str },

    #[error("Contribution {index} has shape {found:?}, expected {expected:?}.")]
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Contribution {index} is a list of {found} items, expected {expected}.")]
    LengthMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("Expected a {expected} contribution, found a {found}.")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    Scalar(f64),
    Array(ArrayD<f64>),
    List(Vec<Contribution>),
}

impl From<f64> for Contribution {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl<D: Dimension> From<Array<f64, D>> for Contribution {
    fn from(array: Array<f64, D>) -> Self {
        Self::Array(array.into_dyn())
    }
}

impl From<Vec<Contribution>> for Contribution {
    fn from(items: Vec<Contribution>) -> Self {
        Self::List(items)
    }
}

impl Contribution {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Array(_) => "array",
            Self::List(_) => "list",
        }
    }

    pub fn as_scalar(&self) -> Result<f64, AggregationError> {
        match self {
            Self::Scalar(value) => Ok(*value),
            other => Err(other.unexpected("scalar")),
        }
    }

    pub fn into_array(self) -> Result<ArrayD<f64>, AggregationError> {
        match self {
            Self::Array(array) => Ok(array),
            other => Err(other.unexpected("array")),
        }
    }

    pub fn into_list(self) -> Result<Vec<Contribution>, AggregationError> {
        match self {
            Self::List(items) => Ok(items),
            other => Err(other.unexpected("list")),
        }
    }

    fn unexpected(&self, expected: &'static str) -> AggregationError {
        AggregationError::UnexpectedKind {
            expected,
            found: self.kind(),
        }
    }
}

/// A rule for merging the contributions of every site into one value.
pub trait Aggregation {
    fn name(&self) -> &'static str;

    fn aggregate(&self, contributions: &[Contribution]) -> Result<Contribution, AggregationError>;
}

/// Element-wise sum of same-shaped contributions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumUp;

impl Aggregation for SumUp {
    fn name(&self) -> &'static str {
        "SumUp"
    }

    fn aggregate(&self, contributions: &[Contribution]) -> Result<Contribution, AggregationError> {
        let (first, rest) = contributions
            .split_first()
            .ok_or(AggregationError::Empty { operation: self.name() })?;

        match first {
            Contribution::Scalar(value) => {
                let mut total = *value;
                for other in rest {
                    total += match other {
                        Contribution::Scalar(v) => *v,
                        _ => return Err(mixed(self.name())),
                    };
                }
                Ok(Contribution::Scalar(total))
            }
            Contribution::Array(array) => {
                let mut total = array.clone();
                for (offset, other) in rest.iter().enumerate() {
                    let Contribution::Array(addend) = other else {
                        return Err(mixed(self.name()));
                    };
                    if addend.shape() != total.shape() {
                        return Err(AggregationError::ShapeMismatch {
                            index: offset + 1,
                            expected: total.shape().to_vec(),
                            found: addend.shape().to_vec(),
                        });
                    }
                    total += addend;
                }
                Ok(Contribution::Array(total))
            }
            Contribution::List(items) => {
                let mut columns: Vec<Vec<Contribution>> =
                    items.iter().map(|item| vec![item.clone()]).collect();
                for (offset, other) in rest.iter().enumerate() {
                    let Contribution::List(others) = other else {
                        return Err(mixed(self.name()));
                    };
                    if others.len() != items.len() {
                        return Err(AggregationError::LengthMismatch {
                            index: offset + 1,
                            expected: items.len(),
                            found: others.len(),
                        });
                    }
                    for (column, item) in columns.iter_mut().zip(others) {
                        column.push(item.clone());
                    }
                }
                let summed = columns
                    .iter()
                    .map(|column| self.aggregate(column))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Contribution::List(summed))
            }
        }
    }
}

fn mixed(operation: &'static str) -> AggregationError {
    AggregationError::NotImplemented {
        operation,
        kind: "mixed",
    }
}

/// Ordered intersection of numeric arrays.
///
/// Multi-dimensional arrays are read in logical (row-major) order. Zero and negative
/// zero are the same element; NaN matches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Intersect;

fn element_key(value: f64) -> Option<u64> {
    if value.is_nan() {
        None
    } else if value == 0.0 {
        Some(0)
    } else {
        Some(value.to_bits())
    }
}

impl Aggregation for Intersect {
    fn name(&self) -> &'static str {
        "Intersect"
    }

    fn aggregate(&self, contributions: &[Contribution]) -> Result<Contribution, AggregationError> {
        if contributions.is_empty() {
            return Err(AggregationError::Empty { operation: self.name() });
        }
        let mut arrays = Vec::with_capacity(contributions.len());
        for contribution in contributions {
            match contribution {
                Contribution::Array(array) => arrays.push(array),
                other => {
                    return Err(AggregationError::NotImplemented {
                        operation: self.name(),
                        kind: other.kind(),
                    });
                }
            }
        }

        let (first, rest) = (arrays[0], &arrays[1..]);
        let others: Vec<AHashSet<u64>> = rest
            .iter()
            .map(|array| array.iter().filter_map(|&v| element_key(v)).collect())
            .collect();

        let mut seen = AHashSet::new();
        let kept: Vec<f64> = first
            .iter()
            .copied()
            .filter(|&value| match element_key(value) {
                Some(key) => others.iter().all(|set| set.contains(&key)) && seen.insert(key),
                None => false,
            })
            .collect();

        Ok(Contribution::Array(Array1::from(kept).into_dyn()))
    }
}

/// Ordered intersection over any hashable identifiers, under the same contract as
/// [`Intersect`]: first-list order, first occurrence only.
pub fn intersect_ordered<T, S>(lists: &[S]) -> Vec<T>
where
    T: Eq + Hash + Clone,
    S: AsRef<[T]>,
{
    let Some((first, rest)) = lists.split_first() else {
        return Vec::new();
    };
    let others: Vec<AHashSet<&T>> = rest
        .iter()
        .map(|list| list.as_ref().iter().collect())
        .collect();

    let mut seen = AHashSet::new();
    first
        .as_ref()
        .iter()
        .filter(|item| others.iter().all(|set| set.contains(item)) && seen.insert(*item))
        .cloned()
        .collect()
}
