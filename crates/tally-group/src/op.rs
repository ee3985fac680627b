//! Reduction operators: builtins plus registered custom record merges.
//!
//! A reduction folds one buffer per participant into a single buffer.
//! Builtin operators work element-wise. A custom operator merges fixed-width
//! records of reals (e.g. the 7-field statistics tuple) and must be
//! associative and commutative, since the transport picks the fold order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GroupError;

/// Handle of a registered custom operator.
///
/// Handles are assigned sequentially, so participants that register the same
/// operators in the same order agree on them without communicating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(pub u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Reduction operation for reduce/all-reduce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Prod,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// A registered record merge.
    Custom(OpId),
}

/// Merge function of a custom operator: folds `input` into `inout`.
///
/// Both slices hold the same whole number of records.
pub type MergeFn = dyn Fn(&[f64], &mut [f64]) + Send + Sync;

/// A user-defined merge over records of `width` reals.
#[derive(Clone)]
pub struct CustomOp {
    width: usize,
    merge: Arc<MergeFn>,
}

impl CustomOp {
    /// Create a custom operator over `width`-element records.
    pub fn new<F>(width: usize, merge: F) -> Self
    where
        F: Fn(&[f64], &mut [f64]) + Send + Sync + 'static,
    {
        assert!(width > 0, "custom reduction records must have at least one element");
        Self {
            width,
            merge: Arc::new(merge),
        }
    }

    /// Number of reals per record.
    pub fn width(&self) -> usize {
        self.width
    }

    fn apply(&self, input: &[f64], inout: &mut [f64]) {
        (self.merge)(input, inout);
    }
}

impl fmt::Debug for CustomOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomOp").field("width", &self.width).finish_non_exhaustive()
    }
}

/// Table of custom operators known to one participant.
#[derive(Debug, Default)]
pub struct OpRegistry {
    ops: HashMap<OpId, CustomOp>,
    next: u32,
}

impl OpRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator and return its handle.
    pub fn register(&mut self, op: CustomOp) -> OpId {
        let id = OpId(self.next);
        self.next += 1;
        self.ops.insert(id, op);
        id
    }

    /// Remove an operator. Returns it if it was registered.
    pub fn free(&mut self, id: OpId) -> Option<CustomOp> {
        self.ops.remove(&id)
    }

    /// Look up a custom operator.
    pub fn get(&self, id: OpId) -> Option<&CustomOp> {
        self.ops.get(&id)
    }

    /// Number of live custom operators.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no custom operator is registered.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Check that `op` is known and that `len` elements split into whole records.
    pub fn validate(&self, op: ReduceOp, len: usize) -> Result<(), GroupError> {
        if let ReduceOp::Custom(id) = op {
            let custom = self.get(id).ok_or(GroupError::UnknownOp(id))?;
            if len % custom.width() != 0 {
                return Err(GroupError::Misaligned {
                    op: id,
                    width: custom.width(),
                    len,
                });
            }
        }
        Ok(())
    }

    /// Fold `input` into `inout` with `op`.
    pub fn combine(&self, op: ReduceOp, input: &[f64], inout: &mut [f64]) -> Result<(), GroupError> {
        debug_assert_eq!(input.len(), inout.len());
        self.validate(op, inout.len())?;

        match op {
            ReduceOp::Sum => {
                for (r, x) in inout.iter_mut().zip(input) {
                    *r += x;
                }
            }
            ReduceOp::Prod => {
                for (r, x) in inout.iter_mut().zip(input) {
                    *r *= x;
                }
            }
            ReduceOp::Min => {
                for (r, x) in inout.iter_mut().zip(input) {
                    *r = r.min(*x);
                }
            }
            ReduceOp::Max => {
                for (r, x) in inout.iter_mut().zip(input) {
                    *r = r.max(*x);
                }
            }
            ReduceOp::Custom(id) => {
                let custom = self.get(id).ok_or(GroupError::UnknownOp(id))?;
                custom.apply(input, inout);
            }
        }
        Ok(())
    }

    /// Reduce one buffer per participant into one buffer.
    ///
    /// Contributions are folded in slice (rank) order, so the result is
    /// reproducible bit for bit. All buffers must have the same length.
    pub fn reduce(&self, op: ReduceOp, contributions: &[Vec<f64>]) -> Result<Vec<f64>, GroupError> {
        let Some((first, rest)) = contributions.split_first() else {
            return Ok(Vec::new());
        };
        self.validate(op, first.len())?;

        let mut result = first.clone();
        for contribution in rest {
            if contribution.len() != result.len() {
                return Err(GroupError::Collective(format!(
                    "reduce buffers differ in length: {} vs {}",
                    contribution.len(),
                    result.len()
                )));
            }
            self.combine(op, contribution, &mut result)?;
        }
        Ok(result)
    }
}
