// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partials-update operation lists.
//!
//! A peel pass is submitted as a flat list of integer 6-tuples
//! `(dest, destScaling, child1, child1Matrix, child2, child2Matrix)`.
//! Within one list, an operation's inputs are either pre-existing buffers
//! or the destination of an earlier operation; every backend executes the
//! list in submission order, which satisfies that dependency rule without
//! further analysis.

use crate::error::{Error, Result};
use crate::sizing::InstanceSizing;

/// Number of integers per operation tuple.
pub const OPERATION_WIDTH: usize = 6;

/// One validated peeling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    /// Destination partials buffer.
    pub destination: usize,
    /// Scaling-factor buffer receiving this node's log scaler.
    pub dest_scaling: usize,
    /// First child partials (or compact tip) buffer.
    pub child1: usize,
    /// Transition matrix for the first child's edge.
    pub child1_matrix: usize,
    /// Second child partials (or compact tip) buffer.
    pub child2: usize,
    /// Transition matrix for the second child's edge.
    pub child2_matrix: usize,
}

/// Decode and validate a flat operation list against an instance sizing.
///
/// `rescale` adds the `destScaling > tipCount` constraint; with rescaling
/// off the scaling slot is ignored and only range-checked when
/// non-negative.
///
/// # Errors
///
/// [`Error::OutOfRange`] when the list length is not a multiple of six or
/// any index falls outside the instance's buffer counts.
pub fn decode(flat: &[i32], sizing: &InstanceSizing, rescale: bool) -> Result<Vec<Operation>> {
    if flat.len() % OPERATION_WIDTH != 0 {
        return Err(Error::OutOfRange(format!(
            "operation list length {} is not a multiple of {OPERATION_WIDTH}",
            flat.len()
        )));
    }
    let mut ops = Vec::with_capacity(flat.len() / OPERATION_WIDTH);
    for tuple in flat.chunks_exact(OPERATION_WIDTH) {
        let destination = partials_index(tuple[0], "destination", sizing)?;
        let child1 = partials_index(tuple[2], "child1", sizing)?;
        let child1_matrix = matrix_index(tuple[3], "child1 matrix", sizing)?;
        let child2 = partials_index(tuple[4], "child2", sizing)?;
        let child2_matrix = matrix_index(tuple[5], "child2 matrix", sizing)?;
        let dest_scaling = if rescale {
            let idx = partials_index(tuple[1], "destination scaling", sizing)?;
            if idx <= sizing.tip_count {
                return Err(Error::OutOfRange(format!(
                    "destination scaling index {idx} must exceed tip count {}",
                    sizing.tip_count
                )));
            }
            idx
        } else {
            // Ignored without rescaling; clamp into range so backends can
            // bind the slot unconditionally.
            usize::try_from(tuple[1])
                .ok()
                .filter(|&idx| idx < sizing.partials_buffer_count)
                .unwrap_or(0)
        };
        ops.push(Operation {
            destination,
            dest_scaling,
            child1,
            child1_matrix,
            child2,
            child2_matrix,
        });
    }
    Ok(ops)
}

fn partials_index(raw: i32, what: &str, sizing: &InstanceSizing) -> Result<usize> {
    let idx = usize::try_from(raw)
        .map_err(|_| Error::OutOfRange(format!("{what} index {raw} is negative")))?;
    if idx >= sizing.partials_buffer_count {
        return Err(Error::OutOfRange(format!(
            "{what} index {idx} >= partials buffer count {}",
            sizing.partials_buffer_count
        )));
    }
    Ok(idx)
}

fn matrix_index(raw: i32, what: &str, sizing: &InstanceSizing) -> Result<usize> {
    let idx = usize::try_from(raw)
        .map_err(|_| Error::OutOfRange(format!("{what} index {raw} is negative")))?;
    if idx >= sizing.matrix_buffer_count {
        return Err(Error::OutOfRange(format!(
            "{what} index {idx} >= matrix buffer count {}",
            sizing.matrix_buffer_count
        )));
    }
    Ok(idx)
}
