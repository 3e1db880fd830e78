// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host-memory buffer pool for one instance.
//!
//! All storage is allocated up front at instance creation and lives until
//! finalization; kernels never allocate. Allocation goes through
//! `try_reserve_exact` so an unsatisfiable pool reports out-of-memory
//! instead of aborting the process, and a failed creation leaks no partial
//! state (the pool is only handed out once fully built).

use crate::error::{Error, Result};
use crate::sizing::InstanceSizing;

/// An eigen-decomposition triple `(U, U⁻¹, λ)` for `Q = U·diag(λ)·U⁻¹`.
#[derive(Debug, Clone)]
pub struct EigenDecomposition {
    /// Eigenvectors, `S×S` row-major.
    pub vectors: Vec<f64>,
    /// Inverse eigenvectors, `S×S` row-major.
    pub inverse: Vec<f64>,
    /// Eigenvalues, length `S`.
    pub values: Vec<f64>,
}

/// The buffer pool backing a CPU instance.
///
/// Partials and matrix buffers are zero-initialized and never tracked for
/// populated-ness: the engine computes what it is told to compute.
/// Compact tip states are the exception — peeling dispatches on whether a
/// tip has a state buffer set, so those slots start empty.
#[derive(Debug)]
pub struct BufferPool {
    /// Partial-likelihood buffers, each `S·P·C`.
    pub partials: Vec<Vec<f64>>,
    /// Compact tip-state buffers, each length `P`, keyed by tip index.
    pub tip_states: Vec<Option<Vec<u32>>>,
    /// Eigen-decomposition buffers.
    pub eigens: Vec<EigenDecomposition>,
    /// Transition-matrix buffers, each `S·S·C`.
    pub matrices: Vec<Vec<f64>>,
    /// Per-pattern log scaling factors, one buffer per partials buffer.
    pub scalers: Vec<Vec<f64>>,
    /// Category rate scalers, length `C`. Defaults to `1.0` everywhere.
    pub rates: Vec<f64>,
    /// Peel scratch, `S·P·C`; lets a destination alias one of its children.
    pub scratch: Vec<f64>,
}

impl BufferPool {
    /// Allocate every buffer for `sizing`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when any allocation cannot be satisfied.
    pub fn allocate(sizing: &InstanceSizing) -> Result<Self> {
        let partials_len = sizing.partials_len();
        let matrix_len = sizing.matrix_len();
        let eigen_len = sizing.eigen_matrix_len();

        let mut partials = Vec::new();
        for _ in 0..sizing.partials_buffer_count {
            partials.push(zeroed(partials_len)?);
        }
        let mut matrices = Vec::new();
        for _ in 0..sizing.matrix_buffer_count {
            matrices.push(zeroed(matrix_len)?);
        }
        let mut scalers = Vec::new();
        for _ in 0..sizing.partials_buffer_count {
            scalers.push(zeroed(sizing.pattern_count)?);
        }
        let mut eigens = Vec::new();
        for _ in 0..sizing.eigen_buffer_count {
            eigens.push(EigenDecomposition {
                vectors: zeroed(eigen_len)?,
                inverse: zeroed(eigen_len)?,
                values: zeroed(sizing.state_count)?,
            });
        }
        let tip_states = vec![None; sizing.compact_buffer_count];
        let mut rates = zeroed(sizing.category_count)?;
        rates.fill(1.0);
        let scratch = zeroed(partials_len)?;

        Ok(Self {
            partials,
            tip_states,
            eigens,
            matrices,
            scalers,
            rates,
            scratch,
        })
    }
}

fn zeroed(len: usize) -> Result<Vec<f64>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(format!("buffer of {len} f64 values")))?;
    v.resize(len, 0.0);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizing() -> InstanceSizing {
        InstanceSizing {
            state_count: 4,
            pattern_count: 3,
            category_count: 2,
            tip_count: 2,
            partials_buffer_count: 4,
            compact_buffer_count: 2,
            eigen_buffer_count: 1,
            matrix_buffer_count: 3,
        }
    }

    #[test]
    fn allocates_full_pool() {
        let pool = BufferPool::allocate(&sizing()).unwrap();
        assert_eq!(pool.partials.len(), 4);
        assert_eq!(pool.partials[0].len(), 4 * 3 * 2);
        assert_eq!(pool.matrices.len(), 3);
        assert_eq!(pool.matrices[0].len(), 4 * 4 * 2);
        assert_eq!(pool.scalers.len(), 4);
        assert_eq!(pool.scalers[0].len(), 3);
        assert_eq!(pool.eigens.len(), 1);
        assert_eq!(pool.eigens[0].vectors.len(), 16);
        assert_eq!(pool.scratch.len(), 4 * 3 * 2);
    }

    #[test]
    fn tip_states_start_unset() {
        let pool = BufferPool::allocate(&sizing()).unwrap();
        assert!(pool.tip_states.iter().all(Option::is_none));
    }

    #[test]
    fn rates_default_to_unity() {
        let pool = BufferPool::allocate(&sizing()).unwrap();
        assert!(pool.rates.iter().all(|&r| (r - 1.0).abs() < f64::EPSILON));
    }
}
