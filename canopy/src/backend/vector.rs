// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pattern-blocked CPU engine, registered as the SSE resource.
//!
//! Identical semantics to the scalar engine; only the partials/partials
//! peel differs. Patterns are processed four at a time with independent
//! accumulator pairs so each transition-matrix row is loaded once per
//! block and the loops stay branch-free for the auto-vectorizer. The
//! compact-tip peels are already column lookups and stay scalar.
//!
//! Agreement with the scalar engine is bit-exact: both evaluate the same
//! sums in the same association order per pattern.

use crate::buffers::BufferPool;
use crate::error::Result;
use crate::ops::Operation;
use crate::sizing::InstanceSizing;

use super::{cpu, Backend, EdgeArgs};

const BLOCK: usize = 4;

/// The pattern-blocked CPU backend.
pub(crate) struct VectorBackend {
    sizing: InstanceSizing,
    pool: BufferPool,
}

impl VectorBackend {
    /// Allocate the pool for `sizing`.
    pub(crate) fn create(sizing: InstanceSizing) -> Result<Self> {
        Ok(Self {
            pool: BufferPool::allocate(&sizing)?,
            sizing,
        })
    }
}

impl Backend for VectorBackend {
    fn set_partials(&mut self, index: usize, values: &[f64]) -> Result<()> {
        self.pool.partials[index].copy_from_slice(values);
        Ok(())
    }

    fn get_partials(&mut self, index: usize, out: &mut [f64]) -> Result<()> {
        out.copy_from_slice(&self.pool.partials[index]);
        Ok(())
    }

    fn set_tip_states(&mut self, tip_index: usize, states: &[u32]) -> Result<()> {
        self.pool.tip_states[tip_index] = Some(states.to_vec());
        Ok(())
    }

    fn set_eigen_decomposition(
        &mut self,
        index: usize,
        vectors: &[f64],
        inverse: &[f64],
        values: &[f64],
    ) -> Result<()> {
        let eigen = &mut self.pool.eigens[index];
        eigen.vectors.copy_from_slice(vectors);
        eigen.inverse.copy_from_slice(inverse);
        eigen.values.copy_from_slice(values);
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        self.pool.rates.copy_from_slice(rates);
        Ok(())
    }

    fn set_transition_matrix(&mut self, index: usize, matrix: &[f64]) -> Result<()> {
        self.pool.matrices[index].copy_from_slice(matrix);
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        prob_indices: &[usize],
        d1_indices: Option<&[usize]>,
        d2_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        cpu::update_transition_matrices(
            &mut self.pool,
            &self.sizing,
            eigen_index,
            prob_indices,
            d1_indices,
            d2_indices,
            edge_lengths,
        )
    }

    fn update_partials(&mut self, operations: &[Operation], rescale: bool) -> Result<()> {
        for op in operations {
            self.peel(op);
            cpu::finish_operation(&mut self.pool, &self.sizing, op, rescale);
        }
        Ok(())
    }

    fn wait_for_partials(&mut self, _destinations: &[usize]) -> Result<()> {
        Ok(())
    }

    fn root_log_likelihoods(
        &mut self,
        root_indices: &[usize],
        weights: &[f64],
        frequencies: &[f64],
        scaling_indices: &[usize],
        scaling_counts: &[usize],
        out: &mut [f64],
    ) -> Result<()> {
        cpu::root_log_likelihoods(
            &self.pool,
            &self.sizing,
            root_indices,
            weights,
            frequencies,
            scaling_indices,
            scaling_counts,
            out,
        )
    }

    fn edge_log_likelihoods(
        &mut self,
        args: &EdgeArgs<'_>,
        out_log_likelihoods: &mut [f64],
        out_first_derivatives: Option<&mut [f64]>,
        out_second_derivatives: Option<&mut [f64]>,
    ) -> Result<()> {
        cpu::edge_log_likelihoods(
            &self.pool,
            &self.sizing,
            args,
            out_log_likelihoods,
            out_first_derivatives,
            out_second_derivatives,
        )
    }
}

impl VectorBackend {
    fn peel(&mut self, op: &Operation) {
        let both_partials = cpu::tip_states_for(&self.pool, &self.sizing, op.child1).is_none()
            && cpu::tip_states_for(&self.pool, &self.sizing, op.child2).is_none();
        if both_partials {
            self.peel_partials_blocked(op);
        } else {
            cpu::peel_scalar(&mut self.pool, &self.sizing, op);
        }
    }

    fn peel_partials_blocked(&mut self, op: &Operation) {
        let s = self.sizing.state_count;
        let pc = self.sizing.pattern_count;
        let cc = self.sizing.category_count;

        let BufferPool {
            partials,
            matrices,
            scratch,
            ..
        } = &mut self.pool;
        let p1 = &partials[op.child1];
        let p2 = &partials[op.child2];
        let m1 = &matrices[op.child1_matrix];
        let m2 = &matrices[op.child2_matrix];

        for c in 0..cc {
            let m1c = &m1[c * s * s..(c + 1) * s * s];
            let m2c = &m2[c * s * s..(c + 1) * s * s];
            let mut p = 0;
            while p + BLOCK <= pc {
                let base = (c * pc + p) * s;
                for si in 0..s {
                    let row1 = &m1c[si * s..(si + 1) * s];
                    let row2 = &m2c[si * s..(si + 1) * s];
                    let mut sum1 = [0.0_f64; BLOCK];
                    let mut sum2 = [0.0_f64; BLOCK];
                    for sj in 0..s {
                        let a = row1[sj];
                        let b = row2[sj];
                        for lane in 0..BLOCK {
                            let v = base + lane * s + sj;
                            sum1[lane] += a * p1[v];
                            sum2[lane] += b * p2[v];
                        }
                    }
                    for lane in 0..BLOCK {
                        scratch[base + lane * s + si] = sum1[lane] * sum2[lane];
                    }
                }
                p += BLOCK;
            }
            // Pattern tail, scalar.
            while p < pc {
                let off = (c * pc + p) * s;
                for si in 0..s {
                    let row1 = &m1c[si * s..(si + 1) * s];
                    let row2 = &m2c[si * s..(si + 1) * s];
                    let mut sum1 = 0.0;
                    let mut sum2 = 0.0;
                    for sj in 0..s {
                        sum1 += row1[sj] * p1[off + sj];
                        sum2 += row2[sj] * p2[off + sj];
                    }
                    scratch[off + si] = sum1 * sum2;
                }
                p += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sizing() -> InstanceSizing {
        InstanceSizing {
            state_count: 4,
            // Exercise a full block plus a tail.
            pattern_count: 6,
            category_count: 2,
            tip_count: 2,
            partials_buffer_count: 4,
            compact_buffer_count: 2,
            eigen_buffer_count: 1,
            matrix_buffer_count: 2,
        }
    }

    fn jc_eigen() -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        (
            vec![
                1.0, 2.0, 0.0, 0.5, //
                1.0, -2.0, 0.5, 0.0, //
                1.0, 2.0, 0.0, -0.5, //
                1.0, -2.0, -0.5, 0.0,
            ],
            vec![
                0.25, 0.25, 0.25, 0.25, //
                0.125, -0.125, 0.125, -0.125, //
                0.0, 1.0, 0.0, -1.0, //
                1.0, 0.0, -1.0, 0.0,
            ],
            vec![0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0],
        )
    }

    /// Deterministic quasi-random partials, strictly positive.
    fn synth_partials(len: usize, seed: u64) -> Vec<f64> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                f64::from((state >> 33) as u32) / f64::from(u32::MAX) + 1.0e-3
            })
            .collect()
    }

    #[test]
    fn blocked_peel_matches_scalar_bit_exact() {
        let sz = sizing();
        let (u, inv, lam) = jc_eigen();
        let len = sz.partials_len();
        let a = synth_partials(len, 11);
        let b = synth_partials(len, 23);
        let op = Operation {
            destination: 3,
            dest_scaling: 3,
            child1: 0,
            child1_matrix: 0,
            child2: 1,
            child2_matrix: 1,
        };

        let mut scalar = cpu::CpuBackend::create(sz).unwrap();
        let mut blocked = VectorBackend::create(sz).unwrap();

        for run in [
            &mut scalar as &mut dyn Backend,
            &mut blocked as &mut dyn Backend,
        ] {
            run.set_eigen_decomposition(0, &u, &inv, &lam).unwrap();
            run.set_category_rates(&[0.5, 1.7]).unwrap();
            run.update_transition_matrices(0, &[0, 1], None, None, &[0.12, 0.31])
                .unwrap();
            // Indices >= tip count, so both children peel as partials.
            run.set_partials(2, &a).unwrap();
            run.set_partials(3, &b).unwrap();
        }
        let op = Operation {
            child1: 2,
            child2: 3,
            destination: 3,
            ..op
        };
        scalar.update_partials(&[op], false).unwrap();
        blocked.update_partials(&[op], false).unwrap();

        let mut out_scalar = vec![0.0; len];
        let mut out_blocked = vec![0.0; len];
        scalar.get_partials(3, &mut out_scalar).unwrap();
        blocked.get_partials(3, &mut out_blocked).unwrap();
        for (x, y) in out_scalar.iter().zip(&out_blocked) {
            assert_eq!(x.to_bits(), y.to_bits(), "scalar {x} vs blocked {y}");
        }
    }

    #[test]
    fn compact_children_fall_back_to_scalar_path() {
        let sz = sizing();
        let (u, inv, lam) = jc_eigen();
        let mut backend = VectorBackend::create(sz).unwrap();
        backend.set_eigen_decomposition(0, &u, &inv, &lam).unwrap();
        backend
            .update_transition_matrices(0, &[0, 1], None, None, &[0.1, 0.2])
            .unwrap();
        backend.set_tip_states(0, &[0, 1, 2, 3, 4, 0]).unwrap();
        backend.set_tip_states(1, &[3, 2, 1, 0, 4, 4]).unwrap();
        let op = Operation {
            destination: 2,
            dest_scaling: 3,
            child1: 0,
            child1_matrix: 0,
            child2: 1,
            child2_matrix: 1,
        };
        backend.update_partials(&[op], false).unwrap();
        let mut out = vec![0.0; sz.partials_len()];
        backend.get_partials(2, &mut out).unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
        assert!(out.iter().any(|&v| v > 0.0));
    }
}
