// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scalar double-precision CPU engine.
//!
//! Reference realization of the four kernels; the vectorized and GPU
//! engines must agree with it to within their documented tolerances.
//! Peeling carries the three child-representation specializations
//! (states/states, states/partials, partials/partials) — compact tips are
//! a single matrix-column lookup per state instead of a dot product, which
//! is the whole point of the compact representation.
//!
//! # References
//!
//! - Felsenstein 1981, *J Mol Evol* 17:368-376 (pruning recursion)
//! - Yang 1994, *J Mol Evol* 39:306-314 (discrete gamma rate categories)

use crate::buffers::BufferPool;
use crate::error::Result;
use crate::ops::Operation;
use crate::sizing::InstanceSizing;

use super::{Backend, EdgeArgs};

/// Exponent saturation bound, just under `ln(f64::MAX)`.
///
/// Extreme `λ·t·r` products stay finite; for a proper rate matrix the
/// `λ = 0` mode then dominates and the matrix converges to the stationary
/// distribution.
const MAX_EXP_ARG: f64 = 709.0;

/// The scalar CPU backend: a host buffer pool plus the reference kernels.
pub(crate) struct CpuBackend {
    sizing: InstanceSizing,
    pool: BufferPool,
}

impl CpuBackend {
    /// Allocate the pool for `sizing`.
    pub(crate) fn create(sizing: InstanceSizing) -> Result<Self> {
        Ok(Self {
            pool: BufferPool::allocate(&sizing)?,
            sizing,
        })
    }
}

impl Backend for CpuBackend {
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
        update_transition_matrices(
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
            peel_scalar(&mut self.pool, &self.sizing, op);
            finish_operation(&mut self.pool, &self.sizing, op, rescale);
        }
        Ok(())
    }

    fn wait_for_partials(&mut self, _destinations: &[usize]) -> Result<()> {
        // Synchronous engine: every prior call has completed.
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
        root_log_likelihoods(
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
        edge_log_likelihoods(
            &self.pool,
            &self.sizing,
            args,
            out_log_likelihoods,
            out_first_derivatives,
            out_second_derivatives,
        )
    }
}

// ─── Shared scalar kernels ──────────────────────────────────────────
//
// Free functions over (pool, sizing) so the vectorized engine can reuse
// everything it does not specialize.

/// Compute `M_i[c] = U·diag(exp(λ·t_i·r_c))·U⁻¹` for every requested
/// matrix, plus first/second derivatives when index lists are given.
///
/// The per-category exponentials are computed once and shared between the
/// probability matrix and its derivatives (`d/dt` scales mode `k` by
/// `λ_k·r_c`, `d²/dt²` by its square).
pub(crate) fn update_transition_matrices(
    pool: &mut BufferPool,
    sizing: &InstanceSizing,
    eigen_index: usize,
    prob_indices: &[usize],
    d1_indices: Option<&[usize]>,
    d2_indices: Option<&[usize]>,
    edge_lengths: &[f64],
) -> Result<()> {
    let s = sizing.state_count;
    let cc = sizing.category_count;
    let block = s * s;

    let mut exps = vec![0.0_f64; s];
    let mut diag = vec![0.0_f64; s];

    for (i, &t) in edge_lengths.iter().enumerate() {
        for c in 0..cc {
            let rate = pool.rates[c];
            let distance = t * rate;
            for k in 0..s {
                exps[k] = saturated_exp(pool.eigens[eigen_index].values[k] * distance);
            }

            let offset = c * block;
            assemble_matrix(pool, eigen_index, prob_indices[i], offset, &exps, s);

            if let Some(d1) = d1_indices {
                for k in 0..s {
                    diag[k] = pool.eigens[eigen_index].values[k] * rate * exps[k];
                }
                assemble_matrix(pool, eigen_index, d1[i], offset, &diag, s);
            }
            if let Some(d2) = d2_indices {
                for k in 0..s {
                    let factor = pool.eigens[eigen_index].values[k] * rate;
                    diag[k] = factor * factor * exps[k];
                }
                assemble_matrix(pool, eigen_index, d2[i], offset, &diag, s);
            }
        }
    }
    Ok(())
}

/// `dest[si,sj] = Σ_k U[si,k]·diag[k]·U⁻¹[k,sj]` into one category slot.
fn assemble_matrix(
    pool: &mut BufferPool,
    eigen_index: usize,
    matrix_index: usize,
    offset: usize,
    diag: &[f64],
    s: usize,
) {
    let eigen = &pool.eigens[eigen_index];
    let dest = &mut pool.matrices[matrix_index][offset..offset + s * s];
    for si in 0..s {
        let urow = &eigen.vectors[si * s..(si + 1) * s];
        let drow = &mut dest[si * s..(si + 1) * s];
        drow.fill(0.0);
        for (k, &d) in diag.iter().enumerate() {
            let scaled = urow[k] * d;
            let irow = &eigen.inverse[k * s..(k + 1) * s];
            for (out, &inv) in drow.iter_mut().zip(irow) {
                *out += scaled * inv;
            }
        }
    }
}

fn saturated_exp(x: f64) -> f64 {
    x.min(MAX_EXP_ARG).exp()
}

/// Compact states for `index` when it is a tip with states set.
pub(crate) fn tip_states_for<'a>(
    pool: &'a BufferPool,
    sizing: &InstanceSizing,
    index: usize,
) -> Option<&'a [u32]> {
    compact_in(&pool.tip_states, sizing.tip_count, index)
}

fn compact_in(
    tip_states: &[Option<Vec<u32>>],
    tip_count: usize,
    index: usize,
) -> Option<&[u32]> {
    if index < tip_count {
        tip_states.get(index).and_then(|o| o.as_deref())
    } else {
        None
    }
}

/// One peel into the pool's scratch buffer, dispatching on each child's
/// representation. The product of the two child terms is commutative, so
/// the partials/states case reduces to states/partials with the children
/// swapped.
pub(crate) fn peel_scalar(pool: &mut BufferPool, sizing: &InstanceSizing, op: &Operation) {
    let s = sizing.state_count;
    let pc = sizing.pattern_count;
    let cc = sizing.category_count;

    // Field-precise borrows: scratch is written while partials, matrices,
    // and tip states are read.
    let BufferPool {
        partials,
        tip_states,
        matrices,
        scratch,
        ..
    } = pool;
    let m1 = &matrices[op.child1_matrix];
    let m2 = &matrices[op.child2_matrix];
    let states1 = compact_in(tip_states, sizing.tip_count, op.child1);
    let states2 = compact_in(tip_states, sizing.tip_count, op.child2);

    match (states1, states2) {
        (Some(x1), Some(x2)) => {
            peel_states_states(scratch, x1, x2, m1, m2, s, pc, cc);
        }
        (Some(x1), None) => {
            peel_states_partials(scratch, x1, &partials[op.child2], m1, m2, s, pc, cc);
        }
        (None, Some(x2)) => {
            peel_states_partials(scratch, x2, &partials[op.child1], m2, m1, s, pc, cc);
        }
        (None, None) => {
            peel_partials_partials(
                scratch,
                &partials[op.child1],
                &partials[op.child2],
                m1,
                m2,
                s,
                pc,
                cc,
            );
        }
    }
}

/// Rescale the scratch buffer if requested, then swap it into the
/// destination. Swapping (rather than copying) keeps the peel safe when
/// the destination aliases one of its own children.
pub(crate) fn finish_operation(
    pool: &mut BufferPool,
    sizing: &InstanceSizing,
    op: &Operation,
    rescale: bool,
) {
    if rescale {
        rescale_scratch(pool, sizing, op.dest_scaling);
    }
    std::mem::swap(&mut pool.scratch, &mut pool.partials[op.destination]);
}

/// Divide each pattern of the scratch buffer by its maximum across all
/// categories and states, recording `ln(max)` in the scaling buffer.
/// A non-positive maximum leaves the pattern unscaled with a `0.0` entry.
pub(crate) fn rescale_scratch(pool: &mut BufferPool, sizing: &InstanceSizing, scaling_index: usize) {
    let s = sizing.state_count;
    let pc = sizing.pattern_count;
    let cc = sizing.category_count;
    let scalers = &mut pool.scalers[scaling_index];

    for p in 0..pc {
        let mut max = 0.0_f64;
        for c in 0..cc {
            let off = (c * pc + p) * s;
            for &v in &pool.scratch[off..off + s] {
                if v > max {
                    max = v;
                }
            }
        }
        if max > 0.0 {
            for c in 0..cc {
                let off = (c * pc + p) * s;
                for v in &mut pool.scratch[off..off + s] {
                    *v /= max;
                }
            }
            scalers[p] = max.ln();
        } else {
            scalers[p] = 0.0;
        }
    }
}

fn peel_partials_partials(
    scratch: &mut [f64],
    p1: &[f64],
    p2: &[f64],
    m1: &[f64],
    m2: &[f64],
    s: usize,
    pc: usize,
    cc: usize,
) {
    for c in 0..cc {
        let m1c = &m1[c * s * s..(c + 1) * s * s];
        let m2c = &m2[c * s * s..(c + 1) * s * s];
        for p in 0..pc {
            let off = (c * pc + p) * s;
            let v1 = &p1[off..off + s];
            let v2 = &p2[off..off + s];
            let dest = &mut scratch[off..off + s];
            for (si, d) in dest.iter_mut().enumerate() {
                let row = si * s;
                let mut sum1 = 0.0;
                let mut sum2 = 0.0;
                for sj in 0..s {
                    sum1 += m1c[row + sj] * v1[sj];
                    sum2 += m2c[row + sj] * v2[sj];
                }
                *d = sum1 * sum2;
            }
        }
    }
}

fn peel_states_partials(
    scratch: &mut [f64],
    states1: &[u32],
    p2: &[f64],
    m1: &[f64],
    m2: &[f64],
    s: usize,
    pc: usize,
    cc: usize,
) {
    let mut row_sums = vec![0.0_f64; s];
    for c in 0..cc {
        let m1c = &m1[c * s * s..(c + 1) * s * s];
        let m2c = &m2[c * s * s..(c + 1) * s * s];
        fill_row_sums(&mut row_sums, m1c, s);
        for p in 0..pc {
            let off = (c * pc + p) * s;
            let state = states1[p] as usize;
            let v2 = &p2[off..off + s];
            let dest = &mut scratch[off..off + s];
            for (si, d) in dest.iter_mut().enumerate() {
                let row = si * s;
                let sum1 = if state < s {
                    m1c[row + state]
                } else {
                    row_sums[si]
                };
                let mut sum2 = 0.0;
                for sj in 0..s {
                    sum2 += m2c[row + sj] * v2[sj];
                }
                *d = sum1 * sum2;
            }
        }
    }
}

fn peel_states_states(
    scratch: &mut [f64],
    states1: &[u32],
    states2: &[u32],
    m1: &[f64],
    m2: &[f64],
    s: usize,
    pc: usize,
    cc: usize,
) {
    let mut row_sums1 = vec![0.0_f64; s];
    let mut row_sums2 = vec![0.0_f64; s];
    for c in 0..cc {
        let m1c = &m1[c * s * s..(c + 1) * s * s];
        let m2c = &m2[c * s * s..(c + 1) * s * s];
        fill_row_sums(&mut row_sums1, m1c, s);
        fill_row_sums(&mut row_sums2, m2c, s);
        for p in 0..pc {
            let off = (c * pc + p) * s;
            let x1 = states1[p] as usize;
            let x2 = states2[p] as usize;
            let dest = &mut scratch[off..off + s];
            for (si, d) in dest.iter_mut().enumerate() {
                let row = si * s;
                let sum1 = if x1 < s { m1c[row + x1] } else { row_sums1[si] };
                let sum2 = if x2 < s { m2c[row + x2] } else { row_sums2[si] };
                *d = sum1 * sum2;
            }
        }
    }
}

/// Row sums of one `S×S` category slot — the missing-state contribution.
/// Computed rather than assumed `1.0` so derivative matrices behave.
fn fill_row_sums(row_sums: &mut [f64], matrix: &[f64], s: usize) {
    for (si, sum) in row_sums.iter_mut().enumerate() {
        *sum = matrix[si * s..(si + 1) * s].iter().sum();
    }
}

/// Integrate root partials against frequencies and category weights into
/// per-pattern log-likelihoods, adding accumulated scaling corrections.
/// Multiple roots contribute additively in log space.
#[allow(clippy::too_many_arguments)]
pub(crate) fn root_log_likelihoods(
    pool: &BufferPool,
    sizing: &InstanceSizing,
    root_indices: &[usize],
    weights: &[f64],
    frequencies: &[f64],
    scaling_indices: &[usize],
    scaling_counts: &[usize],
    out: &mut [f64],
) -> Result<()> {
    let s = sizing.state_count;
    let pc = sizing.pattern_count;
    let cc = sizing.category_count;

    out.fill(0.0);
    let mut scaling_offset = 0;
    for (i, &root) in root_indices.iter().enumerate() {
        let w = &weights[i * cc..(i + 1) * cc];
        let f = &frequencies[i * s..(i + 1) * s];
        let partials = &pool.partials[root];
        let scaling = &scaling_indices[scaling_offset..scaling_offset + scaling_counts[i]];
        scaling_offset += scaling_counts[i];

        for (p, site) in out.iter_mut().enumerate() {
            let mut lik = 0.0;
            for (si, &freq) in f.iter().enumerate() {
                let mut across = 0.0;
                for (c, &wc) in w.iter().enumerate() {
                    across += wc * partials[(c * pc + p) * s + si];
                }
                lik += freq * across;
            }
            let mut log_lik = lik.ln();
            for &idx in scaling {
                log_lik += pool.scalers[idx][p];
            }
            *site += log_lik;
        }
    }
    Ok(())
}

/// Integrate parent and child partials across an edge's transition matrix,
/// yielding per-pattern log-likelihoods plus derivatives of the
/// log-likelihood in the branch length when derivative matrices are given.
pub(crate) fn edge_log_likelihoods(
    pool: &BufferPool,
    sizing: &InstanceSizing,
    args: &EdgeArgs<'_>,
    out_log_likelihoods: &mut [f64],
    mut out_first_derivatives: Option<&mut [f64]>,
    mut out_second_derivatives: Option<&mut [f64]>,
) -> Result<()> {
    let s = sizing.state_count;
    let pc = sizing.pattern_count;
    let cc = sizing.category_count;

    out_log_likelihoods.fill(0.0);
    if let Some(d) = out_first_derivatives.as_deref_mut() {
        d.fill(0.0);
    }
    if let Some(d) = out_second_derivatives.as_deref_mut() {
        d.fill(0.0);
    }

    let mut scaling_offset = 0;
    for i in 0..args.parents.len() {
        let parent = &pool.partials[args.parents[i]];
        let child_states = tip_states_for(pool, sizing, args.children[i]);
        let child_partials = &pool.partials[args.children[i]];
        let m = &pool.matrices[args.prob_indices[i]];
        let d1m = args.d1_indices.map(|ix| &pool.matrices[ix[i]]);
        let d2m = args.d2_indices.map(|ix| &pool.matrices[ix[i]]);
        let w = &args.weights[i * cc..(i + 1) * cc];
        let f = &args.frequencies[i * s..(i + 1) * s];
        let scaling =
            &args.scaling_indices[scaling_offset..scaling_offset + args.scaling_counts[i]];
        scaling_offset += args.scaling_counts[i];

        for p in 0..pc {
            let mut lik = 0.0;
            let mut d1_lik = 0.0;
            let mut d2_lik = 0.0;
            for (c, &wc) in w.iter().enumerate() {
                let off = (c * pc + p) * s;
                for (si, &freq) in f.iter().enumerate() {
                    let weight = freq * wc * parent[off + si];
                    if weight == 0.0 {
                        continue;
                    }
                    lik += weight
                        * edge_inner(m, child_states, child_partials, c, p, si, s, pc);
                    if let Some(dm) = d1m {
                        d1_lik += weight
                            * edge_inner(dm, child_states, child_partials, c, p, si, s, pc);
                    }
                    if let Some(dm) = d2m {
                        d2_lik += weight
                            * edge_inner(dm, child_states, child_partials, c, p, si, s, pc);
                    }
                }
            }

            let mut log_lik = lik.ln();
            for &idx in scaling {
                log_lik += pool.scalers[idx][p];
            }
            out_log_likelihoods[p] += log_lik;

            if let Some(d) = out_first_derivatives.as_deref_mut() {
                let ratio = d1_lik / lik;
                d[p] += ratio;
                if let Some(d2) = out_second_derivatives.as_deref_mut() {
                    d2[p] += d2_lik / lik - ratio * ratio;
                }
            }
        }
    }
    Ok(())
}

/// `Σ_{s'} M[c,si,s']·child[c,p,s']`, collapsing to a column lookup (or a
/// row sum for the missing sentinel) when the child is compact.
#[allow(clippy::too_many_arguments)]
fn edge_inner(
    matrix: &[f64],
    child_states: Option<&[u32]>,
    child_partials: &[f64],
    c: usize,
    p: usize,
    si: usize,
    s: usize,
    pc: usize,
) -> f64 {
    let row = &matrix[(c * s + si) * s..(c * s + si + 1) * s];
    match child_states {
        Some(states) => {
            let state = states[p] as usize;
            if state < s {
                row[state]
            } else {
                row.iter().sum()
            }
        }
        None => {
            let off = (c * pc + p) * s;
            row.iter()
                .zip(&child_partials[off..off + s])
                .map(|(&m, &v)| m * v)
                .sum()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ops::Operation;

    fn sizing() -> InstanceSizing {
        InstanceSizing {
            state_count: 4,
            pattern_count: 2,
            category_count: 1,
            tip_count: 2,
            partials_buffer_count: 4,
            compact_buffer_count: 2,
            eigen_buffer_count: 1,
            matrix_buffer_count: 2,
        }
    }

    /// Jukes-Cantor eigen-decomposition, unit substitution rate.
    fn jc_eigen() -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let vectors = vec![
            1.0, 2.0, 0.0, 0.5, //
            1.0, -2.0, 0.5, 0.0, //
            1.0, 2.0, 0.0, -0.5, //
            1.0, -2.0, -0.5, 0.0,
        ];
        let inverse = vec![
            0.25, 0.25, 0.25, 0.25, //
            0.125, -0.125, 0.125, -0.125, //
            0.0, 1.0, 0.0, -1.0, //
            1.0, 0.0, -1.0, 0.0,
        ];
        let values = vec![0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0];
        (vectors, inverse, values)
    }

    fn backend_with_jc(t: f64) -> CpuBackend {
        let mut b = CpuBackend::create(sizing()).unwrap();
        let (u, inv, lam) = jc_eigen();
        b.set_eigen_decomposition(0, &u, &inv, &lam).unwrap();
        b.update_transition_matrices(0, &[0, 1], None, None, &[t, t])
            .unwrap();
        b
    }

    #[test]
    fn zero_branch_yields_identity() {
        let b = backend_with_jc(0.0);
        let m = &b.pool.matrices[0];
        for si in 0..4 {
            for sj in 0..4 {
                let expected = if si == sj { 1.0 } else { 0.0 };
                assert!(
                    (m[si * 4 + sj] - expected).abs() < 1e-12,
                    "M[{si}][{sj}] = {}",
                    m[si * 4 + sj]
                );
            }
        }
    }

    #[test]
    fn transition_rows_are_stochastic() {
        let b = backend_with_jc(0.37);
        for si in 0..4 {
            let sum: f64 = b.pool.matrices[0][si * 4..(si + 1) * 4].iter().sum();
            assert!((sum - 1.0).abs() < 1e-10, "row {si} sums to {sum}");
        }
    }

    #[test]
    fn jc_transition_matches_closed_form() {
        let t = 0.1;
        let b = backend_with_jc(t);
        let e = (-4.0 * t / 3.0).exp();
        let same = 0.25 + 0.75 * e;
        let diff = 0.25 - 0.25 * e;
        let m = &b.pool.matrices[0];
        assert!((m[0] - same).abs() < 1e-12);
        assert!((m[1] - diff).abs() < 1e-12);
    }

    #[test]
    fn huge_branch_converges_to_stationary() {
        let b = backend_with_jc(1.0e8);
        for &v in &b.pool.matrices[0][..16] {
            assert!(v.is_finite());
            assert!((v - 0.25).abs() < 1e-9, "stationary entry {v}");
        }
    }

    #[test]
    fn states_and_one_hot_partials_agree() {
        let mut a = backend_with_jc(0.1);
        let mut b = backend_with_jc(0.1);

        // Tip 0 state A, tip 1 state C at pattern 0; both missing at 1.
        a.set_tip_states(0, &[0, 4]).unwrap();
        a.set_tip_states(1, &[1, 4]).unwrap();

        let mut hot0 = vec![0.0; 8];
        let mut hot1 = vec![0.0; 8];
        hot0[0] = 1.0;
        hot1[1] = 1.0;
        hot0[4..8].fill(1.0);
        hot1[4..8].fill(1.0);
        b.set_partials(0, &hot0).unwrap();
        b.set_partials(1, &hot1).unwrap();

        let op = Operation {
            destination: 2,
            dest_scaling: 3,
            child1: 0,
            child1_matrix: 0,
            child2: 1,
            child2_matrix: 1,
        };
        a.update_partials(&[op], false).unwrap();
        b.update_partials(&[op], false).unwrap();

        let mut out_a = vec![0.0; 8];
        let mut out_b = vec![0.0; 8];
        a.get_partials(2, &mut out_a).unwrap();
        b.get_partials(2, &mut out_b).unwrap();
        for (x, y) in out_a.iter().zip(&out_b) {
            assert!((x - y).abs() < 1e-14, "compact {x} vs one-hot {y}");
        }
    }

    #[test]
    fn rescaling_preserves_log_likelihood() {
        let mut plain = backend_with_jc(0.1);
        let mut scaled = backend_with_jc(0.1);
        for b in [&mut plain, &mut scaled] {
            b.set_tip_states(0, &[0, 2]).unwrap();
            b.set_tip_states(1, &[0, 3]).unwrap();
        }
        let op = Operation {
            destination: 2,
            dest_scaling: 3,
            child1: 0,
            child1_matrix: 0,
            child2: 1,
            child2_matrix: 1,
        };
        plain.update_partials(&[op], false).unwrap();
        scaled.update_partials(&[op], true).unwrap();

        let weights = [1.0];
        let freqs = [0.25; 4];
        let mut out_plain = vec![0.0; 2];
        let mut out_scaled = vec![0.0; 2];
        plain
            .root_log_likelihoods(&[2], &weights, &freqs, &[], &[0], &mut out_plain)
            .unwrap();
        scaled
            .root_log_likelihoods(&[2], &weights, &freqs, &[3], &[1], &mut out_scaled)
            .unwrap();
        for (x, y) in out_plain.iter().zip(&out_scaled) {
            assert!((x - y).abs() < 1e-10, "unscaled {x} vs rescaled {y}");
        }
    }

    #[test]
    fn destination_may_alias_child() {
        let mut b = backend_with_jc(0.1);
        b.set_tip_states(0, &[0, 1]).unwrap();
        let mut hot = vec![0.0; 8];
        hot[2] = 1.0;
        hot[4 + 3] = 1.0;
        b.set_partials(2, &hot).unwrap();

        // dest == child2: peel must read child2 fully before overwrite.
        let op = Operation {
            destination: 2,
            dest_scaling: 3,
            child1: 0,
            child1_matrix: 0,
            child2: 2,
            child2_matrix: 1,
        };
        let mut expected = vec![0.0; 8];
        {
            let mut reference = backend_with_jc(0.1);
            reference.set_tip_states(0, &[0, 1]).unwrap();
            reference.set_partials(1, &hot).unwrap();
            let ref_op = Operation {
                destination: 3,
                dest_scaling: 3,
                child1: 0,
                child1_matrix: 0,
                child2: 1,
                child2_matrix: 1,
            };
            // Tip 1 has no states set in `reference`, so child2 peels as
            // partials, same as the aliased case.
            reference.update_partials(&[ref_op], false).unwrap();
            reference.get_partials(3, &mut expected).unwrap();
        }
        b.update_partials(&[op], false).unwrap();
        let mut actual = vec![0.0; 8];
        b.get_partials(2, &mut actual).unwrap();
        for (x, y) in actual.iter().zip(&expected) {
            assert!((x - y).abs() < 1e-14);
        }
    }
}
