// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend abstraction — interchangeable kernel engines.
//!
//! A backend owns its buffer pool in device-appropriate memory and realizes
//! the four kernels. The backend is fixed once per instance (one dynamic
//! dispatch per call; inner loops stay monomorphic). Inputs arrive
//! pre-validated by the instance layer: indices are in range and array
//! lengths match the sizing.

use crate::error::Result;
use crate::flags::Flags;
use crate::ops::Operation;
use crate::resource::Resource;

pub(crate) mod cpu;
#[cfg(feature = "gpu")]
pub(crate) mod gpu;
#[cfg(feature = "gpu")]
pub(crate) mod shaders;
pub(crate) mod vector;

/// Arguments to the edge integration kernel.
///
/// Parallel lists of length `k`; `weights` is `k·C`, `frequencies` is
/// `k·S`, and `scaling_indices` is consumed `scaling_counts[i]` entries
/// per edge.
pub(crate) struct EdgeArgs<'a> {
    pub parents: &'a [usize],
    pub children: &'a [usize],
    pub prob_indices: &'a [usize],
    pub d1_indices: Option<&'a [usize]>,
    pub d2_indices: Option<&'a [usize]>,
    pub weights: &'a [f64],
    pub frequencies: &'a [f64],
    pub scaling_indices: &'a [usize],
    pub scaling_counts: &'a [usize],
}

/// The kernel and I/O surface every engine implements.
pub(crate) trait Backend: Send {
    fn set_partials(&mut self, index: usize, values: &[f64]) -> Result<()>;
    fn get_partials(&mut self, index: usize, out: &mut [f64]) -> Result<()>;
    fn set_tip_states(&mut self, tip_index: usize, states: &[u32]) -> Result<()>;
    fn set_eigen_decomposition(
        &mut self,
        index: usize,
        vectors: &[f64],
        inverse: &[f64],
        values: &[f64],
    ) -> Result<()>;
    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()>;
    fn set_transition_matrix(&mut self, index: usize, matrix: &[f64]) -> Result<()>;
    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        prob_indices: &[usize],
        d1_indices: Option<&[usize]>,
        d2_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()>;
    fn update_partials(&mut self, operations: &[Operation], rescale: bool) -> Result<()>;
    fn wait_for_partials(&mut self, destinations: &[usize]) -> Result<()>;
    fn root_log_likelihoods(
        &mut self,
        root_indices: &[usize],
        weights: &[f64],
        frequencies: &[f64],
        scaling_indices: &[usize],
        scaling_counts: &[usize],
        out: &mut [f64],
    ) -> Result<()>;
    fn edge_log_likelihoods(
        &mut self,
        args: &EdgeArgs<'_>,
        out_log_likelihoods: &mut [f64],
        out_first_derivatives: Option<&mut [f64]>,
        out_second_derivatives: Option<&mut [f64]>,
    ) -> Result<()>;
}

/// Select a resource from the registry.
///
/// Scans in registry order, drops resources not in `allowed` (when given)
/// or missing any `require` bit, then keeps the candidate matching the most
/// `prefer` bits. Registry order breaks ties, so the scalar CPU wins when
/// the caller expresses no preference.
///
/// # Errors
///
/// [`crate::error::Error::General`] when no resource survives.
pub(crate) fn select(
    registry: &[Resource],
    allowed: Option<&[i32]>,
    prefer: Flags,
    require: Flags,
) -> Result<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (idx, resource) in registry.iter().enumerate() {
        if let Some(allowed) = allowed {
            let listed = allowed
                .iter()
                .any(|&a| usize::try_from(a).is_ok_and(|a| a == idx));
            if !listed {
                continue;
            }
        }
        if !resource.flags.contains(require) {
            continue;
        }
        let score = resource.flags.matching_bits(prefer);
        let better = match best {
            None => true,
            Some((_, best_score)) => score > best_score,
        };
        if better {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx).ok_or_else(|| {
        crate::error::Error::General(format!(
            "no resource satisfies requirement flags [{require}]"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    fn registry() -> Vec<Resource> {
        vec![
            Resource {
                name: "cpu".into(),
                flags: Flags::CPU | Flags::DOUBLE | Flags::SYNCH,
                kind: ResourceKind::CpuScalar,
            },
            Resource {
                name: "cpu-sse".into(),
                flags: Flags::CPU | Flags::SSE | Flags::DOUBLE | Flags::SYNCH,
                kind: ResourceKind::CpuVector,
            },
        ]
    }

    #[test]
    fn defaults_to_first_resource() {
        let idx = select(&registry(), None, Flags::NONE, Flags::NONE).unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn preference_moves_selection() {
        let idx = select(&registry(), None, Flags::SSE, Flags::NONE).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn requirement_is_hard() {
        assert!(select(&registry(), None, Flags::NONE, Flags::GPU).is_err());
        let idx = select(&registry(), None, Flags::NONE, Flags::SSE).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn allowed_list_restricts() {
        let idx = select(&registry(), Some(&[1]), Flags::NONE, Flags::NONE).unwrap();
        assert_eq!(idx, 1);
        assert!(select(&registry(), Some(&[]), Flags::NONE, Flags::NONE).is_err());
    }

    #[test]
    fn unsatisfied_preference_still_selects() {
        let idx = select(&registry(), None, Flags::GPU, Flags::NONE).unwrap();
        assert_eq!(idx, 0);
    }
}
