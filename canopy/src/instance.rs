// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle and entry validation.
//!
//! An [`Instance`] is the unit of isolation: one selected backend plus its
//! buffer pool, sized immutably at creation. Every call validates handles,
//! indices, and array lengths here before touching the backend, so a
//! failed call never mutates state and backends can assume clean inputs.
//!
//! Lifecycle: [`Instance::create`] selects the resource and (for CPU
//! engines) allocates the pool; [`Instance::initialize`] completes any
//! deferred backend construction — GPU device and pipeline creation lives
//! there — and reports the effective capabilities. Dropping the instance
//! releases everything.

use crate::backend::{self, Backend, EdgeArgs};
use crate::error::{Error, Result};
use crate::flags::Flags;
use crate::ops;
use crate::resource::{self, ResourceKind};
use crate::sizing::InstanceSizing;

/// The resource an instance landed on and its effective capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceDetails {
    /// Index into [`crate::resource::resources`].
    pub resource_index: usize,
    /// Effective (not preferred) capability flags.
    pub flags: Flags,
}

/// One likelihood-evaluation instance.
pub struct Instance {
    sizing: InstanceSizing,
    resource_index: usize,
    flags: Flags,
    kind: ResourceKind,
    backend: Option<Box<dyn Backend>>,
    initialized: bool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("sizing", &self.sizing)
            .field("resource_index", &self.resource_index)
            .field("flags", &self.flags)
            .field("kind", &self.kind)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Select a backend against the resource registry and allocate.
    ///
    /// Requirement flags are hard; preference flags are soft. CPU pools are
    /// allocated here (an unsatisfiable pool fails creation and leaks
    /// nothing); GPU device setup is deferred to [`Self::initialize`].
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for an invalid sizing, [`Error::General`] when
    /// no resource satisfies the requirements, [`Error::OutOfMemory`] when
    /// the pool cannot be allocated.
    pub fn create(
        sizing: InstanceSizing,
        allowed_resources: Option<&[i32]>,
        preference_flags: Flags,
        requirement_flags: Flags,
    ) -> Result<Self> {
        sizing.validate()?;
        let registry = resource::resources();
        let resource_index = backend::select(
            registry,
            allowed_resources,
            preference_flags,
            requirement_flags,
        )?;
        let chosen = &registry[resource_index];

        let backend: Option<Box<dyn Backend>> = match chosen.kind {
            ResourceKind::CpuScalar => Some(Box::new(backend::cpu::CpuBackend::create(sizing)?)),
            ResourceKind::CpuVector => {
                Some(Box::new(backend::vector::VectorBackend::create(sizing)?))
            }
            #[cfg(feature = "gpu")]
            ResourceKind::Gpu { .. } => None,
        };

        Ok(Self {
            sizing,
            resource_index,
            flags: chosen.flags,
            kind: chosen.kind,
            backend,
            initialized: false,
        })
    }

    /// Complete deferred backend construction and report the resource.
    ///
    /// # Errors
    ///
    /// GPU device or pipeline creation failures surface here as
    /// [`Error::UnidentifiedException`] or [`Error::OutOfMemory`].
    pub fn initialize(&mut self) -> Result<InstanceDetails> {
        if self.backend.is_none() {
            match self.kind {
                #[cfg(feature = "gpu")]
                ResourceKind::Gpu { adapter_index } => {
                    self.backend = Some(Box::new(backend::gpu::GpuBackend::create(
                        self.sizing,
                        adapter_index,
                    )?));
                }
                _ => {
                    return Err(Error::General("backend construction missing".into()));
                }
            }
        }
        self.initialized = true;
        Ok(InstanceDetails {
            resource_index: self.resource_index,
            flags: self.flags,
        })
    }

    /// The sizing this instance was created with.
    #[must_use]
    pub const fn sizing(&self) -> &InstanceSizing {
        &self.sizing
    }

    /// Copy a partials buffer in, layout `[c,p,s]` with `s` fastest.
    ///
    /// # Errors
    ///
    /// [`Error::UninitializedInstance`] before [`Self::initialize`],
    /// [`Error::OutOfRange`] for a bad index or length.
    pub fn set_partials(&mut self, buffer_index: i32, partials: &[f64]) -> Result<()> {
        let index = check_index(buffer_index, self.sizing.partials_buffer_count, "partials")?;
        check_len(partials.len(), self.sizing.partials_len(), "partials")?;
        self.ready()?.set_partials(index, partials)
    }

    /// Copy a partials buffer out, blocking on asynchronous backends until
    /// the buffer is stable.
    ///
    /// # Errors
    ///
    /// As [`Self::set_partials`].
    pub fn get_partials(&mut self, buffer_index: i32, out: &mut [f64]) -> Result<()> {
        let index = check_index(buffer_index, self.sizing.partials_buffer_count, "partials")?;
        check_len(out.len(), self.sizing.partials_len(), "partials output")?;
        self.ready()?.get_partials(index, out)
    }

    /// Set the compact state representation for a tip.
    ///
    /// Entries are `0…S` inclusive; `S` is the missing/ambiguous sentinel.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when the tip index is outside both the tip
    /// count and the compact buffer count, or any state exceeds `S`.
    pub fn set_tip_states(&mut self, tip_index: i32, states: &[i32]) -> Result<()> {
        let index = check_index(tip_index, self.sizing.tip_count, "tip")?;
        check_index(tip_index, self.sizing.compact_buffer_count, "compact buffer")?;
        check_len(states.len(), self.sizing.pattern_count, "tip states")?;
        let max_state = self.sizing.state_count;
        let mut converted = Vec::with_capacity(states.len());
        for &raw in states {
            let state = usize::try_from(raw)
                .ok()
                .filter(|&x| x <= max_state)
                .ok_or_else(|| {
                    Error::OutOfRange(format!("tip state {raw} outside 0..={max_state}"))
                })?;
            converted.push(state as u32);
        }
        self.ready()?.set_tip_states(index, &converted)
    }

    /// Copy an eigen-decomposition `(U, U⁻¹, λ)` into an eigen buffer.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for a bad index or matrix/vector length.
    pub fn set_eigen_decomposition(
        &mut self,
        eigen_index: i32,
        vectors: &[f64],
        inverse: &[f64],
        values: &[f64],
    ) -> Result<()> {
        let index = check_index(eigen_index, self.sizing.eigen_buffer_count, "eigen")?;
        check_len(vectors.len(), self.sizing.eigen_matrix_len(), "eigenvectors")?;
        check_len(
            inverse.len(),
            self.sizing.eigen_matrix_len(),
            "inverse eigenvectors",
        )?;
        check_len(values.len(), self.sizing.state_count, "eigenvalues")?;
        self.ready()?.set_eigen_decomposition(index, vectors, inverse, values)
    }

    /// Set the instance-level category rate vector.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for a bad length or a negative/non-finite rate.
    pub fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        check_len(rates.len(), self.sizing.category_count, "category rates")?;
        if let Some(bad) = rates.iter().find(|r| !(r.is_finite() && **r >= 0.0)) {
            return Err(Error::OutOfRange(format!(
                "category rate {bad} must be finite and non-negative"
            )));
        }
        self.ready()?.set_category_rates(rates)
    }

    /// Copy a closed-form transition matrix in, bypassing the eigen path.
    ///
    /// Write-wins with [`Self::update_transition_matrices`]: whichever
    /// wrote the index last is what kernels read.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for a bad index or length.
    pub fn set_transition_matrix(&mut self, matrix_index: i32, matrix: &[f64]) -> Result<()> {
        let index = check_index(matrix_index, self.sizing.matrix_buffer_count, "matrix")?;
        check_len(matrix.len(), self.sizing.matrix_len(), "transition matrix")?;
        self.ready()?.set_transition_matrix(index, matrix)
    }

    /// Compute transition matrices (and optional derivative matrices) from
    /// an eigen-decomposition and edge lengths.
    ///
    /// Negative (or NaN) edge lengths are rejected; they are not clamped.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for index/length mismatches, a negative edge
    /// length, or second-derivative indices without first-derivative ones.
    pub fn update_transition_matrices(
        &mut self,
        eigen_index: i32,
        probability_indices: &[i32],
        first_derivative_indices: Option<&[i32]>,
        second_derivative_indices: Option<&[i32]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        let eigen = check_index(eigen_index, self.sizing.eigen_buffer_count, "eigen")?;
        check_len(
            probability_indices.len(),
            edge_lengths.len(),
            "probability indices",
        )?;
        if second_derivative_indices.is_some() && first_derivative_indices.is_none() {
            return Err(Error::OutOfRange(
                "second derivatives require first-derivative indices".into(),
            ));
        }
        let prob = check_indices(
            probability_indices,
            self.sizing.matrix_buffer_count,
            "matrix",
        )?;
        let d1 = first_derivative_indices
            .map(|ix| {
                check_len(ix.len(), edge_lengths.len(), "first derivative indices")?;
                check_indices(ix, self.sizing.matrix_buffer_count, "first derivative matrix")
            })
            .transpose()?;
        let d2 = second_derivative_indices
            .map(|ix| {
                check_len(ix.len(), edge_lengths.len(), "second derivative indices")?;
                check_indices(ix, self.sizing.matrix_buffer_count, "second derivative matrix")
            })
            .transpose()?;
        if let Some(bad) = edge_lengths.iter().find(|t| !(**t >= 0.0)) {
            return Err(Error::OutOfRange(format!(
                "edge length {bad} must be non-negative"
            )));
        }
        self.ready()?.update_transition_matrices(
            eigen,
            &prob,
            d1.as_deref(),
            d2.as_deref(),
            edge_lengths,
        )
    }

    /// Execute (or enqueue, on asynchronous backends) a peel operation
    /// list. See [`crate::ops`] for the tuple format and ordering contract.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for malformed tuples or indices.
    pub fn update_partials(&mut self, operations: &[i32], rescale: bool) -> Result<()> {
        let ops = ops::decode(operations, &self.sizing, rescale)?;
        self.ready()?.update_partials(&ops, rescale)
    }

    /// Block until the listed destination buffers are stable in memory.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for a bad destination index.
    pub fn wait_for_partials(&mut self, destinations: &[i32]) -> Result<()> {
        let dests = check_indices(destinations, self.sizing.partials_buffer_count, "partials")?;
        self.ready()?.wait_for_partials(&dests)
    }

    /// Integrate root partials to per-pattern site log-likelihoods.
    ///
    /// `weights` carries one `C`-sized row per root buffer, `frequencies`
    /// one `S`-sized row; `scaling_indices` is consumed
    /// `scaling_counts[i]` entries per root. Per-root mixing weights fold
    /// into the weight rows; multiple roots add in log space.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for any index or length mismatch.
    pub fn calculate_root_log_likelihoods(
        &mut self,
        buffer_indices: &[i32],
        weights: &[f64],
        state_frequencies: &[f64],
        scaling_indices: &[i32],
        scaling_counts: &[i32],
        out_log_likelihoods: &mut [f64],
    ) -> Result<()> {
        let k = buffer_indices.len();
        let roots = check_indices(buffer_indices, self.sizing.partials_buffer_count, "root")?;
        check_len(weights.len(), k * self.sizing.category_count, "weights")?;
        check_len(
            state_frequencies.len(),
            k * self.sizing.state_count,
            "state frequencies",
        )?;
        check_len(scaling_counts.len(), k, "scaling counts")?;
        let (scaling, counts) = check_scaling(
            scaling_indices,
            scaling_counts,
            self.sizing.partials_buffer_count,
        )?;
        check_len(
            out_log_likelihoods.len(),
            self.sizing.pattern_count,
            "site log-likelihood output",
        )?;
        self.ready()?.root_log_likelihoods(
            &roots,
            weights,
            state_frequencies,
            &scaling,
            &counts,
            out_log_likelihoods,
        )
    }

    /// Integrate across an edge, yielding per-pattern log-likelihoods and,
    /// when derivative matrices are supplied, first and second derivatives
    /// of the log-likelihood with respect to the edge length.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for any index or length mismatch, or when
    /// derivative outputs and derivative matrix lists are not paired.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_edge_log_likelihoods(
        &mut self,
        parent_buffer_indices: &[i32],
        child_buffer_indices: &[i32],
        probability_indices: &[i32],
        first_derivative_indices: Option<&[i32]>,
        second_derivative_indices: Option<&[i32]>,
        weights: &[f64],
        state_frequencies: &[f64],
        scaling_indices: &[i32],
        scaling_counts: &[i32],
        out_log_likelihoods: &mut [f64],
        out_first_derivatives: Option<&mut [f64]>,
        out_second_derivatives: Option<&mut [f64]>,
    ) -> Result<()> {
        let k = parent_buffer_indices.len();
        let parents = check_indices(
            parent_buffer_indices,
            self.sizing.partials_buffer_count,
            "parent",
        )?;
        check_len(child_buffer_indices.len(), k, "child indices")?;
        let children = check_indices(
            child_buffer_indices,
            self.sizing.partials_buffer_count,
            "child",
        )?;
        check_len(probability_indices.len(), k, "probability indices")?;
        let probs = check_indices(
            probability_indices,
            self.sizing.matrix_buffer_count,
            "matrix",
        )?;
        if first_derivative_indices.is_some() != out_first_derivatives.is_some()
            || second_derivative_indices.is_some() != out_second_derivatives.is_some()
        {
            return Err(Error::OutOfRange(
                "derivative outputs must pair with derivative matrix indices".into(),
            ));
        }
        if second_derivative_indices.is_some() && first_derivative_indices.is_none() {
            return Err(Error::OutOfRange(
                "second derivatives require first-derivative indices".into(),
            ));
        }
        let d1 = first_derivative_indices
            .map(|ix| {
                check_len(ix.len(), k, "first derivative indices")?;
                check_indices(ix, self.sizing.matrix_buffer_count, "first derivative matrix")
            })
            .transpose()?;
        let d2 = second_derivative_indices
            .map(|ix| {
                check_len(ix.len(), k, "second derivative indices")?;
                check_indices(ix, self.sizing.matrix_buffer_count, "second derivative matrix")
            })
            .transpose()?;
        check_len(weights.len(), k * self.sizing.category_count, "weights")?;
        check_len(
            state_frequencies.len(),
            k * self.sizing.state_count,
            "state frequencies",
        )?;
        check_len(scaling_counts.len(), k, "scaling counts")?;
        let (scaling, counts) = check_scaling(
            scaling_indices,
            scaling_counts,
            self.sizing.partials_buffer_count,
        )?;
        check_len(
            out_log_likelihoods.len(),
            self.sizing.pattern_count,
            "site log-likelihood output",
        )?;
        if let Some(ref d) = out_first_derivatives {
            check_len(d.len(), self.sizing.pattern_count, "first derivative output")?;
        }
        if let Some(ref d) = out_second_derivatives {
            check_len(d.len(), self.sizing.pattern_count, "second derivative output")?;
        }

        let args = EdgeArgs {
            parents: &parents,
            children: &children,
            prob_indices: &probs,
            d1_indices: d1.as_deref(),
            d2_indices: d2.as_deref(),
            weights,
            frequencies: state_frequencies,
            scaling_indices: &scaling,
            scaling_counts: &counts,
        };
        self.ready()?.edge_log_likelihoods(
            &args,
            out_log_likelihoods,
            out_first_derivatives,
            out_second_derivatives,
        )
    }

    fn ready(&mut self) -> Result<&mut (dyn Backend + 'static)> {
        if !self.initialized {
            return Err(Error::UninitializedInstance(
                "instance has not been initialized".into(),
            ));
        }
        self.backend
            .as_deref_mut()
            .ok_or_else(move || Error::UninitializedInstance("backend construction incomplete".into()))
    }
}

fn check_index(raw: i32, count: usize, what: &str) -> Result<usize> {
    usize::try_from(raw)
        .ok()
        .filter(|&idx| idx < count)
        .ok_or_else(|| Error::OutOfRange(format!("{what} index {raw} outside 0..{count}")))
}

fn check_indices(raw: &[i32], count: usize, what: &str) -> Result<Vec<usize>> {
    raw.iter().map(|&r| check_index(r, count, what)).collect()
}

fn check_len(actual: usize, expected: usize, what: &str) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::OutOfRange(format!(
            "{what} length {actual}, expected {expected}"
        )))
    }
}

fn check_scaling(
    scaling_indices: &[i32],
    scaling_counts: &[i32],
    buffer_count: usize,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let counts: Vec<usize> = scaling_counts
        .iter()
        .map(|&c| {
            usize::try_from(c)
                .map_err(|_| Error::OutOfRange(format!("scaling count {c} is negative")))
        })
        .collect::<Result<_>>()?;
    let total: usize = counts.iter().sum();
    check_len(scaling_indices.len(), total, "scaling indices")?;
    let indices = check_indices(scaling_indices, buffer_count, "scaling factor")?;
    Ok((indices, counts))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

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

    #[test]
    fn calls_before_initialize_fail() {
        let mut inst = Instance::create(sizing(), None, Flags::NONE, Flags::NONE).unwrap();
        let err = inst.set_partials(0, &[0.0; 8]).unwrap_err();
        assert_eq!(err.code(), -4);
    }

    #[test]
    fn initialize_reports_resource_zero_by_default() {
        let mut inst = Instance::create(sizing(), None, Flags::NONE, Flags::NONE).unwrap();
        let details = inst.initialize().unwrap();
        assert_eq!(details.resource_index, 0);
        assert!(details.flags.contains(Flags::CPU | Flags::DOUBLE));
    }

    #[test]
    fn unsatisfiable_requirement_fails_creation() {
        let err =
            Instance::create(sizing(), None, Flags::NONE, Flags::FPGA).unwrap_err();
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn out_of_range_index_is_reported() {
        let mut inst = Instance::create(sizing(), None, Flags::NONE, Flags::NONE).unwrap();
        inst.initialize().unwrap();
        assert_eq!(inst.set_partials(4, &[0.0; 8]).unwrap_err().code(), -5);
        assert_eq!(inst.set_partials(-1, &[0.0; 8]).unwrap_err().code(), -5);
        assert_eq!(inst.set_partials(0, &[0.0; 7]).unwrap_err().code(), -5);
    }

    #[test]
    fn tip_states_validate_range_and_sentinel() {
        let mut inst = Instance::create(sizing(), None, Flags::NONE, Flags::NONE).unwrap();
        inst.initialize().unwrap();
        assert!(inst.set_tip_states(0, &[0, 4]).is_ok());
        assert_eq!(inst.set_tip_states(0, &[0, 5]).unwrap_err().code(), -5);
        assert_eq!(inst.set_tip_states(2, &[0, 0]).unwrap_err().code(), -5);
    }

    #[test]
    fn negative_edge_length_rejected() {
        let mut inst = Instance::create(sizing(), None, Flags::NONE, Flags::NONE).unwrap();
        inst.initialize().unwrap();
        let err = inst
            .update_transition_matrices(0, &[0], None, None, &[-0.1])
            .unwrap_err();
        assert_eq!(err.code(), -5);
        let err = inst
            .update_transition_matrices(0, &[0], None, None, &[f64::NAN])
            .unwrap_err();
        assert_eq!(err.code(), -5);
    }

    #[test]
    fn second_derivatives_require_first() {
        let mut inst = Instance::create(sizing(), None, Flags::NONE, Flags::NONE).unwrap();
        inst.initialize().unwrap();
        let err = inst
            .update_transition_matrices(0, &[0], None, Some(&[1]), &[0.1])
            .unwrap_err();
        assert_eq!(err.code(), -5);
    }

    #[test]
    fn category_rates_validated() {
        let mut inst = Instance::create(sizing(), None, Flags::NONE, Flags::NONE).unwrap();
        inst.initialize().unwrap();
        assert!(inst.set_category_rates(&[1.0]).is_ok());
        assert_eq!(inst.set_category_rates(&[-1.0]).unwrap_err().code(), -5);
        assert_eq!(inst.set_category_rates(&[1.0, 2.0]).unwrap_err().code(), -5);
    }

    #[test]
    fn scaling_list_must_match_counts() {
        let mut inst = Instance::create(sizing(), None, Flags::NONE, Flags::NONE).unwrap();
        inst.initialize().unwrap();
        let mut out = vec![0.0; 2];
        let err = inst
            .calculate_root_log_likelihoods(&[2], &[1.0], &[0.25; 4], &[3, 3], &[1], &mut out)
            .unwrap_err();
        assert_eq!(err.code(), -5);
    }
}
