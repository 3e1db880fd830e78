// SPDX-License-Identifier: AGPL-3.0-or-later
//! Procedural boundary: integer handles over a process-global instance
//! table.
//!
//! Handles index a table of `Arc<Mutex<Instance>>`; the table itself sits
//! behind an `RwLock` so distinct handles proceed from distinct threads
//! without coordination while one handle's calls serialize on its own
//! mutex. Handles are recycled lowest-free-slot-first after
//! [`finalize`]. A poisoned instance lock (a panic escaped a backend)
//! surfaces as the unidentified-exception error rather than propagating.
//!
//! Callers embedding the library directly can skip this module and hold
//! [`Instance`] values themselves; everything here is a veneer.

use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::error::{Error, Result};
use crate::flags::Flags;
use crate::instance::{Instance, InstanceDetails};
use crate::sizing::InstanceSizing;

static TABLE: OnceLock<RwLock<Vec<Option<Arc<Mutex<Instance>>>>>> = OnceLock::new();

fn table() -> &'static RwLock<Vec<Option<Arc<Mutex<Instance>>>>> {
    TABLE.get_or_init(|| RwLock::new(Vec::new()))
}

fn unknown_handle(handle: i32) -> Error {
    Error::UninitializedInstance(format!("handle {handle} does not refer to a live instance"))
}

fn poisoned() -> Error {
    Error::UnidentifiedException("instance lock poisoned by an earlier panic".into())
}

fn with_instance<T>(handle: i32, f: impl FnOnce(&mut Instance) -> Result<T>) -> Result<T> {
    let index = usize::try_from(handle).map_err(|_| unknown_handle(handle))?;
    let slot = {
        let guard = table().read().map_err(|_| poisoned())?;
        guard
            .get(index)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or_else(|| unknown_handle(handle))?
    };
    let mut instance = slot.lock().map_err(|_| poisoned())?;
    f(&mut instance)
}

/// Create an instance and return its non-negative handle.
///
/// Backend selection scans the resource registry in order, restricted to
/// `allowed_resources` when given; requirement flags are hard, preference
/// flags soft. See [`Instance::create`].
///
/// # Errors
///
/// [`Error::OutOfRange`] for an invalid sizing, [`Error::General`] when no
/// resource qualifies, [`Error::OutOfMemory`] when allocation fails — in
/// which case no handle is produced.
pub fn create_instance(
    sizing: &InstanceSizing,
    allowed_resources: Option<&[i32]>,
    preference_flags: Flags,
    requirement_flags: Flags,
) -> Result<i32> {
    let instance = Instance::create(
        *sizing,
        allowed_resources,
        preference_flags,
        requirement_flags,
    )?;
    let mut guard = table().write().map_err(|_| poisoned())?;
    let slot = guard.iter().position(Option::is_none);
    let index = match slot {
        Some(i) => {
            guard[i] = Some(Arc::new(Mutex::new(instance)));
            i
        }
        None => {
            guard.push(Some(Arc::new(Mutex::new(instance))));
            guard.len() - 1
        }
    };
    i32::try_from(index).map_err(|_| Error::General("handle space exhausted".into()))
}

/// Complete deferred backend initialization and report the chosen
/// resource index and effective capability flags.
///
/// # Errors
///
/// [`Error::UninitializedInstance`] for an unknown handle; GPU
/// construction failures as documented on [`Instance::initialize`].
pub fn initialize_instance(handle: i32) -> Result<InstanceDetails> {
    with_instance(handle, Instance::initialize)
}

/// Release an instance's buffers and backend state.
///
/// The handle becomes invalid immediately and may be recycled by a later
/// [`create_instance`].
///
/// # Errors
///
/// [`Error::UninitializedInstance`] for an unknown handle.
pub fn finalize(handle: i32) -> Result<()> {
    let index = usize::try_from(handle).map_err(|_| unknown_handle(handle))?;
    let mut guard = table().write().map_err(|_| poisoned())?;
    let slot = guard.get_mut(index).ok_or_else(|| unknown_handle(handle))?;
    if slot.take().is_none() {
        return Err(unknown_handle(handle));
    }
    Ok(())
}

/// Copy a partials buffer into the instance. See
/// [`Instance::set_partials`].
///
/// # Errors
///
/// As [`Instance::set_partials`], plus unknown-handle.
pub fn set_partials(handle: i32, buffer_index: i32, in_partials: &[f64]) -> Result<()> {
    with_instance(handle, |inst| inst.set_partials(buffer_index, in_partials))
}

/// Copy a partials buffer out of the instance, blocking on asynchronous
/// backends. See [`Instance::get_partials`].
///
/// # Errors
///
/// As [`Instance::get_partials`], plus unknown-handle.
pub fn get_partials(handle: i32, buffer_index: i32, out_partials: &mut [f64]) -> Result<()> {
    with_instance(handle, |inst| inst.get_partials(buffer_index, out_partials))
}

/// Set a tip's compact state representation. See
/// [`Instance::set_tip_states`].
///
/// # Errors
///
/// As [`Instance::set_tip_states`], plus unknown-handle.
pub fn set_tip_states(handle: i32, tip_index: i32, in_states: &[i32]) -> Result<()> {
    with_instance(handle, |inst| inst.set_tip_states(tip_index, in_states))
}

/// Copy an eigen-decomposition into an eigen buffer. See
/// [`Instance::set_eigen_decomposition`].
///
/// # Errors
///
/// As [`Instance::set_eigen_decomposition`], plus unknown-handle.
pub fn set_eigen_decomposition(
    handle: i32,
    eigen_index: i32,
    in_eigen_vectors: &[f64],
    in_inverse_eigen_vectors: &[f64],
    in_eigen_values: &[f64],
) -> Result<()> {
    with_instance(handle, |inst| {
        inst.set_eigen_decomposition(
            eigen_index,
            in_eigen_vectors,
            in_inverse_eigen_vectors,
            in_eigen_values,
        )
    })
}

/// Set the category rate vector. See [`Instance::set_category_rates`].
///
/// # Errors
///
/// As [`Instance::set_category_rates`], plus unknown-handle.
pub fn set_category_rates(handle: i32, in_category_rates: &[f64]) -> Result<()> {
    with_instance(handle, |inst| inst.set_category_rates(in_category_rates))
}

/// Copy a closed-form transition matrix, bypassing the eigen path. See
/// [`Instance::set_transition_matrix`].
///
/// # Errors
///
/// As [`Instance::set_transition_matrix`], plus unknown-handle.
pub fn set_transition_matrix(handle: i32, matrix_index: i32, in_matrix: &[f64]) -> Result<()> {
    with_instance(handle, |inst| inst.set_transition_matrix(matrix_index, in_matrix))
}

/// Compute transition probability matrices and optional derivatives from
/// an eigen-decomposition. See [`Instance::update_transition_matrices`].
///
/// # Errors
///
/// As [`Instance::update_transition_matrices`], plus unknown-handle.
pub fn update_transition_matrices(
    handle: i32,
    eigen_index: i32,
    probability_indices: &[i32],
    first_derivative_indices: Option<&[i32]>,
    second_derivative_indices: Option<&[i32]>,
    edge_lengths: &[f64],
) -> Result<()> {
    with_instance(handle, |inst| {
        inst.update_transition_matrices(
            eigen_index,
            probability_indices,
            first_derivative_indices,
            second_derivative_indices,
            edge_lengths,
        )
    })
}

/// Execute (or enqueue) a peel operation list on each listed instance.
///
/// The full operation list is applied to every handle, in handle order;
/// callers submit lists meaningful for each handle.
///
/// # Errors
///
/// As [`Instance::update_partials`], plus unknown-handle. Processing stops
/// at the first failing handle.
pub fn update_partials(handles: &[i32], operations: &[i32], rescale: bool) -> Result<()> {
    for &handle in handles {
        with_instance(handle, |inst| inst.update_partials(operations, rescale))?;
    }
    Ok(())
}

/// Block until the listed destination buffers are stable on every listed
/// instance. See [`Instance::wait_for_partials`].
///
/// # Errors
///
/// As [`Instance::wait_for_partials`], plus unknown-handle.
pub fn wait_for_partials(handles: &[i32], destination_partials: &[i32]) -> Result<()> {
    for &handle in handles {
        with_instance(handle, |inst| inst.wait_for_partials(destination_partials))?;
    }
    Ok(())
}

/// Integrate root partials to site log-likelihoods. See
/// [`Instance::calculate_root_log_likelihoods`].
///
/// # Errors
///
/// As [`Instance::calculate_root_log_likelihoods`], plus unknown-handle.
pub fn calculate_root_log_likelihoods(
    handle: i32,
    buffer_indices: &[i32],
    in_weights: &[f64],
    in_state_frequencies: &[f64],
    scaling_factors_indices: &[i32],
    scaling_factors_counts: &[i32],
    out_log_likelihoods: &mut [f64],
) -> Result<()> {
    with_instance(handle, |inst| {
        inst.calculate_root_log_likelihoods(
            buffer_indices,
            in_weights,
            in_state_frequencies,
            scaling_factors_indices,
            scaling_factors_counts,
            out_log_likelihoods,
        )
    })
}

/// Integrate across edges for site log-likelihoods and branch-length
/// derivatives. See [`Instance::calculate_edge_log_likelihoods`].
///
/// # Errors
///
/// As [`Instance::calculate_edge_log_likelihoods`], plus unknown-handle.
#[allow(clippy::too_many_arguments)]
pub fn calculate_edge_log_likelihoods(
    handle: i32,
    parent_buffer_indices: &[i32],
    child_buffer_indices: &[i32],
    probability_indices: &[i32],
    first_derivative_indices: Option<&[i32]>,
    second_derivative_indices: Option<&[i32]>,
    in_weights: &[f64],
    in_state_frequencies: &[f64],
    scaling_factors_indices: &[i32],
    scaling_factors_counts: &[i32],
    out_log_likelihoods: &mut [f64],
    out_first_derivatives: Option<&mut [f64]>,
    out_second_derivatives: Option<&mut [f64]>,
) -> Result<()> {
    with_instance(handle, |inst| {
        inst.calculate_edge_log_likelihoods(
            parent_buffer_indices,
            child_buffer_indices,
            probability_indices,
            first_derivative_indices,
            second_derivative_indices,
            in_weights,
            in_state_frequencies,
            scaling_factors_indices,
            scaling_factors_counts,
            out_log_likelihoods,
            out_first_derivatives,
            out_second_derivatives,
        )
    })
}
