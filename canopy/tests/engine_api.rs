// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract tests for the procedural boundary: handle lifecycle, entry
//! validation, error codes, instance isolation, and backend parity.

use wetspring_canopy::{engine, resource, Flags, InstanceSizing};

fn sizing() -> InstanceSizing {
    InstanceSizing {
        state_count: 4,
        pattern_count: 2,
        category_count: 1,
        tip_count: 2,
        partials_buffer_count: 4,
        compact_buffer_count: 2,
        eigen_buffer_count: 1,
        matrix_buffer_count: 3,
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

fn ready_handle() -> i32 {
    let handle = engine::create_instance(&sizing(), None, Flags::NONE, Flags::NONE).unwrap();
    engine::initialize_instance(handle).unwrap();
    handle
}

#[test]
fn partials_round_trip_is_bit_exact() {
    let handle = ready_handle();
    let values: Vec<f64> = (0..8).map(|i| f64::from(i) * 0.0625 + 1.0e-3).collect();
    engine::set_partials(handle, 3, &values).unwrap();
    let mut out = vec![0.0; 8];
    engine::get_partials(handle, 3, &mut out).unwrap();
    for (a, b) in values.iter().zip(&out) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
    engine::finalize(handle).unwrap();
}

#[test]
fn out_of_range_leaves_state_unchanged() {
    let handle = ready_handle();
    let values = vec![0.5; 8];
    engine::set_partials(handle, 1, &values).unwrap();

    // Bad destination index in an operation list.
    let err = engine::update_partials(&[handle], &[9, 3, 0, 0, 1, 1], false).unwrap_err();
    assert_eq!(err.code(), -5);
    // Bad matrix index.
    let err = engine::update_partials(&[handle], &[2, 3, 0, 7, 1, 1], false).unwrap_err();
    assert_eq!(err.code(), -5);

    let mut out = vec![0.0; 8];
    engine::get_partials(handle, 1, &mut out).unwrap();
    assert_eq!(out, values);
    engine::finalize(handle).unwrap();
}

#[test]
fn kernel_calls_before_initialize_fail() {
    let handle = engine::create_instance(&sizing(), None, Flags::NONE, Flags::NONE).unwrap();
    assert_eq!(
        engine::update_partials(&[handle], &[2, 3, 0, 0, 1, 1], false)
            .unwrap_err()
            .code(),
        -4
    );
    assert_eq!(
        engine::set_category_rates(handle, &[1.0]).unwrap_err().code(),
        -4
    );
    engine::finalize(handle).unwrap();
}

#[test]
fn finalized_handles_are_dead() {
    let handle = ready_handle();
    engine::finalize(handle).unwrap();
    assert_eq!(
        engine::wait_for_partials(&[handle], &[2]).unwrap_err().code(),
        -4
    );
    assert_eq!(engine::finalize(handle).unwrap_err().code(), -4);
}

#[test]
fn instances_are_isolated() {
    let a = ready_handle();
    let b = ready_handle();
    let ones = vec![1.0; 8];
    let twos = vec![2.0; 8];
    engine::set_partials(a, 2, &ones).unwrap();
    engine::set_partials(b, 2, &twos).unwrap();

    // Peel on `a` only; `b`'s buffers must be untouched.
    let (u, inv, lam) = jc_eigen();
    engine::set_eigen_decomposition(a, 0, &u, &inv, &lam).unwrap();
    engine::update_transition_matrices(a, 0, &[0, 1], None, None, &[0.1, 0.1]).unwrap();
    engine::set_tip_states(a, 0, &[0, 1]).unwrap();
    engine::set_tip_states(a, 1, &[2, 3]).unwrap();
    engine::update_partials(&[a], &[2, 3, 0, 0, 1, 1], false).unwrap();

    let mut out = vec![0.0; 8];
    engine::get_partials(b, 2, &mut out).unwrap();
    assert_eq!(out, twos);

    engine::get_partials(a, 2, &mut out).unwrap();
    assert_ne!(out, ones);

    engine::finalize(a).unwrap();
    engine::finalize(b).unwrap();
}

#[test]
fn wait_for_partials_validates_then_succeeds() {
    let handle = ready_handle();
    engine::wait_for_partials(&[handle], &[2, 3]).unwrap();
    assert_eq!(
        engine::wait_for_partials(&[handle], &[4]).unwrap_err().code(),
        -5
    );
    engine::finalize(handle).unwrap();
}

#[test]
fn malformed_operation_list_is_rejected() {
    let handle = ready_handle();
    assert_eq!(
        engine::update_partials(&[handle], &[2, 3, 0, 0, 1], false)
            .unwrap_err()
            .code(),
        -5
    );
    engine::finalize(handle).unwrap();
}

#[test]
fn rescaling_requires_scaling_index_above_tips() {
    let handle = ready_handle();
    // destScaling = 2 == tip count: rejected when rescaling.
    assert_eq!(
        engine::update_partials(&[handle], &[2, 2, 0, 0, 1, 1], true)
            .unwrap_err()
            .code(),
        -5
    );
    // Same tuple without rescaling is fine.
    engine::update_partials(&[handle], &[2, 2, 0, 0, 1, 1], false).unwrap();
    engine::finalize(handle).unwrap();
}

#[test]
fn unsatisfiable_requirements_produce_no_handle() {
    let err =
        engine::create_instance(&sizing(), None, Flags::NONE, Flags::FPGA | Flags::CELL)
            .unwrap_err();
    assert_eq!(err.code(), -1);
}

#[test]
fn allowed_resource_list_restricts_selection() {
    let handle =
        engine::create_instance(&sizing(), Some(&[0]), Flags::NONE, Flags::NONE).unwrap();
    let details = engine::initialize_instance(handle).unwrap();
    assert_eq!(details.resource_index, 0);
    engine::finalize(handle).unwrap();

    assert_eq!(
        engine::create_instance(&sizing(), Some(&[]), Flags::NONE, Flags::NONE)
            .unwrap_err()
            .code(),
        -1
    );
}

#[test]
fn sse_preference_selects_vector_backend_when_listed() {
    let has_sse = resource::resources()
        .iter()
        .any(|r| r.flags.contains(Flags::SSE));
    if !has_sse {
        return;
    }
    let handle =
        engine::create_instance(&sizing(), None, Flags::SSE, Flags::NONE).unwrap();
    let details = engine::initialize_instance(handle).unwrap();
    assert!(details.flags.contains(Flags::SSE));
    engine::finalize(handle).unwrap();
}

#[test]
fn scalar_and_vector_backends_agree() {
    let has_sse = resource::resources()
        .iter()
        .any(|r| r.flags.contains(Flags::SSE));
    if !has_sse {
        return;
    }

    let run = |require: Flags| -> Vec<f64> {
        let handle = engine::create_instance(&sizing(), None, Flags::NONE, require).unwrap();
        engine::initialize_instance(handle).unwrap();
        let (u, inv, lam) = jc_eigen();
        engine::set_eigen_decomposition(handle, 0, &u, &inv, &lam).unwrap();
        engine::update_transition_matrices(handle, 0, &[0, 1], None, None, &[0.07, 0.23])
            .unwrap();
        let child1: Vec<f64> = (0..8).map(|i| 0.1 + 0.09 * f64::from(i)).collect();
        let child2: Vec<f64> = (0..8).map(|i| 0.95 - 0.07 * f64::from(i)).collect();
        engine::set_partials(handle, 2, &child1).unwrap();
        engine::set_partials(handle, 3, &child2).unwrap();
        engine::update_partials(&[handle], &[3, 3, 2, 0, 3, 1], false).unwrap();
        let mut out = [0.0; 2];
        engine::calculate_root_log_likelihoods(
            handle,
            &[3],
            &[1.0],
            &[0.1, 0.2, 0.3, 0.4],
            &[],
            &[0],
            &mut out,
        )
        .unwrap();
        engine::finalize(handle).unwrap();
        out.to_vec()
    };

    let scalar = run(Flags::NONE);
    let vector = run(Flags::SSE);
    for (a, b) in scalar.iter().zip(&vector) {
        assert_eq!(a.to_bits(), b.to_bits(), "scalar {a} vs vector {b}");
    }
}

/// GPU f64 engine against the scalar CPU reference. Runs only when an
/// f64-capable adapter is present in the registry.
#[cfg(feature = "gpu")]
#[test]
fn gpu_backend_matches_cpu_reference() {
    use wetspring_canopy::tolerances;

    let has_gpu = resource::resources()
        .iter()
        .any(|r| r.flags.contains(Flags::GPU));
    if !has_gpu {
        return;
    }

    let run = |require: Flags| -> Vec<f64> {
        let handle = engine::create_instance(&sizing(), None, Flags::NONE, require).unwrap();
        engine::initialize_instance(handle).unwrap();
        let (u, inv, lam) = jc_eigen();
        engine::set_eigen_decomposition(handle, 0, &u, &inv, &lam).unwrap();
        engine::set_tip_states(handle, 0, &[0, 4]).unwrap();
        engine::set_tip_states(handle, 1, &[2, 1]).unwrap();
        engine::update_transition_matrices(handle, 0, &[0, 1], None, None, &[0.11, 0.27])
            .unwrap();
        engine::update_partials(&[handle], &[2, 3, 0, 0, 1, 1], true).unwrap();
        engine::wait_for_partials(&[handle], &[2]).unwrap();
        let mut out = [0.0; 2];
        engine::calculate_root_log_likelihoods(
            handle,
            &[2],
            &[1.0],
            &[0.25; 4],
            &[3],
            &[1],
            &mut out,
        )
        .unwrap();
        engine::finalize(handle).unwrap();
        out.to_vec()
    };

    let cpu = run(Flags::CPU);
    let gpu = run(Flags::GPU);
    for (a, b) in cpu.iter().zip(&gpu) {
        assert!(
            (a - b).abs() < tolerances::GPU_VS_CPU,
            "cpu {a} vs gpu {b}"
        );
    }
}

#[test]
fn set_transition_matrix_is_write_wins() {
    let handle = ready_handle();
    let (u, inv, lam) = jc_eigen();
    engine::set_eigen_decomposition(handle, 0, &u, &inv, &lam).unwrap();

    // Explicit matrix first: uniform rows, so every child contributes 1/4.
    let custom = vec![0.25; 16];
    engine::set_transition_matrix(handle, 0, &custom).unwrap();
    engine::set_transition_matrix(handle, 1, &custom).unwrap();
    engine::set_tip_states(handle, 0, &[1, 2]).unwrap();
    engine::set_tip_states(handle, 1, &[3, 1]).unwrap();
    engine::update_partials(&[handle], &[2, 3, 0, 0, 1, 1], false).unwrap();
    let mut out = [0.0; 2];
    engine::calculate_root_log_likelihoods(
        handle,
        &[2],
        &[1.0],
        &[0.25; 4],
        &[],
        &[0],
        &mut out,
    )
    .unwrap();
    // Each child term is 1/4, so every pattern likelihood is 1/16.
    for &site in &out {
        assert!((site - 0.0625_f64.ln()).abs() < 1e-12);
    }

    // The eigen path then overwrites the same indices.
    engine::update_transition_matrices(handle, 0, &[0, 1], None, None, &[0.0, 0.0]).unwrap();
    engine::update_partials(&[handle], &[2, 3, 0, 0, 1, 1], false).unwrap();
    engine::calculate_root_log_likelihoods(
        handle,
        &[2],
        &[1.0],
        &[0.25; 4],
        &[],
        &[0],
        &mut out,
    )
    .unwrap();
    // Identity matrices and mismatched tips: zero likelihood.
    assert!(out.iter().all(|&site| site.is_infinite() && site < 0.0));
    engine::finalize(handle).unwrap();
}

#[test]
fn resource_registry_lists_cpu_first() {
    let list = resource::resources();
    assert!(!list.is_empty());
    assert!(list[0].flags.contains(Flags::CPU | Flags::DOUBLE | Flags::SYNCH));
    assert!(!list[0].name.is_empty());
}

#[test]
fn batched_update_applies_to_all_handles() {
    let a = ready_handle();
    let b = ready_handle();
    let (u, inv, lam) = jc_eigen();
    for &h in &[a, b] {
        engine::set_eigen_decomposition(h, 0, &u, &inv, &lam).unwrap();
        engine::update_transition_matrices(h, 0, &[0, 1], None, None, &[0.1, 0.1]).unwrap();
        engine::set_tip_states(h, 0, &[0, 0]).unwrap();
        engine::set_tip_states(h, 1, &[0, 0]).unwrap();
    }
    engine::update_partials(&[a, b], &[2, 3, 0, 0, 1, 1], false).unwrap();

    let mut out_a = [0.0; 8];
    let mut out_b = [0.0; 8];
    engine::get_partials(a, 2, &mut out_a).unwrap();
    engine::get_partials(b, 2, &mut out_b).unwrap();
    assert_eq!(out_a, out_b);
    assert!(out_a.iter().any(|&v| v > 0.0));

    engine::finalize(a).unwrap();
    engine::finalize(b).unwrap();
}
