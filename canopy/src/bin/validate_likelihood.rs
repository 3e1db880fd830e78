// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation: likelihood engine against closed-form Jukes-Cantor results.
//!
//! Every expectation below is a direct formula evaluation — transition
//! probabilities `P(same) = 1/4 + 3/4·e^{-4t/3}`, Chapman-Kolmogorov
//! along two-tip paths, and finite-difference derivative checks — so the
//! engine is validated end to end without any external baseline files.

use wetspring_canopy::engine;
use wetspring_canopy::tolerances;
use wetspring_canopy::validation::Validator;
use wetspring_canopy::{Flags, InstanceSizing};

/// Jukes-Cantor eigen-decomposition, unit substitution rate.
/// `Q = U·diag(λ)·U⁻¹` with `λ = (0, -4/3, -4/3, -4/3)`.
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

fn jc_p_same(t: f64) -> f64 {
    0.25 + 0.75 * (-4.0 * t / 3.0).exp()
}

fn jc_p_diff(t: f64) -> f64 {
    0.25 - 0.25 * (-4.0 * t / 3.0).exp()
}

fn two_tip_sizing(category_count: usize) -> InstanceSizing {
    InstanceSizing {
        state_count: 4,
        pattern_count: 1,
        category_count,
        tip_count: 2,
        partials_buffer_count: 4,
        compact_buffer_count: 2,
        eigen_buffer_count: 1,
        matrix_buffer_count: 6,
    }
}

/// Two tips in state 0 joined at a root, both branches `t`.
/// Returns the site log-likelihood from the root kernel.
fn two_tip_log_likelihood(t: f64, rates: &[f64], weights: &[f64]) -> f64 {
    let sizing = two_tip_sizing(rates.len());
    let handle = engine::create_instance(&sizing, None, Flags::NONE, Flags::NONE)
        .expect("create");
    engine::initialize_instance(handle).expect("initialize");
    let (u, inv, lam) = jc_eigen();
    engine::set_eigen_decomposition(handle, 0, &u, &inv, &lam).expect("eigen");
    engine::set_category_rates(handle, rates).expect("rates");
    engine::set_tip_states(handle, 0, &[0]).expect("tip 0");
    engine::set_tip_states(handle, 1, &[0]).expect("tip 1");
    engine::update_transition_matrices(handle, 0, &[0, 1], None, None, &[t, t])
        .expect("matrices");
    engine::update_partials(&[handle], &[2, 3, 0, 0, 1, 1], false).expect("peel");
    let freqs = [0.25; 4];
    let mut out = [0.0];
    engine::calculate_root_log_likelihoods(handle, &[2], weights, &freqs, &[], &[0], &mut out)
        .expect("root");
    engine::finalize(handle).expect("finalize");
    out[0]
}

/// Single edge between a one-hot parent and a compact child, both state 0.
fn edge_log_likelihood(t: f64, with_derivatives: bool) -> (f64, f64, f64) {
    let sizing = two_tip_sizing(1);
    let handle = engine::create_instance(&sizing, None, Flags::NONE, Flags::NONE)
        .expect("create");
    engine::initialize_instance(handle).expect("initialize");
    let (u, inv, lam) = jc_eigen();
    engine::set_eigen_decomposition(handle, 0, &u, &inv, &lam).expect("eigen");
    let mut one_hot = [0.0; 4];
    one_hot[0] = 1.0;
    engine::set_partials(handle, 0, &one_hot).expect("parent");
    engine::set_tip_states(handle, 1, &[0]).expect("child");
    let d1_list = [1];
    let d2_list = [2];
    let (d1_idx, d2_idx) = if with_derivatives {
        (Some(&d1_list[..]), Some(&d2_list[..]))
    } else {
        (None, None)
    };
    engine::update_transition_matrices(handle, 0, &[0], d1_idx, d2_idx, &[t]).expect("matrices");
    let freqs = [0.25; 4];
    let weights = [1.0];
    let mut out = [0.0];
    let mut d1 = [0.0];
    let mut d2 = [0.0];
    let out_d1 = with_derivatives.then_some(&mut d1[..]);
    let out_d2 = with_derivatives.then_some(&mut d2[..]);
    engine::calculate_edge_log_likelihoods(
        handle,
        &[0],
        &[1],
        &[0],
        d1_idx,
        d2_idx,
        &weights,
        &freqs,
        &[],
        &[0],
        &mut out,
        out_d1,
        out_d2,
    )
    .expect("edge");
    engine::finalize(handle).expect("finalize");
    (out[0], d1[0], d2[0])
}

#[allow(clippy::too_many_lines)]
fn main() {
    let mut v = Validator::new("Canopy: closed-form likelihood validation");

    v.section("── Resource registry ──");
    let resources = wetspring_canopy::resource::resources();
    for (i, r) in resources.iter().enumerate() {
        println!("  {i}: {} [{}]", r.name, r.flags);
    }
    v.check_that("registry is non-empty", !resources.is_empty());
    v.check_that(
        "resource 0 is a synchronous double-precision CPU",
        resources[0].flags.contains(Flags::CPU | Flags::DOUBLE | Flags::SYNCH),
    );

    // ── E1: two-tip Jukes-Cantor tree ───────────────────────────────
    v.section("── E1: two tips, t = 0.1 ──");
    let t: f64 = 0.1;
    let expected = (0.25 * (0.25 + 0.75 * (-8.0 * t / 3.0).exp())).ln();
    v.check(
        "logL = ln(1/4·(1/4 + 3/4·e^(-8t/3)))",
        two_tip_log_likelihood(t, &[1.0], &[1.0]),
        expected,
        tolerances::ANALYTICAL_F64,
    );

    // ── E2: identity transitions ────────────────────────────────────
    v.section("── E2: zero branches ──");
    v.check(
        "logL = ln(1/4) at t = 0",
        two_tip_log_likelihood(0.0, &[1.0], &[1.0]),
        0.25_f64.ln(),
        tolerances::ANALYTICAL_F64,
    );

    // ── E3: ambiguous tip ───────────────────────────────────────────
    v.section("── E3: missing tip at t = 0 ──");
    {
        let sizing = two_tip_sizing(1);
        let handle = engine::create_instance(&sizing, None, Flags::NONE, Flags::NONE)
            .expect("create");
        engine::initialize_instance(handle).expect("initialize");
        let (u, inv, lam) = jc_eigen();
        engine::set_eigen_decomposition(handle, 0, &u, &inv, &lam).expect("eigen");
        engine::set_tip_states(handle, 0, &[4]).expect("tip 0 missing");
        engine::set_tip_states(handle, 1, &[0]).expect("tip 1");
        engine::update_transition_matrices(handle, 0, &[0, 1], None, None, &[0.0, 0.0])
            .expect("matrices");
        engine::update_partials(&[handle], &[2, 3, 0, 0, 1, 1], false).expect("peel");
        let mut out = [0.0];
        engine::calculate_root_log_likelihoods(
            handle,
            &[2],
            &[1.0],
            &[0.25; 4],
            &[],
            &[0],
            &mut out,
        )
        .expect("root");
        engine::finalize(handle).expect("finalize");
        v.check(
            "logL = ln(1/4) with one tip missing",
            out[0],
            0.25_f64.ln(),
            tolerances::ANALYTICAL_F64,
        );
    }

    // ── E4: rescaled deep star tree ─────────────────────────────────
    v.section("── E4: 50-tip star, rescaling round trip ──");
    {
        let tips = 50;
        let branch = 0.01;
        let sizing = InstanceSizing {
            state_count: 4,
            pattern_count: 1,
            category_count: 1,
            tip_count: tips,
            partials_buffer_count: 2 * tips,
            compact_buffer_count: tips,
            eigen_buffer_count: 1,
            matrix_buffer_count: 2,
        };
        let (u, inv, lam) = jc_eigen();
        // A star is peeled as a caterpillar with zero-length inner edges:
        // matrix 0 is the tip branch, matrix 1 the identity.
        let mut ops = vec![tips as i32, tips as i32 + 1, 0, 0, 1, 0];
        for k in 2..tips {
            let dest = (tips + k - 1) as i32;
            ops.extend_from_slice(&[dest, dest + 1, dest - 1, 1, k as i32, 0]);
        }
        let root = (2 * tips - 2) as i32;

        let run = |rescale: bool| -> (f64, f64) {
            let handle = engine::create_instance(&sizing, None, Flags::NONE, Flags::NONE)
                .expect("create");
            engine::initialize_instance(handle).expect("initialize");
            engine::set_eigen_decomposition(handle, 0, &u, &inv, &lam).expect("eigen");
            for tip in 0..tips {
                engine::set_tip_states(handle, tip as i32, &[0]).expect("tip");
            }
            engine::update_transition_matrices(handle, 0, &[0, 1], None, None, &[branch, 0.0])
                .expect("matrices");
            engine::update_partials(&[handle], &ops, rescale).expect("peel");
            let scaling: Vec<i32> = if rescale {
                (tips as i32 + 1..=root + 1).collect()
            } else {
                Vec::new()
            };
            let counts = [scaling.len() as i32];
            let mut out = [0.0];
            engine::calculate_root_log_likelihoods(
                handle,
                &[root],
                &[1.0],
                &[0.25; 4],
                &scaling,
                &counts,
                &mut out,
            )
            .expect("root");
            let mut partials = [0.0; 4];
            engine::get_partials(handle, root, &mut partials).expect("get");
            engine::finalize(handle).expect("finalize");
            let max = partials.iter().fold(0.0_f64, |m, &x| m.max(x));
            (out[0], max)
        };
        let (plain, _) = run(false);
        let (scaled, root_max) = run(true);
        let p_same = jc_p_same(branch);
        let p_diff = jc_p_diff(branch);
        let expected =
            (0.25 * (p_same.powi(tips as i32) + 3.0 * p_diff.powi(tips as i32))).ln();
        v.check(
            "unscaled logL matches closed form",
            plain,
            expected,
            tolerances::ANALYTICAL_F64,
        );
        v.check(
            "rescaled logL = unscaled logL",
            scaled,
            plain,
            tolerances::SCALING_ROUND_TRIP,
        );
        v.check_that("rescaled root partials stay near 1", root_max <= 1.0 + 1e-12);
    }

    // ── E5: edge derivatives ────────────────────────────────────────
    v.section("── E5: branch-length derivatives at t = 0.3 ──");
    {
        let t = 0.3;
        let (log_l, d1, d2) = edge_log_likelihood(t, true);
        v.check(
            "edge logL = ln(1/4·P(same))",
            log_l,
            (0.25 * jc_p_same(t)).ln(),
            tolerances::ANALYTICAL_F64,
        );
        let e = (-4.0 * t / 3.0).exp();
        v.check(
            "d/dt logL analytic",
            d1,
            -e / jc_p_same(t),
            tolerances::ANALYTICAL_F64,
        );
        let h = 1.0e-4;
        let (up, _, _) = edge_log_likelihood(t + h, false);
        let (down, _, _) = edge_log_likelihood(t - h, false);
        v.check(
            "d/dt logL vs central difference",
            d1,
            (up - down) / (2.0 * h),
            tolerances::DERIVATIVE_WELL_CONDITIONED,
        );
        v.check(
            "d²/dt² logL vs central difference",
            d2,
            (up - 2.0 * log_l + down) / (h * h),
            tolerances::DERIVATIVE_CENTRAL_DIFF,
        );
    }

    // ── E6: gamma-style rate mixture ────────────────────────────────
    v.section("── E6: four rate categories ──");
    {
        let t: f64 = 0.1;
        let rates = [0.1, 0.5, 1.0, 2.4];
        let weights = [0.25; 4];
        let expected: f64 = rates
            .iter()
            .map(|r| 0.25 * 0.25 * (0.25 + 0.75 * (-8.0 * t * r / 3.0).exp()))
            .sum::<f64>()
            .ln();
        v.check(
            "logL = ln(Σ_c w_c·L_c)",
            two_tip_log_likelihood(t, &rates, &weights),
            expected,
            tolerances::ANALYTICAL_F64,
        );
    }

    // ── Transition-probability sanity ───────────────────────────────
    v.section("── Transition probabilities ──");
    v.check("P(same, t=0.1) + 3·P(diff, t=0.1) = 1", jc_p_same(0.1) + 3.0 * jc_p_diff(0.1), 1.0, tolerances::ROW_STOCHASTIC);

    v.finish();
}
