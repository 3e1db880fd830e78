// SPDX-License-Identifier: AGPL-3.0-or-later
//! WGSL f64 compute shaders for the GPU engine.
//!
//! All shaders stay within f64 add/mul/div/compare — transcendentals are
//! evaluated on the host (the eigenvalue exponentials are `O(S·C)` per
//! matrix while assembly is `O(S²·C)`, and `exp(f64)`/`log(f64)` are the
//! classic driver trouble spots for f64 WGSL). Scaling buffers therefore
//! hold the *raw* per-pattern scaler on device; the host takes logs at
//! integration readback.
//!
//! One invocation per site pattern for peeling and integration — patterns
//! are independent, matching the site-parallel dispatch strategy the CPU
//! engines block over. Layouts match the host: partials `(c·P + p)·S + s`,
//! matrices `(c·S + s)·S + s'`, one `S×S` slot per category.
//!
//! WGSL has no include mechanism; shared sections are assembled here once
//! at pipeline construction instead of being duplicated per variant.

/// Transition-matrix assembly: `out[c,si,sj] = Σ_k U[si,k]·diag[c,k]·U⁻¹[k,sj]`.
///
/// `diag` carries host-computed factors — `exp(λ·t·r_c)` for the
/// probability matrix, `λ·r_c·exp(…)` and `(λ·r_c)²·exp(…)` for the
/// derivative matrices — so one pipeline serves all three.
pub(crate) const ASSEMBLE_MATRIX: &str = r"
struct Params {
    state_count: u32,
    category_count: u32,
    pad0: u32,
    pad1: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> vectors: array<f64>;
@group(0) @binding(2) var<storage, read> inverse: array<f64>;
@group(0) @binding(3) var<storage, read> diag: array<f64>;
@group(0) @binding(4) var<storage, read_write> out_matrix: array<f64>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let s = params.state_count;
    let total = params.category_count * s * s;
    let idx = gid.x;
    if (idx >= total) {
        return;
    }
    let c = idx / (s * s);
    let rem = idx % (s * s);
    let si = rem / s;
    let sj = rem % s;
    var acc = f64(0.0);
    for (var k = 0u; k < s; k = k + 1u) {
        acc = acc + vectors[si * s + k] * diag[c * s + k] * inverse[k * s + sj];
    }
    out_matrix[idx] = acc;
}
";

const PEEL_PRELUDE: &str = r"
struct Params {
    state_count: u32,
    pattern_count: u32,
    category_count: u32,
    rescale: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> matrix1: array<f64>;
@group(0) @binding(2) var<storage, read> matrix2: array<f64>;
@group(0) @binding(5) var<storage, read_write> dest: array<f64>;
@group(0) @binding(6) var<storage, read_write> scalers: array<f64>;

fn row_sum(m_base: u32, si: u32) -> f64 {
    let s = params.state_count;
    var acc = f64(0.0);
    for (var sj = 0u; sj < s; sj = sj + 1u) {
        acc = acc + matrix_ref(m_base + si * s + sj);
    }
    return acc;
}

fn rescale_pattern(p: u32) {
    let s = params.state_count;
    let pc = params.pattern_count;
    var max_value = f64(0.0);
    for (var c = 0u; c < params.category_count; c = c + 1u) {
        let off = (c * pc + p) * s;
        for (var si = 0u; si < s; si = si + 1u) {
            let v = dest[off + si];
            max_value = select(max_value, v, v > max_value);
        }
    }
    if (max_value > f64(0.0)) {
        for (var c = 0u; c < params.category_count; c = c + 1u) {
            let off = (c * pc + p) * s;
            for (var si = 0u; si < s; si = si + 1u) {
                dest[off + si] = dest[off + si] / max_value;
            }
        }
        scalers[p] = max_value;
    } else {
        scalers[p] = f64(1.0);
    }
}
";

const PEEL_PARTIALS_PARTIALS_BODY: &str = r"
@group(0) @binding(3) var<storage, read> child1: array<f64>;
@group(0) @binding(4) var<storage, read> child2: array<f64>;

fn matrix_ref(index: u32) -> f64 {
    return matrix1[index];
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let p = gid.x;
    if (p >= params.pattern_count) {
        return;
    }
    let s = params.state_count;
    let pc = params.pattern_count;
    for (var c = 0u; c < params.category_count; c = c + 1u) {
        let moff = c * s * s;
        let off = (c * pc + p) * s;
        for (var si = 0u; si < s; si = si + 1u) {
            var sum1 = f64(0.0);
            var sum2 = f64(0.0);
            for (var sj = 0u; sj < s; sj = sj + 1u) {
                sum1 = sum1 + matrix1[moff + si * s + sj] * child1[off + sj];
                sum2 = sum2 + matrix2[moff + si * s + sj] * child2[off + sj];
            }
            dest[off + si] = sum1 * sum2;
        }
    }
    if (params.rescale == 1u) {
        rescale_pattern(p);
    }
}
";

const PEEL_STATES_PARTIALS_BODY: &str = r"
@group(0) @binding(3) var<storage, read> child1: array<u32>;
@group(0) @binding(4) var<storage, read> child2: array<f64>;

fn matrix_ref(index: u32) -> f64 {
    return matrix1[index];
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let p = gid.x;
    if (p >= params.pattern_count) {
        return;
    }
    let s = params.state_count;
    let pc = params.pattern_count;
    let state = child1[p];
    for (var c = 0u; c < params.category_count; c = c + 1u) {
        let moff = c * s * s;
        let off = (c * pc + p) * s;
        for (var si = 0u; si < s; si = si + 1u) {
            var sum1 = f64(0.0);
            if (state < s) {
                sum1 = matrix1[moff + si * s + state];
            } else {
                sum1 = row_sum(moff, si);
            }
            var sum2 = f64(0.0);
            for (var sj = 0u; sj < s; sj = sj + 1u) {
                sum2 = sum2 + matrix2[moff + si * s + sj] * child2[off + sj];
            }
            dest[off + si] = sum1 * sum2;
        }
    }
    if (params.rescale == 1u) {
        rescale_pattern(p);
    }
}
";

const PEEL_STATES_STATES_BODY: &str = r"
@group(0) @binding(3) var<storage, read> child1: array<u32>;
@group(0) @binding(4) var<storage, read> child2: array<u32>;

fn matrix_ref(index: u32) -> f64 {
    return matrix1[index];
}

fn row_sum2(m_base: u32, si: u32) -> f64 {
    let s = params.state_count;
    var acc = f64(0.0);
    for (var sj = 0u; sj < s; sj = sj + 1u) {
        acc = acc + matrix2[m_base + si * s + sj];
    }
    return acc;
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let p = gid.x;
    if (p >= params.pattern_count) {
        return;
    }
    let s = params.state_count;
    let pc = params.pattern_count;
    let state1 = child1[p];
    let state2 = child2[p];
    for (var c = 0u; c < params.category_count; c = c + 1u) {
        let moff = c * s * s;
        let off = (c * pc + p) * s;
        for (var si = 0u; si < s; si = si + 1u) {
            var sum1 = f64(0.0);
            if (state1 < s) {
                sum1 = matrix1[moff + si * s + state1];
            } else {
                sum1 = row_sum(moff, si);
            }
            var sum2 = f64(0.0);
            if (state2 < s) {
                sum2 = matrix2[moff + si * s + state2];
            } else {
                sum2 = row_sum2(moff, si);
            }
            dest[off + si] = sum1 * sum2;
        }
    }
    if (params.rescale == 1u) {
        rescale_pattern(p);
    }
}
";

/// Peel with two partials children.
#[must_use]
pub(crate) fn peel_partials_partials() -> String {
    format!("{PEEL_PRELUDE}{PEEL_PARTIALS_PARTIALS_BODY}")
}

/// Peel with a compact first child and partials second.
#[must_use]
pub(crate) fn peel_states_partials() -> String {
    format!("{PEEL_PRELUDE}{PEEL_STATES_PARTIALS_BODY}")
}

/// Peel with two compact children.
#[must_use]
pub(crate) fn peel_states_states() -> String {
    format!("{PEEL_PRELUDE}{PEEL_STATES_STATES_BODY}")
}

/// Root integration: raw per-pattern likelihood
/// `L_p = Σ_s freqs[s] · Σ_c weights[c] · partials[c,p,s]`.
/// The host adds logs and scaling corrections after readback.
pub(crate) const ROOT_INTEGRATE: &str = r"
struct Params {
    state_count: u32,
    pattern_count: u32,
    category_count: u32,
    pad0: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> partials: array<f64>;
@group(0) @binding(2) var<storage, read> weights: array<f64>;
@group(0) @binding(3) var<storage, read> freqs: array<f64>;
@group(0) @binding(4) var<storage, read_write> out_lik: array<f64>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let p = gid.x;
    if (p >= params.pattern_count) {
        return;
    }
    let s = params.state_count;
    let pc = params.pattern_count;
    var lik = f64(0.0);
    for (var si = 0u; si < s; si = si + 1u) {
        var across = f64(0.0);
        for (var c = 0u; c < params.category_count; c = c + 1u) {
            across = across + weights[c] * partials[(c * pc + p) * s + si];
        }
        lik = lik + freqs[si] * across;
    }
    out_lik[p] = lik;
}
";

const EDGE_PRELUDE: &str = r"
struct Params {
    state_count: u32,
    pattern_count: u32,
    category_count: u32,
    has_first: u32,
    has_second: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> parent: array<f64>;
@group(0) @binding(3) var<storage, read> matrix0: array<f64>;
@group(0) @binding(4) var<storage, read> matrix_d1: array<f64>;
@group(0) @binding(5) var<storage, read> matrix_d2: array<f64>;
@group(0) @binding(6) var<storage, read> weights: array<f64>;
@group(0) @binding(7) var<storage, read> freqs: array<f64>;
@group(0) @binding(8) var<storage, read_write> out_lik: array<f64>;
@group(0) @binding(9) var<storage, read_write> out_d1: array<f64>;
@group(0) @binding(10) var<storage, read_write> out_d2: array<f64>;
";

const EDGE_PARTIALS_BODY: &str = r"
@group(0) @binding(2) var<storage, read> child: array<f64>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let p = gid.x;
    if (p >= params.pattern_count) {
        return;
    }
    let s = params.state_count;
    let pc = params.pattern_count;
    var lik = f64(0.0);
    var d1 = f64(0.0);
    var d2 = f64(0.0);
    for (var c = 0u; c < params.category_count; c = c + 1u) {
        let moff = c * s * s;
        let off = (c * pc + p) * s;
        let wc = weights[c];
        for (var si = 0u; si < s; si = si + 1u) {
            let weight = freqs[si] * wc * parent[off + si];
            var sum0 = f64(0.0);
            var sum1 = f64(0.0);
            var sum2 = f64(0.0);
            for (var sj = 0u; sj < s; sj = sj + 1u) {
                let cv = child[off + sj];
                sum0 = sum0 + matrix0[moff + si * s + sj] * cv;
                if (params.has_first == 1u) {
                    sum1 = sum1 + matrix_d1[moff + si * s + sj] * cv;
                }
                if (params.has_second == 1u) {
                    sum2 = sum2 + matrix_d2[moff + si * s + sj] * cv;
                }
            }
            lik = lik + weight * sum0;
            d1 = d1 + weight * sum1;
            d2 = d2 + weight * sum2;
        }
    }
    out_lik[p] = lik;
    out_d1[p] = d1;
    out_d2[p] = d2;
}
";

const EDGE_STATES_BODY: &str = r"
@group(0) @binding(2) var<storage, read> child: array<u32>;

fn column_or_sum(moff: u32, si: u32, state: u32, which: u32) -> f64 {
    let s = params.state_count;
    if (state < s) {
        let index = moff + si * s + state;
        if (which == 0u) {
            return matrix0[index];
        } else if (which == 1u) {
            return matrix_d1[index];
        }
        return matrix_d2[index];
    }
    var acc = f64(0.0);
    for (var sj = 0u; sj < s; sj = sj + 1u) {
        let index = moff + si * s + sj;
        if (which == 0u) {
            acc = acc + matrix0[index];
        } else if (which == 1u) {
            acc = acc + matrix_d1[index];
        } else {
            acc = acc + matrix_d2[index];
        }
    }
    return acc;
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let p = gid.x;
    if (p >= params.pattern_count) {
        return;
    }
    let s = params.state_count;
    let pc = params.pattern_count;
    let state = child[p];
    var lik = f64(0.0);
    var d1 = f64(0.0);
    var d2 = f64(0.0);
    for (var c = 0u; c < params.category_count; c = c + 1u) {
        let moff = c * s * s;
        let off = (c * pc + p) * s;
        let wc = weights[c];
        for (var si = 0u; si < s; si = si + 1u) {
            let weight = freqs[si] * wc * parent[off + si];
            lik = lik + weight * column_or_sum(moff, si, state, 0u);
            if (params.has_first == 1u) {
                d1 = d1 + weight * column_or_sum(moff, si, state, 1u);
            }
            if (params.has_second == 1u) {
                d2 = d2 + weight * column_or_sum(moff, si, state, 2u);
            }
        }
    }
    out_lik[p] = lik;
    out_d1[p] = d1;
    out_d2[p] = d2;
}
";

/// Edge integration with a partials child.
#[must_use]
pub(crate) fn edge_partials() -> String {
    format!("{EDGE_PRELUDE}{EDGE_PARTIALS_BODY}")
}

/// Edge integration with a compact child.
#[must_use]
pub(crate) fn edge_states() -> String {
    format!("{EDGE_PRELUDE}{EDGE_STATES_BODY}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembled_shaders_declare_entry_points() {
        for src in [
            peel_partials_partials(),
            peel_states_partials(),
            peel_states_states(),
            edge_partials(),
            edge_states(),
        ] {
            assert!(src.contains("fn main"), "missing entry point");
            assert!(src.contains("var<uniform> params"), "missing params");
        }
        assert!(ASSEMBLE_MATRIX.contains("fn main"));
        assert!(ROOT_INTEGRATE.contains("fn main"));
    }

    #[test]
    fn peel_variants_bind_consistent_slots() {
        for src in [
            peel_partials_partials(),
            peel_states_partials(),
            peel_states_states(),
        ] {
            assert!(src.contains("@binding(5) var<storage, read_write> dest"));
            assert!(src.contains("@binding(6) var<storage, read_write> scalers"));
        }
    }
}
