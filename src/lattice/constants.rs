// SPDX-License-Identifier: AGPL-3.0-only

//! Lattice constants and the LCG generator behind the context RNG stream.

/// Number of colors (SU(3)).
pub const N_COLORS: usize = 3;

/// Number of Dirac spin components.
pub const N_SPIN: usize = 4;

/// Number of spacetime dimensions.
pub const N_DIM: usize = 4;

/// Index of the time direction, the partitioned (slowest) axis.
pub const T_DIR: usize = 3;

/// Complex components per site of a gauge field: 4 links × 3×3.
pub const GAUGE_COMPONENTS: usize = N_DIM * N_COLORS * N_COLORS;

/// LCG multiplier (Knuth MMIX).
pub const LCG_MULTIPLIER: u64 = 6_364_136_223_846_793_005;

/// LCG increment (Knuth MMIX).
pub const LCG_INCREMENT: u64 = 1_442_695_040_888_963_407;

/// 2^53, for 53-bit uniform deviates.
pub const LCG_53_DIVISOR: f64 = (1u64 << 53) as f64;

/// Guard against division by zero and ln(0).
pub const LATTICE_DIVISION_GUARD: f64 = 1e-30;

/// Perturbation scale of hot-start SU(3) links.
pub const HOT_START_EPSILON: f64 = 1.5;

/// Advance the LCG state by one step.
#[inline]
pub fn lcg_step(state: &mut u64) {
    *state = state
        .wrapping_mul(LCG_MULTIPLIER)
        .wrapping_add(LCG_INCREMENT);
}

/// Uniform deviate in [0, 1) from the top 53 bits.
#[inline]
pub fn lcg_uniform_f64(state: &mut u64) -> f64 {
    lcg_step(state);
    (*state >> 11) as f64 / LCG_53_DIVISOR
}

/// Box-Muller N(0, 1) deviate from two uniform draws.
#[inline]
pub fn lcg_gaussian(state: &mut u64) -> f64 {
    let u1 = lcg_uniform_f64(state);
    let u2 = lcg_uniform_f64(state);
    (-2.0 * u1.max(LATTICE_DIVISION_GUARD).ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
