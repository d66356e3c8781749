// SPDX-License-Identifier: AGPL-3.0-only

//! Centralized numerical thresholds with their rationale.
//!
//! Every guard, default precision and acceptance tolerance used by the
//! solvers, the validation binary and the tests is defined here. No ad-hoc
//! magic numbers.
//!
//! | Category | Basis | Example |
//! |----------|-------|---------|
//! | Breakdown guards | f64 rounding of reductions | 1e-14 relative for BiCGStab |
//! | Solver defaults | Typical HMC force/action precision | 1e-8 residual norm |
//! | Acceptance | Comparison of distributed vs undivided results | exact for halo |

/// Krylov breakdown guards and solver defaults.
pub mod solver;
/// Acceptance tolerances for halo, operator and solver checks.
pub mod lattice;

pub use lattice::{
    EO_VS_DIRECT_SOLUTION_ABS, GAMMA5_HERMITICITY_ABS, HALO_PARITY_ABS, NORM_PRESERVATION_REL,
    POWER_METHOD_BOUND_REL, SOLUTION_RESIDUAL_FACTOR,
};
pub use solver::{
    BICGSTAB_BREAKDOWN_REL, CG_BREAKDOWN_ABS, DEFAULT_MAX_ITERATIONS, DEFAULT_PRECISION,
    POWER_METHOD_CHECK_FREQUENCY, POWER_METHOD_IMAG_TOLERANCE, POWER_METHOD_MAX_ITERATIONS,
    POWER_METHOD_PRECISION,
};
