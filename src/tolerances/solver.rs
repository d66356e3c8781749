// SPDX-License-Identifier: AGPL-3.0-only

//! Krylov breakdown guards and solver defaults.

/// BiCGStab breakdown: |⟨r̂0, v⟩| or |⟨t, s⟩| relative to the norms of the
/// two vectors.
///
/// Both inner products are Cauchy-Schwarz bounded by the product of norms.
/// A ratio below 1e-14 is indistinguishable from rounding of an exactly
/// orthogonal pair (sums of O(V) products each carry ~1e-16 relative error),
/// so the iteration would divide by noise.
pub const BICGSTAB_BREAKDOWN_REL: f64 = 1e-14;

/// CG breakdown: ⟨p, Ap⟩ at or below this means A is not positive on p.
///
/// For a hermitian positive operator ⟨p, Ap⟩ ≥ λ_min‖p‖² > 0. Anything
/// below the division guard is a zero denominator.
pub const CG_BREAKDOWN_ABS: f64 = 1e-30;

/// Default residual norm ‖b − Ax‖ at which a solve counts as converged.
///
/// Matches the force precision used for staggered HMC trajectories.
pub const DEFAULT_PRECISION: f64 = 1e-8;

/// Default Krylov iteration budget.
///
/// Well-conditioned test systems converge in tens of iterations; light
/// quark masses on 8⁴ lattices need a few hundred.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Power method: largest tolerated |Im⟨v, Av⟩| for a hermitian operator.
///
/// The Rayleigh quotient of a hermitian operator is real; an imaginary part
/// above rounding level means the operator is not hermitian.
pub const POWER_METHOD_IMAG_TOLERANCE: f64 = 1e-12;

/// Power method: ‖v_{k+1} − v_k‖ at which the iterate is accepted.
pub const POWER_METHOD_PRECISION: f64 = 1e-6;

/// Power method: residual check every this many iterations.
///
/// The check costs one extra vector update and reduction; checking every
/// tenth iteration amortizes it.
pub const POWER_METHOD_CHECK_FREQUENCY: usize = 10;

/// Power method iteration budget.
pub const POWER_METHOD_MAX_ITERATIONS: usize = 5000;
