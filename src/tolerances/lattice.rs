// SPDX-License-Identifier: AGPL-3.0-only

//! Acceptance tolerances for halo, operator and solver checks.

/// Distributed vs undivided stencil: absolute difference per component.
///
/// The stencil sums the same terms in the same order on every device
/// count, so the results agree bit for bit; zero tolerance.
pub const HALO_PARITY_ABS: f64 = 0.0;

/// γ5-hermiticity ⟨x, My⟩ vs ⟨γ5Mγ5 x, y⟩: absolute difference.
///
/// Two global reductions over O(V) terms of O(1) size on small lattices;
/// 1e-10 leaves five digits for accumulated rounding.
pub const GAMMA5_HERMITICITY_ABS: f64 = 1e-10;

/// ‖b − Ax‖ after a converged solve may exceed the requested precision by
/// this factor (the recursive residual drifts from the true residual).
pub const SOLUTION_RESIDUAL_FACTOR: f64 = 10.0;

/// Even-odd preconditioned vs direct solution: absolute difference norm.
pub const EO_VS_DIRECT_SOLUTION_ABS: f64 = 1e-6;

/// Power-method bound vs exact extreme eigenvalue: relative error.
///
/// The iterate converges linearly with rate λ₂/λ₁; with precision 1e-8 the
/// Rayleigh quotient is accurate to ~1e-6 relative on the test spectra.
pub const POWER_METHOD_BOUND_REL: f64 = 1e-4;

/// Normalization check after `sax` with 1/‖v‖: relative error.
pub const NORM_PRESERVATION_REL: f64 = 1e-12;
