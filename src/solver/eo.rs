// SPDX-License-Identifier: AGPL-3.0-only

//! Even-odd preconditioned inversion of a full fermion matrix.
//!
//! Split b into (b_p, b_q), solve the Schur system on p with the prepared
//! source, reconstruct x_q, merge. CG is used when the Schur operator is
//! hermitian (staggered), BiCGStab otherwise, unless the configuration
//! forces a method.

use super::{solve, SolverConfig};
use crate::error::Result;
use crate::lattice::field::LatticeField;
use crate::lattice::gauge::GaugeField;
use crate::lattice::geometry::Parity;
use crate::operator::{EoBlock, FermionOperator};

/// Solve `base · x = rhs` on the full lattice through the Schur complement
/// on `parity`. `x` is the initial guess and receives the solution.
/// Returns the Schur solver's iteration count.
///
/// # Errors
///
/// [`crate::LatticeError::InvalidArgument`] if `base` has no even-odd
/// split; solver failures are logged and propagated.
pub fn invert_even_odd(
    base: &FermionOperator,
    gauge: &GaugeField,
    x: &mut LatticeField,
    rhs: &LatticeField,
    parity: Parity,
    config: &SolverConfig,
) -> Result<usize> {
    x.check_compatible(rhs)?;
    let schur = FermionOperator::even_odd(base.clone(), EoBlock::Schur { parity })?;

    let (b_even, b_odd) = rhs.split_even_odd()?;
    let (x_even, x_odd) = x.split_even_odd()?;
    let (b_p, b_q, mut x_p) = match parity {
        Parity::Even => (b_even, b_odd, x_even),
        Parity::Odd => (b_odd, b_even, x_odd),
    };

    let source = schur.prepare_source(gauge, &b_p, &b_q)?;
    source.log_squarenorm("eo source")?;
    let iterations = solve(config, &schur, &mut x_p, &source, gauge).inspect_err(|e| {
        tracing::error!(op = %schur, error = %e, "even-odd inversion failed");
    })?;
    let x_q = schur.reconstruct(gauge, &x_p, &b_q)?;

    match parity {
        Parity::Even => x.merge_even_odd(&x_p, &x_q)?,
        Parity::Odd => x.merge_even_odd(&x_q, &x_p)?,
    }
    tracing::info!(op = %base, %parity, iterations, "even-odd inversion done");
    Ok(iterations)
}
