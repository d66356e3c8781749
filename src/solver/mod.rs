// SPDX-License-Identifier: AGPL-3.0-only

//! Krylov solvers and the power-method eigenvalue bound.
//!
//! Every solve runs `init → iterate → {converged | stuck | exhausted}`:
//!
//! | Outcome | Result |
//! |---------|--------|
//! | ‖r‖ < precision | `Ok(iterations)` |
//! | degenerate inner product | [`LatticeError::SolverStuck`] |
//! | budget spent | [`LatticeError::SolverDidNotSolve`] |
//!
//! All inner products are global reductions over every device.
//!
//! # References
//!
//! - Hestenes & Stiefel (1952): CG
//! - van der Vorst, SIAM J. Sci. Stat. Comput. 13, 631 (1992): BiCGStab

/// BiCGStab for non-hermitian systems.
pub mod bicgstab;
/// Conjugate gradient for hermitian positive systems.
pub mod cg;
/// Power-method bounds of the spectrum.
pub mod eigen;
/// Even-odd preconditioned inversion of the full fermion matrix.
pub mod eo;

use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result, SolverKind};
use crate::lattice::complex::Complex64;
use crate::lattice::field::LatticeField;
use crate::lattice::gauge::GaugeField;
use crate::operator::LinearOperator;
use crate::tolerances::{DEFAULT_MAX_ITERATIONS, DEFAULT_PRECISION};

pub use bicgstab::BiCgStab;
pub use cg::Cg;
pub use eo::invert_even_odd;

/// Which Krylov method [`solve`] uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverMethod {
    /// CG for hermitian operators, BiCGStab otherwise.
    #[default]
    Auto,
    Cg,
    BiCgStab,
}

/// Iteration budget, target residual and method.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iterations: usize,
    /// Converged once ‖b − Ax‖ falls below this.
    pub precision: f64,
    pub method: SolverMethod,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            precision: DEFAULT_PRECISION,
            method: SolverMethod::Auto,
        }
    }
}

/// An iterative solver for `A x = b`.
pub trait KrylovSolver {
    /// Method name carried by failures.
    fn kind(&self) -> SolverKind;

    /// Improve `x` in place until ‖b − Ax‖ < `precision`; returns the
    /// number of iterations.
    ///
    /// # Errors
    ///
    /// [`LatticeError::SolverStuck`], [`LatticeError::SolverDidNotSolve`],
    /// or a device failure.
    fn solve(
        &self,
        op: &dyn LinearOperator,
        x: &mut LatticeField,
        rhs: &LatticeField,
        gauge: &GaugeField,
        precision: f64,
    ) -> Result<usize>;
}

/// Solve `op · x = rhs` with the configured method.
///
/// # Errors
///
/// Convergence failures are logged at `error` and returned.
pub fn solve(
    config: &SolverConfig,
    op: &dyn LinearOperator,
    x: &mut LatticeField,
    rhs: &LatticeField,
    gauge: &GaugeField,
) -> Result<usize> {
    let use_cg = match config.method {
        SolverMethod::Cg => true,
        SolverMethod::BiCgStab => false,
        SolverMethod::Auto => op.is_hermitian(),
    };
    let solver: Box<dyn KrylovSolver> = if use_cg {
        Box::new(Cg::new(config.max_iterations))
    } else {
        Box::new(BiCgStab::new(config.max_iterations))
    };
    solver.solve(op, x, rhs, gauge, config.precision)
}

/// r ← rhs − op·x
pub(crate) fn residual(
    op: &dyn LinearOperator,
    gauge: &GaugeField,
    x: &LatticeField,
    rhs: &LatticeField,
) -> Result<LatticeField> {
    let mut r = rhs.like()?;
    op.apply(&mut r, gauge, x)?;
    r.xpay(rhs, Complex64::real(-1.0))?;
    Ok(r)
}

/// Fresh copy of `f`.
pub(crate) fn duplicate(f: &LatticeField) -> Result<LatticeField> {
    let mut out = f.like()?;
    out.copy_from(f)?;
    Ok(out)
}

pub(crate) fn converged(kind: SolverKind, op: &dyn LinearOperator, x: &LatticeField, iterations: usize, residual: f64) -> usize {
    x.context().diagnostics().record_iterations(iterations);
    tracing::info!(solver = %kind, op = %op.name(), iterations, residual, "solver converged");
    iterations
}

pub(crate) fn stuck(kind: SolverKind, op: &dyn LinearOperator, x: &LatticeField, iteration: usize, residual: f64) -> LatticeError {
    x.context().diagnostics().record_iterations(iteration);
    tracing::error!(solver = %kind, op = %op.name(), iteration, residual, "solver got stuck");
    LatticeError::SolverStuck {
        solver: kind,
        iteration,
        residual,
    }
}

pub(crate) fn exhausted(kind: SolverKind, op: &dyn LinearOperator, x: &LatticeField, iterations: usize, residual: f64) -> LatticeError {
    x.context().diagnostics().record_iterations(iterations);
    tracing::error!(solver = %kind, op = %op.name(), iterations, residual, "solver did not converge");
    LatticeError::SolverDidNotSolve {
        solver: kind,
        iterations,
        residual,
    }
}
