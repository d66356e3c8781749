// SPDX-License-Identifier: AGPL-3.0-only

//! Conjugate gradient for hermitian positive-definite `A x = b`.
//!
//! ```text
//!   r = b − Ax,  p = r,  ρ = ⟨r, r⟩
//!   loop: q = Ap;  α = ρ / ⟨p, q⟩;  x += αp;  r −= αq
//!         ρ' = ⟨r, r⟩;  √ρ' < precision → done
//!         p = r + (ρ'/ρ) p
//! ```

use super::{converged, duplicate, exhausted, residual, stuck, KrylovSolver};
use crate::error::{Result, SolverKind};
use crate::lattice::complex::Complex64;
use crate::lattice::field::LatticeField;
use crate::lattice::gauge::GaugeField;
use crate::operator::LinearOperator;
use crate::tolerances::CG_BREAKDOWN_ABS;

/// CG with a fixed iteration budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cg {
    /// Iteration budget.
    pub max_iterations: usize,
}

impl Cg {
    #[must_use]
    pub const fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }
}

impl KrylovSolver for Cg {
    fn kind(&self) -> SolverKind {
        SolverKind::Cg
    }

    fn solve(
        &self,
        op: &dyn LinearOperator,
        x: &mut LatticeField,
        rhs: &LatticeField,
        gauge: &GaugeField,
        precision: f64,
    ) -> Result<usize> {
        let kind = self.kind();
        let mut r = residual(op, gauge, x, rhs)?;
        let mut rho = r.norm_sq()?;
        if rho.sqrt() < precision {
            return Ok(converged(kind, op, x, 0, rho.sqrt()));
        }
        let mut p = duplicate(&r)?;
        let mut q = rhs.like()?;

        for iteration in 1..=self.max_iterations {
            op.apply(&mut q, gauge, &p)?;
            let pq = p.dot(&q)?.re;
            if !(pq.abs() > CG_BREAKDOWN_ABS) {
                return Err(stuck(kind, op, x, iteration, rho.sqrt()));
            }
            let alpha = rho / pq;
            x.axpy(Complex64::real(alpha), &p)?;
            r.axpy(Complex64::real(-alpha), &q)?;
            let rho_new = r.norm_sq()?;
            tracing::debug!(solver = "cg", iteration, residual = rho_new.sqrt(), "iteration");
            if rho_new.sqrt() < precision {
                return Ok(converged(kind, op, x, iteration, rho_new.sqrt()));
            }
            p.xpay(&r, Complex64::real(rho_new / rho))?;
            rho = rho_new;
        }
        Err(exhausted(kind, op, x, self.max_iterations, rho.sqrt()))
    }
}
