// SPDX-License-Identifier: AGPL-3.0-only

//! BiCGStab for general (non-hermitian) `A x = b`.
//!
//! ```text
//!   r = b − Ax,  r̂ = r (fixed),  p = r,  ρ = ⟨r̂, r⟩
//!   loop: v = Ap;  α = ρ / ⟨r̂, v⟩;  s = r − αv
//!         ‖s‖ < precision → x += αp, done
//!         t = As;  ω = ⟨t, s⟩ / ⟨t, t⟩
//!         x += αp + ωs;  r = s − ωt;  ‖r‖ < precision → done
//!         β = (⟨r̂, r⟩ / ρ)(α / ω);  p = r + β(p − ωv)
//! ```
//!
//! ⟨r̂, v⟩ and ⟨t, s⟩ are judged against the norms of their vectors; a
//! ratio at rounding level means the recursion divides by noise and the
//! solve is reported stuck.

use super::{converged, duplicate, exhausted, residual, stuck, KrylovSolver};
use crate::error::{Result, SolverKind};
use crate::lattice::complex::Complex64;
use crate::lattice::field::LatticeField;
use crate::lattice::gauge::GaugeField;
use crate::operator::LinearOperator;
use crate::tolerances::{BICGSTAB_BREAKDOWN_REL, CG_BREAKDOWN_ABS};

/// BiCGStab with a fixed iteration budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BiCgStab {
    /// Iteration budget.
    pub max_iterations: usize,
}

impl BiCgStab {
    #[must_use]
    pub const fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }
}

/// |⟨a, b⟩| small against ‖a‖‖b‖.
fn degenerate(inner: Complex64, norm_a: f64, norm_b: f64) -> bool {
    !(inner.abs() >= BICGSTAB_BREAKDOWN_REL * norm_a * norm_b) || inner.abs() == 0.0
}

impl KrylovSolver for BiCgStab {
    fn kind(&self) -> SolverKind {
        SolverKind::BiCgStab
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
        let mut r_norm = r.norm()?;
        if r_norm < precision {
            return Ok(converged(kind, op, x, 0, r_norm));
        }
        let r_hat = duplicate(&r)?;
        let r_hat_norm = r_norm;
        let mut p = duplicate(&r)?;
        let mut rho = r_hat.dot(&r)?;
        let mut v = rhs.like()?;
        let mut s = rhs.like()?;
        let mut t = rhs.like()?;

        for iteration in 1..=self.max_iterations {
            op.apply(&mut v, gauge, &p)?;
            let rv = r_hat.dot(&v)?;
            if degenerate(rv, r_hat_norm, v.norm()?) {
                return Err(stuck(kind, op, x, iteration, r_norm));
            }
            let alpha = rho / rv;

            s.copy_from(&r)?;
            s.axpy(-alpha, &v)?;
            let s_norm = s.norm()?;
            if s_norm < precision {
                x.axpy(alpha, &p)?;
                return Ok(converged(kind, op, x, iteration, s_norm));
            }

            op.apply(&mut t, gauge, &s)?;
            let tt = t.norm_sq()?;
            if !(tt > CG_BREAKDOWN_ABS) {
                return Err(stuck(kind, op, x, iteration, s_norm));
            }
            let ts = t.dot(&s)?;
            if degenerate(ts, tt.sqrt(), s_norm) {
                return Err(stuck(kind, op, x, iteration, s_norm));
            }
            let omega = ts.scale(1.0 / tt);

            x.axpy(alpha, &p)?;
            x.axpy(omega, &s)?;
            r.copy_from(&s)?;
            r.axpy(-omega, &t)?;
            r_norm = r.norm()?;
            tracing::debug!(solver = "bicgstab", iteration, residual = r_norm, "iteration");
            if r_norm < precision {
                return Ok(converged(kind, op, x, iteration, r_norm));
            }

            let rho_new = r_hat.dot(&r)?;
            let beta = (rho_new / rho) * (alpha / omega);
            p.axpy(-omega, &v)?;
            p.xpay(&r, beta)?;
            rho = rho_new;
        }
        Err(exhausted(kind, op, x, self.max_iterations, r_norm))
    }
}
