// SPDX-License-Identifier: AGPL-3.0-only

//! Power-method bounds of the spectrum of a hermitian operator.
//!
//! Used to size rational approximations: the largest eigenvalue directly,
//! the smallest as `λ_max − λ_max(λ_max − A)`.
//!
//! ```text
//!   v ← random, ‖v‖ = 1
//!   loop i: w = Av / ‖Av‖
//!           every k-th i: ‖w − v‖ < precision → λ = ⟨w, Aw⟩
//!           v ← w
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result, SolverKind};
use crate::lattice::complex::Complex64;
use crate::lattice::constants::LATTICE_DIVISION_GUARD;
use crate::lattice::field::LatticeField;
use crate::lattice::gauge::GaugeField;
use crate::operator::LinearOperator;
use crate::tolerances::{
    POWER_METHOD_CHECK_FREQUENCY, POWER_METHOD_IMAG_TOLERANCE, POWER_METHOD_MAX_ITERATIONS,
    POWER_METHOD_PRECISION,
};

/// Power-method settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerMethodConfig {
    /// Iteration budget.
    pub max_iterations: usize,
    /// Accept once successive normalized iterates differ by less than this.
    pub precision: f64,
    /// Compare iterates every this many iterations.
    pub check_frequency: usize,
    /// Report `mass²` as the lower bound instead of iterating.
    pub conservative: bool,
}

impl Default for PowerMethodConfig {
    fn default() -> Self {
        Self {
            max_iterations: POWER_METHOD_MAX_ITERATIONS,
            precision: POWER_METHOD_PRECISION,
            check_frequency: POWER_METHOD_CHECK_FREQUENCY,
            conservative: false,
        }
    }
}

/// `shift − A`.
pub struct ShiftedOperator<'a> {
    /// Scalar shift.
    pub shift: f64,
    /// Shifted operator.
    pub inner: &'a dyn LinearOperator,
}

impl LinearOperator for ShiftedOperator<'_> {
    fn apply(&self, out: &mut LatticeField, gauge: &GaugeField, input: &LatticeField) -> Result<()> {
        self.inner.apply(out, gauge, input)?;
        out.scale(Complex64::real(-1.0))?;
        out.axpy(Complex64::real(self.shift), input)
    }

    fn is_hermitian(&self) -> bool {
        self.inner.is_hermitian()
    }

    fn mass(&self) -> f64 {
        self.inner.mass()
    }

    fn name(&self) -> String {
        format!("{} − {}", self.shift, self.inner.name())
    }
}

fn require_hermitian(op: &dyn LinearOperator) -> Result<()> {
    if op.is_hermitian() {
        Ok(())
    } else {
        Err(LatticeError::InvalidArgument(format!(
            "power method needs a hermitian operator, {} is not",
            op.name()
        )))
    }
}

fn normalize(v: &mut LatticeField) -> Result<f64> {
    let norm = v.norm()?;
    if norm > LATTICE_DIVISION_GUARD {
        v.scale(Complex64::real(1.0 / norm))?;
    }
    Ok(norm)
}

fn power_method(
    op: &dyn LinearOperator,
    gauge: &GaugeField,
    space: &LatticeField,
    config: &PowerMethodConfig,
) -> Result<f64> {
    let check = config.check_frequency.max(1);
    let mut v1 = space.like()?;
    v1.fill_gaussian()?;
    normalize(&mut v1)?;
    v1.log_squarenorm("power method v1 (initial)")?;
    let mut v2 = space.like()?;
    let mut diff = space.like()?;
    let mut resid = f64::INFINITY;
    let diagnostics = space.context().diagnostics();

    for i in 0..config.max_iterations {
        op.apply(&mut v2, gauge, &v1)?;
        if normalize(&mut v2)? <= LATTICE_DIVISION_GUARD {
            // A annihilates the iterate: the component along every
            // non-zero eigenvector vanished.
            diagnostics.record_iterations(i + 1);
            return Ok(0.0);
        }
        if i % check == 0 {
            diff.copy_from(&v2)?;
            diff.axpy(Complex64::real(-1.0), &v1)?;
            resid = diff.norm()?;
            tracing::debug!(op = %op.name(), iteration = i, resid, "power method");
            if resid < config.precision {
                diagnostics.record_iterations(i + 1);
                let mut av = space.like()?;
                op.apply(&mut av, gauge, &v2)?;
                let rayleigh = v2.dot(&av)?;
                if rayleigh.im.abs() > POWER_METHOD_IMAG_TOLERANCE {
                    tracing::error!(op = %op.name(), iteration = i, im = rayleigh.im, "complex eigenvalue");
                    return Err(LatticeError::SolverStuck {
                        solver: SolverKind::PowerMethod,
                        iteration: i,
                        residual: resid,
                    });
                }
                tracing::debug!(op = %op.name(), iterations = i, resid, eigenvalue = rayleigh.re, "power method converged");
                return Ok(rayleigh.re);
            }
        }
        v1.copy_from(&v2)?;
    }
    diagnostics.record_iterations(config.max_iterations);
    tracing::error!(op = %op.name(), iterations = config.max_iterations, resid, "power method did not converge");
    Err(LatticeError::SolverDidNotSolve {
        solver: SolverKind::PowerMethod,
        iterations: config.max_iterations,
        residual: resid,
    })
}

/// Largest eigenvalue of the hermitian `op`, acting on fields like `space`.
///
/// # Errors
///
/// [`LatticeError::InvalidArgument`] for a non-hermitian operator,
/// [`LatticeError::SolverStuck`] if the Rayleigh quotient has an imaginary
/// part, [`LatticeError::SolverDidNotSolve`] when the budget is spent.
pub fn find_max_eigenvalue(
    op: &dyn LinearOperator,
    gauge: &GaugeField,
    space: &LatticeField,
    config: &PowerMethodConfig,
) -> Result<f64> {
    require_hermitian(op)?;
    power_method(op, gauge, space, config)
}

/// Smallest eigenvalue of the hermitian `op`: `λ_max − λ_max(λ_max − A)`,
/// or `mass²` when `config.conservative` is set.
///
/// # Errors
///
/// As [`find_max_eigenvalue`].
pub fn find_min_eigenvalue(
    op: &dyn LinearOperator,
    gauge: &GaugeField,
    space: &LatticeField,
    config: &PowerMethodConfig,
) -> Result<f64> {
    if config.conservative {
        let mass = op.mass();
        return Ok(mass * mass);
    }
    require_hermitian(op)?;
    let max = power_method(op, gauge, space, config)?;
    tracing::info!(op = %op.name(), max, "largest eigenvalue");
    let shifted = ShiftedOperator {
        shift: max,
        inner: op,
    };
    Ok(max - power_method(&shifted, gauge, space, config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimulationContext;
    use crate::device::{Device, DeviceCaps};
    use crate::lattice::field::Species;
    use crate::lattice::geometry::LatticeGeometry;
    use crate::operator::FermionOperator;
    use crate::tolerances::NORM_PRESERVATION_REL;

    fn field(devices: usize) -> LatticeField {
        let devices = Device::host_set(devices, &DeviceCaps::default()).expect("devices");
        let geometry = LatticeGeometry::new([2, 2, 2, 4]).expect("geometry");
        let ctx = SimulationContext::new(devices, geometry, 5).expect("context");
        let mut f = LatticeField::new(&ctx, Species::ColorVector, None).expect("field");
        f.fill_gaussian().expect("gaussian");
        f
    }

    #[test]
    fn normalize_preserves_direction_at_unit_norm() {
        let mut v = field(2);
        let before = v.to_host().expect("host");
        let norm = normalize(&mut v).expect("normalize");
        assert!(norm > 1.0);
        assert!((v.norm().expect("norm") - 1.0).abs() < NORM_PRESERVATION_REL);
        let after = v.to_host().expect("host");
        let drift = before
            .iter()
            .zip(&after)
            .map(|(b, a)| (b.scale(1.0 / norm) - *a).abs())
            .fold(0.0, f64::max);
        assert!(drift < NORM_PRESERVATION_REL);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = field(1);
        v.clear().expect("clear");
        assert_eq!(normalize(&mut v).expect("normalize"), 0.0);
        assert_eq!(v.norm().expect("norm"), 0.0);
    }

    #[test]
    fn shifted_operator_keeps_metadata() {
        let base = FermionOperator::normal(FermionOperator::Staggered { mass: 0.3 });
        let shifted = ShiftedOperator { shift: 5.0, inner: &base };
        assert!(shifted.is_hermitian());
        assert!((shifted.mass() - 0.3).abs() < f64::EPSILON);
        assert!(shifted.name().starts_with("5 − "));
    }
}
