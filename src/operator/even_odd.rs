// SPDX-License-Identifier: AGPL-3.0-only

//! Even-odd decomposition.
//!
//! Ordering the sites by parity p (solve parity) and q = p̄,
//!
//! ```text
//!   M = | M_pp  K_pq |
//!       | K_qp  M_qq |
//! ```
//!
//! with site-local diagonal blocks and hopping blocks K between parities.
//! The Schur complement on p is `S = M_pp − K_pq M_qq⁻¹ K_qp`:
//!
//! | Base | M_pp = M_qq | K | S |
//! |------|-------------|---|---|
//! | staggered | m | H | m² − H_pq H_qp (after scaling by m; hermitian) |
//! | Wilson / twisted mass | 1 + 2iκμγ5 | −κH | M_pp − K_pq M_qq⁻¹ K_qp |
//!
//! Solving `S x_p = b̃_p` with the prepared source and reconstructing
//! `x_q = M_qq⁻¹(b_q − K_qp x_p)` solves the full system.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{expect_parity, expect_species, gamma5_sandwich, staggered, wilson, FermionOperator, LinearOperator};
use crate::error::{LatticeError, Result};
use crate::lattice::complex::Complex64;
use crate::lattice::field::LatticeField;
use crate::lattice::gauge::GaugeField;
use crate::lattice::geometry::Parity;

/// Which block of the decomposition an `EvenOddSplit` operator applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EoBlock {
    /// Hopping block from parity `from` to the other parity (D_eo / D_oe).
    Hopping { from: Parity },
    /// Schur complement on `parity`.
    Schur { parity: Parity },
}

impl EoBlock {
    /// Parity of the block's input.
    #[must_use]
    pub const fn input_parity(self) -> Parity {
        match self {
            Self::Hopping { from } => from,
            Self::Schur { parity } => parity,
        }
    }
}

impl fmt::Display for EoBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hopping { from } => write!(f, "hopping from {from}"),
            Self::Schur { parity } => write!(f, "{parity} Schur complement"),
        }
    }
}

/// out ← K·input, mapping the input's parity to the other one.
fn hop(base: &FermionOperator, out: &mut LatticeField, gauge: &GaugeField, input: &LatticeField) -> Result<()> {
    match base {
        FermionOperator::Staggered { .. } => staggered::apply(out, gauge, input, None, 1.0),
        FermionOperator::Wilson { kappa } | FermionOperator::TwistedMass { kappa, .. } => {
            wilson::apply(out, gauge, input, None, -kappa)
        }
        other => Err(LatticeError::InvalidArgument(format!(
            "no hopping block for {other}"
        ))),
    }
}

fn other_parity(field: &LatticeField, parity: Parity) -> Result<LatticeField> {
    LatticeField::new(field.context(), field.species(), Some(parity))
}

fn check_block(base: &FermionOperator, block: EoBlock, out: &LatticeField, input: &LatticeField) -> Result<()> {
    expect_species(input, base.species())?;
    expect_species(out, base.species())?;
    let from = block.input_parity();
    expect_parity(input, Some(from), "input")?;
    let to = match block {
        EoBlock::Hopping { .. } => from.flip(),
        EoBlock::Schur { .. } => from,
    };
    expect_parity(out, Some(to), "output")
}

pub(crate) fn apply(
    base: &FermionOperator,
    block: EoBlock,
    out: &mut LatticeField,
    gauge: &GaugeField,
    input: &LatticeField,
) -> Result<()> {
    check_block(base, block, out, input)?;
    match block {
        EoBlock::Hopping { .. } => hop(base, out, gauge, input),
        EoBlock::Schur { parity } => schur(base, parity, out, gauge, input),
    }
}

fn schur(
    base: &FermionOperator,
    parity: Parity,
    out: &mut LatticeField,
    gauge: &GaugeField,
    input: &LatticeField,
) -> Result<()> {
    let mut kq = other_parity(input, parity.flip())?;
    hop(base, &mut kq, gauge, input)?;
    if let FermionOperator::Staggered { mass } = base {
        hop(base, out, gauge, &kq)?;
        out.scale(Complex64::real(-1.0))?;
        return out.axpy(Complex64::real(mass * mass), input);
    }
    let twist = base.twist();
    let mut inv = kq.like()?;
    wilson::apply_twist(&mut inv, &kq, twist, true)?;
    hop(base, out, gauge, &inv)?;
    let mut diag = input.like()?;
    wilson::apply_twist(&mut diag, input, twist, false)?;
    out.xpay(&diag, Complex64::real(-1.0))
}

pub(crate) fn apply_dagger(
    base: &FermionOperator,
    block: EoBlock,
    out: &mut LatticeField,
    gauge: &GaugeField,
    input: &LatticeField,
) -> Result<()> {
    match (block, base) {
        // (D_pq)† = −D_qp for the anti-hermitian staggered hopping term.
        (EoBlock::Hopping { from }, FermionOperator::Staggered { .. }) => {
            let back = EoBlock::Hopping { from: from.flip() };
            check_block(base, back, out, input)?;
            staggered::apply(out, gauge, input, None, -1.0)
        }
        (EoBlock::Hopping { from }, _) => {
            let back = EoBlock::Hopping { from: from.flip() };
            check_block(base, back, out, input)?;
            let adjoint = FermionOperator::EvenOddSplit {
                base: Box::new(base.with_negated_twist()),
                block: back,
            };
            gamma5_sandwich(&adjoint, out, gauge, input)
        }
        (EoBlock::Schur { .. }, FermionOperator::Staggered { .. }) => apply(base, block, out, gauge, input),
        (EoBlock::Schur { .. }, _) => {
            check_block(base, block, out, input)?;
            let adjoint = FermionOperator::EvenOddSplit {
                base: Box::new(base.with_negated_twist()),
                block,
            };
            gamma5_sandwich(&adjoint, out, gauge, input)
        }
    }
}

impl FermionOperator {
    fn schur_parts(&self) -> Result<(&Self, Parity)> {
        match self {
            Self::EvenOddSplit {
                base,
                block: EoBlock::Schur { parity },
            } => Ok((base, *parity)),
            other => Err(LatticeError::InvalidArgument(format!(
                "{other} is not an even-odd Schur operator"
            ))),
        }
    }

    /// Source of the Schur system for the full right-hand side `(b_p, b_q)`:
    /// `m·b_p − H_pq b_q` (staggered) or `b_p − K_pq M_qq⁻¹ b_q`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidArgument`] unless `self` is a Schur block;
    /// incompatible fields.
    pub fn prepare_source(&self, gauge: &GaugeField, b_p: &LatticeField, b_q: &LatticeField) -> Result<LatticeField> {
        let (base, parity) = self.schur_parts()?;
        expect_parity(b_p, Some(parity), "b_p")?;
        expect_parity(b_q, Some(parity.flip()), "b_q")?;
        let mut kb = b_p.like()?;
        let mut source = b_p.like()?;
        source.copy_from(b_p)?;
        if let Self::Staggered { mass } = base {
            hop(base, &mut kb, gauge, b_q)?;
            source.scale(Complex64::real(*mass))?;
        } else {
            let mut inv = b_q.like()?;
            wilson::apply_twist(&mut inv, b_q, base.twist(), true)?;
            hop(base, &mut kb, gauge, &inv)?;
        }
        source.axpy(Complex64::real(-1.0), &kb)?;
        Ok(source)
    }

    /// Other-parity solution `x_q = M_qq⁻¹ (b_q − K_qp x_p)`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidArgument`] unless `self` is a Schur block, or
    /// for a massless staggered base.
    pub fn reconstruct(&self, gauge: &GaugeField, x_p: &LatticeField, b_q: &LatticeField) -> Result<LatticeField> {
        let (base, parity) = self.schur_parts()?;
        expect_parity(x_p, Some(parity), "x_p")?;
        expect_parity(b_q, Some(parity.flip()), "b_q")?;
        let mut r = b_q.like()?;
        hop(base, &mut r, gauge, x_p)?;
        r.xpay(b_q, Complex64::real(-1.0))?;
        if let Self::Staggered { mass } = base {
            if *mass == 0.0 {
                return Err(LatticeError::InvalidArgument(
                    "even-odd reconstruction needs a non-zero staggered mass".into(),
                ));
            }
            r.scale(Complex64::real(1.0 / mass))?;
            return Ok(r);
        }
        let mut x_q = r.like()?;
        wilson::apply_twist(&mut x_q, &r, base.twist(), true)?;
        Ok(x_q)
    }
}

/// Rayleigh-type check helper used by tests: ⟨a, A b⟩.
#[cfg(test)]
pub(crate) fn matrix_element(
    op: &FermionOperator,
    gauge: &GaugeField,
    a: &LatticeField,
    b: &LatticeField,
) -> Result<Complex64> {
    let mut ab = LatticeField::new(b.context(), op.species(), op.output_parity(b.parity()))?;
    op.apply(&mut ab, gauge, b)?;
    a.dot(&ab)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimulationContext;
    use crate::device::{Device, DeviceCaps};
    use crate::lattice::field::Species;
    use crate::lattice::geometry::LatticeGeometry;
    use std::sync::Arc;

    fn setup(n: usize) -> (Arc<SimulationContext>, GaugeField) {
        let devices = Device::host_set(n, &DeviceCaps::default()).expect("devices");
        let g = LatticeGeometry::new([2, 2, 2, 4]).expect("geometry");
        let ctx = SimulationContext::new(devices, g, 17).expect("context");
        let gauge = GaugeField::random(&ctx, 0.4).expect("gauge");
        (ctx, gauge)
    }

    fn random(ctx: &Arc<SimulationContext>, species: Species, parity: Option<Parity>) -> LatticeField {
        let mut f = LatticeField::new(ctx, species, parity).expect("field");
        f.fill_gaussian().expect("fill");
        f
    }

    #[test]
    fn staggered_schur_equals_composed_hopping_blocks() {
        let (ctx, gauge) = setup(2);
        let mass = 0.3;
        let base = FermionOperator::Staggered { mass };
        let schur = FermionOperator::even_odd(base.clone(), EoBlock::Schur { parity: Parity::Even })
            .expect("schur");
        let d_oe = FermionOperator::even_odd(base.clone(), EoBlock::Hopping { from: Parity::Even })
            .expect("oe");
        let d_eo = FermionOperator::even_odd(base, EoBlock::Hopping { from: Parity::Odd }).expect("eo");

        let psi = random(&ctx, Species::ColorVector, Some(Parity::Even));
        let mut direct = psi.like().expect("out");
        schur.apply(&mut direct, &gauge, &psi).expect("schur");

        let mut odd = LatticeField::new(&ctx, Species::ColorVector, Some(Parity::Odd)).expect("odd");
        d_oe.apply(&mut odd, &gauge, &psi).expect("d_oe");
        let mut composed = psi.like().expect("composed");
        d_eo.apply(&mut composed, &gauge, &odd).expect("d_eo");
        composed.scale(Complex64::real(-1.0)).expect("neg");
        composed.axpy(Complex64::real(mass * mass), &psi).expect("mass");

        composed.axpy(Complex64::real(-1.0), &direct).expect("diff");
        assert!(composed.norm().expect("norm") < 1e-12);
    }

    #[test]
    fn staggered_hopping_dagger_is_minus_reverse_block() {
        let (ctx, gauge) = setup(2);
        let d_oe = FermionOperator::even_odd(
            FermionOperator::Staggered { mass: 0.1 },
            EoBlock::Hopping { from: Parity::Even },
        )
        .expect("oe");
        let e = random(&ctx, Species::ColorVector, Some(Parity::Even));
        let o = random(&ctx, Species::ColorVector, Some(Parity::Odd));
        // ⟨o, D_oe e⟩ = ⟨D_oe† o, e⟩
        let lhs = matrix_element(&d_oe, &gauge, &o, &e).expect("lhs");
        let mut dag = e.like().expect("dag");
        d_oe.apply_dagger(&mut dag, &gauge, &o).expect("dagger");
        let rhs = dag.dot(&e).expect("rhs");
        assert!((lhs - rhs).abs() < 1e-10, "{lhs} vs {rhs}");
    }

    #[test]
    fn twisted_mass_schur_dagger_is_adjoint() {
        let (ctx, gauge) = setup(1);
        let schur = FermionOperator::even_odd(
            FermionOperator::TwistedMass { kappa: 0.12, mu: 0.3 },
            EoBlock::Schur { parity: Parity::Odd },
        )
        .expect("schur");
        let a = random(&ctx, Species::DiracSpinor, Some(Parity::Odd));
        let b = random(&ctx, Species::DiracSpinor, Some(Parity::Odd));
        let lhs = matrix_element(&schur, &gauge, &a, &b).expect("lhs");
        let mut dag = a.like().expect("dag");
        schur.apply_dagger(&mut dag, &gauge, &a).expect("dagger");
        let rhs = dag.dot(&b).expect("rhs");
        assert!((lhs - rhs).abs() < 1e-10, "{lhs} vs {rhs}");
    }

    #[test]
    fn schur_helpers_reject_other_operators() {
        let (ctx, gauge) = setup(1);
        let op = FermionOperator::Staggered { mass: 0.2 };
        let e = random(&ctx, Species::ColorVector, Some(Parity::Even));
        let o = random(&ctx, Species::ColorVector, Some(Parity::Odd));
        assert!(op.prepare_source(&gauge, &e, &o).is_err());
        let massless = FermionOperator::even_odd(
            FermionOperator::Staggered { mass: 0.0 },
            EoBlock::Schur { parity: Parity::Even },
        )
        .expect("schur");
        assert!(massless.reconstruct(&gauge, &e, &o).is_err());
    }
}
