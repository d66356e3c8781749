// SPDX-License-Identifier: AGPL-3.0-only

//! Fermion matrices as opaque linear operators.
//!
//! | Variant | Acts on | Hermitian |
//! |---------|---------|-----------|
//! | [`FermionOperator::Staggered`] | colour vectors | no |
//! | [`FermionOperator::Wilson`] | Dirac spinors | no (γ5-hermitian) |
//! | [`FermionOperator::TwistedMass`] | Dirac spinors | no (γ5-hermitian) |
//! | [`FermionOperator::EvenOddSplit`] | one parity | Schur block of staggered only |
//! | [`FermionOperator::NormalEquations`] | as base | yes |
//!
//! Operators own no field data and hold no context; every apply exchanges
//! the input's halo before its stencil.

/// Even-odd blocks, Schur complement, source preparation.
pub mod even_odd;
/// Staggered stencil.
pub mod staggered;
/// Wilson and twisted-mass stencils, gamma matrices.
pub mod wilson;

use std::fmt;

use crate::error::{LatticeError, Result};
use crate::lattice::field::{LatticeField, Species};
use crate::lattice::gauge::GaugeField;
use crate::lattice::geometry::Parity;

pub use even_odd::EoBlock;

/// A linear map on lattice fields.
///
/// `apply` writes `out = A·input`; `out` must be allocated with the species
/// and parity the operator produces.
pub trait LinearOperator: Send + Sync {
    /// out ← A·input
    ///
    /// # Errors
    ///
    /// Incompatible fields or a device failure.
    fn apply(&self, out: &mut LatticeField, gauge: &GaugeField, input: &LatticeField) -> Result<()>;

    /// Whether A = A†; selects CG over BiCGStab.
    fn is_hermitian(&self) -> bool;

    /// Bare quark mass; `mass()²` bounds the spectrum of hermitian
    /// fermion operators from below.
    fn mass(&self) -> f64;

    /// Short name for logs.
    fn name(&self) -> String;
}

/// Closed set of fermion matrices and their compositions.
#[derive(Clone, Debug, PartialEq)]
pub enum FermionOperator {
    /// Staggered Dirac operator `m + H`.
    Staggered { mass: f64 },
    /// Wilson matrix `1 − κH`.
    Wilson { kappa: f64 },
    /// Twisted-mass matrix `1 + 2iκμγ5 − κH`.
    TwistedMass { kappa: f64, mu: f64 },
    /// One block of the even-odd decomposition of `base`.
    EvenOddSplit { base: Box<FermionOperator>, block: EoBlock },
    /// `M†M`.
    NormalEquations(Box<FermionOperator>),
}

impl fmt::Display for FermionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staggered { mass } => write!(f, "staggered(m={mass})"),
            Self::Wilson { kappa } => write!(f, "wilson(κ={kappa})"),
            Self::TwistedMass { kappa, mu } => write!(f, "twisted mass(κ={kappa}, μ={mu})"),
            Self::EvenOddSplit { base, block } => write!(f, "{block} of {base}"),
            Self::NormalEquations(base) => write!(f, "normal equations of {base}"),
        }
    }
}

pub(crate) fn expect_species(field: &LatticeField, species: Species) -> Result<()> {
    if field.species() == species {
        Ok(())
    } else {
        Err(LatticeError::IncompatibleFields(format!(
            "operator acts on {species}, got {}",
            field.species()
        )))
    }
}

fn expect_parity(field: &LatticeField, parity: Option<Parity>, role: &str) -> Result<()> {
    if field.parity() == parity {
        Ok(())
    } else {
        Err(LatticeError::IncompatibleFields(format!(
            "{role} has parity {:?}, operator needs {parity:?}",
            field.parity()
        )))
    }
}

impl FermionOperator {
    /// Even-odd block of a staggered, Wilson or twisted-mass operator.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidArgument`] for any other base.
    pub fn even_odd(base: Self, block: EoBlock) -> Result<Self> {
        if !base.is_local() {
            return Err(LatticeError::InvalidArgument(format!(
                "even-odd split needs a staggered, Wilson or twisted-mass base, got {base}"
            )));
        }
        Ok(Self::EvenOddSplit {
            base: Box::new(base),
            block,
        })
    }

    /// `M†M`.
    #[must_use]
    pub fn normal(base: Self) -> Self {
        Self::NormalEquations(Box::new(base))
    }

    /// Staggered, Wilson or twisted mass.
    const fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Staggered { .. } | Self::Wilson { .. } | Self::TwistedMass { .. }
        )
    }

    /// Field species the operator acts on.
    #[must_use]
    pub fn species(&self) -> Species {
        match self {
            Self::Staggered { .. } => Species::ColorVector,
            Self::Wilson { .. } | Self::TwistedMass { .. } => Species::DiracSpinor,
            Self::EvenOddSplit { base, .. } | Self::NormalEquations(base) => base.species(),
        }
    }

    /// Parity of `A·ψ` for `ψ` of parity `input`.
    #[must_use]
    pub fn output_parity(&self, input: Option<Parity>) -> Option<Parity> {
        match self {
            Self::EvenOddSplit {
                block: EoBlock::Hopping { from },
                ..
            } => Some(from.flip()),
            _ => input,
        }
    }

    /// Parity the operator expects of its input (`None` = full lattice).
    #[must_use]
    pub fn input_parity(&self) -> Option<Parity> {
        match self {
            Self::Staggered { .. } | Self::Wilson { .. } | Self::TwistedMass { .. } => None,
            Self::EvenOddSplit { block, .. } => Some(block.input_parity()),
            Self::NormalEquations(base) => base.input_parity(),
        }
    }

    /// `2κμ` of the twisted-mass term; 0 for Wilson.
    pub(crate) fn twist(&self) -> f64 {
        match self {
            Self::TwistedMass { kappa, mu } => 2.0 * kappa * mu,
            Self::EvenOddSplit { base, .. } | Self::NormalEquations(base) => base.twist(),
            _ => 0.0,
        }
    }

    /// Same operator with the twist sign flipped (γ5-hermitian conjugate).
    pub(crate) fn with_negated_twist(&self) -> Self {
        match self {
            Self::TwistedMass { kappa, mu } => Self::TwistedMass {
                kappa: *kappa,
                mu: -*mu,
            },
            Self::EvenOddSplit { base, block } => Self::EvenOddSplit {
                base: Box::new(base.with_negated_twist()),
                block: *block,
            },
            Self::NormalEquations(base) => Self::NormalEquations(Box::new(base.with_negated_twist())),
            other => other.clone(),
        }
    }

    fn check_fields(&self, out: &LatticeField, input: &LatticeField) -> Result<()> {
        expect_species(input, self.species())?;
        expect_species(out, self.species())?;
        let expected = self.input_parity();
        expect_parity(input, expected, "input")?;
        expect_parity(out, self.output_parity(expected), "output")
    }

    /// out ← A†·input
    ///
    /// # Errors
    ///
    /// Incompatible fields or a device failure.
    pub fn apply_dagger(&self, out: &mut LatticeField, gauge: &GaugeField, input: &LatticeField) -> Result<()> {
        match self {
            Self::Staggered { mass } => {
                self.check_fields(out, input)?;
                staggered::apply(out, gauge, input, Some(*mass), -1.0)
            }
            Self::Wilson { .. } | Self::TwistedMass { .. } => {
                self.check_fields(out, input)?;
                gamma5_sandwich(&self.with_negated_twist(), out, gauge, input)
            }
            Self::EvenOddSplit { base, block } => even_odd::apply_dagger(base, *block, out, gauge, input),
            Self::NormalEquations(_) => self.apply(out, gauge, input),
        }
    }
}

/// out ← γ5·A·γ5·input
pub(crate) fn gamma5_sandwich(
    op: &FermionOperator,
    out: &mut LatticeField,
    gauge: &GaugeField,
    input: &LatticeField,
) -> Result<()> {
    let mut rotated = input.like()?;
    rotated.copy_from(input)?;
    rotated.apply_gamma5()?;
    op.apply(out, gauge, &rotated)?;
    out.apply_gamma5()
}

impl LinearOperator for FermionOperator {
    fn apply(&self, out: &mut LatticeField, gauge: &GaugeField, input: &LatticeField) -> Result<()> {
        match self {
            Self::Staggered { mass } => {
                self.check_fields(out, input)?;
                staggered::apply(out, gauge, input, Some(*mass), 1.0)
            }
            Self::Wilson { kappa } => {
                self.check_fields(out, input)?;
                wilson::apply(out, gauge, input, Some(0.0), -kappa)
            }
            Self::TwistedMass { kappa, .. } => {
                self.check_fields(out, input)?;
                wilson::apply(out, gauge, input, Some(self.twist()), -kappa)
            }
            Self::EvenOddSplit { base, block } => even_odd::apply(base, *block, out, gauge, input),
            Self::NormalEquations(base) => {
                self.check_fields(out, input)?;
                let mut tmp = LatticeField::new(
                    input.context(),
                    base.species(),
                    base.output_parity(input.parity()),
                )?;
                base.apply(&mut tmp, gauge, input)?;
                base.apply_dagger(out, gauge, &tmp)
            }
        }
    }

    fn is_hermitian(&self) -> bool {
        match self {
            Self::EvenOddSplit {
                base,
                block: EoBlock::Schur { .. },
            } => matches!(**base, Self::Staggered { .. }),
            Self::NormalEquations(_) => true,
            _ => false,
        }
    }

    fn mass(&self) -> f64 {
        match self {
            Self::Staggered { mass } => *mass,
            Self::Wilson { kappa } | Self::TwistedMass { kappa, .. } => 1.0 / (2.0 * kappa) - 4.0,
            Self::EvenOddSplit { base, .. } | Self::NormalEquations(base) => base.mass(),
        }
    }

    fn name(&self) -> String {
        self.to_string()
    }
}
