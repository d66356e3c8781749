// SPDX-License-Identifier: AGPL-3.0-only

//! Staggered (Kogut-Susskind) Dirac operator on colour vectors:
//!
//!   (D ψ)(x) = m ψ(x) + ½ Σ_μ η_μ(x) [U_μ(x) ψ(x+μ̂) − U_μ†(x−μ̂) ψ(x−μ̂)]
//!
//! The hopping part H is anti-hermitian, so D† = m − H. Every hop connects
//! sites of opposite parity, so H restricted to one parity gives the
//! even-odd blocks D_eo and D_oe.
//!
//! # References
//!
//! - Kogut & Susskind, PRD 11, 395 (1975)
//! - Gattringer & Lang, "QCD on the Lattice" (2010), Ch. 5

use crate::error::Result;
use crate::lattice::complex::Complex64;
use crate::lattice::constants::{N_COLORS, N_DIM};
use crate::lattice::field::{LatticeField, Species};
use crate::lattice::gauge::GaugeField;
use crate::lattice::geometry::LatticeGeometry;
use crate::lattice::kernels::{self, PartData};

/// out(x) = diag·ψ(x) + scale·(Hψ)(x) on the owned sites of one device.
fn stencil(
    g: &LatticeGeometry,
    out: &mut PartData,
    psi: &PartData,
    gauge: &PartData,
    diag: Option<f64>,
    scale: f64,
) {
    out.compute_owned(g, |slot, x, site| {
        let mut acc = [Complex64::ZERO; N_COLORS];
        for mu in 0..N_DIM {
            let half_eta = 0.5 * LatticeGeometry::staggered_phase(x, mu);

            let (fslot, xf) = psi.neighbor(g, slot, x, mu, true);
            let u = gauge.link(gauge.storage_site(g, slot, x), mu);
            let fwd = u.mul_vec(&psi.color(psi.storage_site(g, fslot, xf), 0));

            let (bslot, xb) = psi.neighbor(g, slot, x, mu, false);
            let ub = gauge.link(gauge.storage_site(g, bslot, xb), mu);
            let bwd = ub.adjoint_mul_vec(&psi.color(psi.storage_site(g, bslot, xb), 0));

            for c in 0..N_COLORS {
                acc[c] += (fwd[c] - bwd[c]).scale(half_eta);
            }
        }
        let here = diag.map(|m| psi.color(psi.storage_site(g, slot, x), 0).map(|z| z.scale(m)));
        for c in 0..N_COLORS {
            site[c] = acc[c].scale(scale) + here.map_or(Complex64::ZERO, |h| h[c]);
        }
    });
}

/// Exchange the halo of `input`, then out = diag·ψ + scale·Hψ.
///
/// `diag` requires `out` and `input` to share a parity (the full lattice);
/// the pure hopping term (`diag = None`) maps one parity to the other.
pub(crate) fn apply(
    out: &mut LatticeField,
    gauge: &GaugeField,
    input: &LatticeField,
    diag: Option<f64>,
    scale: f64,
) -> Result<()> {
    super::expect_species(input, Species::ColorVector)?;
    super::expect_species(out, Species::ColorVector)?;
    input.update_halo()?;
    kernels::launch("staggered", out, &[input, gauge.as_field()], move |g, o, ins| {
        stencil(g, o, &ins[0], &ins[1], diag, scale);
        Ok(())
    })?;
    input.context().diagnostics().record_operator();
    Ok(())
}
