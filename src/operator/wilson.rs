// SPDX-License-Identifier: AGPL-3.0-only

//! Wilson and twisted-mass fermion matrices on Dirac spinors:
//!
//!   M ψ(x) = ψ(x) + 2iκμ γ5 ψ(x)
//!            − κ Σ_μ [(1 − γ_μ) U_μ(x) ψ(x+μ̂) + (1 + γ_μ) U_μ†(x−μ̂) ψ(x−μ̂)]
//!
//! μ = 0 is the plain Wilson matrix. Both are γ5-hermitian:
//! M(μ)† = γ5 M(−μ) γ5.
//!
//! Spinor components are spin-major: component `s·3 + c` is spin `s`,
//! colour `c`. Gamma matrices are in the chiral basis, where
//! γ5 = γ1γ2γ3γ4 = diag(1, 1, −1, −1).

use crate::error::Result;
use crate::lattice::complex::Complex64;
use crate::lattice::constants::{N_COLORS, N_DIM, N_SPIN};
use crate::lattice::field::{LatticeField, Species};
use crate::lattice::gauge::GaugeField;
use crate::lattice::geometry::LatticeGeometry;
use crate::lattice::kernels::{self, PartData};
use crate::lattice::su3::ColorVector;

type Spinor = [ColorVector; N_SPIN];

const O: Complex64 = Complex64::ZERO;
const R: Complex64 = Complex64::ONE;
const M: Complex64 = Complex64::new(-1.0, 0.0);
const I: Complex64 = Complex64::I;
const J: Complex64 = Complex64::new(0.0, -1.0);

/// γ_1..γ_4 (x, y, z, t) in the chiral basis.
pub const GAMMA: [[[Complex64; N_SPIN]; N_SPIN]; N_DIM] = [
    [[O, O, O, J], [O, O, J, O], [O, I, O, O], [I, O, O, O]],
    [[O, O, O, M], [O, O, R, O], [O, R, O, O], [M, O, O, O]],
    [[O, O, J, O], [O, O, O, I], [I, O, O, O], [O, J, O, O]],
    [[O, O, R, O], [O, O, O, R], [R, O, O, O], [O, R, O, O]],
];

/// Sign of γ5 on spin component `s`.
#[inline]
pub const fn gamma5_sign(s: usize) -> f64 {
    if s < 2 {
        1.0
    } else {
        -1.0
    }
}

/// (1 + sign·γ_μ) ψ
fn project(mu: usize, sign: f64, psi: &Spinor) -> Spinor {
    let mut out = *psi;
    for (s, row) in GAMMA[mu].iter().enumerate() {
        for (t, g) in row.iter().enumerate() {
            if *g != O {
                let coef = g.scale(sign);
                for c in 0..N_COLORS {
                    out[s][c] += coef * psi[t][c];
                }
            }
        }
    }
    out
}

fn spinor(part: &PartData, site: usize) -> Spinor {
    [
        part.color(site, 0),
        part.color(site, N_COLORS),
        part.color(site, 2 * N_COLORS),
        part.color(site, 3 * N_COLORS),
    ]
}

/// out(x) = [ψ + i·twist·γ5ψ](x) (if `twist` is set) + scale·(Hψ)(x), with
/// H the Wilson hopping term.
fn stencil(
    g: &LatticeGeometry,
    out: &mut PartData,
    psi: &PartData,
    gauge: &PartData,
    twist: Option<f64>,
    scale: f64,
) {
    out.compute_owned(g, |slot, x, site| {
        let mut acc: Spinor = [[Complex64::ZERO; N_COLORS]; N_SPIN];
        for mu in 0..N_DIM {
            let (fslot, xf) = psi.neighbor(g, slot, x, mu, true);
            let u = gauge.link(gauge.storage_site(g, slot, x), mu);
            let fwd = project(mu, -1.0, &spinor(psi, psi.storage_site(g, fslot, xf)));

            let (bslot, xb) = psi.neighbor(g, slot, x, mu, false);
            let ub = gauge.link(gauge.storage_site(g, bslot, xb), mu);
            let bwd = project(mu, 1.0, &spinor(psi, psi.storage_site(g, bslot, xb)));

            for s in 0..N_SPIN {
                let f = u.mul_vec(&fwd[s]);
                let b = ub.adjoint_mul_vec(&bwd[s]);
                for c in 0..N_COLORS {
                    acc[s][c] += f[c] + b[c];
                }
            }
        }
        let here = twist.map(|_| spinor(psi, psi.storage_site(g, slot, x)));
        for s in 0..N_SPIN {
            for c in 0..N_COLORS {
                let mut v = acc[s][c].scale(scale);
                if let (Some(t), Some(h)) = (twist, here.as_ref()) {
                    v += h[s][c] + h[s][c].mul_i().scale(t * gamma5_sign(s));
                }
                site[s * N_COLORS + c] = v;
            }
        }
    });
}

/// Exchange the halo of `input`, then out = (1 + i·twist·γ5)ψ + scale·Hψ
/// (`twist = None` leaves only the hopping term).
pub(crate) fn apply(
    out: &mut LatticeField,
    gauge: &GaugeField,
    input: &LatticeField,
    twist: Option<f64>,
    scale: f64,
) -> Result<()> {
    super::expect_species(input, Species::DiracSpinor)?;
    super::expect_species(out, Species::DiracSpinor)?;
    input.update_halo()?;
    kernels::launch("wilson", out, &[input, gauge.as_field()], move |g, o, ins| {
        stencil(g, o, &ins[0], &ins[1], twist, scale);
        Ok(())
    })?;
    input.context().diagnostics().record_operator();
    Ok(())
}

/// Site-local twist block: out = (1 + i·twist·γ5)ψ, or its inverse
/// (1 − i·twist·γ5)ψ / (1 + twist²).
pub(crate) fn apply_twist(
    out: &mut LatticeField,
    input: &LatticeField,
    twist: f64,
    inverse: bool,
) -> Result<()> {
    super::expect_species(input, Species::DiracSpinor)?;
    out.check_compatible(input)?;
    let (sign, norm) = if inverse {
        (-1.0, 1.0 / (1.0 + twist * twist))
    } else {
        (1.0, 1.0)
    };
    kernels::launch("twist", out, &[input], move |_, o, ins| {
        let psi = &ins[0];
        for site in 0..o.sites.sites {
            for s in 0..N_SPIN {
                let coef = Complex64::new(norm, norm * sign * twist * gamma5_sign(s));
                for c in 0..N_COLORS {
                    let at = o.sites.index(site, s * N_COLORS + c);
                    o.data[at] = coef * psi.data[at];
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matmul(a: &[[Complex64; 4]; 4], b: &[[Complex64; 4]; 4]) -> [[Complex64; 4]; 4] {
        let mut r = [[O; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                r[i][j] = (0..4).map(|k| a[i][k] * b[k][j]).sum();
            }
        }
        r
    }

    fn identity() -> [[Complex64; 4]; 4] {
        let mut r = [[O; 4]; 4];
        for (i, row) in r.iter_mut().enumerate() {
            row[i] = R;
        }
        r
    }

    #[test]
    fn gammas_square_to_one_and_are_hermitian() {
        for g in &GAMMA {
            assert_eq!(matmul(g, g), identity());
            for i in 0..4 {
                for j in 0..4 {
                    assert_eq!(g[i][j], g[j][i].conj());
                }
            }
        }
    }

    #[test]
    fn gammas_anticommute() {
        for mu in 0..4 {
            for nu in 0..4 {
                if mu != nu {
                    let ab = matmul(&GAMMA[mu], &GAMMA[nu]);
                    let ba = matmul(&GAMMA[nu], &GAMMA[mu]);
                    for i in 0..4 {
                        for j in 0..4 {
                            assert_eq!(ab[i][j], -ba[i][j]);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn gamma5_is_product_of_gammas() {
        let g5 = matmul(
            &matmul(&GAMMA[0], &GAMMA[1]),
            &matmul(&GAMMA[2], &GAMMA[3]),
        );
        for (s, row) in g5.iter().enumerate() {
            for (t, z) in row.iter().enumerate() {
                let expected = if s == t { gamma5_sign(s) } else { 0.0 };
                assert_eq!(*z, Complex64::real(expected));
            }
        }
    }

    #[test]
    fn projectors_are_complementary() {
        let psi: Spinor = [
            [Complex64::new(1.0, 0.5), O, Complex64::new(-0.3, 0.0)],
            [O, R, O],
            [Complex64::new(0.2, -1.0), O, O],
            [O, O, I],
        ];
        for mu in 0..4 {
            let minus = project(mu, -1.0, &psi);
            let plus = project(mu, 1.0, &psi);
            for s in 0..4 {
                for c in 0..3 {
                    let sum = minus[s][c] + plus[s][c];
                    assert!((sum - psi[s][c].scale(2.0)).abs() < 1e-15);
                }
            }
        }
    }
}
