// SPDX-License-Identifier: AGPL-3.0-only

//! SU(3) link matrices and colour vectors.
//!
//! A link `U_μ(x)` is the parallel transporter from x to x+μ̂. Storage is
//! row-major, 9 `Complex64`, so a gauge site (4 links) is 36 contiguous
//! complex components in an AOS buffer.

use std::ops::Mul;

use bytemuck::{Pod, Zeroable};

use super::complex::Complex64;
use super::constants::{lcg_gaussian, LATTICE_DIVISION_GUARD, N_COLORS};

/// Three complex colour components at one site.
pub type ColorVector = [Complex64; N_COLORS];

/// 3×3 complex matrix, `m[row][col]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Su3Matrix {
    /// Matrix elements.
    pub m: [[Complex64; 3]; 3],
}

impl Mul for Su3Matrix {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        let mut r = Self::ZERO;
        for (i, row) in r.m.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.m[i][k] * rhs.m[k][j]).sum();
            }
        }
        r
    }
}

impl Su3Matrix {
    /// Unit link.
    pub const IDENTITY: Self = Self {
        m: [
            [Complex64::ONE, Complex64::ZERO, Complex64::ZERO],
            [Complex64::ZERO, Complex64::ONE, Complex64::ZERO],
            [Complex64::ZERO, Complex64::ZERO, Complex64::ONE],
        ],
    };

    /// All elements zero.
    pub const ZERO: Self = Self {
        m: [[Complex64::ZERO; 3]; 3],
    };

    /// Conjugate transpose.
    #[must_use]
    pub fn adjoint(self) -> Self {
        let mut r = Self::ZERO;
        for (i, row) in r.m.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = self.m[j][i].conj();
            }
        }
        r
    }

    /// U v
    #[inline]
    #[must_use]
    pub fn mul_vec(&self, v: &ColorVector) -> ColorVector {
        let mut out = [Complex64::ZERO; 3];
        for (c, o) in out.iter_mut().enumerate() {
            *o = self.m[c][0] * v[0] + self.m[c][1] * v[1] + self.m[c][2] * v[2];
        }
        out
    }

    /// U† v without forming U†.
    #[inline]
    #[must_use]
    pub fn adjoint_mul_vec(&self, v: &ColorVector) -> ColorVector {
        let mut out = [Complex64::ZERO; 3];
        for (c, o) in out.iter_mut().enumerate() {
            *o = self.m[0][c].conj_mul(v[0]) + self.m[1][c].conj_mul(v[1]) + self.m[2][c].conj_mul(v[2]);
        }
        out
    }

    /// Determinant.
    #[must_use]
    pub fn det(self) -> Complex64 {
        let m = &self.m;
        let a = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]);
        let b = m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0]);
        let c = m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        a - b + c
    }

    /// Frobenius distance squared to `other`.
    #[must_use]
    pub fn distance_sq(&self, other: &Self) -> f64 {
        self.m
            .iter()
            .flatten()
            .zip(other.m.iter().flatten())
            .map(|(a, b)| (*a - *b).norm_sq())
            .sum()
    }

    /// Project onto SU(3): Gram-Schmidt on rows 0 and 1, row 2 from their
    /// conjugate cross product (det = 1).
    #[must_use]
    pub fn reunitarize(self) -> Self {
        let mut u = self;
        normalize_row(&mut u, 0);
        let overlap: Complex64 = (0..3).map(|j| u.m[0][j].conj_mul(u.m[1][j])).sum();
        for j in 0..3 {
            let shift = u.m[0][j] * overlap;
            u.m[1][j] -= shift;
        }
        normalize_row(&mut u, 1);
        u.m[2][0] = (u.m[0][1] * u.m[1][2] - u.m[0][2] * u.m[1][1]).conj();
        u.m[2][1] = (u.m[0][2] * u.m[1][0] - u.m[0][0] * u.m[1][2]).conj();
        u.m[2][2] = (u.m[0][0] * u.m[1][1] - u.m[0][1] * u.m[1][0]).conj();
        u
    }

    /// Random SU(3) element near the identity: exp(iεH) to second order,
    /// H traceless hermitian with Gaussian components, then reunitarized.
    pub fn random_near_identity(state: &mut u64, epsilon: f64) -> Self {
        let mut h = [[Complex64::ZERO; 3]; 3];
        let a3 = lcg_gaussian(state) * epsilon;
        let a8 = lcg_gaussian(state) * epsilon / 3.0_f64.sqrt();
        h[0][0] = Complex64::real(a3 + a8);
        h[1][1] = Complex64::real(-a3 + a8);
        h[2][2] = Complex64::real(-2.0 * a8);
        for (i, j) in [(0, 1), (0, 2), (1, 2)] {
            let z = Complex64::new(lcg_gaussian(state) * epsilon, lcg_gaussian(state) * epsilon);
            h[i][j] = z;
            h[j][i] = z.conj();
        }

        let mut u = Self::IDENTITY;
        for i in 0..3 {
            for j in 0..3 {
                let h2: Complex64 = (0..3).map(|k| h[i][k] * h[k][j]).sum();
                u.m[i][j] += h[i][j].mul_i() - h2.scale(0.5);
            }
        }
        u.reunitarize()
    }
}

fn normalize_row(u: &mut Su3Matrix, row: usize) {
    let norm = u.m[row].iter().map(|z| z.norm_sq()).sum::<f64>().sqrt();
    if norm > LATTICE_DIVISION_GUARD {
        for z in &mut u.m[row] {
            *z = z.scale(1.0 / norm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_acts_trivially() {
        let v = [
            Complex64::new(1.0, 2.0),
            Complex64::new(-0.5, 0.0),
            Complex64::new(0.0, 3.0),
        ];
        assert_eq!(Su3Matrix::IDENTITY.mul_vec(&v), v);
        assert_eq!(Su3Matrix::IDENTITY.adjoint_mul_vec(&v), v);
    }

    #[test]
    fn random_link_is_special_unitary() {
        let mut state = 42u64;
        for _ in 0..10 {
            let u = Su3Matrix::random_near_identity(&mut state, 0.7);
            let uu = u * u.adjoint();
            assert!(uu.distance_sq(&Su3Matrix::IDENTITY) < 1e-20);
            assert!((u.det() - Complex64::ONE).abs() < 1e-12);
        }
    }

    #[test]
    fn adjoint_mul_vec_matches_explicit_adjoint() {
        let mut state = 9u64;
        let u = Su3Matrix::random_near_identity(&mut state, 1.0);
        let v = [
            Complex64::new(0.3, -0.1),
            Complex64::new(1.0, 0.4),
            Complex64::new(-0.2, 0.9),
        ];
        let a = u.adjoint_mul_vec(&v);
        let b = u.adjoint().mul_vec(&v);
        for c in 0..3 {
            assert!((a[c] - b[c]).abs() < 1e-14);
        }
    }
}
