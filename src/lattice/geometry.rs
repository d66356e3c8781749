// SPDX-License-Identifier: AGPL-3.0-only

//! Global lattice geometry and checkerboard indexing.
//!
//! Coordinates are `[x, y, z, t]` with periodic boundaries. The global site
//! index runs t slowest, z fastest:
//! `idx = t·NxNyNz + x·NyNz + y·Nz + z`. Within one timeslice the spatial
//! index `s = x·NyNz + y·Nz + z` pairs neighbouring z values of opposite
//! parity, so with Nz even the even-odd index of a site inside its slice is
//! simply `s / 2`.

use std::fmt;

use super::constants::{N_DIM, T_DIR};
use crate::error::{LatticeError, Result};

/// Checkerboard colour of a site: parity of `x + y + z + t`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Parity {
    /// `x + y + z + t` even.
    Even,
    /// `x + y + z + t` odd.
    Odd,
}

impl Parity {
    /// The other checkerboard colour.
    #[must_use]
    pub const fn flip(self) -> Self {
        match self {
            Self::Even => Self::Odd,
            Self::Odd => Self::Even,
        }
    }

    /// Parity of a coordinate sum.
    #[must_use]
    pub const fn of_sum(sum: usize) -> Self {
        if sum % 2 == 0 {
            Self::Even
        } else {
            Self::Odd
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Even => write!(f, "even"),
            Self::Odd => write!(f, "odd"),
        }
    }
}

/// Global 4D lattice extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LatticeGeometry {
    dims: [usize; N_DIM],
}

impl LatticeGeometry {
    /// Geometry with extents `[nx, ny, nz, nt]`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidGeometry`] if an extent is zero, or if an
    /// extent is odd (the checkerboard split needs every direction even so
    /// that parity is consistent across the periodic boundary).
    pub fn new(dims: [usize; N_DIM]) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(LatticeError::InvalidGeometry(format!(
                "zero extent in {dims:?}"
            )));
        }
        if dims.iter().any(|&d| d % 2 != 0) {
            return Err(LatticeError::InvalidGeometry(format!(
                "extents {dims:?} must all be even for the even-odd split"
            )));
        }
        Ok(Self { dims })
    }

    /// Extents `[nx, ny, nz, nt]`.
    #[must_use]
    pub const fn dims(&self) -> [usize; N_DIM] {
        self.dims
    }

    /// Number of timeslices.
    #[must_use]
    pub const fn nt(&self) -> usize {
        self.dims[T_DIR]
    }

    /// Sites in one timeslice.
    #[must_use]
    pub const fn spatial_volume(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Total sites.
    #[must_use]
    pub const fn volume(&self) -> usize {
        self.spatial_volume() * self.nt()
    }

    /// Spatial index inside a timeslice.
    #[must_use]
    pub const fn spatial_index(&self, x: [usize; N_DIM]) -> usize {
        x[0] * (self.dims[1] * self.dims[2]) + x[1] * self.dims[2] + x[2]
    }

    /// Global site index (t slowest).
    #[must_use]
    pub const fn site_index(&self, x: [usize; N_DIM]) -> usize {
        x[T_DIR] * self.spatial_volume() + self.spatial_index(x)
    }

    /// Inverse of [`Self::site_index`].
    #[must_use]
    pub const fn site_coords(&self, idx: usize) -> [usize; N_DIM] {
        let nxyz = self.spatial_volume();
        let t = idx / nxyz;
        self.coords_in_slice(idx % nxyz, t)
    }

    /// Coordinates of spatial index `s` on timeslice `t`.
    #[must_use]
    pub const fn coords_in_slice(&self, s: usize, t: usize) -> [usize; N_DIM] {
        let nyz = self.dims[1] * self.dims[2];
        [s / nyz, (s % nyz) / self.dims[2], s % self.dims[2], t]
    }

    /// Periodic neighbour of `x` in direction `mu`.
    #[must_use]
    pub const fn neighbor(&self, x: [usize; N_DIM], mu: usize, forward: bool) -> [usize; N_DIM] {
        let mut y = x;
        y[mu] = if forward {
            (x[mu] + 1) % self.dims[mu]
        } else {
            (x[mu] + self.dims[mu] - 1) % self.dims[mu]
        };
        y
    }

    /// Checkerboard colour of a site.
    #[must_use]
    pub const fn parity(x: [usize; N_DIM]) -> Parity {
        Parity::of_sum(x[0] + x[1] + x[2] + x[3])
    }

    /// Index of a site among the sites of its parity (t slowest).
    #[must_use]
    pub const fn eo_index(&self, x: [usize; N_DIM]) -> usize {
        x[T_DIR] * (self.spatial_volume() / 2) + self.spatial_index(x) / 2
    }

    /// Coordinates of the `k`-th site of parity `p` on slice `t`.
    #[must_use]
    pub const fn eo_coords_in_slice(&self, k: usize, t: usize, p: Parity) -> [usize; N_DIM] {
        // Candidates 2k and 2k+1 differ only in z and so in parity.
        let s = 2 * k;
        let x = self.coords_in_slice(s, t);
        let here = Self::parity(x);
        if matches!((here, p), (Parity::Even, Parity::Even) | (Parity::Odd, Parity::Odd)) {
            x
        } else {
            self.coords_in_slice(s + 1, t)
        }
    }

    /// Number of sites of one parity.
    #[must_use]
    pub const fn eo_volume(&self) -> usize {
        self.volume() / 2
    }

    /// Staggered phase η_μ(x) = (−1)^(x_0 + … + x_{μ−1}).
    #[must_use]
    pub fn staggered_phase(x: [usize; N_DIM], mu: usize) -> f64 {
        let sum: usize = x[..mu].iter().sum();
        if sum % 2 == 0 {
            1.0
        } else {
            -1.0
        }
    }
}
