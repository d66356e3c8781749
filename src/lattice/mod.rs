// SPDX-License-Identifier: AGPL-3.0-only

//! Lattice data: geometry, partitioning and distributed fields.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `complex` | `Complex64` component type |
//! | `constants` | colour/spin/direction counts, LCG generator |
//! | `su3` | SU(3) link matrices |
//! | `geometry` | global extents, site and even-odd indexing |
//! | `partition` | split along t, ghost slices, per-device site layout |
//! | `field` | [`LatticeField`]: one buffer per device, BLAS-style algebra |
//! | `gauge` | [`GaugeField`]: links with ghost slices filled at upload |
//! | `halo` | ghost-slice exchange between neighbouring devices |
//!
//! Fields are split along the t axis. Neighbour lookups in x, y and z stay
//! inside a device; t-neighbours on the slab boundary come from ghost slices
//! refreshed by [`LatticeField::update_halo`].

pub mod complex;
pub mod constants;
pub mod field;
pub mod gauge;
pub mod geometry;
pub mod halo;
pub(crate) mod kernels;
pub mod partition;
pub mod su3;

pub use complex::Complex64;
pub use field::{LatticeField, Species};
pub use gauge::GaugeField;
pub use geometry::{LatticeGeometry, Parity};
pub use halo::HaloRegion;
pub use partition::{LocalVolume, Partition, SiteLayout};
pub use su3::Su3Matrix;
