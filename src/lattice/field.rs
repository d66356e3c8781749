// SPDX-License-Identifier: AGPL-3.0-only

//! Distributed lattice fields.
//!
//! A [`LatticeField`] is one [`Buffer`] per device of its context. Each
//! buffer holds the device's owned timeslices plus the ghost slices of
//! [`Partition`](super::partition::Partition), in the element layout every
//! device agreed on. Even-odd fields store only the sites of one parity.
//!
//! Host-side data (for [`LatticeField::from_host`] and
//! [`LatticeField::to_host`]) is in canonical order: site-major (global or
//! even-odd site index, t slowest), components contiguous per site,
//! regardless of the device layout.
//!
//! Operations that mutate take `&mut self`; they run as one job per device
//! and return once every device has finished.

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;

use super::complex::Complex64;
use super::constants::{GAUGE_COMPONENTS, N_COLORS, N_SPIN};
use super::geometry::{LatticeGeometry, Parity};
use super::kernels::{self, PartData};
use super::partition::{LocalVolume, SiteLayout};
use crate::buffer::Buffer;
use crate::context::SimulationContext;
use crate::device::Layout;
use crate::error::{LatticeError, Result};

/// What a field stores per site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Species {
    /// Staggered fermion: one colour vector.
    ColorVector,
    /// Wilson fermion: four spin components of a colour vector.
    DiracSpinor,
    /// Gauge background: four SU(3) links.
    GaugeLinks,
}

impl Species {
    /// Complex components per site.
    #[must_use]
    pub const fn components(self) -> usize {
        match self {
            Self::ColorVector => N_COLORS,
            Self::DiracSpinor => N_SPIN * N_COLORS,
            Self::GaugeLinks => GAUGE_COMPONENTS,
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColorVector => write!(f, "colour vector"),
            Self::DiracSpinor => write!(f, "Dirac spinor"),
            Self::GaugeLinks => write!(f, "gauge links"),
        }
    }
}

/// One device's share of a field.
#[derive(Debug)]
pub(crate) struct FieldPart {
    pub buffer: Buffer,
    pub volume: LocalVolume,
    pub sites: SiteLayout,
}

/// A field distributed over the devices of a [`SimulationContext`].
pub struct LatticeField {
    ctx: Arc<SimulationContext>,
    species: Species,
    parity: Option<Parity>,
    layout: Layout,
    parts: Vec<FieldPart>,
}

impl fmt::Debug for LatticeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatticeField")
            .field("species", &self.species)
            .field("parity", &self.parity)
            .field("layout", &self.layout)
            .field("devices", &self.parts.len())
            .finish()
    }
}

impl LatticeField {
    /// Zero field of `species` over the whole lattice (`parity = None`) or
    /// over the sites of one parity.
    ///
    /// # Errors
    ///
    /// [`LatticeError::LayoutMismatch`] if the devices prefer different
    /// layouts, [`LatticeError::Allocation`] if a device is out of memory.
    pub fn new(ctx: &Arc<SimulationContext>, species: Species, parity: Option<Parity>) -> Result<Self> {
        let layout = ctx.common_layout()?;
        let partition = ctx.partition();
        let parts = ctx
            .devices()
            .iter()
            .enumerate()
            .map(|(d, device)| {
                let volume = partition.local_volume(d, parity);
                let sites = SiteLayout {
                    layout,
                    components: species.components(),
                    sites: volume.storage_sites(),
                };
                Ok(FieldPart {
                    buffer: Buffer::new(device, sites.bytes())?,
                    volume,
                    sites,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            species,
            parity,
            layout,
            parts,
        })
    }

    /// Zero field with the same species, parity and context.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Allocation`] if a device is out of memory.
    pub fn like(&self) -> Result<Self> {
        Self::new(&self.ctx, self.species, self.parity)
    }

    /// Field holding `data` (canonical host order).
    ///
    /// # Errors
    ///
    /// [`LatticeError::SizeMismatch`] if `data` does not have exactly
    /// [`Self::host_len`] elements, plus the errors of [`Self::new`].
    pub fn from_host(
        ctx: &Arc<SimulationContext>,
        species: Species,
        parity: Option<Parity>,
        data: &[Complex64],
    ) -> Result<Self> {
        let mut field = Self::new(ctx, species, parity)?;
        field.upload(data)?;
        Ok(field)
    }

    /// Overwrite the owned sites with `data` (canonical host order). Ghost
    /// slices are zeroed; the next halo update refills them.
    ///
    /// # Errors
    ///
    /// [`LatticeError::SizeMismatch`] on a wrong element count.
    pub fn upload(&mut self, data: &[Complex64]) -> Result<()> {
        self.check_host_len(data.len())?;
        let comps = self.species.components();
        for part in &self.parts {
            let v = part.volume;
            let first_global = v.t_start * v.sites_per_slice;
            let first_stored = v.halo * v.sites_per_slice;
            let mut storage = vec![Complex64::ZERO; part.sites.len()];
            for i in 0..v.owned_sites() {
                for c in 0..comps {
                    storage[part.sites.index(first_stored + i, c)] =
                        data[(first_global + i) * comps + c];
                }
            }
            part.buffer.load_slice(&storage)?;
        }
        tracing::trace!(species = %self.species, elements = data.len(), "upload field");
        Ok(())
    }

    /// Owned sites in canonical host order.
    ///
    /// # Errors
    ///
    /// Transfer failure.
    pub fn to_host(&self) -> Result<Vec<Complex64>> {
        let mut out = Vec::with_capacity(self.host_len());
        for d in 0..self.parts.len() {
            let part = self.part_data(d)?;
            out.extend(part.owned_elements());
        }
        Ok(out)
    }

    /// Host element count: sites (of the field's parity) × components.
    #[must_use]
    pub fn host_len(&self) -> usize {
        let g = self.ctx.geometry();
        let sites = if self.parity.is_some() {
            g.eo_volume()
        } else {
            g.volume()
        };
        sites * self.species.components()
    }

    fn check_host_len(&self, len: usize) -> Result<()> {
        let expected = self.host_len();
        if len == expected {
            Ok(())
        } else {
            Err(LatticeError::SizeMismatch {
                source_bytes: len * std::mem::size_of::<Complex64>(),
                dest_bytes: expected * std::mem::size_of::<Complex64>(),
            })
        }
    }

    // ── Metadata ────────────────────────────────────────────────────

    /// Element layout shared by every device buffer.
    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    /// `None` for a full-lattice field.
    #[must_use]
    pub const fn parity(&self) -> Option<Parity> {
        self.parity
    }

    /// Per-site content.
    #[must_use]
    pub const fn species(&self) -> Species {
        self.species
    }

    /// Owning context.
    #[must_use]
    pub fn context(&self) -> &Arc<SimulationContext> {
        &self.ctx
    }

    /// Global geometry.
    #[must_use]
    pub fn geometry(&self) -> &LatticeGeometry {
        self.ctx.geometry()
    }

    /// Per-device buffers, in partition order.
    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.parts.iter().map(|p| &p.buffer)
    }

    pub(crate) fn part(&self, device: usize) -> &FieldPart {
        &self.parts[device]
    }

    pub(crate) fn parts(&self) -> &[FieldPart] {
        &self.parts
    }

    fn part_data(&self, device: usize) -> Result<PartData> {
        let part = &self.parts[device];
        Ok(PartData {
            volume: part.volume,
            sites: part.sites,
            parity: self.parity,
            data: part.buffer.dump_vec()?,
        })
    }

    /// Same context, species and parity as `other`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::IncompatibleFields`] naming the difference.
    pub fn check_compatible(&self, other: &Self) -> Result<()> {
        if !self.ctx.is_same(&other.ctx) {
            return Err(LatticeError::IncompatibleFields(
                "fields belong to different simulation contexts".into(),
            ));
        }
        if self.species != other.species || self.parity != other.parity {
            return Err(LatticeError::IncompatibleFields(format!(
                "{} ({:?}) vs {} ({:?})",
                self.species, self.parity, other.species, other.parity
            )));
        }
        Ok(())
    }

    // ── Initialization ──────────────────────────────────────────────

    /// Zero every component, ghosts included.
    ///
    /// # Errors
    ///
    /// Backend failure of the fill.
    pub fn clear(&mut self) -> Result<()> {
        let events: Vec<_> = self.parts.iter().map(|p| p.buffer.clear_async(&[])).collect();
        crate::device::SyncEvent::wait_all(&events)
    }

    /// Copy `src` into this field, device by device.
    ///
    /// # Errors
    ///
    /// [`LatticeError::IncompatibleFields`] if the fields differ in
    /// species, parity or context.
    pub fn copy_from(&mut self, src: &Self) -> Result<()> {
        self.check_compatible(src)?;
        let events = self
            .parts
            .iter()
            .zip(&src.parts)
            .map(|(dst, from)| dst.buffer.copy_from_async(&from.buffer, &[]))
            .collect::<Result<Vec<_>>>()?;
        crate::device::SyncEvent::wait_all(&events)
    }

    /// Gaussian random components from the context RNG stream, E|z|² = 1.
    ///
    /// Values are drawn in canonical host order, so the field content does
    /// not depend on the number of devices.
    ///
    /// # Errors
    ///
    /// Transfer failure.
    pub fn fill_gaussian(&mut self) -> Result<()> {
        let n = self.host_len();
        let data: Vec<Complex64> = self.ctx.with_rng(|rng| {
            (0..n)
                .map(|_| {
                    Complex64::new(rng.gaussian(), rng.gaussian())
                        .scale(std::f64::consts::FRAC_1_SQRT_2)
                })
                .collect()
        });
        self.upload(&data)
    }

    /// Every component equal to `1/√N` (N = [`Self::host_len`]), so the
    /// field has unit norm.
    ///
    /// # Errors
    ///
    /// Transfer failure.
    pub fn set_cold(&mut self) -> Result<()> {
        let n = self.host_len();
        let value = Complex64::real(1.0 / (n as f64).sqrt());
        self.upload(&vec![value; n])
    }

    // ── Reductions ──────────────────────────────────────────────────

    /// ⟨self, other⟩ = Σ conj(self)·other over all owned sites of all
    /// devices.
    ///
    /// # Errors
    ///
    /// [`LatticeError::IncompatibleFields`], or a device failure.
    pub fn dot(&self, other: &Self) -> Result<Complex64> {
        self.check_compatible(other)?;
        kernels::reduce("dot", &[self, other], |parts| {
            kernels::partial_dot(&parts[0], &parts[1])
        })
    }

    /// ‖self‖².
    ///
    /// # Errors
    ///
    /// Device failure.
    pub fn norm_sq(&self) -> Result<f64> {
        let sum = kernels::reduce("norm_sq", &[self], |parts| {
            let s: f64 = parts[0].owned_elements().map(Complex64::norm_sq).sum();
            Complex64::real(s)
        })?;
        Ok(sum.re)
    }

    /// ‖self‖.
    ///
    /// # Errors
    ///
    /// Device failure.
    pub fn norm(&self) -> Result<f64> {
        Ok(self.norm_sq()?.sqrt())
    }

    /// Log ‖self‖² at debug level; skips the reduction when debug logging
    /// is off.
    ///
    /// # Errors
    ///
    /// Device failure.
    pub fn log_squarenorm(&self, label: &str) -> Result<()> {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let norm_sq = self.norm_sq()?;
            tracing::debug!(field = label, norm_sq, "squarenorm");
        }
        Ok(())
    }

    // ── Linear algebra ──────────────────────────────────────────────

    /// self ← a·self
    ///
    /// # Errors
    ///
    /// Device failure.
    pub fn scale(&mut self, a: Complex64) -> Result<()> {
        kernels::launch("scale", self, &[], move |_, out, _| {
            out.data.par_iter_mut().for_each(|z| *z = a * *z);
            Ok(())
        })
    }

    /// self ← self + a·x
    ///
    /// # Errors
    ///
    /// [`LatticeError::IncompatibleFields`], or a device failure.
    pub fn axpy(&mut self, a: Complex64, x: &Self) -> Result<()> {
        self.check_compatible(x)?;
        kernels::launch("axpy", self, &[x], move |_, out, ins| {
            out.data
                .par_iter_mut()
                .zip(ins[0].data.par_iter())
                .for_each(|(y, x)| *y += a * *x);
            Ok(())
        })
    }

    /// self ← x + a·self
    ///
    /// # Errors
    ///
    /// [`LatticeError::IncompatibleFields`], or a device failure.
    pub fn xpay(&mut self, x: &Self, a: Complex64) -> Result<()> {
        self.check_compatible(x)?;
        kernels::launch("xpay", self, &[x], move |_, out, ins| {
            out.data
                .par_iter_mut()
                .zip(ins[0].data.par_iter())
                .for_each(|(y, x)| *y = *x + a * *y);
            Ok(())
        })
    }

    /// self ← a·x + b·y + z
    ///
    /// # Errors
    ///
    /// [`LatticeError::IncompatibleFields`], or a device failure.
    pub fn saxsbypz(&mut self, a: Complex64, x: &Self, b: Complex64, y: &Self, z: &Self) -> Result<()> {
        self.check_compatible(x)?;
        self.check_compatible(y)?;
        self.check_compatible(z)?;
        kernels::launch("saxsbypz", self, &[x, y, z], move |_, out, ins| {
            out.data
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, o)| *o = a * ins[0].data[i] + b * ins[1].data[i] + ins[2].data[i]);
            Ok(())
        })
    }

    /// self ← γ5·self (chiral basis: γ5 = diag(1, 1, −1, −1) in spin).
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidArgument`] unless the field holds Dirac
    /// spinors.
    pub fn apply_gamma5(&mut self) -> Result<()> {
        if self.species != Species::DiracSpinor {
            return Err(LatticeError::InvalidArgument(format!(
                "γ5 acts on Dirac spinors, not {}",
                self.species
            )));
        }
        kernels::launch("gamma5", self, &[], |_, out, _| {
            let lower = 2 * N_COLORS..N_SPIN * N_COLORS;
            for site in 0..out.sites.sites {
                for c in lower.clone() {
                    let at = out.sites.index(site, c);
                    out.data[at] = -out.data[at];
                }
            }
            Ok(())
        })
    }

    // ── Even-odd split ──────────────────────────────────────────────

    /// Copy the even and odd sites of this full field into two one-parity
    /// fields.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidArgument`] if this field already has a
    /// parity; allocation or device failure.
    pub fn split_even_odd(&self) -> Result<(Self, Self)> {
        if self.parity.is_some() {
            return Err(LatticeError::InvalidArgument(
                "split_even_odd needs a full-lattice field".into(),
            ));
        }
        let even = Self::new(&self.ctx, self.species, Some(Parity::Even))?;
        let odd = Self::new(&self.ctx, self.species, Some(Parity::Odd))?;
        for half in [&even, &odd] {
            kernels::launch("split even-odd", half, &[self], |g, out, ins| {
                let full = &ins[0];
                let comps = out.sites.components;
                out.compute_owned(g, |slot, x, site| {
                    let from = full.storage_site(g, slot, x);
                    for (c, v) in site.iter_mut().enumerate().take(comps) {
                        *v = full.get(from, c);
                    }
                });
                Ok(())
            })?;
        }
        Ok((even, odd))
    }

    /// Assemble this full field from its even and odd halves.
    ///
    /// # Errors
    ///
    /// [`LatticeError::IncompatibleFields`] if the halves do not match this
    /// field or have the wrong parities.
    pub fn merge_even_odd(&mut self, even: &Self, odd: &Self) -> Result<()> {
        if self.parity.is_some()
            || even.parity != Some(Parity::Even)
            || odd.parity != Some(Parity::Odd)
            || even.species != self.species
            || odd.species != self.species
        {
            return Err(LatticeError::IncompatibleFields(format!(
                "merge of {:?} + {:?} into {:?}",
                even.parity, odd.parity, self.parity
            )));
        }
        kernels::launch("merge even-odd", self, &[even, odd], |g, out, ins| {
            out.compute_owned(g, |slot, x, site| {
                let half = match LatticeGeometry::parity(x) {
                    Parity::Even => &ins[0],
                    Parity::Odd => &ins[1],
                };
                let from = half.storage_site(g, slot, x);
                for (c, v) in site.iter_mut().enumerate() {
                    *v = half.get(from, c);
                }
            });
            Ok(())
        })
    }
}
