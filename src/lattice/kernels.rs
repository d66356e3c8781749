// SPDX-License-Identifier: AGPL-3.0-only

//! Per-device kernel launch and global reductions.
//!
//! A kernel is a host job on the device queue: it reads the device's part
//! of every participating field, computes on the host with rayon, and
//! writes the output part back. One job per device, all devices in
//! parallel, then the caller waits on every event.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use super::complex::Complex64;
use super::constants::{N_COLORS, T_DIR};
use super::field::LatticeField;
use super::geometry::{LatticeGeometry, Parity};
use super::partition::{LocalVolume, SiteLayout};
use super::su3::{ColorVector, Su3Matrix};
use crate::buffer::DeviceMemory;
use crate::device::SyncEvent;
use crate::error::{LatticeError, Result};

/// One device's part of a field, materialized on the host.
#[derive(Clone, Debug)]
pub(crate) struct PartData {
    pub volume: LocalVolume,
    pub sites: SiteLayout,
    pub parity: Option<Parity>,
    pub data: Vec<Complex64>,
}

impl PartData {
    #[inline]
    pub fn get(&self, site: usize, c: usize) -> Complex64 {
        self.data[self.sites.index(site, c)]
    }

    /// Component `c` of every owned site, in global order.
    pub fn owned_elements(&self) -> impl Iterator<Item = Complex64> + '_ {
        let first = self.volume.halo * self.volume.sites_per_slice;
        (first..first + self.volume.owned_sites())
            .flat_map(move |s| (0..self.sites.components).map(move |c| self.get(s, c)))
    }

    /// Storage site of global coordinates `x`, held in storage slice `slot`.
    #[inline]
    pub fn storage_site(&self, geometry: &LatticeGeometry, slot: usize, x: [usize; 4]) -> usize {
        let s = geometry.spatial_index(x);
        let k = if self.parity.is_some() { s / 2 } else { s };
        slot * self.volume.sites_per_slice + k
    }

    /// Global coordinates of the `k`-th stored site of slice `slot`.
    #[inline]
    pub fn coords(&self, geometry: &LatticeGeometry, slot: usize, k: usize) -> [usize; 4] {
        let t = self.volume.slot_global_t(slot);
        match self.parity {
            None => geometry.coords_in_slice(k, t),
            Some(p) => geometry.eo_coords_in_slice(k, t, p),
        }
    }

    /// Storage slice and coordinates of the neighbour of `x` (stored in
    /// `slot`) in direction `mu`.
    #[inline]
    pub fn neighbor(
        &self,
        geometry: &LatticeGeometry,
        slot: usize,
        x: [usize; 4],
        mu: usize,
        forward: bool,
    ) -> (usize, [usize; 4]) {
        let slot = if mu == T_DIR {
            self.volume.t_neighbor_slot(slot, forward)
        } else {
            slot
        };
        (slot, geometry.neighbor(x, mu, forward))
    }

    /// Colour vector held in components `first..first + 3` of `site`.
    #[inline]
    pub fn color(&self, site: usize, first: usize) -> ColorVector {
        [
            self.get(site, first),
            self.get(site, first + 1),
            self.get(site, first + 2),
        ]
    }

    /// Link `U_mu` of a gauge part at `site`.
    #[inline]
    pub fn link(&self, site: usize, mu: usize) -> Su3Matrix {
        let mut u = Su3Matrix::ZERO;
        let base = mu * N_COLORS * N_COLORS;
        for (r, row) in u.m.iter_mut().enumerate() {
            for (c, z) in row.iter_mut().enumerate() {
                *z = self.get(site, base + r * N_COLORS + c);
            }
        }
        u
    }

    /// Run `site_fn` over every owned site in parallel, then scatter the
    /// per-site results (`components` values each) into storage.
    pub fn compute_owned<F>(&mut self, geometry: &LatticeGeometry, site_fn: F)
    where
        F: Fn(usize, [usize; 4], &mut [Complex64]) + Sync,
    {
        let comps = self.sites.components;
        let sps = self.volume.sites_per_slice;
        let halo = self.volume.halo;
        let mut scratch = vec![Complex64::ZERO; self.volume.owned_sites() * comps];
        let this = &*self;
        scratch
            .par_chunks_mut(comps)
            .enumerate()
            .for_each(|(i, out)| {
                let slot = halo + i / sps;
                let x = this.coords(geometry, slot, i % sps);
                site_fn(slot, x, out);
            });
        let first = halo * sps;
        for (i, site) in scratch.chunks(comps).enumerate() {
            for (c, v) in site.iter().enumerate() {
                let at = self.sites.index(first + i, c);
                self.data[at] = *v;
            }
        }
    }
}

struct PartSource {
    block: Arc<DeviceMemory>,
    volume: LocalVolume,
    sites: SiteLayout,
    parity: Option<Parity>,
}

impl PartSource {
    fn of(field: &LatticeField, device: usize) -> Self {
        let part = field.part(device);
        Self {
            block: part.buffer.memory(),
            volume: part.volume,
            sites: part.sites,
            parity: field.parity(),
        }
    }

    fn materialize(&self) -> Result<PartData> {
        Ok(PartData {
            volume: self.volume,
            sites: self.sites,
            parity: self.parity,
            data: self.block.read_all()?,
        })
    }
}

fn check_same_context(out: &LatticeField, inputs: &[&LatticeField]) -> Result<()> {
    for f in inputs {
        if !out.context().is_same(f.context()) {
            return Err(LatticeError::IncompatibleFields(
                "fields belong to different simulation contexts".into(),
            ));
        }
    }
    Ok(())
}

/// Run `kernel` on every device: `out` part mutable, `inputs` parts read.
/// Waits for every device before returning.
pub(crate) fn launch<K>(
    label: &'static str,
    out: &LatticeField,
    inputs: &[&LatticeField],
    kernel: K,
) -> Result<()>
where
    K: Fn(&LatticeGeometry, &mut PartData, &[PartData]) -> Result<()> + Send + Sync + 'static,
{
    check_same_context(out, inputs)?;
    let kernel = Arc::new(kernel);
    let geometry = *out.context().geometry();
    let events: Vec<SyncEvent> = out
        .context()
        .devices()
        .iter()
        .enumerate()
        .map(|(d, device)| {
            let target = PartSource::of(out, d);
            let sources: Vec<PartSource> = inputs.iter().map(|f| PartSource::of(f, d)).collect();
            let kernel = Arc::clone(&kernel);
            device.enqueue(
                label,
                &[],
                Box::new(move || {
                    let ins = sources
                        .iter()
                        .map(PartSource::materialize)
                        .collect::<Result<Vec<_>>>()?;
                    let mut part = target.materialize()?;
                    kernel(&geometry, &mut part, &ins)?;
                    target.block.write_all(&part.data)
                }),
            )
        })
        .collect();
    SyncEvent::wait_all(&events)
}

/// Per-device partial results of `partial`, summed in device order.
pub(crate) fn reduce<R>(label: &'static str, inputs: &[&LatticeField], partial: R) -> Result<Complex64>
where
    R: Fn(&[PartData]) -> Complex64 + Send + Sync + 'static,
{
    let Some(first) = inputs.first() else {
        return Err(LatticeError::InvalidArgument("reduction over no fields".into()));
    };
    check_same_context(first, inputs)?;
    let partial = Arc::new(partial);
    let ctx = first.context();
    let slots: Vec<Arc<Mutex<Complex64>>> = ctx
        .devices()
        .iter()
        .map(|_| Arc::new(Mutex::new(Complex64::ZERO)))
        .collect();
    let events: Vec<SyncEvent> = ctx
        .devices()
        .iter()
        .enumerate()
        .map(|(d, device)| {
            let sources: Vec<PartSource> = inputs.iter().map(|f| PartSource::of(f, d)).collect();
            let slot = Arc::clone(&slots[d]);
            let partial = Arc::clone(&partial);
            device.enqueue(
                label,
                &[],
                Box::new(move || {
                    let ins = sources
                        .iter()
                        .map(PartSource::materialize)
                        .collect::<Result<Vec<_>>>()?;
                    *slot.lock() = partial(&ins);
                    Ok(())
                }),
            )
        })
        .collect();
    SyncEvent::wait_all(&events)?;
    ctx.diagnostics().record_reduction();
    Ok(slots.iter().map(|s| *s.lock()).sum())
}

/// Σ conj(a)·b over the owned sites of two parts.
pub(crate) fn partial_dot(a: &PartData, b: &PartData) -> Complex64 {
    let av: Vec<Complex64> = a.owned_elements().collect();
    let bv: Vec<Complex64> = b.owned_elements().collect();
    av.par_iter()
        .zip(bv.par_iter())
        .map(|(x, y)| x.conj_mul(*y))
        .sum()
}
