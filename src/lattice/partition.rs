// SPDX-License-Identifier: AGPL-3.0-only

//! Partitioning of the lattice along t and per-device storage layout.
//!
//! Each device owns a contiguous range of timeslices. With more than one
//! device its buffer also carries one ghost slice below and one above the
//! owned range (the stencil radius is 1):
//!
//! ```text
//!   storage slice:  0        1 ..= len        len + 1
//!                   ghost    owned slices     ghost
//!                   (t0-1)   (t0 ..)          (t0+len)
//! ```
//!
//! With a single device no ghosts are allocated and t-neighbours wrap
//! inside the device.

use std::ops::Range;

use super::geometry::{LatticeGeometry, Parity};
use crate::buffer::Region;
use crate::device::Layout;
use crate::error::{LatticeError, Result};

/// Bytes per complex component.
pub const COMPLEX_BYTES: usize = 16;

/// Split of the timeslices over `n` devices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    geometry: LatticeGeometry,
    slabs: Vec<Range<usize>>,
}

impl Partition {
    /// Partition `geometry` over `devices` devices; the first `nt % devices`
    /// get one extra timeslice.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidGeometry`] if `devices` is zero or exceeds the
    /// number of timeslices.
    pub fn new(geometry: LatticeGeometry, devices: usize) -> Result<Self> {
        let nt = geometry.nt();
        if devices == 0 || devices > nt {
            return Err(LatticeError::InvalidGeometry(format!(
                "cannot split {nt} timeslices over {devices} devices"
            )));
        }
        let base = nt / devices;
        let extra = nt % devices;
        let mut start = 0;
        let slabs = (0..devices)
            .map(|d| {
                let len = base + usize::from(d < extra);
                let slab = start..start + len;
                start += len;
                slab
            })
            .collect();
        Ok(Self { geometry, slabs })
    }

    /// Global geometry.
    #[must_use]
    pub const fn geometry(&self) -> &LatticeGeometry {
        &self.geometry
    }

    /// Number of devices.
    #[must_use]
    pub fn devices(&self) -> usize {
        self.slabs.len()
    }

    /// Ghost slices on each side (0 for one device, else 1).
    #[must_use]
    pub fn halo_width(&self) -> usize {
        usize::from(self.slabs.len() > 1)
    }

    /// Owned timeslices of `device`.
    #[must_use]
    pub fn slab(&self, device: usize) -> Range<usize> {
        self.slabs[device].clone()
    }

    /// Device owning timeslice `t`; `None` for `t >= nt`.
    #[must_use]
    pub fn owner(&self, t: usize) -> Option<usize> {
        self.slabs.iter().position(|s| s.contains(&t))
    }

    /// Local volume of `device` for a field of the given parity.
    #[must_use]
    pub fn local_volume(&self, device: usize, parity: Option<Parity>) -> LocalVolume {
        let slab = self.slab(device);
        let nxyz = self.geometry.spatial_volume();
        LocalVolume {
            t_start: slab.start,
            t_len: slab.len(),
            halo: self.halo_width(),
            nt: self.geometry.nt(),
            sites_per_slice: if parity.is_some() { nxyz / 2 } else { nxyz },
        }
    }
}

/// Timeslice window held by one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalVolume {
    /// First owned global timeslice.
    pub t_start: usize,
    /// Owned timeslices.
    pub t_len: usize,
    /// Ghost slices per side.
    pub halo: usize,
    /// Global number of timeslices.
    pub nt: usize,
    /// Stored sites per timeslice (halved for one-parity fields).
    pub sites_per_slice: usize,
}

impl LocalVolume {
    /// Timeslices in storage, ghosts included.
    #[must_use]
    pub const fn storage_slices(&self) -> usize {
        self.t_len + 2 * self.halo
    }

    /// Sites in storage, ghosts included.
    #[must_use]
    pub const fn storage_sites(&self) -> usize {
        self.storage_slices() * self.sites_per_slice
    }

    /// Owned sites.
    #[must_use]
    pub const fn owned_sites(&self) -> usize {
        self.t_len * self.sites_per_slice
    }

    /// Global timeslice held in storage slice `slot`, ghosts included.
    #[must_use]
    pub const fn slot_global_t(&self, slot: usize) -> usize {
        (self.t_start + self.nt + slot - self.halo) % self.nt
    }

    /// Storage slice holding the t-neighbour of the owned slice `slot`.
    #[must_use]
    pub const fn t_neighbor_slot(&self, slot: usize, forward: bool) -> usize {
        if self.halo == 0 {
            if forward {
                (slot + 1) % self.t_len
            } else {
                (slot + self.t_len - 1) % self.t_len
            }
        } else if forward {
            slot + 1
        } else {
            slot - 1
        }
    }

    /// Storage slices of the owned range.
    #[must_use]
    pub const fn owned_slices(&self) -> Range<usize> {
        self.halo..self.halo + self.t_len
    }
}

/// Memory map of one device buffer: which complex component of which
/// stored site lives at which offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SiteLayout {
    /// SOA or AOS.
    pub layout: Layout,
    /// Complex components per site.
    pub components: usize,
    /// Stored sites (ghosts included).
    pub sites: usize,
}

impl SiteLayout {
    /// Complex elements in the buffer.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.sites * self.components
    }

    /// Whether the buffer holds no elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer size in bytes.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.len() * COMPLEX_BYTES
    }

    /// Element index of component `c` at stored site `site`.
    #[inline]
    #[must_use]
    pub const fn index(&self, site: usize, c: usize) -> usize {
        match self.layout {
            Layout::Aos => site * self.components + c,
            Layout::Soa => c * self.sites + site,
        }
    }

    /// Element ranges covering `sites` (a contiguous run of stored sites):
    /// one range for AOS, one per component for SOA.
    #[must_use]
    pub fn element_ranges(&self, sites: Range<usize>) -> Vec<Range<usize>> {
        match self.layout {
            Layout::Aos => vec![sites.start * self.components..sites.end * self.components],
            Layout::Soa => (0..self.components)
                .map(|c| c * self.sites + sites.start..c * self.sites + sites.end)
                .collect(),
        }
    }

    /// Byte regions of a contiguous run of stored sites.
    #[must_use]
    pub fn byte_regions(&self, sites: Range<usize>) -> Vec<Region> {
        self.element_ranges(sites)
            .into_iter()
            .map(|r| Region::new(r.start * COMPLEX_BYTES, r.len() * COMPLEX_BYTES))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> LatticeGeometry {
        LatticeGeometry::new([2, 2, 2, 6]).expect("geometry")
    }

    #[test]
    fn uneven_split_front_loads_extra_slices() {
        let p = Partition::new(geometry(), 4).expect("partition");
        let lens: Vec<usize> = (0..4).map(|d| p.slab(d).len()).collect();
        assert_eq!(lens, vec![2, 2, 1, 1]);
        assert_eq!(p.slab(3), 5..6);
        assert_eq!(p.owner(4), Some(2));
        assert_eq!(p.owner(0), Some(0));
        assert_eq!(p.owner(5), Some(3));
        assert_eq!(p.halo_width(), 1);
    }

    #[test]
    fn timeslice_outside_lattice_has_no_owner() {
        let p = Partition::new(geometry(), 2).expect("partition");
        assert_eq!(p.owner(6), None);
        assert_eq!(p.owner(usize::MAX), None);
    }

    #[test]
    fn too_many_devices_rejected() {
        assert!(Partition::new(geometry(), 7).is_err());
        assert!(Partition::new(geometry(), 0).is_err());
    }

    #[test]
    fn single_device_has_no_ghosts_and_wraps() {
        let p = Partition::new(geometry(), 1).expect("partition");
        let v = p.local_volume(0, None);
        assert_eq!(v.halo, 0);
        assert_eq!(v.storage_slices(), 6);
        assert_eq!(v.t_neighbor_slot(0, false), 5);
        assert_eq!(v.t_neighbor_slot(5, true), 0);
    }

    #[test]
    fn two_devices_one_slice_each_use_distinct_ghosts() {
        let g = LatticeGeometry::new([2, 2, 2, 2]).expect("geometry");
        let p = Partition::new(g, 2).expect("partition");
        let v = p.local_volume(1, None);
        assert_eq!(v.storage_slices(), 3);
        assert_eq!(v.slot_global_t(0), 0);
        assert_eq!(v.slot_global_t(2), 0);
        assert_eq!(v.t_neighbor_slot(1, false), 0);
        assert_eq!(v.t_neighbor_slot(1, true), 2);
    }

    #[test]
    fn ghost_slices_map_to_periodic_neighbours() {
        let p = Partition::new(geometry(), 3).expect("partition");
        let v0 = p.local_volume(0, Some(Parity::Even));
        assert_eq!(v0.sites_per_slice, 4);
        assert_eq!(v0.slot_global_t(0), 5);
        assert_eq!(v0.slot_global_t(1), 0);
        assert_eq!(v0.slot_global_t(3), 2);
        assert_eq!(v0.t_neighbor_slot(1, false), 0);
        assert_eq!(v0.t_neighbor_slot(2, true), 3);
    }

    #[test]
    fn soa_regions_are_strided_aos_contiguous() {
        let aos = SiteLayout {
            layout: Layout::Aos,
            components: 3,
            sites: 10,
        };
        let soa = SiteLayout {
            layout: Layout::Soa,
            ..aos
        };
        assert_eq!(aos.byte_regions(2..4), vec![Region::new(6 * 16, 6 * 16)]);
        let regions = soa.byte_regions(2..4);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[1], Region::new(12 * 16, 2 * 16));
        assert_eq!(soa.index(2, 1), 12);
        assert_eq!(aos.index(2, 1), 7);
    }
}
