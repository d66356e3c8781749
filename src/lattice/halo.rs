// SPDX-License-Identifier: AGPL-3.0-only

//! Halo exchange between t-adjacent devices.
//!
//! Device `d` owns slices `[t0, t0 + len)`. Its last owned slice is the
//! lower ghost of device `d + 1`, its first owned slice the upper ghost of
//! device `d − 1` (both periodic in the device index). Each transfer is a
//! gather on the source queue into a staging area sized to one slice,
//! followed by a scatter on the destination queue that depends on the
//! gather's event. SOA buffers move one region per component, AOS buffers a
//! single contiguous region.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use super::field::LatticeField;
use super::partition::Partition;
use crate::buffer::Staging;
use crate::device::SyncEvent;
use crate::error::{LatticeError, Result};
use crate::lattice::geometry::Parity;

/// One boundary slice moving from an owned slice to a neighbour's ghost.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HaloRegion {
    /// Sending device.
    pub from_device: usize,
    /// Receiving device.
    pub to_device: usize,
    /// Stored sites read on the sender.
    pub src_sites: Range<usize>,
    /// Stored sites written on the receiver.
    pub dst_sites: Range<usize>,
}

/// Every transfer of one exchange; empty for a single device.
#[must_use]
pub fn plan(partition: &Partition, parity: Option<Parity>) -> Vec<HaloRegion> {
    let n = partition.devices();
    if partition.halo_width() == 0 {
        return Vec::new();
    }
    let mut regions = Vec::with_capacity(2 * n);
    for d in 0..n {
        let v = partition.local_volume(d, parity);
        let sps = v.sites_per_slice;
        let owned = v.owned_slices();
        let next = (d + 1) % n;
        let prev = (d + n - 1) % n;

        let last = owned.end - 1;
        regions.push(HaloRegion {
            from_device: d,
            to_device: next,
            src_sites: last * sps..(last + 1) * sps,
            dst_sites: 0..sps,
        });

        let first = owned.start;
        let upper = partition.local_volume(prev, parity).storage_slices() - 1;
        regions.push(HaloRegion {
            from_device: d,
            to_device: prev,
            src_sites: first * sps..(first + 1) * sps,
            dst_sites: upper * sps..(upper + 1) * sps,
        });
    }
    regions
}

impl LatticeField {
    /// Queue the exchange of every boundary slice and return the transfer
    /// events without waiting.
    ///
    /// # Errors
    ///
    /// [`LatticeError::LayoutMismatch`] if two buffers of the field use
    /// different layouts.
    pub fn update_halo_async(&self) -> Result<Vec<SyncEvent>> {
        let ctx = self.context();
        let regions = plan(ctx.partition(), self.parity());
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        let parts = self.parts();
        let mut events = Vec::with_capacity(regions.len());
        let mut moved = 0;
        for r in &regions {
            let src = &parts[r.from_device];
            let dst = &parts[r.to_device];
            if src.sites.layout != dst.sites.layout {
                return Err(LatticeError::LayoutMismatch(format!(
                    "halo from device {} ({}) to device {} ({})",
                    r.from_device, src.sites.layout, r.to_device, dst.sites.layout
                )));
            }
            let src_regions = src.sites.byte_regions(r.src_sites.clone());
            let dst_regions = dst.sites.byte_regions(r.dst_sites.clone());
            let bytes: usize = src_regions.iter().map(|g| g.len).sum();
            let staging: Staging = Arc::new(Mutex::new(vec![0u8; bytes]));
            let gathered = src
                .buffer
                .dump_regions_into(&src_regions, Arc::clone(&staging), &[])?;
            events.push(dst.buffer.load_regions_from(&dst_regions, staging, &[gathered])?);
            moved += bytes;
        }
        ctx.diagnostics().record_halo(moved);
        tracing::trace!(
            species = %self.species(),
            parity = ?self.parity(),
            transfers = regions.len(),
            bytes = moved,
            "halo exchange"
        );
        Ok(events)
    }

    /// Exchange boundary slices and wait for every transfer.
    ///
    /// # Errors
    ///
    /// Layout mismatch or a failed transfer.
    pub fn update_halo(&self) -> Result<()> {
        SyncEvent::wait_all(&self.update_halo_async()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::geometry::LatticeGeometry;

    #[test]
    fn single_device_plan_is_empty() {
        let g = LatticeGeometry::new([2, 2, 2, 4]).expect("geometry");
        let p = Partition::new(g, 1).expect("partition");
        assert!(plan(&p, None).is_empty());
    }

    #[test]
    fn ring_of_three_devices() {
        let g = LatticeGeometry::new([2, 2, 2, 6]).expect("geometry");
        let p = Partition::new(g, 3).expect("partition");
        let regions = plan(&p, Some(Parity::Even));
        assert_eq!(regions.len(), 6);
        // Device 2 owns slices 4..6 in storage slots 1..=2; its last slice
        // wraps to the lower ghost of device 0.
        assert_eq!(
            regions[4],
            HaloRegion {
                from_device: 2,
                to_device: 0,
                src_sites: 8..12,
                dst_sites: 0..4,
            }
        );
        // Device 0's first slice becomes the upper ghost (slot 3) of device 2.
        assert_eq!(
            regions[1],
            HaloRegion {
                from_device: 0,
                to_device: 2,
                src_sites: 4..8,
                dst_sites: 12..16,
            }
        );
    }
}
