// SPDX-License-Identifier: AGPL-3.0-only

//! Explicit simulation context: device set, partition, RNG stream and
//! diagnostic counters.
//!
//! Every [`LatticeField`](crate::lattice::field::LatticeField) holds an
//! `Arc<SimulationContext>`; operators and solvers reach the device set
//! through the fields they are given, so no process-global state exists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::RunConfig;
use crate::device::{Device, Layout};
use crate::error::{LatticeError, Result};
use crate::lattice::constants::{lcg_gaussian, lcg_step, lcg_uniform_f64};
use crate::lattice::geometry::LatticeGeometry;
use crate::lattice::partition::Partition;

/// Seeded stream of random deviates shared by everything in one context.
#[derive(Clone, Debug)]
pub struct RngStream {
    state: u64,
}

impl RngStream {
    /// Stream starting from `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let mut state = seed;
        lcg_step(&mut state);
        Self { state }
    }

    /// Uniform deviate in [0, 1).
    pub fn uniform(&mut self) -> f64 {
        lcg_uniform_f64(&mut self.state)
    }

    /// Standard normal deviate.
    pub fn gaussian(&mut self) -> f64 {
        lcg_gaussian(&mut self.state)
    }

    /// Raw state, for seeding per-site generators.
    pub(crate) fn state_mut(&mut self) -> &mut u64 {
        &mut self.state
    }
}

/// Monotone counters of the work done in one context.
#[derive(Debug, Default)]
pub struct Diagnostics {
    operator_applications: AtomicU64,
    halo_exchanges: AtomicU64,
    halo_bytes: AtomicU64,
    reductions: AtomicU64,
    solver_iterations: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Stencil applications (one per operator block evaluated).
    pub operator_applications: u64,
    /// Completed halo exchanges with more than one device.
    pub halo_exchanges: u64,
    /// Bytes moved between devices by halo exchanges.
    pub halo_bytes: u64,
    /// Global (cross-device) reductions.
    pub reductions: u64,
    /// Krylov and power-method iterations.
    pub solver_iterations: u64,
}

impl Diagnostics {
    pub(crate) fn record_operator(&self) {
        self.operator_applications.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_halo(&self, bytes: usize) {
        self.halo_exchanges.fetch_add(1, Ordering::Relaxed);
        self.halo_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_reduction(&self) {
        self.reductions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_iterations(&self, n: usize) {
        self.solver_iterations.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            operator_applications: self.operator_applications.load(Ordering::Relaxed),
            halo_exchanges: self.halo_exchanges.load(Ordering::Relaxed),
            halo_bytes: self.halo_bytes.load(Ordering::Relaxed),
            reductions: self.reductions.load(Ordering::Relaxed),
            solver_iterations: self.solver_iterations.load(Ordering::Relaxed),
        }
    }
}

/// Device set, partition, RNG stream and diagnostics of one run.
#[derive(Debug)]
pub struct SimulationContext {
    devices: Vec<Device>,
    partition: Partition,
    rng: Mutex<RngStream>,
    diagnostics: Diagnostics,
}

impl SimulationContext {
    /// Context splitting `geometry` over `devices`.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidGeometry`] if there are no devices or more
    /// devices than timeslices.
    pub fn new(devices: Vec<Device>, geometry: LatticeGeometry, seed: u64) -> Result<Arc<Self>> {
        let partition = Partition::new(geometry, devices.len())?;
        tracing::info!(
            dims = ?geometry.dims(),
            devices = devices.len(),
            halo = partition.halo_width(),
            seed,
            "simulation context"
        );
        Ok(Arc::new(Self {
            devices,
            partition,
            rng: Mutex::new(RngStream::new(seed)),
            diagnostics: Diagnostics::default(),
        }))
    }

    /// Open the configured devices and build the context.
    ///
    /// # Errors
    ///
    /// Configuration, geometry or device bring-up failure.
    pub fn from_config(config: &RunConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let geometry = config.geometry()?;
        Self::new(config.open_devices()?, geometry, config.seed)
    }

    /// Active devices, in partition order.
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Timeslice split over the devices.
    #[must_use]
    pub const fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Global lattice geometry.
    #[must_use]
    pub const fn geometry(&self) -> &LatticeGeometry {
        self.partition.geometry()
    }

    /// Work counters.
    #[must_use]
    pub const fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Run `f` with exclusive access to the RNG stream.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut RngStream) -> T) -> T {
        f(&mut self.rng.lock())
    }

    /// Element layout shared by every device.
    ///
    /// # Errors
    ///
    /// [`LatticeError::LayoutMismatch`] if the devices prefer different
    /// layouts.
    pub fn common_layout(&self) -> Result<Layout> {
        let first = self
            .devices
            .first()
            .map_or(Layout::Aos, Device::preferred_layout);
        match self.devices.iter().find(|d| d.preferred_layout() != first) {
            None => Ok(first),
            Some(other) => Err(LatticeError::LayoutMismatch(format!(
                "device {} prefers {first}, device {} prefers {}",
                self.devices[0].id(),
                other.id(),
                other.preferred_layout()
            ))),
        }
    }

    /// Whether `other` is this very context.
    #[must_use]
    pub fn is_same(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        Arc::ptr_eq(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCaps;

    fn geometry() -> LatticeGeometry {
        LatticeGeometry::new([2, 2, 2, 4]).expect("geometry")
    }

    #[test]
    fn rng_stream_is_reproducible() {
        let mut a = RngStream::new(5);
        let mut b = RngStream::new(5);
        let xs: Vec<f64> = (0..5).map(|_| a.gaussian()).collect();
        let ys: Vec<f64> = (0..5).map(|_| b.gaussian()).collect();
        assert_eq!(xs, ys);
        assert_ne!(RngStream::new(6).uniform(), RngStream::new(5).uniform());
    }

    #[test]
    fn rejects_more_devices_than_slices() {
        let devices = Device::host_set(5, &DeviceCaps::default()).expect("devices");
        let err = SimulationContext::new(devices, geometry(), 1).expect_err("too many");
        assert!(matches!(err, LatticeError::InvalidGeometry(_)));
    }

    #[test]
    fn mixed_layouts_reported() {
        let soa = DeviceCaps {
            preferred_layout: Layout::Soa,
            ..DeviceCaps::default()
        };
        let devices = vec![
            Device::host(0, DeviceCaps::default()).expect("aos"),
            Device::host(1, soa).expect("soa"),
        ];
        let ctx = SimulationContext::new(devices, geometry(), 1).expect("context");
        let err = ctx.common_layout().expect_err("mixed");
        assert!(matches!(err, LatticeError::LayoutMismatch(_)));
    }

    #[test]
    fn diagnostics_accumulate() {
        let d = Diagnostics::default();
        d.record_halo(128);
        d.record_halo(64);
        d.record_iterations(7);
        d.record_reduction();
        let s = d.snapshot();
        assert_eq!(s.halo_exchanges, 2);
        assert_eq!(s.halo_bytes, 192);
        assert_eq!(s.solver_iterations, 7);
        assert_eq!(s.reductions, 1);
        assert_eq!(s.operator_applications, 0);
    }
}
