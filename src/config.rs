// SPDX-License-Identifier: AGPL-3.0-only

//! Run configuration: lattice extent, device set, solver and power-method
//! settings, RNG seed.
//!
//! Every field has a default, so a JSON document only needs the keys it
//! changes:
//!
//! ```json
//! { "lattice": { "dims": [8, 8, 8, 16] }, "devices": { "count": 4 } }
//! ```
//!
//! `LATTICE_DEVICE_COUNT` overrides `devices.count` after parsing.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceCaps};
use crate::error::{LatticeError, Result};
use crate::lattice::geometry::LatticeGeometry;
use crate::solver::eigen::PowerMethodConfig;
use crate::solver::SolverConfig;

/// Environment variable overriding the device count.
pub const DEVICE_COUNT_ENV: &str = "LATTICE_DEVICE_COUNT";

/// Memory backend behind each device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process memory, one worker thread per device.
    #[default]
    Host,
    /// wgpu buffers on the selected adapter (`gpu` feature).
    Wgpu,
}

/// Global lattice extent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeConfig {
    /// `[nx, ny, nz, nt]`.
    pub dims: [usize; 4],
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self { dims: [4, 4, 4, 8] }
    }
}

/// Device set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of devices the lattice is split over.
    pub count: usize,
    /// Backend of every device.
    pub backend: BackendKind,
    /// Capabilities shared by every device.
    pub caps: DeviceCaps,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            count: 1,
            backend: BackendKind::Host,
            caps: DeviceCaps::default(),
        }
    }
}

/// Complete run configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub lattice: LatticeConfig,
    pub devices: DeviceConfig,
    /// Krylov solver budget, precision and method choice.
    pub solver: SolverConfig,
    /// Power-method settings for eigenvalue bounds.
    pub eigen: PowerMethodConfig,
    /// Seed of the context RNG stream.
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lattice: LatticeConfig::default(),
            devices: DeviceConfig::default(),
            solver: SolverConfig::default(),
            eigen: PowerMethodConfig::default(),
            seed: 42,
        }
    }
}

impl RunConfig {
    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Config`] on malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| LatticeError::Config(format!("parse: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a JSON file.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Config`] if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LatticeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Config`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| LatticeError::Config(e.to_string()))
    }

    /// Apply `LATTICE_DEVICE_COUNT` if set.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Config`] if the variable is not a positive integer.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_device_count_override(std::env::var(DEVICE_COUNT_ENV).ok().as_deref())
    }

    fn with_device_count_override(mut self, value: Option<&str>) -> Result<Self> {
        if let Some(raw) = value {
            let count: usize = raw.trim().parse().map_err(|_| {
                LatticeError::Config(format!("{DEVICE_COUNT_ENV}={raw:?} is not a device count"))
            })?;
            tracing::debug!(count, "device count from environment");
            self.devices.count = count;
            self.validate()?;
        }
        Ok(self)
    }

    /// Check values a typed parse cannot reject.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.devices.count == 0 {
            return Err(LatticeError::Config("devices.count must be at least 1".into()));
        }
        if self.devices.count > self.lattice.dims[3] {
            return Err(LatticeError::Config(format!(
                "devices.count {} exceeds nt = {}",
                self.devices.count, self.lattice.dims[3]
            )));
        }
        if !(self.solver.precision > 0.0) || self.solver.max_iterations == 0 {
            return Err(LatticeError::Config(
                "solver.precision must be positive and solver.max_iterations non-zero".into(),
            ));
        }
        if !(self.eigen.precision > 0.0) || self.eigen.check_frequency == 0 {
            return Err(LatticeError::Config(
                "eigen.precision must be positive and eigen.check_frequency non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Lattice geometry.
    ///
    /// # Errors
    ///
    /// [`LatticeError::InvalidGeometry`] for zero or odd extents.
    pub fn geometry(&self) -> Result<LatticeGeometry> {
        LatticeGeometry::new(self.lattice.dims)
    }

    /// Bring up the configured device set.
    ///
    /// # Errors
    ///
    /// [`LatticeError::Config`] if the wgpu backend is requested without the
    /// `gpu` feature, or a backend error while opening devices.
    pub fn open_devices(&self) -> Result<Vec<Device>> {
        match self.devices.backend {
            BackendKind::Host => Device::host_set(self.devices.count, &self.devices.caps),
            #[cfg(feature = "gpu")]
            BackendKind::Wgpu => {
                crate::device::wgpu_backend::open_devices(self.devices.count, &self.devices.caps)
            }
            #[cfg(not(feature = "gpu"))]
            BackendKind::Wgpu => Err(LatticeError::Config(
                "backend \"wgpu\" requires the `gpu` feature".into(),
            )),
        }
    }
}
