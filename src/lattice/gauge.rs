// SPDX-License-Identifier: AGPL-3.0-only

//! Gauge background: four SU(3) links per site, distributed like any other
//! field. Ghost slices are filled by a halo exchange at upload, so stencils
//! can read `U_μ(x − μ̂)` across a partition boundary.

use std::sync::Arc;

use super::complex::Complex64;
use super::constants::{HOT_START_EPSILON, N_DIM};
use super::field::{LatticeField, Species};
use super::su3::Su3Matrix;
use crate::context::SimulationContext;
use crate::device::Layout;
use crate::error::{LatticeError, Result};

/// Links `U_μ(x)`, host index `site · 4 + μ`.
#[derive(Debug)]
pub struct GaugeField {
    field: LatticeField,
}

impl GaugeField {
    /// Every link the identity.
    ///
    /// # Errors
    ///
    /// Allocation, layout or transfer failure.
    pub fn cold(ctx: &Arc<SimulationContext>) -> Result<Self> {
        let links = vec![Su3Matrix::IDENTITY; ctx.geometry().volume() * N_DIM];
        Self::from_links(ctx, &links)
    }

    /// Random links near the identity drawn from the context RNG stream.
    ///
    /// # Errors
    ///
    /// Allocation, layout or transfer failure.
    pub fn hot(ctx: &Arc<SimulationContext>) -> Result<Self> {
        Self::random(ctx, HOT_START_EPSILON)
    }

    /// Random links `exp(iεH)` with Gaussian traceless hermitian `H`.
    ///
    /// # Errors
    ///
    /// Allocation, layout or transfer failure.
    pub fn random(ctx: &Arc<SimulationContext>, epsilon: f64) -> Result<Self> {
        let n = ctx.geometry().volume() * N_DIM;
        let links: Vec<Su3Matrix> = ctx.with_rng(|rng| {
            (0..n)
                .map(|_| Su3Matrix::random_near_identity(rng.state_mut(), epsilon))
                .collect()
        });
        Self::from_links(ctx, &links)
    }

    /// Upload host links and fill the ghost slices.
    ///
    /// # Errors
    ///
    /// [`LatticeError::SizeMismatch`] if `links` is not `4 · volume` long.
    pub fn from_links(ctx: &Arc<SimulationContext>, links: &[Su3Matrix]) -> Result<Self> {
        let expected = ctx.geometry().volume() * N_DIM;
        if links.len() != expected {
            return Err(LatticeError::SizeMismatch {
                source_bytes: std::mem::size_of_val(links),
                dest_bytes: expected * std::mem::size_of::<Su3Matrix>(),
            });
        }
        let data: &[Complex64] = bytemuck::cast_slice(links);
        let field = LatticeField::from_host(ctx, Species::GaugeLinks, None, data)?;
        field.update_halo()?;
        tracing::debug!(links = links.len(), layout = %field.layout(), "gauge field uploaded");
        Ok(Self { field })
    }

    /// Links back on the host.
    ///
    /// # Errors
    ///
    /// Transfer failure.
    pub fn to_links(&self) -> Result<Vec<Su3Matrix>> {
        let data = self.field.to_host()?;
        Ok(bytemuck::cast_slice(&data).to_vec())
    }

    /// Underlying distributed field.
    #[must_use]
    pub const fn as_field(&self) -> &LatticeField {
        &self.field
    }

    /// Element layout of the link buffers.
    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.field.layout()
    }

    /// Owning context.
    #[must_use]
    pub fn context(&self) -> &Arc<SimulationContext> {
        self.field.context()
    }

    /// Average real trace of all links divided by 3 (1 for a cold start).
    ///
    /// # Errors
    ///
    /// Transfer failure.
    pub fn mean_link_trace(&self) -> Result<f64> {
        let links = self.to_links()?;
        let sum: f64 = links
            .iter()
            .map(|u| (u.m[0][0] + u.m[1][1] + u.m[2][2]).re)
            .sum();
        Ok(sum / (3.0 * links.len() as f64))
    }
}
