// SPDX-License-Identifier: AGPL-3.0-only

//! lattice-offload: distributed lattice fields and Krylov solvers
//!
//! Lattice QCD fields split along the time axis over one or more compute
//! devices, with ghost-slice halo exchange, staggered and Wilson-family
//! fermion matrices, CG / BiCGStab / even-odd preconditioned inversion and
//! power-method spectral bounds.
//!
//! ## Active modules
//!   - `device` — per-device in-order queues, sync events, memory backends
//!   - `buffer` — RAII device buffers, async transfers, cross-device copies
//!   - `context` — device set, partition, RNG stream, diagnostics counters
//!   - `lattice` — geometry, partition, fields, gauge links, halo exchange
//!   - `operator` — `LinearOperator` trait and the fermion matrices
//!   - `solver` — CG, BiCGStab, even-odd inversion, power method
//!   - `config` — JSON run configuration with env overrides
//!   - `tolerances` — numerical guards and validation thresholds
//!   - `validation` — pass/fail harness for the validation binary
//!
//! ## Validation binary
//!   - `validate_halo_solver` — halo parity across device counts, solver
//!     residuals, even-odd vs direct solutions, eigenvalue bounds

pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod lattice;
pub mod operator;
pub mod solver;
pub mod tolerances;
pub mod validation;

pub use buffer::{Buffer, Region};
pub use config::RunConfig;
pub use context::{DiagnosticsSnapshot, SimulationContext};
pub use device::{Device, DeviceCaps, Layout, SyncEvent};
pub use error::{LatticeError, Result};
pub use lattice::{GaugeField, LatticeField, LatticeGeometry, Parity, Species};
pub use operator::{FermionOperator, LinearOperator};
pub use solver::{KrylovSolver, SolverConfig, SolverMethod};
