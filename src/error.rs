// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for device memory, halo exchange and the Krylov solvers.
//!
//! Resource errors (`Range`, `SizeMismatch`, `LayoutMismatch`, `Allocation`)
//! indicate programmer or configuration mistakes and are never retried.
//! Convergence failures carry the solver, iteration and residual so the
//! caller can decide whether to relax precision or abort the trajectory.
//!
//! The enum is `Clone`: a failed queued job stores its error in the
//! completion event and every waiter receives the same value.

use std::fmt;

/// Which Krylov method produced a convergence failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SolverKind {
    /// Conjugate gradient (hermitian positive systems).
    Cg,
    /// Biconjugate gradient stabilized (general systems).
    BiCgStab,
    /// Power iteration for the spectral bound.
    PowerMethod,
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cg => write!(f, "cg"),
            Self::BiCgStab => write!(f, "bicgstab"),
            Self::PowerMethod => write!(f, "power method"),
        }
    }
}

/// Errors arising from device memory, field algebra, and solvers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LatticeError {
    /// A transfer touched bytes outside a buffer (or a host slice was too short).
    #[error("range error: {offset} + {count} bytes exceeds capacity {capacity}")]
    Range {
        /// First byte of the requested range.
        offset: usize,
        /// Length of the requested range.
        count: usize,
        /// Size of the buffer or host slice checked against.
        capacity: usize,
    },

    /// A whole-buffer copy between buffers of different byte size.
    #[error("size mismatch: source has {source_bytes} bytes, destination {dest_bytes}")]
    SizeMismatch {
        /// Source buffer size.
        source_bytes: usize,
        /// Destination buffer size.
        dest_bytes: usize,
    },

    /// Buffers of one field (or of an exchange) disagree on SOA/AOS layout.
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),

    /// The device could not provide the requested memory.
    #[error("allocation of {requested} bytes failed on device {device} ({available} available)")]
    Allocation {
        /// Device id.
        device: usize,
        /// Bytes requested.
        requested: usize,
        /// Bytes still free before the request.
        available: usize,
    },

    /// Failure in the execution layer, wrapped with the failing operation.
    #[error("device operation `{op}` failed: {message}")]
    Backend {
        /// Name of the failing operation.
        op: String,
        /// Underlying message.
        message: String,
    },

    /// The iteration budget ran out before the residual met the precision.
    #[error("{solver} did not solve within {iterations} iterations (residual {residual:.3e})")]
    SolverDidNotSolve {
        /// Method that ran.
        solver: SolverKind,
        /// Iterations attempted (the configured budget).
        iterations: usize,
        /// Residual at exit.
        residual: f64,
    },

    /// A reduction denominator degenerated; iterating further would be garbage.
    #[error("{solver} got stuck after {iteration} iterations (residual {residual:.3e})")]
    SolverStuck {
        /// Method that ran.
        solver: SolverKind,
        /// Iteration at which the breakdown was detected.
        iteration: usize,
        /// Residual at the breakdown.
        residual: f64,
    },

    /// Lattice dimensions incompatible with the requested partition or parity split.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// An argument violates an operation's precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Two fields in one operation differ in shape, species, parity or device set.
    #[error("incompatible fields: {0}")]
    IncompatibleFields(String),

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LatticeError {
    /// Wrap a backend failure with the name of the failing operation.
    pub fn backend(op: &str, message: impl fmt::Display) -> Self {
        Self::Backend {
            op: op.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether this is a convergence failure (as opposed to a resource error).
    #[must_use]
    pub const fn is_convergence_failure(&self) -> bool {
        matches!(
            self,
            Self::SolverDidNotSolve { .. } | Self::SolverStuck { .. }
        )
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, LatticeError>;
