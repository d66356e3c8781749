// SPDX-License-Identifier: AGPL-3.0-only

//! Halo exchange and solver validation
//!
//! Checks, on the configured lattice and device backend:
//!   - operator output is identical for 1, 2 and 4 devices (halo parity)
//!   - CG on the staggered normal equations and BiCGStab on Wilson and
//!     twisted mass reach the requested residual
//!   - even-odd preconditioned inversion agrees with the direct solve
//!   - power-method bounds of M†M lie inside [m², m² + 16]
//!
//! Usage: `validate_halo_solver [config.json]`. `LATTICE_DEVICE_COUNT`
//! overrides the device count of the solver runs; `RUST_LOG` sets the
//! log filter.
//!
//! Exit code 0 = all checks pass, exit code 1 = any check fails.

use std::sync::Arc;

use lattice_offload::config::RunConfig;
use lattice_offload::context::SimulationContext;
use lattice_offload::lattice::{Complex64, GaugeField, LatticeField, Parity, Species};
use lattice_offload::operator::{FermionOperator, LinearOperator};
use lattice_offload::solver::{self, eigen, invert_even_odd, SolverConfig, SolverMethod};
use lattice_offload::tolerances::{
    EO_VS_DIRECT_SOLUTION_ABS, HALO_PARITY_ABS, POWER_METHOD_BOUND_REL, SOLUTION_RESIDUAL_FACTOR,
};
use lattice_offload::validation::ValidationHarness;
use lattice_offload::Result;
use tracing_subscriber::EnvFilter;

const STAGGERED_MASS: f64 = 0.1;
const KAPPA: f64 = 0.12;
const TWIST_MU: f64 = 0.05;
const LINK_EPSILON: f64 = 0.5;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Multi-device halo exchange + Krylov solver validation      ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let mut harness = ValidationHarness::new("halo_solver");

    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            println!("configuration: {e}");
            harness.check_bool("configuration loads", false);
            harness.finish();
        }
    };
    println!(
        "lattice {:?}, {} {:?} device(s), seed {}",
        config.lattice.dims, config.devices.count, config.devices.backend, config.seed
    );
    println!();

    run(&mut harness, "halo parity", |h| check_halo_parity(h, &config));

    let ctx = match SimulationContext::from_config(&config) {
        Ok(ctx) => ctx,
        Err(e) => {
            println!("context: {e}");
            harness.check_bool("context opens", false);
            harness.finish();
        }
    };
    run(&mut harness, "solvers", |h| check_solvers(h, &ctx, &config.solver));
    run(&mut harness, "even-odd", |h| check_even_odd(h, &ctx, &config.solver));
    run(&mut harness, "eigenvalue bounds", |h| check_eigen_bounds(h, &ctx, &config));

    if let Ok(json) = serde_json::to_string(&ctx.diagnostics().snapshot()) {
        println!();
        println!("diagnostics: {json}");
    }
    println!();
    harness.finish();
}

fn load_config() -> Result<RunConfig> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => RunConfig::from_path(path)?,
        None => RunConfig::default(),
    };
    cfg.with_env_overrides()
}

fn run(
    harness: &mut ValidationHarness,
    section: &str,
    f: impl FnOnce(&mut ValidationHarness) -> Result<()>,
) {
    if let Err(e) = f(harness) {
        println!("  {section} aborted: {e}");
        harness.check_bool(&format!("{section} completes"), false);
    }
    println!();
}

fn max_abs_diff(a: &[Complex64], b: &[Complex64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (*x - *y).abs())
        .fold(0.0, f64::max)
}

/// Apply every base operator once on a context with `devices` devices.
fn operator_outputs(config: &RunConfig, devices: usize) -> Result<Vec<Vec<Complex64>>> {
    let mut cfg = config.clone();
    cfg.devices.count = devices;
    let ctx = SimulationContext::from_config(&cfg)?;
    let gauge = GaugeField::random(&ctx, LINK_EPSILON)?;
    let ops = [
        (FermionOperator::Staggered { mass: STAGGERED_MASS }, Species::ColorVector),
        (FermionOperator::Wilson { kappa: KAPPA }, Species::DiracSpinor),
        (FermionOperator::TwistedMass { kappa: KAPPA, mu: TWIST_MU }, Species::DiracSpinor),
    ];
    let mut outputs = Vec::with_capacity(ops.len());
    for (op, species) in ops {
        let mut psi = LatticeField::new(&ctx, species, None)?;
        psi.fill_gaussian()?;
        let mut out = psi.like()?;
        op.apply(&mut out, &gauge, &psi)?;
        outputs.push(out.to_host()?);
    }
    Ok(outputs)
}

/// \[1\] The same seed on 1, 2 and 4 devices gives bit-identical output.
fn check_halo_parity(harness: &mut ValidationHarness, config: &RunConfig) -> Result<()> {
    println!("[1] Halo parity across device counts");
    let nt = config.lattice.dims[3];
    let reference = operator_outputs(config, 1)?;
    for devices in [2, 4].into_iter().filter(|&n| n <= nt) {
        let outputs = operator_outputs(config, devices)?;
        for (name, (a, b)) in ["staggered", "wilson", "twisted mass"]
            .iter()
            .zip(reference.iter().zip(&outputs))
        {
            let diff = max_abs_diff(a, b);
            println!("  {name:>13} on {devices} devices: max |Δ| = {diff:.3e}");
            harness.check_abs(&format!("{name} 1 vs {devices} devices"), diff, 0.0, HALO_PARITY_ABS);
        }
    }
    Ok(())
}

fn residual_norm(op: &dyn LinearOperator, gauge: &GaugeField, x: &LatticeField, b: &LatticeField) -> Result<f64> {
    let mut r = b.like()?;
    op.apply(&mut r, gauge, x)?;
    r.xpay(b, Complex64::real(-1.0))?;
    r.norm()
}

/// \[2\] CG and BiCGStab reach the configured precision.
fn check_solvers(harness: &mut ValidationHarness, ctx: &Arc<SimulationContext>, cfg: &SolverConfig) -> Result<()> {
    println!("[2] Krylov solvers");
    let gauge = GaugeField::random(ctx, LINK_EPSILON)?;
    let bound = SOLUTION_RESIDUAL_FACTOR * cfg.precision;

    let normal = FermionOperator::normal(FermionOperator::Staggered { mass: STAGGERED_MASS });
    let mut b = LatticeField::new(ctx, Species::ColorVector, None)?;
    b.fill_gaussian()?;
    let mut x = b.like()?;
    let iters = solver::solve(&SolverConfig { method: SolverMethod::Cg, ..cfg.clone() }, &normal, &mut x, &b, &gauge)?;
    let res = residual_norm(&normal, &gauge, &x, &b)?;
    println!("  CG on {normal}: {iters} iterations, ‖r‖ = {res:.3e}");
    harness.check_upper("CG staggered M†M residual", res, bound);

    for op in [
        FermionOperator::Wilson { kappa: KAPPA },
        FermionOperator::TwistedMass { kappa: KAPPA, mu: TWIST_MU },
    ] {
        let mut b = LatticeField::new(ctx, Species::DiracSpinor, None)?;
        b.fill_gaussian()?;
        let mut x = b.like()?;
        let iters = solver::solve(cfg, &op, &mut x, &b, &gauge)?;
        let res = residual_norm(&op, &gauge, &x, &b)?;
        println!("  BiCGStab on {op}: {iters} iterations, ‖r‖ = {res:.3e}");
        harness.check_upper(&format!("BiCGStab {op} residual"), res, bound);
    }
    Ok(())
}

/// \[3\] Schur-complement inversion matches the unpreconditioned solve.
fn check_even_odd(harness: &mut ValidationHarness, ctx: &Arc<SimulationContext>, cfg: &SolverConfig) -> Result<()> {
    println!("[3] Even-odd preconditioning vs direct solve");
    let gauge = GaugeField::random(ctx, LINK_EPSILON)?;
    let tight = SolverConfig {
        precision: cfg.precision.min(1e-10),
        ..cfg.clone()
    };
    for (base, species) in [
        (FermionOperator::Staggered { mass: STAGGERED_MASS }, Species::ColorVector),
        (FermionOperator::Wilson { kappa: KAPPA }, Species::DiracSpinor),
        (FermionOperator::TwistedMass { kappa: KAPPA, mu: TWIST_MU }, Species::DiracSpinor),
    ] {
        let mut b = LatticeField::new(ctx, species, None)?;
        b.fill_gaussian()?;
        let mut direct = b.like()?;
        let direct_config = SolverConfig {
            method: SolverMethod::BiCgStab,
            ..tight.clone()
        };
        solver::solve(&direct_config, &base, &mut direct, &b, &gauge)?;
        for parity in [Parity::Even, Parity::Odd] {
            let mut eo = b.like()?;
            let iters = invert_even_odd(&base, &gauge, &mut eo, &b, parity, &tight)?;
            let diff = max_abs_diff(&eo.to_host()?, &direct.to_host()?);
            println!("  {base} on {parity} sites: {iters} iterations, max |Δx| = {diff:.3e}");
            harness.check_abs(&format!("{base} eo({parity}) vs direct"), diff, 0.0, EO_VS_DIRECT_SOLUTION_ABS);
        }
    }
    Ok(())
}

/// \[4\] m² ≤ λ(M†M) ≤ m² + 16 for the staggered operator.
fn check_eigen_bounds(harness: &mut ValidationHarness, ctx: &Arc<SimulationContext>, config: &RunConfig) -> Result<()> {
    println!("[4] Power-method spectral bounds");
    let gauge = GaugeField::random(ctx, LINK_EPSILON)?;
    let normal = FermionOperator::normal(FermionOperator::Staggered { mass: STAGGERED_MASS });
    let space = LatticeField::new(ctx, Species::ColorVector, None)?;
    let m2 = STAGGERED_MASS * STAGGERED_MASS;

    let max = eigen::find_max_eigenvalue(&normal, &gauge, &space, &config.eigen)?;
    let min = eigen::find_min_eigenvalue(&normal, &gauge, &space, &config.eigen)?;
    println!("  λ_max = {max:.6}, λ_min = {min:.6}, m² = {m2:.6}");
    harness.check_upper("λ_max ≤ m² + 16", max, (m2 + 16.0) * (1.0 + POWER_METHOD_BOUND_REL));
    harness.check_lower("λ_min ≥ m²", min, m2 * (1.0 - POWER_METHOD_BOUND_REL) - config.eigen.precision * max);
    harness.check_bool("λ_min ≤ λ_max", min <= max);

    let conservative = eigen::PowerMethodConfig {
        conservative: true,
        ..config.eigen.clone()
    };
    let lower = eigen::find_min_eigenvalue(&normal, &gauge, &space, &conservative)?;
    harness.check_abs("conservative lower bound = m²", lower, m2, 0.0);
    Ok(())
}
