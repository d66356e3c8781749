// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests: halo exchange and operator parity across device
//! counts.
//!
//! The same seed must give bit-identical operator output whether the
//! lattice lives on one device or is split over several, in either memory
//! layout. Adjoint relations are checked on the multi-device path.

use std::sync::Arc;

use lattice_offload::context::SimulationContext;
use lattice_offload::device::{Device, DeviceCaps, Layout};
use lattice_offload::lattice::{Complex64, GaugeField, LatticeField, LatticeGeometry, Parity, Species};
use lattice_offload::operator::{EoBlock, FermionOperator, LinearOperator};
use lattice_offload::tolerances::{GAMMA5_HERMITICITY_ABS, HALO_PARITY_ABS};
use lattice_offload::LatticeError;

const SEED: u64 = 1234;

fn context(dims: [usize; 4], devices: usize, layout: Layout) -> Arc<SimulationContext> {
    let caps = DeviceCaps {
        preferred_layout: layout,
        ..DeviceCaps::default()
    };
    let devices = Device::host_set(devices, &caps).expect("devices");
    let geometry = LatticeGeometry::new(dims).expect("geometry");
    SimulationContext::new(devices, geometry, SEED).expect("context")
}

fn max_abs_diff(a: &[Complex64], b: &[Complex64]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (*x - *y).abs()).fold(0.0, f64::max)
}

/// Gauge links and a source from the context stream, then `op` applied.
fn apply_once(ctx: &Arc<SimulationContext>, op: &FermionOperator, species: Species) -> Vec<Complex64> {
    let gauge = GaugeField::random(ctx, 0.8).expect("gauge");
    let mut psi = LatticeField::new(ctx, species, None).expect("psi");
    psi.fill_gaussian().expect("gaussian");
    let mut out = psi.like().expect("out");
    op.apply(&mut out, &gauge, &psi).expect("apply");
    out.to_host().expect("download")
}

fn base_operators() -> [(FermionOperator, Species); 3] {
    [
        (FermionOperator::Staggered { mass: 0.2 }, Species::ColorVector),
        (FermionOperator::Wilson { kappa: 0.13 }, Species::DiracSpinor),
        (FermionOperator::TwistedMass { kappa: 0.13, mu: 0.1 }, Species::DiracSpinor),
    ]
}

#[test]
fn operators_identical_on_one_two_and_four_devices() {
    let dims = [4, 2, 2, 8];
    for layout in [Layout::Aos, Layout::Soa] {
        for (op, species) in base_operators() {
            let reference = apply_once(&context(dims, 1, layout), &op, species);
            for devices in [2, 4] {
                let split = apply_once(&context(dims, devices, layout), &op, species);
                let diff = max_abs_diff(&reference, &split);
                assert!(
                    diff <= HALO_PARITY_ABS,
                    "{op} {layout} on {devices} devices differs by {diff:e}"
                );
            }
        }
    }
}

#[test]
fn aos_and_soa_agree() {
    let dims = [2, 2, 4, 4];
    for (op, species) in base_operators() {
        let aos = apply_once(&context(dims, 2, Layout::Aos), &op, species);
        let soa = apply_once(&context(dims, 2, Layout::Soa), &op, species);
        assert!(max_abs_diff(&aos, &soa) <= HALO_PARITY_ABS, "{op}");
    }
}

#[test]
fn uneven_split_matches_single_device() {
    let dims = [2, 2, 2, 6];
    let op = FermionOperator::Wilson { kappa: 0.11 };
    let reference = apply_once(&context(dims, 1, Layout::Aos), &op, Species::DiracSpinor);
    let split = apply_once(&context(dims, 4, Layout::Aos), &op, Species::DiracSpinor);
    assert!(max_abs_diff(&reference, &split) <= HALO_PARITY_ABS);
}

#[test]
fn ghost_slices_hold_neighbour_timeslices() {
    let ctx = context([2, 2, 2, 4], 2, Layout::Aos);
    let geometry = *ctx.geometry();
    let nxyz = geometry.spatial_volume();
    let host: Vec<Complex64> = (0..geometry.volume() * 3)
        .map(|i| Complex64::new(i as f64, -(i as f64)))
        .collect();
    let field = LatticeField::from_host(&ctx, Species::ColorVector, None, &host).expect("upload");

    let first: Vec<Complex64> = field.buffers().next().expect("part 0").dump_vec().expect("dump");
    assert!(first[..nxyz * 3].iter().all(|z| *z == Complex64::ZERO));

    field.update_halo().expect("exchange");
    let parts: Vec<Vec<Complex64>> = field
        .buffers()
        .map(|b| b.dump_vec().expect("dump"))
        .collect();
    let slice = |t: usize| &host[t * nxyz * 3..(t + 1) * nxyz * 3];
    let stored = |part: &[Complex64], slot: usize| part[slot * nxyz * 3..(slot + 1) * nxyz * 3].to_vec();

    // Device 0 owns t = 0, 1; device 1 owns t = 2, 3.
    assert_eq!(stored(&parts[0], 0), slice(3));
    assert_eq!(stored(&parts[0], 3), slice(2));
    assert_eq!(stored(&parts[1], 0), slice(1));
    assert_eq!(stored(&parts[1], 3), slice(0));

    let snap = ctx.diagnostics().snapshot();
    assert_eq!(snap.halo_exchanges, 1);
    assert_eq!(snap.halo_bytes, (4 * nxyz * 3 * 16) as u64);
}

#[test]
fn single_device_exchange_moves_nothing() {
    let ctx = context([2, 2, 2, 4], 1, Layout::Soa);
    let mut field = LatticeField::new(&ctx, Species::DiracSpinor, None).expect("field");
    field.fill_gaussian().expect("gaussian");
    assert!(field.update_halo_async().expect("plan").is_empty());
    assert_eq!(ctx.diagnostics().snapshot().halo_bytes, 0);
}

#[test]
fn mixed_layout_preferences_are_rejected() {
    let devices = vec![
        Device::host(0, DeviceCaps::default()).expect("aos"),
        Device::host(
            1,
            DeviceCaps {
                preferred_layout: Layout::Soa,
                ..DeviceCaps::default()
            },
        )
        .expect("soa"),
    ];
    let geometry = LatticeGeometry::new([2, 2, 2, 4]).expect("geometry");
    let ctx = SimulationContext::new(devices, geometry, SEED).expect("context");
    let err = LatticeField::new(&ctx, Species::ColorVector, None).expect_err("mixed layouts");
    assert!(matches!(err, LatticeError::LayoutMismatch(_)));
}

#[test]
fn even_odd_hopping_identical_across_device_counts() {
    let dims = [2, 2, 4, 6];
    let op = FermionOperator::even_odd(
        FermionOperator::Staggered { mass: 0.3 },
        EoBlock::Hopping { from: Parity::Even },
    )
    .expect("eo block");
    let run = |devices: usize| {
        let ctx = context(dims, devices, Layout::Aos);
        let gauge = GaugeField::random(&ctx, 0.8).expect("gauge");
        let mut even = LatticeField::new(&ctx, Species::ColorVector, Some(Parity::Even)).expect("even");
        even.fill_gaussian().expect("gaussian");
        let mut odd = LatticeField::new(&ctx, Species::ColorVector, Some(Parity::Odd)).expect("odd");
        op.apply(&mut odd, &gauge, &even).expect("hop");
        odd.to_host().expect("download")
    };
    let reference = run(1);
    for devices in [2, 3] {
        assert!(max_abs_diff(&reference, &run(devices)) <= HALO_PARITY_ABS);
    }
}

/// ⟨φ, Mψ⟩ against ⟨M†φ, ψ⟩.
fn adjoint_defect(ctx: &Arc<SimulationContext>, op: &FermionOperator, species: Species) -> f64 {
    let gauge = GaugeField::random(ctx, 0.8).expect("gauge");
    let mut phi = LatticeField::new(ctx, species, None).expect("phi");
    let mut psi = phi.like().expect("psi");
    phi.fill_gaussian().expect("phi");
    psi.fill_gaussian().expect("psi");
    let mut m_psi = psi.like().expect("m psi");
    let mut mdag_phi = phi.like().expect("mdag phi");
    op.apply(&mut m_psi, &gauge, &psi).expect("apply");
    op.apply_dagger(&mut mdag_phi, &gauge, &phi).expect("dagger");
    let lhs = phi.dot(&m_psi).expect("dot");
    let rhs = mdag_phi.dot(&psi).expect("dot");
    (lhs - rhs).abs()
}

#[test]
fn dagger_is_the_adjoint_on_split_lattice() {
    let ctx = context([2, 2, 2, 4], 2, Layout::Soa);
    for (op, species) in base_operators() {
        let defect = adjoint_defect(&ctx, &op, species);
        assert!(defect < GAMMA5_HERMITICITY_ABS, "{op}: defect {defect:e}");
    }
}

#[test]
fn wilson_is_gamma5_hermitian() {
    let ctx = context([2, 2, 2, 4], 2, Layout::Aos);
    let gauge = GaugeField::random(&ctx, 0.8).expect("gauge");
    let op = FermionOperator::Wilson { kappa: 0.15 };
    let mut psi = LatticeField::new(&ctx, Species::DiracSpinor, None).expect("psi");
    psi.fill_gaussian().expect("gaussian");

    // γ5 M γ5 ψ
    let mut g5psi = psi.like().expect("tmp");
    g5psi.copy_from(&psi).expect("copy");
    g5psi.apply_gamma5().expect("γ5");
    let mut sandwich = psi.like().expect("out");
    op.apply(&mut sandwich, &gauge, &g5psi).expect("apply");
    sandwich.apply_gamma5().expect("γ5");

    let mut dagger = psi.like().expect("dagger");
    op.apply_dagger(&mut dagger, &gauge, &psi).expect("dagger");
    let diff = max_abs_diff(&sandwich.to_host().expect("a"), &dagger.to_host().expect("b"));
    assert!(diff < GAMMA5_HERMITICITY_ABS, "defect {diff:e}");
}

#[test]
fn operator_rejects_wrong_species() {
    let ctx = context([2, 2, 2, 4], 2, Layout::Aos);
    let gauge = GaugeField::cold(&ctx).expect("gauge");
    let psi = LatticeField::new(&ctx, Species::DiracSpinor, None).expect("psi");
    let mut out = psi.like().expect("out");
    let err = FermionOperator::Staggered { mass: 0.1 }
        .apply(&mut out, &gauge, &psi)
        .expect_err("staggered on spinors");
    assert!(matches!(err, LatticeError::IncompatibleFields(_)));
}
