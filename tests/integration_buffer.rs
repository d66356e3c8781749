// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests: device buffers across queues and devices.
//!
//! Exercises the public buffer API the way field code drives it: async
//! chains over several device queues, migration between devices, the
//! 16-byte copy workaround and capacity limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lattice_offload::buffer::{Buffer, Region};
use lattice_offload::device::{Device, DeviceCaps, HostMemory, MemoryBackend, Placement};
use lattice_offload::LatticeError;

fn pair() -> (Device, Device) {
    let devices = Device::host_set(2, &DeviceCaps::default()).expect("devices");
    let mut it = devices.into_iter();
    (it.next().expect("device 0"), it.next().expect("device 1"))
}

#[test]
fn migrate_moves_contents_and_accounting() {
    let (d0, d1) = pair();
    let mut buf = Buffer::new(&d0, 64).expect("alloc");
    let data: Vec<u8> = (0..64).collect();
    buf.load(&data).expect("load");
    assert_eq!(d0.memory_usage().device_bytes, 64);

    buf.migrate(&d1, &[]).expect("migrate");
    assert!(buf.device().is_same(&d1));
    assert_eq!(d0.memory_usage().device_bytes, 0);
    assert_eq!(d0.memory_usage().live_allocations, 0);
    assert_eq!(d1.memory_usage().device_bytes, 64);

    let mut back = vec![0u8; 64];
    buf.dump(&mut back).expect("dump");
    assert_eq!(back, data);
}

#[test]
fn migrate_to_own_device_is_a_no_op() {
    let (d0, _) = pair();
    let mut buf = Buffer::with_placement(&d0, 32, Placement::HostVisible).expect("alloc");
    buf.migrate(&d0, &[]).expect("migrate");
    let usage = d0.memory_usage();
    assert_eq!(usage.host_bytes, 32);
    assert_eq!(usage.total_allocations, 1);
}

#[test]
fn migrate_waits_for_dependencies() {
    let (d0, d1) = pair();
    let mut buf = Buffer::new(&d0, 16).expect("alloc");
    let loaded = buf.load_async(vec![7u8; 16], 0, &[]).expect("queue load");
    buf.migrate(&d1, &[loaded]).expect("migrate");
    assert_eq!(buf.dump_vec::<u8>().expect("dump"), vec![7u8; 16]);
}

#[test]
fn cross_device_async_chain_preserves_order() {
    let (d0, d1) = pair();
    let a = Buffer::new(&d0, 32).expect("a");
    let b = Buffer::new(&d1, 32).expect("b");
    let c = Buffer::new(&d0, 32).expect("c");

    let first = a.load_async(vec![1u8; 32], 0, &[]).expect("load");
    let second = a.load_async(vec![2u8; 16], 16, &[first]).expect("load tail");
    let to_b = b.copy_from_async(&a, &[second]).expect("a -> b");
    let to_c = c.copy_from_async(&b, &[to_b]).expect("b -> c");
    let readback = c.dump_async(0, 32, &[to_c]).expect("dump");
    let data = readback.wait().expect("wait");

    assert_eq!(&data[..16], &[1u8; 16]);
    assert_eq!(&data[16..], &[2u8; 16]);
}

#[test]
fn failed_dependency_propagates_through_the_chain() {
    let (d0, d1) = pair();
    let a = Buffer::new(&d0, 16).expect("a");
    let b = Buffer::new(&d1, 16).expect("b");
    let failing = d0.enqueue(
        "fail",
        &[],
        Box::new(|| Err(LatticeError::backend("test", "injected"))),
    );
    let copied = b.copy_from_async(&a, &[failing]).expect("queue copy");
    let err = copied.wait().expect_err("dependency failed");
    assert!(matches!(err, LatticeError::Backend { .. }));
}

#[test]
fn devices_on_one_backend_copy_without_staging() {
    let memory: Arc<dyn MemoryBackend> = Arc::new(HostMemory::new());
    let d0 = Device::with_backend(0, "shared-0".into(), DeviceCaps::default(), Arc::clone(&memory))
        .expect("device 0");
    let d1 = Device::with_backend(1, "shared-1".into(), DeviceCaps::default(), memory).expect("device 1");
    assert!(d0.shares_memory_with(&d1));

    let src = Buffer::new(&d0, 32).expect("src");
    let dst = Buffer::new(&d1, 32).expect("dst");
    let loaded = src.load_async((0..32).collect(), 0, &[]).expect("load");
    dst.copy_from_async(&src, &[loaded]).expect("copy").wait().expect("wait");
    assert_eq!(dst.dump_vec::<u8>().expect("dump"), (0..32).collect::<Vec<u8>>());
    assert_eq!(d1.copy_counts(), (0, 1));

    // Separate backends go through host staging instead.
    let (h0, h1) = pair();
    assert!(!h0.shares_memory_with(&h1));
    let a = Buffer::new(&h0, 32).expect("a");
    let b = Buffer::new(&h1, 32).expect("b");
    b.copy_from(&a).expect("staged copy");
    assert_eq!(h1.copy_counts(), (0, 0));
}

#[test]
fn sixteen_byte_copies_use_the_kernel_when_flagged() {
    let caps = DeviceCaps {
        needs_kernel_copy_workaround: true,
        ..DeviceCaps::default()
    };
    let dev = Device::host(0, caps).expect("device");
    let src = Buffer::new(&dev, 16).expect("src");
    let dst = Buffer::new(&dev, 16).expect("dst");
    let big_src = Buffer::new(&dev, 32).expect("big src");
    let big_dst = Buffer::new(&dev, 32).expect("big dst");
    let payload: Vec<u8> = (100..116).collect();
    src.load(&payload).expect("load");

    dst.copy_from(&src).expect("16-byte copy");
    big_dst.copy_from(&big_src).expect("32-byte copy");
    dst.copy_range(&src, 8, 0, 8).expect("partial copy");

    assert_eq!(dev.copy_counts(), (1, 2));
    let out = dst.dump_vec::<u8>().expect("dump");
    assert_eq!(&out[..8], &payload[..8]);
    assert_eq!(&out[8..], &payload[..8]);
}

#[test]
fn native_copy_without_the_flag() {
    let dev = Device::host(0, DeviceCaps::default()).expect("device");
    let src = Buffer::new(&dev, 16).expect("src");
    let dst = Buffer::new(&dev, 16).expect("dst");
    dst.copy_from(&src).expect("copy");
    assert_eq!(dev.copy_counts(), (0, 1));
}

#[test]
fn capacity_limit_reports_allocation_error() {
    let caps = DeviceCaps {
        capacity_bytes: Some(256),
        ..DeviceCaps::default()
    };
    let dev = Device::host(5, caps).expect("device");
    let held = Buffer::new(&dev, 200).expect("fits");
    let err = Buffer::new(&dev, 100).expect_err("over capacity");
    assert_eq!(
        err,
        LatticeError::Allocation {
            device: 5,
            requested: 100,
            available: 56,
        }
    );
    drop(held);
    Buffer::new(&dev, 100).expect("fits after release");
}

#[test]
fn size_mismatch_and_range_errors() {
    let (d0, d1) = pair();
    let a = Buffer::new(&d0, 32).expect("a");
    let b = Buffer::new(&d1, 16).expect("b");
    assert!(matches!(
        b.copy_from(&a),
        Err(LatticeError::SizeMismatch { .. })
    ));
    assert!(matches!(
        a.load_range(&[0u8; 8], 30),
        Err(LatticeError::Range { .. })
    ));
    assert!(matches!(
        a.dump_regions(&[Region::new(24, 16)]),
        Err(LatticeError::Range { .. })
    ));
}

#[test]
fn strided_regions_across_devices() {
    let (d0, d1) = pair();
    let src = Buffer::new(&d0, 64).expect("src");
    let dst = Buffer::new(&d1, 64).expect("dst");
    let data: Vec<u8> = (0..64).collect();
    src.load(&data).expect("load");
    let regions = [Region::new(0, 16), Region::new(32, 16)];
    let packed = src.dump_regions(&regions).expect("gather");
    assert_eq!(packed.len(), 32);
    dst.load_regions(&regions, &packed).expect("scatter");
    let out = dst.dump_vec::<u8>().expect("dump");
    assert_eq!(&out[..16], &data[..16]);
    assert!(out[16..32].iter().all(|&x| x == 0));
    assert_eq!(&out[32..48], &data[32..48]);
}

#[test]
fn queues_run_independently_until_joined() {
    let (d0, d1) = pair();
    let hits = Arc::new(AtomicUsize::new(0));
    let mut events = Vec::new();
    for dev in [&d0, &d1] {
        for _ in 0..4 {
            let hits = Arc::clone(&hits);
            events.push(dev.enqueue(
                "bump",
                &[],
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            ));
        }
    }
    lattice_offload::SyncEvent::wait_all(&events).expect("all");
    assert_eq!(hits.load(Ordering::SeqCst), 8);
    assert!(events.iter().all(lattice_offload::SyncEvent::is_complete));
}
