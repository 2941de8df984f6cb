//! Port reservation across independent allocators sharing one lock directory.

use std::collections::HashSet;
use std::time::Duration;

use sandbox_runtime::{PortAllocator, PortRange};

fn allocator(lock_dir: &std::path::Path) -> PortAllocator {
    PortAllocator::new(lock_dir, "0.0.0.0", Duration::from_millis(300))
}

#[test]
fn separate_allocators_get_distinct_locked_ports() {
    let dir = tempfile::tempdir().unwrap();
    let range = PortRange::new(47611, 47613);

    let first = allocator(dir.path()).allocate(range).unwrap();
    let second = allocator(dir.path()).allocate(range).unwrap();

    assert!(first.is_locked());
    assert!(second.is_locked());
    assert_ne!(first.port(), second.port());
    assert!(range.contains(first.port()) && range.contains(second.port()));
}

#[test]
fn fully_locked_range_degrades_to_lockless_reservation() {
    let dir = tempfile::tempdir().unwrap();
    let range = PortRange::new(47621, 47623);

    let held: Vec<_> = (0..3)
        .map(|_| allocator(dir.path()).allocate(range).unwrap())
        .collect();
    assert!(held.iter().all(|r| r.is_locked()));
    let locked: HashSet<u16> = held.iter().map(|r| r.port()).collect();
    assert_eq!(locked.len(), 3);

    let degraded = allocator(dir.path()).allocate(range).unwrap();
    assert!(!degraded.is_locked());
    assert!(range.contains(degraded.port()));
}

#[test]
fn released_port_can_be_locked_again() {
    let dir = tempfile::tempdir().unwrap();
    let range = PortRange::new(47631, 47631);
    let alloc = allocator(dir.path());

    let mut first = alloc.allocate(range).unwrap();
    assert!(first.is_locked());
    assert!(alloc.release(&mut first));

    let again = alloc.allocate(range).unwrap();
    assert!(again.is_locked());
    assert_eq!(again.port(), 47631);
}

#[test]
fn concurrent_allocations_never_share_a_locked_port() {
    let dir = tempfile::tempdir().unwrap();
    let range = PortRange::new(47641, 47660);
    let lock_dir = dir.path().to_path_buf();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lock_dir = lock_dir.clone();
            std::thread::spawn(move || allocator(&lock_dir).allocate(range).unwrap())
        })
        .collect();
    let reservations: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let ports: HashSet<u16> = reservations.iter().map(|r| r.port()).collect();
    assert_eq!(ports.len(), reservations.len());
    assert!(reservations.iter().all(|r| r.is_locked()));
}
