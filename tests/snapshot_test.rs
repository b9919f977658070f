//! Snapshot persistence: round-trips through the registry and load fallbacks.

use std::sync::Arc;
use std::time::Duration;

use lotwarden::core::{Category, RateTable, Registry};
use lotwarden::infra::snapshot::{self, SnapshotError};
use lotwarden::util::ManualClock;

fn rates() -> RateTable {
    RateTable::new(5.0, 8.0).unwrap()
}

#[test]
fn test_round_trip_present_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parking_data.dat");
    let clock = Arc::new(ManualClock::new(1_700_000_000));

    let original = Registry::open(&path, 10, rates()).with_clock(clock.clone());
    for i in 0..6 {
        let category = if i % 2 == 0 { Category::Small } else { Category::Large };
        original
            .admit(&format!("P{i}"), category, Duration::ZERO)
            .unwrap();
        clock.advance(450);
    }
    for i in 0..4 {
        original.release(&format!("P{i}")).unwrap();
        clock.advance(900);
    }
    original.set_rates(6.5, 9.5).unwrap();

    let reloaded = Registry::open(&path, 1, rates());
    assert_eq!(reloaded.capacity(), 10);
    assert_eq!(reloaded.occupied(), 2);
    assert_eq!(reloaded.rates(), RateTable::new(6.5, 9.5).unwrap());

    let mut before = original.list_current();
    let mut after = reloaded.list_current();
    before.sort_by(|a, b| a.key.cmp(&b.key));
    after.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(before, after);
    assert_eq!(original.list_history(), reloaded.list_history());
    for i in 0..6 {
        let key = format!("P{i}");
        assert_eq!(original.query(&key), reloaded.query(&key));
    }
}

#[test]
fn test_snapshot_image_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.dat");
    let registry = Registry::new(4, rates());
    registry.admit("A", Category::Small, Duration::ZERO).unwrap();
    registry.admit("B", Category::Large, Duration::ZERO).unwrap();
    registry.release("A").unwrap();

    let image = registry.snapshot_image();
    snapshot::save(&path, &image).unwrap();
    assert_eq!(snapshot::load(&path).unwrap(), image);
    assert!(!path.with_extension("dat.tmp").exists());
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.dat");
    let registry = Registry::open(&path, 7, rates());
    assert_eq!(registry.capacity(), 7);
    assert_eq!(registry.occupied(), 0);
    assert!(!path.exists());

    registry.admit("A", Category::Small, Duration::ZERO).unwrap();
    assert!(path.exists());
}

#[test]
fn test_corrupt_file_falls_back_and_is_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.dat");
    std::fs::write(&path, b"definitely not a snapshot").unwrap();
    assert!(matches!(
        snapshot::load(&path),
        Err(SnapshotError::InvalidMagic(_))
    ));

    let registry = Registry::open(&path, 3, rates());
    assert_eq!(registry.capacity(), 3);
    assert!(registry.list_history().is_empty());

    registry.admit("A", Category::Large, Duration::ZERO).unwrap();
    let image = snapshot::load(&path).unwrap();
    assert_eq!(image.occupied, 1);
    assert_eq!(image.records.len(), 1);
}

#[test]
fn test_truncated_file_is_rejected() {
    let registry = Registry::new(2, rates());
    registry.admit("A", Category::Small, Duration::ZERO).unwrap();
    let bytes = snapshot::encode(&registry.snapshot_image()).unwrap();
    assert!(snapshot::decode(&bytes[..bytes.len() - 3]).is_err());
    assert!(snapshot::decode(&bytes).is_ok());
}

#[test]
fn test_every_mutation_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.dat");
    let registry = Registry::open(&path, 2, rates());

    registry.admit("A", Category::Small, Duration::ZERO).unwrap();
    assert_eq!(snapshot::load(&path).unwrap().occupied, 1);

    registry.release("A").unwrap();
    let image = snapshot::load(&path).unwrap();
    assert_eq!(image.occupied, 0);
    assert!(!image.records[0].is_present());

    registry.set_rates(1.0, 2.0).unwrap();
    assert_eq!(snapshot::load(&path).unwrap().rates, RateTable::new(1.0, 2.0).unwrap());
}

#[test]
fn test_failed_save_keeps_in_memory_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("nested").join("lot.dat");
    let registry = Registry::new(2, rates()).with_snapshot_path(&path);

    let admitted = registry.admit("A", Category::Small, Duration::ZERO).unwrap();
    assert_eq!(registry.query("A").unwrap(), admitted);
    assert_eq!(registry.occupied(), 1);
    assert!(!path.exists());

    registry.set_rates(3.0, 4.0).unwrap();
    assert_eq!(registry.rates(), RateTable::new(3.0, 4.0).unwrap());

    let released = registry.release("A").unwrap();
    assert!(!released.is_present());
    assert_eq!(registry.occupied(), 0);
    assert_eq!(registry.list_history().len(), 1);
    assert!(snapshot::load(&path).is_err());
}
