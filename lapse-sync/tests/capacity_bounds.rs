use std::fs;
use std::time::{Duration, SystemTime};

use chrono::{TimeZone, Utc};
use filetime::{set_file_mtime, FileTime};
use lapse_core::{CapacityPolicy, Partition};
use lapse_sync::capacity::{enforce, LocalImages, RemoteImages};
use lapse_sync::lister::Remote;
use lapse_sync::reconcile::reconcile;
use lapse_sync::store::memory::StoreOp;
use lapse_sync::{Cancellation, LocalMirror, MemoryStore, RetryPolicy, StoreError};
use rstest::rstest;
use tempfile::TempDir;

fn partition() -> Partition {
    Partition::new("farm", "Cam1")
}

/// Ten local images whose age does not follow name order.
fn seeded_mirror() -> (TempDir, LocalMirror) {
    let tmp = TempDir::new().expect("tmp");
    let mirror = LocalMirror::new(tmp.path());
    let dir = mirror.partition_dir(&partition());
    fs::create_dir_all(&dir).expect("mkdir");
    let ages_min = [30u64, 5, 90, 60, 10, 45, 15, 75, 20, 1];
    for (i, age) in ages_min.iter().enumerate() {
        let path = dir.join(format!("img_{i}.jpg"));
        fs::write(&path, b"x").expect("write");
        let mtime = SystemTime::now() - Duration::from_secs(age * 60);
        set_file_mtime(&path, FileTime::from_system_time(mtime)).expect("mtime");
    }
    (tmp, mirror)
}

#[rstest]
#[case(4, &["img_1.jpg", "img_4.jpg", "img_6.jpg", "img_9.jpg"])]
#[case(1, &["img_9.jpg"])]
#[case(0, &[])]
fn local_eviction_keeps_most_recent(#[case] max: usize, #[case] expected: &[&str]) {
    let (_tmp, mirror) = seeded_mirror();
    let p = partition();
    let target = LocalImages {
        mirror: &mirror,
        partition: &p,
    };

    let report = enforce(&target, &p, &CapacityPolicy::new(max)).expect("enforce");

    let left: Vec<String> = mirror.list(&p).unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(left, expected);
    assert_eq!(report.removed, 10 - max);
    assert!(left.len() <= max);
}

#[test]
fn local_eviction_within_capacity_touches_nothing() {
    let (_tmp, mirror) = seeded_mirror();
    let p = partition();
    let target = LocalImages {
        mirror: &mirror,
        partition: &p,
    };
    let report = enforce(&target, &p, &CapacityPolicy::new(10)).expect("enforce");
    assert_eq!(report.overflow, 0);
    assert_eq!(mirror.list(&p).unwrap().len(), 10);
}

#[test]
fn remote_eviction_retries_transient_and_skips_denied() {
    let store = MemoryStore::new();
    let folder = store.add_folder(None, "image");
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let ids: Vec<String> = (0..6)
        .map(|i| store.add_image(&folder, &format!("img_{i}.jpg"), base + chrono::Duration::hours(i)))
        .collect();
    store.fail_times(StoreOp::Delete, Some(&ids[0]), 1, StoreError::transient("503"));
    store.fail_always(StoreOp::Delete, Some(&ids[1]), StoreError::permission_denied("403"));

    let retry = RetryPolicy::immediate(3);
    let cancel = Cancellation::new();
    let target = RemoteImages {
        remote: Remote::new(&store, &retry, &cancel),
        container: &folder,
    };
    let report = enforce(&target, &partition(), &CapacityPolicy::new(4)).expect("enforce");

    assert_eq!(report.overflow, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "img_1.jpg");
    assert!(!store.contains(&ids[0]));
    assert!(store.contains(&ids[1]));
    assert_eq!(
        store.calls_of(StoreOp::Delete),
        vec![ids[0].clone(), ids[0].clone(), ids[1].clone()]
    );
}

#[test]
fn reconcile_twice_is_idempotent() {
    let store = MemoryStore::new().with_page_size(2);
    let folder = store.add_folder(None, "image");
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    for i in 0..5 {
        store.add_image(&folder, &format!("img_{i}.jpg"), base);
    }
    let tmp = TempDir::new().expect("tmp");
    let mirror = LocalMirror::new(tmp.path());
    let retry = RetryPolicy::immediate(3);
    let cancel = Cancellation::new();
    let remote = Remote::new(&store, &retry, &cancel);

    let first = reconcile(&remote, &mirror, &partition(), &folder).expect("first");
    assert_eq!(first.downloaded, 5);
    let snapshot = mirror.list(&partition()).unwrap();

    let second = reconcile(&remote, &mirror, &partition(), &folder).expect("second");
    assert!(second.new_objects.is_empty());
    assert_eq!(second.downloaded, 0);
    assert_eq!(mirror.list(&partition()).unwrap(), snapshot);
}

#[test]
fn local_stems_are_subset_of_remote_after_download() {
    let store = MemoryStore::new();
    let folder = store.add_folder(None, "image");
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    for name in ["a.jpg", "b.png", "c.jpeg"] {
        store.add_image(&folder, name, base);
    }
    let tmp = TempDir::new().expect("tmp");
    let mirror = LocalMirror::new(tmp.path());
    let retry = RetryPolicy::immediate(3);
    let cancel = Cancellation::new();
    let remote = Remote::new(&store, &retry, &cancel);

    reconcile(&remote, &mirror, &partition(), &folder).expect("reconcile");

    let remote_stems: Vec<String> = store
        .child_names(&folder)
        .iter()
        .map(|n| lapse_core::stem(n).to_string())
        .collect();
    for entry in mirror.list(&partition()).unwrap() {
        assert!(remote_stems.contains(&entry.stem().to_string()));
    }
    assert_eq!(
        fs::read(mirror.partition_dir(&partition()).join("b.png")).unwrap(),
        b"b.png"
    );
}
