// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use rand::Rng;
use statmon_core::statistics::CallTime;
use statmon_core::{KeyFields, ManualClock, MonitorConfig, OverflowTarget, StatMonitor, StatementEvent, TextStoreError, required_shared_memory};
use tempfile::tempdir;

fn config(max_entries: usize, buckets: usize) -> MonitorConfig {
    MonitorConfig {
        max_entries,
        max_buckets: buckets,
        bucket_time_secs: 60,
        query_shared_buffer: buckets * 4096,
        ..Default::default()
    }
}

/// Clock parked on a bucket boundary so nothing rotates unless a test moves it
fn frozen() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(6_000))
}

fn monitor(config: MonitorConfig) -> StatMonitor {
    StatMonitor::create_anonymous_with_clock(config, frozen()).unwrap()
}

#[test]
fn test_calls_and_moments_for_one_key() {
    let monitor = monitor(config(64, 2));
    let timings = [3.5, 0.25, 12.0, 7.0, 7.0, 1.0];

    for (i, &t) in timings.iter().enumerate() {
        monitor.record(&StatementEvent::finished(11, "select * from t where id = $1", t, 1));

        let entry = &monitor.entries()[0];
        assert_eq!(entry.calls(), i as i64 + 1);
        assert!(entry.exec.min <= entry.exec.mean);
        assert!(entry.exec.mean <= entry.exec.max);
    }

    let entry = &monitor.entries()[0];
    assert_eq!(entry.exec.min, 0.25);
    assert_eq!(entry.exec.max, 12.0);
    assert!((entry.exec.total - timings.iter().sum::<f64>()).abs() < 1e-9);
}

#[test]
fn test_full_ring_of_rotations() {
    let clock = frozen();
    let monitor = StatMonitor::create_anonymous_with_clock(config(64, 10), clock.clone()).unwrap();
    let start = monitor.current_bucket();

    for step in 1..=10u64 {
        monitor.record(&StatementEvent::finished(step, "select 1", 1.0, 1));
        let recorded_in = monitor.current_bucket();
        clock.advance(60);
        let now = monitor.tick();
        assert_eq!(now, (recorded_in + 1) % 10);

        // Nothing from the recycled bucket survives
        assert!(monitor.entries().iter().all(|e| e.key.bucket_id != now));
    }
    assert_eq!(monitor.current_bucket(), start);
    assert_eq!(monitor.stats().rotations, 10);
}

#[test]
fn test_text_lives_until_bucket_is_recycled() {
    let clock = frozen();
    let monitor = StatMonitor::create_anonymous_with_clock(config(16, 2), clock.clone()).unwrap();
    monitor.record(&StatementEvent::finished(1, "select name from users", 1.0, 1));

    let key = KeyFields {
        query_id: 1,
        top_level: true,
        ..Default::default()
    }
    .in_bucket(0);
    let entry = monitor.table().find(&key).unwrap();
    let text = monitor.table().lock_entry(entry).unwrap().text;
    assert_eq!(monitor.query_text(&text).unwrap(), "select name from users");

    // Rotating into bucket 1 leaves bucket 0 alone
    clock.advance(60);
    assert_eq!(monitor.tick(), 1);
    assert_eq!(monitor.query_text(&text).unwrap(), "select name from users");

    // Rotating back into bucket 0 recycles it
    clock.advance(60);
    assert_eq!(monitor.tick(), 0);
    assert!(matches!(monitor.query_text(&text), Err(TextStoreError::NotFound)));
    assert!(monitor.entries().is_empty());
}

#[test]
fn test_capacity_example_five_entries() {
    let monitor = monitor(config(5, 10));
    for id in 1..=5 {
        monitor.record(&StatementEvent::finished(id, format!("select {}", id), 1.0, 1));
    }
    assert_eq!(monitor.live_entries(), 5);

    monitor.record(&StatementEvent::finished(6, "select 6", 1.0, 1));
    assert_eq!(monitor.live_entries(), 5);
    assert!(monitor.entries().iter().any(|e| e.key.query_id == 6));
    assert_eq!(monitor.stats().dealloc_passes, 1);

    for id in 7..50 {
        monitor.record(&StatementEvent::finished(id, "select n", 1.0, 1));
        assert!(monitor.live_entries() <= 5);
    }
}

#[test]
fn test_dealloc_respects_median() {
    let monitor = monitor(config(200, 2));
    for id in 0..200u64 {
        // Query `id` finishes `id + 1` times
        for _ in 0..=id {
            monitor.record(&StatementEvent::finished(id, "select", 1.0, 1));
        }
    }

    assert_eq!(monitor.dealloc(), 10);
    assert_eq!(monitor.live_entries(), 190);

    let entries = monitor.entries();
    for id in 0..10 {
        assert!(entries.iter().all(|e| e.key.query_id != id), "low usage entry {} retained", id);
    }
    let lowest_kept = entries.iter().map(|e| e.usage).fold(f64::INFINITY, f64::min);
    assert!(lowest_kept <= monitor.stats().median_usage);
    // Query 10 starts at 1.0 and gains 11 uses before one decay step
    assert!((lowest_kept - 12.0 * 0.99).abs() < 1e-9);
}

#[test]
fn test_concurrent_workers_on_file_region_lose_no_updates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("statmon.region");
    let cfg = config(128, 4);
    let clock = frozen();

    let creator = StatMonitor::create_file_with_clock(cfg.clone(), &path, clock.clone()).unwrap();
    const WORKERS: usize = 8;
    const PER_WORKER: usize = 500;

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let cfg = cfg.clone();
            let path = path.clone();
            let clock = clock.clone();
            thread::spawn(move || {
                // Every worker maps the file on its own, as a separate process would
                let worker = StatMonitor::attach_file_with_clock(cfg, &path, clock).unwrap();
                let mut rng = rand::thread_rng();
                for _ in 0..PER_WORKER {
                    let elapsed = rng.gen_range(0.1..50.0);
                    worker.record(&StatementEvent::finished(7, "update counters set n = n + 1", elapsed, 1));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = WORKERS * PER_WORKER;
    let entries = creator.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].calls(), total as i64);
    assert_eq!(entries[0].rows, total as i64);
    assert_eq!(entries[0].resp_calls.iter().sum::<u64>(), total as u64);
    assert_eq!(creator.stats().attached, 1);
}

#[test]
fn test_concurrent_distinct_keys() {
    let monitor = monitor(config(1024, 2));

    let handles: Vec<_> = (0..4u64)
        .map(|w| {
            let worker = monitor.attach().unwrap();
            thread::spawn(move || {
                for i in 0..100u64 {
                    worker.record(&StatementEvent::finished(w * 1000 + i, format!("select {}", i), 1.0, 1));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let entries = monitor.entries();
    assert_eq!(entries.len(), 400);
    assert!(entries.iter().all(|e| e.calls() == 1 && e.query.is_some()));
}

#[test]
fn test_scans_and_rotation_while_workers_record() {
    const MAX_ENTRIES: usize = 32;
    const BUCKETS: u64 = 4;
    const STEPS: u64 = 12;

    let clock = frozen();
    let monitor = StatMonitor::create_anonymous_with_clock(config(MAX_ENTRIES, BUCKETS as usize), clock.clone()).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let scans = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4u64)
        .map(|w| {
            let worker = monitor.attach().unwrap();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut recorded = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    // More distinct keys than slots keeps dealloc busy
                    let id = rng.gen_range(0..200u64);
                    worker.record(&StatementEvent::finished(id, format!("select * from t{}", id), 1.0, 1).with_user(w));
                    recorded += 1;
                }
                recorded
            })
        })
        .collect();

    let scanner = {
        let reader = monitor.attach().unwrap();
        let stop = Arc::clone(&stop);
        let scans = Arc::clone(&scans);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let mut seen = 0;
                reader.for_each_entry(|entry| {
                    seen += 1;
                    assert!(entry.key.bucket_id < BUCKETS);
                    assert!(entry.calls() >= 0);
                    if let Some(query) = &entry.query {
                        assert_eq!(query, &format!("select * from t{}", entry.key.query_id));
                    }
                });
                assert!(seen <= MAX_ENTRIES);
                assert!(reader.live_entries() <= MAX_ENTRIES);
                scans.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    for _ in 0..STEPS {
        thread::sleep(Duration::from_millis(5));
        clock.advance(60);
        monitor.tick();
        monitor.dealloc();
        assert!(monitor.live_entries() <= MAX_ENTRIES);
    }

    stop.store(true, Ordering::Relaxed);
    let recorded: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();
    scanner.join().unwrap();

    assert!(recorded > 0);
    assert!(scans.load(Ordering::Relaxed) > 0);
    // Racing workers and the clock thread rotated exactly once per step
    assert_eq!(monitor.stats().rotations, STEPS);
    assert_eq!(monitor.current_bucket(), STEPS % BUCKETS);

    // Each further rotation leaves nothing behind in the bucket it recycles
    for _ in 0..BUCKETS {
        clock.advance(60);
        let recycled = monitor.tick();
        assert!(monitor.entries().iter().all(|e| e.key.bucket_id != recycled));
    }
    assert!(monitor.entries().is_empty());
    assert_eq!(monitor.stats().rotations, STEPS + BUCKETS);
}

#[test]
fn test_attach_with_mismatched_config_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("statmon.region");
    let _creator = StatMonitor::create_file(config(64, 2), &path).unwrap();

    assert!(StatMonitor::attach_file(config(32, 2), &path).is_err());
    assert!(StatMonitor::attach_file(config(64, 2), &path).is_ok());
}

#[test]
fn test_attach_before_create_fails() {
    let dir = tempdir().unwrap();
    assert!(StatMonitor::attach_file(config(64, 2), dir.path().join("missing.region")).is_err());
}

#[test]
fn test_text_overflow_without_sink_keeps_entry() {
    let cfg = MonitorConfig {
        max_entries: 256,
        max_buckets: 1,
        query_max_len: 1024,
        query_shared_buffer: 1024,
        overflow_target: OverflowTarget::None,
        ..Default::default()
    };
    let monitor = monitor(cfg);
    let long = "x".repeat(900);
    monitor.record(&StatementEvent::finished(1, long.clone(), 1.0, 1));
    monitor.record(&StatementEvent::finished(2, long, 1.0, 1));

    let entries = monitor.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries.iter().filter(|e| e.query.is_some()).count(), 1);
}

#[test]
fn test_text_overflow_to_disk() {
    let dir = tempdir().unwrap();
    let cfg = MonitorConfig {
        max_entries: 256,
        max_buckets: 1,
        query_max_len: 1024,
        query_shared_buffer: 1024,
        overflow_target: OverflowTarget::Disk,
        overflow_dir: dir.path().join("overflow"),
        ..Default::default()
    };
    let monitor = monitor(cfg);
    let long = "y".repeat(900);
    monitor.record(&StatementEvent::finished(1, long.clone(), 1.0, 1));
    monitor.record(&StatementEvent::finished(2, long.clone(), 1.0, 1));

    let entries = monitor.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.query.as_deref() == Some(long.as_str())));
    assert!(dir.path().join("overflow").join("bucket_0.qtext").exists());
}

#[test]
fn test_reset_operations() {
    let clock = frozen();
    let monitor = StatMonitor::create_anonymous_with_clock(config(64, 3), clock.clone()).unwrap();
    monitor.record(&StatementEvent::finished(1, "select 1", 1.0, 1));
    clock.advance(60);
    monitor.record(&StatementEvent::finished(2, "select 2", 1.0, 1));
    assert_eq!(monitor.live_entries(), 2);

    assert_eq!(monitor.reset_bucket(0), 1);
    assert_eq!(monitor.entries()[0].key.query_id, 2);

    assert_eq!(monitor.reset_all(), 1);
    assert_eq!(monitor.live_entries(), 0);
    assert_eq!(monitor.current_bucket(), 0);
}

#[test]
fn test_sizing_matches_region() {
    let cfg = config(100, 4);
    let monitor = monitor(cfg.clone());
    assert_eq!(monitor.stats().region_bytes as usize, required_shared_memory(&cfg));
    assert_eq!(monitor.stats().capacity, 100);
}

proptest! {
    #[test]
    fn prop_moments_stay_ordered(samples in prop::collection::vec(0.0f64..1e6, 1..200)) {
        let mut time = CallTime::default();
        for (i, &x) in samples.iter().enumerate() {
            time.observe(i as i64 + 1, x);
            prop_assert!(time.min <= time.mean + 1e-9 * time.max.max(1.0));
            prop_assert!(time.mean <= time.max + 1e-9 * time.max.max(1.0));
            prop_assert!(time.sum_var >= -1e-6 * time.max.max(1.0));
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        prop_assert!((time.mean - mean).abs() <= 1e-6 * mean.abs().max(1.0));
    }
}
