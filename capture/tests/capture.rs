mod common;

use capture::checkpoint::BackfillStatus;
use capture::event::operation::Operation;
use capture::memory::{MemoryCheckpointStore, MemoryDatabase, MemorySink};
use capture::reconcile::phase::SequencerPhase;
use capture::watermark::{Watermark, WatermarkStore};
use common::*;
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn test_backfill_then_stream() {
    let db = seeded(&orders(), 1..=10);
    let sink = MemorySink::new();
    let store = MemoryCheckpointStore::new();

    let running = start(config(&[orders()]), &db, &sink, &store);
    wait_converged(&db, &sink, &[orders()]).await;
    wait_until("streaming", || running.phase() == SequencerPhase::Streaming).await;

    assert!(sink
        .events()
        .iter()
        .all(|e| e.operation() == Operation::Insert));

    db.upsert(&orders(), row(11, "late")).unwrap();
    db.upsert(&orders(), row(4, "changed")).unwrap();
    db.delete(&orders(), &key(7)).unwrap();
    wait_converged(&db, &sink, &[orders()]).await;

    let checkpoint = running.stop().await.unwrap();
    let state = checkpoint.table(&orders()).unwrap();
    assert_eq!(state.status, BackfillStatus::Complete);
    assert_eq!(state.rows_emitted, 10);
    assert_eq!(events_for(&sink, &orders(), 7).last().unwrap().operation(), Operation::Delete);
}

#[tokio::test]
async fn test_changes_during_scan_patch_the_chunk() {
    let db = seeded(&orders(), 1..=3);
    let sink = MemorySink::new();
    let store = MemoryCheckpointStore::new();
    db.on_next_scan(&orders(), |db| {
        db.upsert(&orders(), row(2, "new")).unwrap();
        db.delete(&orders(), &key(3)).unwrap();
    });

    let mut config = config(&[orders()]);
    config.backfill.chunk_size = 10;
    let running = start(config, &db, &sink, &store);
    wait_converged(&db, &sink, &[orders()]).await;
    running.stop().await.unwrap();

    assert!(events_for(&sink, &orders(), 3).is_empty());
    let row_2 = events_for(&sink, &orders(), 2);
    assert!(!row_2.is_empty());
    assert!(row_2
        .iter()
        .all(|e| e.after().unwrap()["name"] == "new"));
    assert_eq!(events_for(&sink, &orders(), 1).len(), 1);
    assert_eq!(sink.events().len(), 2);
}

#[tokio::test]
async fn test_tables_backfill_independently() {
    let db = seeded(&orders(), 1..=8);
    seed(&db, &customers(), 1..=5);
    let sink = MemorySink::new();
    let store = MemoryCheckpointStore::new();

    let running = start(config(&[orders(), customers()]), &db, &sink, &store);
    wait_converged(&db, &sink, &[orders(), customers()]).await;
    let checkpoint = running.stop().await.unwrap();

    assert_eq!(checkpoint.table(&orders()).unwrap().rows_emitted, 8);
    assert_eq!(checkpoint.table(&customers()).unwrap().rows_emitted, 5);
}

#[tokio::test]
async fn test_resume_skips_scanned_keys() {
    let db = seeded(&orders(), 1..=30);
    let store = MemoryCheckpointStore::new();
    let mut config = config(&[orders()]);
    config.backfill.chunk_size = 2;

    let first = MemorySink::new();
    let running = start(config.clone(), &db, &first, &store);
    wait_until("a chunk is committed", || {
        store
            .checkpoint()
            .and_then(|c| c.table(&orders()).and_then(|t| t.resume_key.clone()))
            .is_some()
    })
    .await;
    let stopped = running.stop().await.unwrap();
    let resume_key = stopped.table(&orders()).unwrap().resume_key.clone().unwrap();
    let stopped_at = stopped.log_position.clone().unwrap();

    db.upsert(&orders(), row(100, "late")).unwrap();
    db.upsert(&orders(), row(101, "late")).unwrap();

    let second = MemorySink::new();
    let running = start(config, &db, &second, &store);
    wait_until("both runs together match the source", || {
        let mut events = first.events();
        events.extend(second.events());
        materialize(&events, &orders()) == source_state(&db, &orders())
    })
    .await;
    let checkpoint = running.stop().await.unwrap();

    let resumed = second.events();
    assert!(resumed.iter().all(|e| e.key() > &resume_key));
    assert!(resumed
        .iter()
        .all(|e| e.log_position().is_after(&stopped_at) == Some(true)));
    assert_eq!(
        checkpoint.table(&orders()).unwrap().status,
        BackfillStatus::Complete
    );
    assert_eq!(checkpoint.log_position.unwrap().is_after(&stopped_at), Some(true));
}

#[tokio::test]
async fn test_restart_after_complete_only_streams() {
    let db = seeded(&orders(), 1..=4);
    let store = MemoryCheckpointStore::new();

    let first = MemorySink::new();
    let running = start(config(&[orders()]), &db, &first, &store);
    wait_converged(&db, &first, &[orders()]).await;
    running.stop().await.unwrap();
    let scans = db.scans();

    db.upsert(&orders(), row(2, "after restart")).unwrap();
    let second = MemorySink::new();
    let running = start(config(&[orders()]), &db, &second, &store);
    wait_until("the update is delivered", || second.events().len() == 1).await;
    assert_eq!(running.phase(), SequencerPhase::Streaming);
    running.stop().await.unwrap();

    assert_eq!(db.scans(), scans);
    assert_eq!(second.events()[0].operation(), Operation::Update);
}

#[tokio::test]
async fn test_foreign_watermarks_are_ignored() {
    let db = seeded(&orders(), 1..=6);
    let sink = MemorySink::new();
    let store = MemoryCheckpointStore::new();
    db.on_next_watermark(|db| {
        let db = db.clone();
        tokio::spawn(async move {
            db.write(&Watermark::fresh("another-capture")).await.unwrap();
        });
    });

    let running = start(config(&[orders()]), &db, &sink, &store);
    wait_converged(&db, &sink, &[orders()]).await;
    running.stop().await.unwrap();

    assert!(db.watermark("another-capture").is_some());
    for id in 1..=6 {
        assert_eq!(events_for(&sink, &orders(), id).len(), 1);
    }
}

/// Deterministic pseudo-random numbers for the concurrent writer.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

async fn write_randomly(db: MemoryDatabase, seed: u64, writes: usize) {
    let tables = [orders(), customers()];
    let mut rng = Lcg(seed);
    for n in 0..writes {
        let table = &tables[rng.next(2) as usize];
        let id = rng.next(60) as i64;
        if rng.next(8) < 6 {
            db.upsert(table, row(id, &format!("v{}", n))).unwrap();
        } else {
            db.delete(table, &key(id)).unwrap();
        }
        if n % 20 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_converge() {
    let db = seeded(&orders(), 0..40);
    seed(&db, &customers(), 0..40);
    let sink = MemorySink::new();
    let store = MemoryCheckpointStore::new();
    let mut config = config(&[orders(), customers()]);
    config.backfill.chunk_size = 4;

    let running = start(config, &db, &sink, &store);
    let writers = [
        tokio::spawn(write_randomly(db.clone(), 7, 400)),
        tokio::spawn(write_randomly(db.clone(), 11, 400)),
    ];
    for writer in writers {
        writer.await.unwrap();
    }
    wait_converged(&db, &sink, &[orders(), customers()]).await;
    let checkpoint = running.stop().await.unwrap();

    for table in [orders(), customers()] {
        assert_eq!(
            checkpoint.table(&table).unwrap().status,
            BackfillStatus::Complete
        );
    }

    let mut last_seen = HashMap::new();
    for event in sink.events() {
        let id = (event.table_id().clone(), event.key().clone());
        if let Some(previous) = last_seen.insert(id, event.log_position().clone()) {
            assert_ne!(
                previous.is_after(event.log_position()),
                Some(true),
                "{} went back in the log",
                event.key()
            );
        }
    }
}
