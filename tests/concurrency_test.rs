mod common;

use audit_ledger::audit::{AuditLedger, LedgerStore};
use common::setup_ledger;
use std::collections::HashSet;

const PRODUCERS: usize = 2;
const APPENDS_PER_PRODUCER: usize = 1000;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_producers_get_gapless_sequences() {
    let (_temp_dir, ledger) = setup_ledger(false).await;

    let mut handles = Vec::new();
    for producer in 0..PRODUCERS {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut sequences = Vec::with_capacity(APPENDS_PER_PRODUCER);
            for i in 0..APPENDS_PER_PRODUCER {
                let payload = format!(r#"{{"producer":{},"index":{}}}"#, producer, i);
                let entry = ledger.submit_json("audit", &payload).await.unwrap();
                sequences.push(entry.sequence);
            }
            sequences
        }));
    }

    let mut acknowledged = HashSet::new();
    for handle in handles {
        let sequences = handle.await.unwrap();
        // Each producer sees its own appends in submission order.
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        acknowledged.extend(sequences);
    }

    let total = (PRODUCERS * APPENDS_PER_PRODUCER) as u64;
    assert_eq!(acknowledged.len() as u64, total);

    let entries = ledger.entries().unwrap();
    assert_eq!(entries.len() as u64, total);
    for (position, entry) in entries.iter().enumerate() {
        assert_eq!(entry.sequence, position as u64);
    }

    let result = ledger.verify().unwrap();
    assert!(result.valid, "{}", result.summary());
    assert_eq!(result.entry_count, total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cloned_handles_share_one_writer() {
    let (_temp_dir, ledger) = setup_ledger(false).await;
    let clone = ledger.clone();

    let a = tokio::spawn(async move {
        for _ in 0..50 {
            clone.submit_json("a", "{}").await.unwrap();
        }
    });
    for _ in 0..50 {
        ledger.submit_json("b", "{}").await.unwrap();
    }
    a.await.unwrap();

    assert_eq!(ledger.store().count().unwrap(), 100);
    assert!(ledger.verify().unwrap().valid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_see_consistent_prefixes_during_appends() {
    let (_temp_dir, ledger) = setup_ledger(false).await;
    let path = ledger.store().path().to_path_buf();

    let writer = ledger.clone();
    let producer = tokio::spawn(async move {
        for i in 0..300 {
            writer
                .submit_json("audit", &format!(r#"{{"index":{}}}"#, i))
                .await
                .unwrap();
        }
    });

    let reader = AuditLedger::new(LedgerStore::new(&path, false));
    let mut last_seen = 0;
    while !producer.is_finished() {
        let result = reader.verify().unwrap();
        assert!(result.valid, "{}", result.summary());
        assert!(result.entry_count >= last_seen);
        last_seen = result.entry_count;
        tokio::task::yield_now().await;
    }
    producer.await.unwrap();

    let result = reader.verify().unwrap();
    assert!(result.valid);
    assert_eq!(result.entry_count, 300);
}
