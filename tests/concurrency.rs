//! Readers, writer and background solidify running at the same time.

use chainkv::{
    Cursor, EngineConfig, Epoch, KeyValueStore, RevokingEngine, SnapshotManager, Solidifier,
    StoreError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

#[test]
fn test_captured_reader_during_background_solidify() {
    let engine = SnapshotManager::in_memory();
    let account = engine.register_store("account").unwrap();
    account.put(b"untouched", b"genesis").unwrap();
    account.put(b"alice", b"50").unwrap();

    // Captured before either epoch begins.
    let captured = account.at(Cursor::Head).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reads = 0u64;
            loop {
                assert_eq!(
                    captured.get(b"untouched").unwrap(),
                    Some(b"genesis".to_vec())
                );
                reads += 1;
                if done.load(Ordering::Acquire) {
                    return reads;
                }
            }
        })
    };

    engine.advance_all().unwrap();
    account.put(b"alice", b"100").unwrap();
    engine.advance_all().unwrap();
    account.put(b"alice", b"150").unwrap();

    let worker = Solidifier::spawn(engine.clone()).unwrap();
    assert_eq!(worker.solidify(1).unwrap(), 1);

    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);

    assert_eq!(account.get(b"alice").unwrap(), Some(b"150".to_vec()));
    engine.revoke().unwrap();
    assert_eq!(account.get(b"alice").unwrap(), Some(b"100".to_vec()));
}

#[test]
fn test_head_reader_keeps_values_across_solidify() {
    let engine = SnapshotManager::in_memory();
    let account = engine.register_store("account").unwrap();

    for block in 0..8u8 {
        engine.advance_all().unwrap();
        account.put(&[block], &[block]).unwrap();
        account.put(b"latest", &[block]).unwrap();
    }
    let captured = account.at(Cursor::Head).unwrap();
    let expected = captured.iter().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let reader = {
        let barrier = Arc::clone(&barrier);
        let captured = Arc::clone(&captured);
        let expected = expected.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..200 {
                assert_eq!(captured.iter().unwrap(), expected);
                assert_eq!(captured.get(b"latest").unwrap(), Some(vec![7]));
            }
        })
    };

    barrier.wait();
    for _ in 0..7 {
        engine.solidify(1).unwrap();
    }
    reader.join().unwrap();

    assert_eq!(engine.root_epoch(), Epoch(7));
    assert_eq!(captured.iter().unwrap(), expected);
}

#[test]
fn test_lower_layers_and_views_keep_values_across_multi_epoch_solidify() {
    let engine = SnapshotManager::in_memory();
    let account = engine.register_store("account").unwrap();
    let witness = engine.register_store("witness").unwrap();
    account.put(b"alice", b"0").unwrap();

    let mut first = None;
    for block in 1..=4u8 {
        engine.advance_all().unwrap();
        account.put(b"alice", &[block]).unwrap();
        account.put(&[block], b"x").unwrap();
        witness.put(b"height", &[block]).unwrap();
        if block == 1 {
            first = Some(account.at(Cursor::Head).unwrap());
        }
    }
    let first = first.unwrap();
    engine.mark(Cursor::Solid, Epoch(2)).unwrap();
    let view = engine.view(Cursor::Solid);

    let expected_first = vec![(vec![1], b"x".to_vec()), (b"alice".to_vec(), vec![1])];
    assert_eq!(first.iter().unwrap(), expected_first);

    let barrier = Arc::new(Barrier::new(2));
    let reader = {
        let barrier = Arc::clone(&barrier);
        let first = Arc::clone(&first);
        let expected_first = expected_first.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..500 {
                assert_eq!(first.iter().unwrap(), expected_first);
                assert_eq!(first.get(&[2]).unwrap(), None);
                assert_eq!(view.get("account", b"alice").unwrap(), Some(vec![2]));
                assert_eq!(view.get("account", &[3]).unwrap(), None);
                assert_eq!(view.get("witness", b"height").unwrap(), Some(vec![2]));
            }
            view
        })
    };

    let worker = Solidifier::spawn(engine.clone()).unwrap();
    barrier.wait();
    assert_eq!(worker.solidify(2).unwrap(), 2);
    let view = reader.join().unwrap();

    assert_eq!(engine.root_epoch(), Epoch(2));
    assert_eq!(first.iter().unwrap(), expected_first);
    assert_eq!(view.get("account", b"alice").unwrap(), Some(vec![2]));
    assert_eq!(account.get_at(Cursor::Solid, b"alice").unwrap(), Some(vec![2]));
    assert_eq!(account.get(b"alice").unwrap(), Some(vec![4]));
}

#[test]
fn test_marks_race_background_folds() {
    let engine = SnapshotManager::in_memory();
    let account = engine.register_store("account").unwrap();
    for block in 1..=40u64 {
        engine.advance_all().unwrap();
        account.put(b"height", &block.to_le_bytes()).unwrap();
    }

    let worker = Solidifier::spawn(engine.clone()).unwrap();
    let folder = thread::spawn(move || {
        let mut folded = 0;
        for _ in 0..200 {
            match worker.solidify(1) {
                Ok(count) => folded += count,
                // Blocked by the marker until it moves on.
                Err(StoreError::ChainConsistencyViolation(_)) => thread::yield_now(),
                Err(e) => panic!("fold failed: {}", e),
            }
        }
        folded
    });

    for _ in 0..200 {
        let target = Epoch((engine.root_epoch().0 + 1).min(39));
        match engine.mark(Cursor::Pbft, target) {
            Ok(()) | Err(StoreError::ChainConsistencyViolation(_)) => {}
            Err(e) => panic!("mark failed: {}", e),
        }
        // Whatever the marker names, reads through it see that epoch.
        if let Some(marker) = engine.marker(Cursor::Pbft) {
            assert_eq!(
                account.get_at(Cursor::Pbft, b"height").unwrap(),
                Some(marker.0.to_le_bytes().to_vec())
            );
        }
    }
    let folded = folder.join().unwrap();

    let marker = engine.marker(Cursor::Pbft).unwrap();
    assert!(marker >= engine.root_epoch());
    assert_eq!(engine.root_epoch(), Epoch(folded as u64));
    assert_eq!(
        account.get_at(Cursor::Pbft, b"height").unwrap(),
        Some(marker.0.to_le_bytes().to_vec())
    );
}

#[test]
fn test_writer_continues_while_worker_folds() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = TempDir::new().unwrap();
    let engine =
        SnapshotManager::open(EngineConfig::at(dir.path()).with_max_revocable_depth(4)).unwrap();
    let account = engine.register_store("account").unwrap();
    let witness = engine.register_store("witness").unwrap();
    let worker = Solidifier::spawn(engine.clone()).unwrap();

    for block in 0..100u32 {
        engine.advance_all().unwrap();
        account.put(b"height", &block.to_le_bytes()).unwrap();
        witness
            .put(format!("w{}", block % 7).as_bytes(), &block.to_le_bytes())
            .unwrap();
        worker.request_flush().unwrap();

        // Every store always reports the same epoch boundary.
        let stats = engine.stats();
        assert!(stats
            .chains
            .iter()
            .all(|c| c.head_epoch == stats.head_epoch && c.root_epoch == stats.root_epoch));
    }
    assert!(worker.flush_if_needed().is_ok());
    drop(worker);

    assert_eq!(engine.head_epoch(), Epoch(100));
    assert!(engine.depth() <= 4);
    assert_eq!(account.get(b"height").unwrap(), Some(99u32.to_le_bytes().to_vec()));
    assert_eq!(witness.iter().unwrap().len(), 7);
}

#[test]
fn test_concurrent_views_see_whole_blocks() {
    let engine = SnapshotManager::in_memory();
    let account = engine.register_store("account").unwrap();
    let witness = engine.register_store("witness").unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let engine = engine.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let view = engine.view(Cursor::Solid);
                let a = view.get("account", b"height").unwrap();
                let w = view.get("witness", b"height").unwrap();
                assert_eq!(a, w);
            }
        })
    };

    for block in 1..=50u32 {
        engine.advance_all().unwrap();
        account.put(b"height", &block.to_le_bytes()).unwrap();
        witness.put(b"height", &block.to_le_bytes()).unwrap();
        if block > 1 {
            engine.mark(Cursor::Solid, Epoch(block as u64 - 1)).unwrap();
        }
    }
    done.store(true, Ordering::Release);
    reader.join().unwrap();
}
