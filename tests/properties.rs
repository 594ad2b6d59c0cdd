//! Property tests for revoke and solidify.

use chainkv::{Cursor, KeyValueStore, RevokingEngine, SnapshotManager, UndoLogManager};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
enum Op {
    Put(u8, u8),
    Delete(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..16, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        (0u8..16).prop_map(Op::Delete),
    ]
}

/// Epochs of writes, each a short list of ops over a small key space.
fn epochs() -> impl Strategy<Value = Vec<Vec<Op>>> {
    prop::collection::vec(prop::collection::vec(op(), 0..12), 1..8)
}

fn apply<S: KeyValueStore>(store: &S, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Put(k, v) => store.put(&[*k], &[*v]).unwrap(),
            Op::Delete(k) => store.delete(&[*k]).unwrap(),
        }
    }
}

fn model(initial: &[(u8, u8)], epochs: &[Vec<Op>]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut state: BTreeMap<Vec<u8>, Vec<u8>> =
        initial.iter().map(|(k, v)| (vec![*k], vec![*v])).collect();
    for op in epochs.iter().flatten() {
        match op {
            Op::Put(k, v) => {
                state.insert(vec![*k], vec![*v]);
            }
            Op::Delete(k) => {
                state.remove(&vec![*k]);
            }
        }
    }
    state
}

fn seeded<E: RevokingEngine>(engine: &E, initial: &[(u8, u8)]) -> E::Store {
    let store = engine.register_store("account").unwrap();
    for (k, v) in initial {
        store.put(&[*k], &[*v]).unwrap();
    }
    store
}

proptest! {
    #[test]
    fn prop_n_revokes_restore_root(
        initial in prop::collection::vec((0u8..16, any::<u8>()), 0..10),
        epochs in epochs(),
    ) {
        let engine = SnapshotManager::in_memory();
        let store = seeded(&engine, &initial);
        let before = store.iter().unwrap();

        for ops in &epochs {
            engine.advance_all().unwrap();
            apply(&store, ops);
        }
        for _ in &epochs {
            engine.revoke().unwrap();
        }

        prop_assert_eq!(store.iter().unwrap(), before);
        prop_assert_eq!(engine.depth(), 0);
    }

    #[test]
    fn prop_solidify_is_transparent(
        initial in prop::collection::vec((0u8..16, any::<u8>()), 0..10),
        epochs in epochs(),
        fold in 0usize..8,
    ) {
        let engine = SnapshotManager::in_memory();
        let store = seeded(&engine, &initial);
        for ops in &epochs {
            engine.advance_all().unwrap();
            apply(&store, ops);
        }
        engine.advance_all().unwrap();

        let before = store.digest(Cursor::Head).unwrap();
        let count = fold.min(epochs.len());
        prop_assert_eq!(engine.solidify(count).unwrap(), count);

        prop_assert_eq!(store.digest(Cursor::Head).unwrap(), before);
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model(&initial, &epochs).into_iter().collect();
        prop_assert_eq!(store.iter().unwrap(), expected);

        // The root now holds exactly the folded epochs.
        let folded: Vec<(Vec<u8>, Vec<u8>)> =
            model(&initial, &epochs[..count]).into_iter().collect();
        prop_assert_eq!(store.iter_at(Cursor::Solid).unwrap(), folded);
    }

    #[test]
    fn prop_captured_layers_survive_solidify(
        initial in prop::collection::vec((0u8..16, any::<u8>()), 0..10),
        epochs in epochs(),
        fold in 0usize..8,
    ) {
        let engine = SnapshotManager::in_memory();
        let store = seeded(&engine, &initial);

        // One capture per epoch, starting with the root.
        let mut captured = vec![store.at(Cursor::Head).unwrap()];
        for ops in &epochs {
            engine.advance_all().unwrap();
            apply(&store, ops);
            captured.push(store.at(Cursor::Head).unwrap());
        }
        engine.advance_all().unwrap();

        let count = fold.min(epochs.len());
        prop_assert_eq!(engine.solidify(count).unwrap(), count);

        for (epoch, layer) in captured.iter().enumerate() {
            let expected: Vec<(Vec<u8>, Vec<u8>)> =
                model(&initial, &epochs[..epoch]).into_iter().collect();
            prop_assert_eq!(layer.iter().unwrap(), expected);
        }
    }

    #[test]
    fn prop_advance_put_revoke(
        initial in prop::collection::vec((0u8..16, any::<u8>()), 0..10),
        key in 0u8..16,
        value in any::<u8>(),
    ) {
        for undo_log in [false, true] {
            let (before, after) = if undo_log {
                let engine = UndoLogManager::in_memory();
                let store = seeded(&engine, &initial);
                let before = store.get(&[key]).unwrap();
                engine.advance_all().unwrap();
                store.put(&[key], &[value]).unwrap();
                engine.revoke().unwrap();
                (before, store.get(&[key]).unwrap())
            } else {
                let engine = SnapshotManager::in_memory();
                let store = seeded(&engine, &initial);
                let before = store.get(&[key]).unwrap();
                engine.advance_all().unwrap();
                store.put(&[key], &[value]).unwrap();
                engine.revoke().unwrap();
                (before, store.get(&[key]).unwrap())
            };
            prop_assert_eq!(before, after);
        }
    }

    #[test]
    fn prop_engines_agree(
        initial in prop::collection::vec((0u8..16, any::<u8>()), 0..10),
        epochs in epochs(),
        revokes in 0usize..8,
    ) {
        let layered = SnapshotManager::in_memory();
        let journal = UndoLogManager::in_memory();
        let a = seeded(&layered, &initial);
        let b = seeded(&journal, &initial);

        for ops in &epochs {
            layered.advance_all().unwrap();
            journal.advance_all().unwrap();
            apply(&a, ops);
            apply(&b, ops);
        }
        for _ in 0..revokes.min(epochs.len()) {
            layered.revoke().unwrap();
            journal.revoke().unwrap();
        }

        prop_assert_eq!(a.iter().unwrap(), b.iter().unwrap());
        prop_assert_eq!(layered.head_epoch(), journal.head_epoch());
    }
}
