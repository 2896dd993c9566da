#![cfg(test)]

// Property tests for the table variants kept inside the crate so they can
// observe pool accounting directly.
//
// Both properties run a random operation sequence against a model map and
// check, after every step:
// - presence parity: an entry is findable iff the model says so, and the
//   handle identity is stable while the entry is in the map;
// - accounting parity: `len`, `in_use` and `available` agree with the
//   model and never exceed the object limit;
// - reclaim: a handle stops resolving exactly when the model reclaims it.

use crate::{Error, Handle, Int32Table, StringTable, TableConfig};
use proptest::prelude::*;
use std::collections::HashMap;

const LIMIT: u32 = 4;

fn config(name: &str) -> TableConfig {
    TableConfig {
        name: name.to_string(),
        object_size: 64,
        object_limit: LIMIT,
        shard_count: 4,
    }
}

#[derive(Clone, Debug)]
enum Op {
    MustGet(usize),
    TryGet(usize),
    Release(usize),
    Delete(usize),
}

fn arb_ops(keys: usize) -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        (0..keys).prop_map(Op::MustGet),
        (0..keys).prop_map(Op::TryGet),
        (0..keys).prop_map(Op::Release),
        (0..keys).prop_map(Op::Delete),
    ];
    proptest::collection::vec(op, 1..120)
}

// Int32Table reclaims at refcount zero, so the model only ever holds
// entries with outstanding references: key -> (handle, refs).
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_int32_state_machine(ops in arb_ops(6)) {
        let table = Int32Table::new(config("prop-int32"), None, None).unwrap();
        let mut live: HashMap<i32, (Handle, u32)> = HashMap::new();

        for op in ops {
            match op {
                Op::MustGet(i) => {
                    let k = i as i32;
                    match live.get_mut(&k) {
                        Some((h, refs)) => {
                            let (h2, created) = table.must_get(k).unwrap();
                            prop_assert!(!created, "existing key must not be re-created");
                            prop_assert_eq!(h2, *h, "handle identity stable while live");
                            *refs += 1;
                        }
                        None => {
                            if live.len() == LIMIT as usize {
                                // Every entry has holders: nothing is evictable.
                                prop_assert!(matches!(table.must_get(k), Err(Error::Exhausted)));
                            } else {
                                let (h, created) = table.must_get(k).unwrap();
                                prop_assert!(created);
                                // Creators hold two references.
                                live.insert(k, (h, 2));
                            }
                        }
                    }
                }
                Op::TryGet(i) => {
                    let k = i as i32;
                    match live.get_mut(&k) {
                        Some((h, refs)) => {
                            prop_assert_eq!(table.try_get(k), Some(*h));
                            *refs += 1;
                        }
                        None => prop_assert!(table.try_get(k).is_none()),
                    }
                }
                Op::Release(i) => {
                    let k = i as i32;
                    if let Some((h, refs)) = live.get_mut(&k) {
                        let h = *h;
                        *refs -= 1;
                        let reclaimed = *refs == 0;
                        if reclaimed {
                            live.remove(&k);
                        }
                        table.release(h);
                        if reclaimed {
                            prop_assert!(
                                table.entry(h).is_none(),
                                "last release must reclaim and invalidate the handle"
                            );
                        }
                    }
                }
                Op::Delete(i) => {
                    // Either the entry has holders or it is absent; both
                    // are no-ops for the int-keyed table.
                    table.delete(i as i32);
                }
            }

            prop_assert_eq!(table.len(), live.len());
            prop_assert_eq!(table.in_use(), live.len());
            prop_assert_eq!(table.available(), LIMIT as usize - live.len());
        }

        for (_k, (h, refs)) in live.drain() {
            for _ in 0..refs {
                table.release(h);
            }
        }
        prop_assert_eq!(table.len(), 0);
        prop_assert_eq!(table.available(), LIMIT as usize);
    }
}

// StringTable with the default deferred-reclaim policy parks entries at
// refcount zero, so the model tracks both live and parked entries. Parked
// entries are probed without side effects through `entry(h)`: eviction
// frees the slot and bumps the generation, so the old handle stops
// resolving.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_string_state_machine_deferred_reclaim(ops in arb_ops(6)) {
        let table = StringTable::new(config("prop-string"), None, None).unwrap();
        let mut live: HashMap<String, (Handle, u32)> = HashMap::new();
        let mut parked: HashMap<String, Handle> = HashMap::new();

        for op in ops {
            match op {
                Op::MustGet(i) => {
                    let key = format!("k{i}");
                    if let Some((h, refs)) = live.get_mut(&key) {
                        let (h2, completion) = table.must_get(&key).unwrap();
                        prop_assert!(completion.is_none());
                        prop_assert_eq!(h2, *h);
                        *refs += 1;
                    } else if let Some(h) = parked.remove(&key) {
                        let (h2, completion) = table.must_get(&key).unwrap();
                        prop_assert!(completion.is_none(), "parked entry is reused, not re-created");
                        prop_assert_eq!(h2, h, "parked entry retains its identity");
                        live.insert(key, (h, 1));
                    } else if live.len() + parked.len() == LIMIT as usize && parked.is_empty() {
                        prop_assert!(matches!(table.must_get(&key), Err(Error::Exhausted)));
                    } else {
                        let full = live.len() + parked.len() == LIMIT as usize;
                        let parked_before = parked.len();
                        let (h, completion) = table.must_get(&key).unwrap();
                        let completion = completion.expect("new entry must return a completion");
                        completion.complete();
                        live.insert(key, (h, 2));
                        if full {
                            // Exactly one quiescent entry must have been evicted.
                            parked.retain(|_k, ph| table.entry(*ph).is_some());
                            prop_assert_eq!(parked.len(), parked_before - 1);
                        }
                    }
                }
                Op::TryGet(i) => {
                    let key = format!("k{i}");
                    if let Some((h, refs)) = live.get_mut(&key) {
                        prop_assert_eq!(table.try_get(key.as_str()), Some(*h));
                        *refs += 1;
                    } else if let Some(h) = parked.remove(&key) {
                        prop_assert_eq!(table.try_get(key.as_str()), Some(h));
                        live.insert(key, (h, 1));
                    } else {
                        prop_assert!(table.try_get(key.as_str()).is_none());
                    }
                }
                Op::Release(i) => {
                    let key = format!("k{i}");
                    if let Some((h, refs)) = live.get_mut(&key) {
                        let h = *h;
                        *refs -= 1;
                        let quiescent = *refs == 0;
                        table.release(h);
                        if quiescent {
                            live.remove(&key);
                            // Deferred reclaim: the entry stays in the map.
                            prop_assert!(table.entry(h).is_some());
                            parked.insert(key, h);
                        }
                    }
                }
                Op::Delete(i) => {
                    let key = format!("k{i}");
                    table.delete(&key);
                    if let Some(h) = parked.remove(&key) {
                        prop_assert!(
                            table.entry(h).is_none(),
                            "delete must reclaim a quiescent entry"
                        );
                    }
                    // Live or absent keys: no-op.
                }
            }

            let expected = live.len() + parked.len();
            prop_assert_eq!(table.len(), expected);
            prop_assert_eq!(table.in_use(), expected);
            prop_assert_eq!(table.available(), LIMIT as usize - expected);
        }
    }
}
