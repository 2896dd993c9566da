// StringTable integration suite.
//
// The string-keyed variant differs from the int-keyed one in two ways:
// - must_get returns a deferred completion for newly created entries; the
//   shard write lock is held until the completion finishes (or drops), so
//   the creator can populate the payload before anyone can look it up.
// - release reclaims at zero only when release_requires_reclaim is set;
//   by default quiescent entries stay parked in the map for reuse and are
//   reclaimed by the evictor when the pool runs out of capacity.
use std::sync::Arc;

use slotcache::{Error, StringTable, TableConfig};

fn config(name: &str, object_limit: u32) -> TableConfig {
    TableConfig {
        name: name.to_string(),
        object_size: 96,
        object_limit,
        shard_count: 4,
    }
}

// Test: completion is Some exactly on creation.
// Verifies: found paths never return a completion; created entries hold
// two references once the completion runs.
#[test]
fn completion_returned_only_on_create() {
    let t = StringTable::new(config("two-phase", 2), None, None).unwrap();

    let (h, completion) = t.must_get("a").unwrap();
    let completion = completion.expect("first must_get creates");
    completion.complete();

    let (h2, completion) = t.must_get("a").unwrap();
    assert!(completion.is_none(), "found path returns no completion");
    assert_eq!(h, h2);
    assert_eq!(t.entry(h).unwrap().accessor_count(), 3);

    t.release(h);
    t.release(h);
    t.release(h2);
}

// Test: the creator populates the payload while the completion holds the
// shard write lock.
// Verifies: a subsequent lookup observes the initialized payload.
#[test]
fn payload_populated_under_completion_lock() {
    let t = StringTable::new(config("populate", 2), None, None).unwrap();

    let (h, completion) = t.must_get("blob").unwrap();
    let completion = completion.expect("created");
    unsafe { *t.entry(h).unwrap().payload_mut::<u64>() = 4242 };
    completion.complete();

    let g = t.try_get("blob").unwrap();
    assert_eq!(unsafe { *t.entry(g).unwrap().payload::<u64>() }, 4242);
    t.release(g);
    t.release(h);
    t.release(h);
}

// Test: dropping the completion without calling complete().
// Assumes: drop performs the final acquire and releases the write lock.
// Verifies: the table stays usable (no leaked lock) and the reference
// count matches the completed path.
#[test]
fn dropped_completion_releases_lock_and_acquires() {
    let t = StringTable::new(config("drop-completion", 2), None, None).unwrap();

    let (h, completion) = t.must_get("a").unwrap();
    drop(completion);

    // Would deadlock on the shard write lock if the drop leaked it.
    let g = t.try_get("a").unwrap();
    assert_eq!(g, h);
    assert_eq!(t.entry(h).unwrap().accessor_count(), 3);
    t.release(g);
    t.release(h);
    t.release(h);
}

// Test: deferred-reclaim policy (the default).
// Verifies: after the last release the entry stays in the map, and a
// later try_get returns a handle with the same identity.
#[test]
fn quiescent_entry_is_retained_and_reused() {
    let t = StringTable::new(config("retain", 2), None, None).unwrap();
    assert!(!t.release_requires_reclaim());

    let (h, completion) = t.must_get("a").unwrap();
    completion.unwrap().complete();
    t.release(h);
    t.release(h);

    assert_eq!(t.len(), 1, "quiescent entry stays in the map");
    assert_eq!(t.entry(h).unwrap().accessor_count(), 0);

    let g = t.try_get("a").unwrap();
    assert_eq!(g, h, "reused entry retains its identity");
    t.release(g);
}

// Test: release_requires_reclaim = true.
// Verifies: the last release reclaims like the int-keyed table.
#[test]
fn reclaim_policy_reclaims_at_zero() {
    let t = StringTable::new(config("reclaim", 2), None, None).unwrap();
    t.set_release_requires_reclaim(true);
    assert!(t.release_requires_reclaim());

    let (h, completion) = t.must_get("a").unwrap();
    completion.unwrap().complete();
    t.release(h);
    assert_eq!(t.len(), 1);
    t.release(h);

    assert_eq!(t.len(), 0);
    assert!(t.entry(h).is_none());
    assert!(t.try_get("a").is_none());
    assert_eq!(t.available(), 2);
}

// Test: eviction under a full pool of quiescent entries.
// Assumes: the evictor scans shards in index order and delete re-validates
// under the write lock.
// Verifies: the new key is created, exactly one quiescent entry is
// reclaimed, and the pool never exceeds its limit.
#[test]
fn eviction_reclaims_one_quiescent_entry() {
    let t = StringTable::new(config("evict", 2), None, None).unwrap();

    for key in ["1", "2"] {
        let (h, completion) = t.must_get(key).unwrap();
        completion.unwrap().complete();
        t.release(h);
        t.release(h);
    }
    assert_eq!(t.in_use(), 2);
    assert_eq!(t.available(), 0);

    let (h3, completion) = t.must_get("3").unwrap();
    completion.expect("new entry under full pool").complete();

    assert_eq!(t.in_use(), 2, "pool size stays at the limit");
    assert_eq!(t.len(), 2);
    let survivor_1 = t.try_get("1");
    let survivor_2 = t.try_get("2");
    assert!(
        survivor_1.is_some() != survivor_2.is_some(),
        "exactly one of the quiescent entries must survive"
    );
    for probe in [survivor_1, survivor_2].into_iter().flatten() {
        t.release(probe);
    }
    t.release(h3);
    t.release(h3);
}

// Test: eviction starvation when every entry is held.
// Verifies: must_get surfaces Exhausted instead of spinning.
#[test]
fn must_get_exhausted_when_all_entries_held() {
    let t = StringTable::new(config("held", 2), None, None).unwrap();
    let (h1, c1) = t.must_get("a").unwrap();
    c1.unwrap().complete();
    let (h2, c2) = t.must_get("b").unwrap();
    c2.unwrap().complete();

    assert!(matches!(t.must_get("c"), Err(Error::Exhausted)));

    for h in [h1, h2] {
        t.release(h);
        t.release(h);
    }
}

// Test: delete semantics across the three entry states.
// Verifies: absent and held are no-ops; quiescent is reclaimed.
#[test]
fn delete_only_reclaims_quiescent_entries() {
    let t = StringTable::new(config("delete", 2), None, None).unwrap();

    t.delete("missing");

    let (h, completion) = t.must_get("a").unwrap();
    completion.unwrap().complete();
    t.delete("a");
    assert_eq!(t.len(), 1, "delete of a held entry is a no-op");

    t.release(h);
    t.release(h);
    assert_eq!(t.len(), 1, "deferred reclaim parks the entry");
    t.delete("a");
    assert_eq!(t.len(), 0);
    assert!(t.entry(h).is_none());
    assert_eq!(t.available(), 2);
}

// Test: before_release runs for evicted entries too.
// Verifies: the hook observes the entry (key still readable) exactly once
// per reclaim, whether through delete, release-at-zero, or eviction.
#[test]
fn before_release_runs_on_eviction() {
    use std::sync::Mutex;
    let reclaimed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let hook = {
        let reclaimed = Arc::clone(&reclaimed);
        Box::new(move |e: slotcache::EntryRef<'_, String>| {
            reclaimed.lock().unwrap().push(e.key().clone());
        }) as slotcache::BeforeReleaseFn<String>
    };

    let t = StringTable::new(config("hook-evict", 1), None, Some(hook)).unwrap();
    let (h, c) = t.must_get("old").unwrap();
    c.unwrap().complete();
    t.release(h);
    t.release(h);
    assert!(reclaimed.lock().unwrap().is_empty(), "parked, not reclaimed");

    let (h2, c2) = t.must_get("new").unwrap();
    c2.unwrap().complete();
    assert_eq!(reclaimed.lock().unwrap().as_slice(), &["old".to_string()]);

    t.release(h2);
    t.release(h2);
}

// Test: borrowed lookups.
// Verifies: stored String keys are queried with &str.
#[test]
fn borrowed_lookup_with_str() {
    let t = StringTable::new(config("borrow", 2), None, None).unwrap();
    let (h, c) = t.must_get("hello").unwrap();
    c.unwrap().complete();

    assert!(t.try_get("world").is_none());
    let g = t.try_get("hello").unwrap();
    assert_eq!(t.entry(g).unwrap().key(), "hello");

    t.release(g);
    t.release(h);
    t.release(h);
}

#[test]
fn name_is_reported() {
    let t = StringTable::new(config("path-cache", 2), None, None).unwrap();
    assert_eq!(t.name(), "path-cache");
}
