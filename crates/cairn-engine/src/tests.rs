//! End-to-end engine scenarios.
//!
//! These drive the public surface the serving layer consumes: open an
//! engine on scratch directories, run commands, reopen, and check that the
//! observable state is what a client would have seen.

use bytes::Bytes;
use tempfile::TempDir;
use test_case::test_case;

use crate::{
    DatasetError, Engine, EngineError, IndexMode, NamespaceId, Reply, Settings, StorageError,
};

fn test_settings(dir: &TempDir) -> Settings {
    Settings {
        datapath: dir.path().join("data"),
        indexpath: dir.path().join("index"),
        bucket_bits: 8,
        ..Settings::default()
    }
}

fn open(dir: &TempDir) -> Engine {
    Engine::open(test_settings(dir)).unwrap()
}

fn entry(key: &[u8], payload: &[u8]) -> Reply {
    Reply::Entry {
        key: key.to_vec(),
        payload: Bytes::copy_from_slice(payload),
    }
}

// ============================================================================
// Basic operations
// ============================================================================

#[test]
fn basic_put_get_exists_del_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);

    let ns = engine.namespace_create("A", None).unwrap();

    assert_eq!(engine.set(ns, b"hello", b"world"), Reply::Buffer(b"hello".to_vec()));
    assert_eq!(engine.get(ns, b"hello"), entry(b"hello", b"world"));
    assert_eq!(engine.exists(ns, b"hello"), Reply::True);
    assert_eq!(engine.check(ns, b"hello"), Reply::True);

    assert_eq!(engine.del(ns, b"hello"), Reply::Success);
    assert_eq!(engine.get(ns, b"hello"), Reply::Deleted);
    assert_eq!(engine.exists(ns, b"hello"), Reply::False);
    assert_eq!(engine.del(ns, b"hello"), Reply::Deleted);
}

#[test]
fn get_of_unknown_key_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    assert_eq!(engine.get(ns, b"missing"), Reply::NotFound);
    assert_eq!(engine.exists(ns, b"missing"), Reply::False);
    assert_eq!(engine.check(ns, b"missing"), Reply::NotFound);
    assert_eq!(engine.del(ns, b"missing"), Reply::NotFound);
}

#[test_case(1)]
#[test_case(255)]
fn key_length_boundaries_round_trip(length: usize) {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    let key = vec![0xab; length];
    assert_eq!(engine.set(ns, &key, b"payload"), Reply::Buffer(key.clone()));
    assert_eq!(engine.get(ns, &key), entry(&key, b"payload"));
}

#[test]
fn empty_key_is_rejected_in_userkey_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    assert!(matches!(engine.set(ns, b"", b"payload"), Reply::Failure(_)));
}

#[test]
fn oversized_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    let key = vec![1u8; 256];
    assert!(matches!(engine.set(ns, &key, b"payload"), Reply::Failure(_)));
}

#[test]
fn empty_payload_is_stored_and_distinct_from_absent() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    assert_eq!(engine.set(ns, b"empty", b""), Reply::Buffer(b"empty".to_vec()));
    assert_eq!(engine.get(ns, b"empty"), entry(b"empty", b""));
    assert_eq!(engine.exists(ns, b"empty"), Reply::True);
    assert_eq!(engine.check(ns, b"empty"), Reply::True);
}

#[test]
fn overwrite_returns_the_new_payload() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    engine.set(ns, b"key", b"first");
    engine.set(ns, b"key", b"second payload");
    assert_eq!(engine.get(ns, b"key"), entry(b"key", b"second payload"));

    let stats = engine.namespace_stats(ns).unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.datasize, 14);
}

#[test]
fn set_after_delete_revives_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    engine.set(ns, b"key", b"v1");
    assert_eq!(engine.del(ns, b"key"), Reply::Success);
    assert_eq!(engine.set(ns, b"key", b"v2"), Reply::Buffer(b"key".to_vec()));
    assert_eq!(engine.get(ns, b"key"), entry(b"key", b"v2"));

    let stats = engine.namespace_stats(ns).unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.datasize, 2);
}

// ============================================================================
// CRC dedup
// ============================================================================

#[test]
fn identical_rewrite_is_up_to_date_and_appends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_create("A", None).unwrap();

    assert_eq!(engine.set(ns, b"k", b"v1"), Reply::Buffer(b"k".to_vec()));

    let index_path = engine.namespace(ns).unwrap().index.active_path();
    let data_path = engine.namespace(ns).unwrap().data.active_path();
    let index_size = std::fs::metadata(&index_path).unwrap().len();
    let data_size = std::fs::metadata(&data_path).unwrap().len();

    assert_eq!(engine.set(ns, b"k", b"v1"), Reply::UpToDate);

    assert_eq!(std::fs::metadata(&index_path).unwrap().len(), index_size);
    assert_eq!(std::fs::metadata(&data_path).unwrap().len(), data_size);
}

#[test]
fn same_length_different_content_is_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    engine.set(ns, b"k", b"aaaa");
    assert_eq!(engine.set(ns, b"k", b"bbbb"), Reply::Buffer(b"k".to_vec()));
    assert_eq!(engine.get(ns, b"k"), entry(b"k", b"bbbb"));
}

// ============================================================================
// Rotation
// ============================================================================

#[test]
fn crossing_the_datasize_threshold_rotates_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(Settings {
        datasize: 1024,
        ..test_settings(&dir)
    })
    .unwrap();
    let ns = engine.namespace_default();

    let payload = [0x5a; 300];
    for key in [&b"k1"[..], b"k2", b"k3", b"k4"] {
        assert_eq!(engine.set(ns, key, &payload), Reply::Buffer(key.to_vec()));
    }

    let namespace = engine.namespace(ns).unwrap();
    assert!(namespace.data.path_for(crate::FileId::new(0)).is_file());
    assert!(namespace.data.path_for(crate::FileId::new(1)).is_file());
    assert!(namespace.index.path_for(crate::FileId::new(1)).is_file());
    assert!(!namespace.data.path_for(crate::FileId::new(2)).is_file());

    // the crossing entry landed entirely in the new file
    assert_eq!(engine.get(ns, b"k4"), entry(b"k4", &payload));
    assert_eq!(engine.get(ns, b"k1"), entry(b"k1", &payload));
}

// ============================================================================
// Sequential mode
// ============================================================================

fn sequential_engine(dir: &TempDir) -> (Engine, NamespaceId) {
    let mut engine = open(dir);
    let ns = engine
        .namespace_create("seq", Some(IndexMode::Sequential))
        .unwrap();
    (engine, ns)
}

#[test]
fn sequential_inserts_return_monotonic_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, ns) = sequential_engine(&dir);

    assert_eq!(engine.set(ns, b"", b"first"), Reply::Buffer(0u32.to_le_bytes().to_vec()));
    assert_eq!(engine.set(ns, b"", b"second"), Reply::Buffer(1u32.to_le_bytes().to_vec()));

    assert_eq!(engine.get(ns, &0u32.to_le_bytes()), entry(&0u32.to_le_bytes(), b"first"));
    assert_eq!(engine.get(ns, &1u32.to_le_bytes()), entry(&1u32.to_le_bytes(), b"second"));
}

#[test]
fn sequential_insert_with_unknown_key_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, ns) = sequential_engine(&dir);

    assert_eq!(engine.set(ns, &7u32.to_le_bytes(), b"nope"), Reply::InsertDenied);
    // a key of the wrong width cannot name an id either
    assert_eq!(engine.set(ns, b"abc", b"nope"), Reply::InsertDenied);
}

#[test]
fn sequential_update_keeps_the_id_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, ns) = sequential_engine(&dir);

    let id0 = 0u32.to_le_bytes();
    assert_eq!(engine.set(ns, b"", b"a"), Reply::Buffer(id0.to_vec()));
    assert_eq!(engine.set(ns, &id0, b"b"), Reply::Buffer(id0.to_vec()));

    assert_eq!(engine.get(ns, &id0), entry(&id0, b"b"));

    // latest version first, then its predecessor, then the chain ends
    let latest = engine.history_get(ns, &id0).unwrap();
    assert_eq!(&latest.payload[..], b"b");
    let token = latest.parent.expect("updated key has a parent");

    let previous = engine.history_next(ns, &id0, &token).unwrap();
    assert_eq!(&previous.payload[..], b"a");
    assert_eq!(previous.parent, None);

    // the next insert skips the shadow slot of the update
    assert_eq!(engine.set(ns, b"", b"c"), Reply::Buffer(2u32.to_le_bytes().to_vec()));
    assert_eq!(engine.get(ns, &2u32.to_le_bytes()), entry(&2u32.to_le_bytes(), b"c"));
}

#[test]
fn sequential_delete_flags_the_slot() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, ns) = sequential_engine(&dir);

    let id0 = 0u32.to_le_bytes();
    engine.set(ns, b"", b"payload");
    assert_eq!(engine.del(ns, &id0), Reply::Success);
    assert_eq!(engine.get(ns, &id0), Reply::Deleted);

    // a deleted id cannot be updated
    assert_eq!(engine.set(ns, &id0, b"again"), Reply::InsertDenied);

    let stats = engine.namespace_stats(ns).unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.datasize, 0);
}

#[test]
fn sequential_state_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let id0 = 0u32.to_le_bytes();

    {
        let (mut engine, ns) = sequential_engine(&dir);
        engine.set(ns, b"", b"a");
        engine.set(ns, b"", b"bb");
        engine.set(ns, &id0, b"ccc");
        engine.close();
    }

    let mut engine = open(&dir);
    let ns = engine.namespace_get("seq").unwrap();

    assert_eq!(engine.namespace(ns).unwrap().mode(), IndexMode::Sequential);
    assert_eq!(engine.get(ns, &id0), entry(&id0, b"ccc"));
    assert_eq!(engine.get(ns, &1u32.to_le_bytes()), entry(&1u32.to_le_bytes(), b"bb"));

    // ids carry on after the replayed shadow entry
    assert_eq!(engine.set(ns, b"", b"dd"), Reply::Buffer(3u32.to_le_bytes().to_vec()));
}

// ============================================================================
// History (user-key mode)
// ============================================================================

#[test]
fn history_walks_every_version_of_a_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    engine.set(ns, b"key", b"v1");
    engine.set(ns, b"key", b"v2-longer");
    engine.set(ns, b"key", b"v3");

    let mut payloads = Vec::new();
    let mut step = engine.history_get(ns, b"key").unwrap();
    payloads.push(step.payload.to_vec());

    while let Some(token) = step.parent {
        step = engine.history_next(ns, b"key", &token).unwrap();
        payloads.push(step.payload.to_vec());
    }

    assert_eq!(payloads, vec![b"v3".to_vec(), b"v2-longer".to_vec(), b"v1".to_vec()]);
}

#[test]
fn history_token_of_another_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    engine.set(ns, b"key", b"v1");
    engine.set(ns, b"key", b"v2");
    engine.set(ns, b"other", b"x");

    let token = engine.history_get(ns, b"key").unwrap().parent.unwrap();
    assert!(matches!(
        engine.history_next(ns, b"other", &token),
        Err(DatasetError::InvalidCursor)
    ));
}

// ============================================================================
// Scan
// ============================================================================

#[test]
fn scan_returns_live_entries_in_write_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    for key in [&b"a"[..], b"b", b"c", b"d"] {
        engine.set(ns, key, b"payload");
    }
    engine.del(ns, b"b");

    let page = engine.scan(ns, None).unwrap();
    let keys: Vec<_> = page.items.iter().map(|item| item.key.clone()).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);

    // the page consumed everything; continuing reports the end
    assert!(matches!(
        engine.scan(ns, Some(&page.cursor)),
        Err(DatasetError::NoMoreData)
    ));

    let page = engine.rscan(ns, None).unwrap();
    let keys: Vec<_> = page.items.iter().map(|item| item.key.clone()).collect();
    assert_eq!(keys, vec![b"d".to_vec(), b"c".to_vec(), b"a".to_vec()]);
}

#[test]
fn scan_cursor_continues_after_a_known_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    for key in [&b"one"[..], b"two", b"three"] {
        engine.set(ns, key, b"payload");
    }

    let cursor = engine.key_cursor(ns, b"one").unwrap();
    let page = engine.scan(ns, Some(&cursor)).unwrap();
    let keys: Vec<_> = page.items.iter().map(|item| item.key.clone()).collect();
    assert_eq!(keys, vec![b"two".to_vec(), b"three".to_vec()]);
}

#[test]
fn crafted_scan_cursors_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    engine.set(ns, b"key", b"payload");
    let mut cursor = engine.key_cursor(ns, b"key").unwrap();

    // wrong size
    assert!(matches!(
        engine.scan(ns, Some(&cursor[..10])),
        Err(DatasetError::InvalidCursor)
    ));

    // tampered CRC field
    cursor[11] ^= 0xff;
    assert!(matches!(
        engine.scan(ns, Some(&cursor)),
        Err(DatasetError::InvalidCursor)
    ));

    assert!(matches!(
        engine.scan(ns, Some(b"garbage-cursor!")),
        Err(DatasetError::InvalidCursor)
    ));
}

#[test]
fn scan_of_an_empty_namespace_has_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    assert!(matches!(engine.scan(ns, None), Err(DatasetError::NoMoreData)));
    assert!(matches!(engine.rscan(ns, None), Err(DatasetError::NoMoreData)));
}

// ============================================================================
// Quota
// ============================================================================

#[test]
fn quota_rejects_net_growth_but_admits_shrinking_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_create("limited", None).unwrap();
    engine.namespace_set_maxsize(ns, 10).unwrap();

    assert_eq!(engine.set(ns, b"k", b"0123456789"), Reply::Buffer(b"k".to_vec()));

    // at exactly maxsize, growth is denied
    assert!(matches!(engine.set(ns, b"other", b"x"), Reply::Failure(_)));

    // overwriting with a shorter payload frees space
    assert_eq!(engine.set(ns, b"k", b"01234"), Reply::Buffer(b"k".to_vec()));
    assert_eq!(engine.set(ns, b"other", b"x"), Reply::Buffer(b"other".to_vec()));

    // and the quota is enforced again on the next growth
    assert!(matches!(engine.set(ns, b"third", b"xxxxx"), Reply::Failure(_)));
}

// ============================================================================
// Permissions: worm, locks
// ============================================================================

#[test]
fn worm_forbids_overwrite_and_delete_but_not_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_create("archive", None).unwrap();

    engine.set(ns, b"kept", b"forever");
    engine.namespace_set_worm(ns, true).unwrap();

    assert!(matches!(engine.set(ns, b"kept", b"changed"), Reply::Failure(_)));
    assert!(matches!(engine.del(ns, b"kept"), Reply::Failure(_)));

    // new keys are still welcome
    assert_eq!(engine.set(ns, b"new", b"data"), Reply::Buffer(b"new".to_vec()));
    assert_eq!(engine.get(ns, b"kept"), entry(b"kept", b"forever"));
}

#[test]
fn locked_namespace_serves_reads_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    engine.set(ns, b"key", b"value");
    engine.namespace_lock(ns).unwrap();

    assert!(matches!(engine.set(ns, b"key", b"other"), Reply::Failure(_)));
    assert!(matches!(engine.del(ns, b"key"), Reply::Failure(_)));
    assert_eq!(engine.get(ns, b"key"), entry(b"key", b"value"));

    engine.namespace_unlock(ns).unwrap();
    assert_eq!(engine.set(ns, b"key", b"other"), Reply::Buffer(b"key".to_vec()));
}

#[test]
fn frozen_namespace_denies_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);
    let ns = engine.namespace_default();

    engine.set(ns, b"key", b"value");
    engine.namespace_freeze(ns).unwrap();

    assert!(matches!(engine.get(ns, b"key"), Reply::Failure(_)));
    assert!(matches!(engine.set(ns, b"key", b"x"), Reply::Failure(_)));

    engine.namespace_unfreeze(ns).unwrap();
    assert_eq!(engine.get(ns, b"key"), entry(b"key", b"value"));
}

// ============================================================================
// Namespace lifecycle
// ============================================================================

#[test]
fn namespace_names_are_validated_and_unique() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);

    engine.namespace_create("valid", None).unwrap();
    assert!(matches!(
        engine.namespace_create("valid", None),
        Err(EngineError::AlreadyExists)
    ));

    for invalid in ["", ".", "..", "a/b", "default"] {
        assert!(matches!(
            engine.namespace_create(invalid, None),
            Err(EngineError::InvalidName)
        ));
    }
}

#[test]
fn deleted_namespace_disappears_from_disk_and_memory() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);

    let ns = engine.namespace_create("temp", None).unwrap();
    engine.set(ns, b"key", b"value");

    let indexpath = engine.namespace(ns).unwrap().indexpath.clone();
    engine.namespace_delete(ns).unwrap();

    assert!(!indexpath.exists());
    assert!(engine.namespace_get("temp").is_none());
    assert!(matches!(engine.get(ns, b"key"), Reply::Failure(_)));

    // the default namespace is untouchable
    let default = engine.namespace_default();
    assert!(matches!(
        engine.namespace_delete(default),
        Err(EngineError::DefaultProtected)
    ));
}

#[test]
fn flush_requires_a_protected_private_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);

    let ns = engine.namespace_create("wipeme", None).unwrap();
    engine.set(ns, b"key", b"value");

    // public and passwordless: denied
    assert!(matches!(engine.namespace_flush(ns), Err(EngineError::FlushDenied)));

    engine.namespace_set_password(ns, Some("secret")).unwrap();
    engine.namespace_set_public(ns, false).unwrap();

    engine.namespace_flush(ns).unwrap();
    assert_eq!(engine.get(ns, b"key"), Reply::NotFound);

    // the descriptor survived the wipe
    let ns_ref = engine.namespace(ns).unwrap();
    assert!(ns_ref.is_password_protected());
    assert!(!ns_ref.is_public());
}

#[test]
fn reload_preserves_the_namespace_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);

    let ns = engine.namespace_create("reloadable", None).unwrap();
    engine.set(ns, b"key", b"value");

    engine.namespace_reload(ns).unwrap();

    // the same handle keeps working
    assert_eq!(engine.get(ns, b"key"), entry(b"key", b"value"));
    assert_eq!(engine.namespace_stats(ns).unwrap().entries, 1);
}

#[test]
fn mode_switch_is_limited_to_fresh_namespaces() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(&dir);

    let ns = engine.namespace_create("switchable", None).unwrap();
    assert!(engine.namespace(ns).unwrap().is_fresh());

    engine.namespace_set_mode(ns, IndexMode::Sequential).unwrap();
    assert_eq!(engine.namespace(ns).unwrap().mode(), IndexMode::Sequential);

    engine.set(ns, b"", b"payload");
    assert!(!engine.namespace(ns).unwrap().is_fresh());
    assert!(matches!(
        engine.namespace_set_mode(ns, IndexMode::UserKey),
        Err(EngineError::NotFresh)
    ));
}

#[test]
fn descriptor_changes_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut engine = open(&dir);
        let ns = engine.namespace_create("tuned", None).unwrap();
        engine.namespace_set_password(ns, Some("hunter2")).unwrap();
        engine.namespace_set_public(ns, false).unwrap();
        engine.namespace_set_worm(ns, true).unwrap();
        engine.namespace_set_maxsize(ns, 1 << 33).unwrap();
        engine.close();
    }

    let engine = {
        let mut engine = open(&dir);
        let ns = engine.namespace_get("tuned").unwrap();
        let namespace = engine.namespace(ns).unwrap();

        assert!(namespace.password_matches(Some("hunter2")));
        assert!(!namespace.password_matches(Some("wrong")));
        assert!(!namespace.password_matches(None));
        assert!(!namespace.is_public());
        assert!(namespace.is_worm());
        assert_eq!(namespace.maxsize(), 1 << 33);
        engine
    };
    engine.close();
}

// ============================================================================
// Reload equivalence
// ============================================================================

#[test]
fn mixed_workload_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let key = |i: usize| format!("key-{i:04}").into_bytes();
    let payload = |i: usize| format!("payload-{i}-{}", "x".repeat(i % 97)).into_bytes();

    let live_count = {
        let mut engine = open(&dir);
        let ns = engine.namespace_default();

        for i in 0..1000 {
            // keys repeat, so a good share of the sets are overwrites
            assert!(!engine.set(ns, &key(i % 400), &payload(i)).is_failure());
        }

        for i in 0..200 {
            assert_eq!(engine.del(ns, &key(i)), Reply::Success);
        }

        let stats = engine.namespace_stats(ns).unwrap();
        engine.close();
        stats.entries
    };
    assert_eq!(live_count, 200);

    let mut engine = open(&dir);
    let ns = engine.namespace_default();
    assert_eq!(engine.namespace_stats(ns).unwrap().entries, live_count);

    // every surviving key returns its last written payload
    for i in 200..400 {
        let expected = payload(i + 400);
        assert_eq!(engine.get(ns, &key(i)), entry(&key(i), &expected));
    }

    // deleted keys are still gone
    for i in 0..200 {
        assert_eq!(engine.get(ns, &key(i)), Reply::Deleted);
    }
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

    /// Keys and payloads are opaque bytes: anything within the length
    /// bounds must round-trip, CRC included.
    #[test]
    fn arbitrary_binary_keys_and_payloads_round_trip(
        key in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..=255),
        payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..2048),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open(&dir);
        let ns = engine.namespace_default();

        proptest::prop_assert_eq!(engine.set(ns, &key, &payload), Reply::Buffer(key.clone()));
        proptest::prop_assert_eq!(engine.get(ns, &key), entry(&key, &payload));
        proptest::prop_assert_eq!(engine.check(ns, &key), Reply::True);
    }
}

// ============================================================================
// Corruption and locking
// ============================================================================

#[test]
fn corrupted_namespace_does_not_take_the_instance_down() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut engine = open(&dir);
        let ns = engine.namespace_create("broken", None).unwrap();
        engine.set(ns, b"key", b"value");

        let default = engine.namespace_default();
        engine.set(default, b"safe", b"payload");
        engine.close();
    }

    // truncate the middle of the namespace's first index header
    let index_file = dir.path().join("index").join("broken").join("zdb-index-00000");
    let file = std::fs::OpenOptions::new().write(true).open(&index_file).unwrap();
    file.set_len(17).unwrap();
    drop(file);

    let mut engine = open(&dir);

    // the broken namespace is not served
    assert!(engine.namespace_get("broken").is_none());

    // live queries on other namespaces succeed
    let default = engine.namespace_default();
    assert_eq!(engine.get(default, b"safe"), entry(b"safe", b"payload"));
    assert_eq!(engine.set(default, b"more", b"data"), Reply::Buffer(b"more".to_vec()));
}

#[test]
fn second_instance_on_the_same_directories_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);

    let denied = Engine::open(test_settings(&dir));
    assert!(matches!(
        denied,
        Err(EngineError::Storage(StorageError::Locked { .. }))
    ));

    drop(engine);
    Engine::open(test_settings(&dir)).unwrap().close();
}

#[test]
fn same_data_and_index_path_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        datapath: dir.path().join("same"),
        indexpath: dir.path().join("same"),
        bucket_bits: 8,
        ..Settings::default()
    };

    assert!(matches!(
        Engine::open(settings),
        Err(EngineError::Settings(crate::SettingsError::SamePaths))
    ));
}
