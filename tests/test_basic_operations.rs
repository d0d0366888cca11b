use stratadb::{
    CommitOutcome, EnvFlags, Environment, Error, Tree, TreeFlags, WriteFlags,
};
use tempfile::TempDir;

// Common test setup
fn setup_env() -> (TempDir, Environment) {
    let dir = TempDir::new().unwrap();
    let env = Environment::new()
        .unwrap()
        .open(dir.path().join("data.strata"), EnvFlags::empty())
        .unwrap();
    (dir, env)
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    tree.put(&txn, b"test_key", b"test_value", WriteFlags::empty())
        .unwrap();
    // Read-your-writes inside the same transaction.
    assert_eq!(tree.get(&txn, b"test_key").unwrap(), b"test_value");
    assert_eq!(txn.commit().unwrap(), CommitOutcome::Committed);

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(tree.get(&txn, b"test_key").unwrap(), b"test_value");
}

#[test]
fn test_get_missing_key() {
    let (_dir, env) = setup_env();
    let txn = env.begin_ro_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    assert_eq!(tree.get(&txn, b"nope"), Err(Error::NotFound));
}

#[test]
fn test_empty_key_is_invalid() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    assert_eq!(
        tree.put(&txn, b"", b"v", WriteFlags::empty()),
        Err(Error::InvalidArgument)
    );
    assert_eq!(tree.get(&txn, b""), Err(Error::InvalidArgument));
}

#[test]
fn test_no_overwrite_reports_key_exist() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    tree.put(&txn, b"unique_key", b"value1", WriteFlags::empty())
        .unwrap();
    assert_eq!(
        tree.put(&txn, b"unique_key", b"value2", WriteFlags::NO_OVERWRITE),
        Err(Error::KeyExist)
    );
    // Plain put overwrites.
    tree.put(&txn, b"unique_key", b"value2", WriteFlags::empty())
        .unwrap();
    assert_eq!(tree.get(&txn, b"unique_key").unwrap(), b"value2");
}

#[test]
fn test_unknown_put_flags_rejected() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    let bogus = WriteFlags::from_bits_retain(0x8000_0000);
    assert_eq!(
        tree.put(&txn, b"k", b"v", bogus),
        Err(Error::InvalidArgument)
    );
    // MULTIPLE is recognized but has no fixed-size-dup mode behind it.
    assert_eq!(
        tree.put(&txn, b"k", b"v", WriteFlags::MULTIPLE),
        Err(Error::InvalidArgument)
    );
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    tree.put(&txn, b"delete_key", b"delete_value", WriteFlags::empty())
        .unwrap();
    tree.delete(&txn, b"delete_key", None).unwrap();
    assert_eq!(tree.get(&txn, b"delete_key"), Err(Error::NotFound));

    // Deleting what is not there is NotFound, exact-pair mismatch too.
    assert_eq!(tree.delete(&txn, b"delete_key", None), Err(Error::NotFound));
    tree.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();
    assert_eq!(
        tree.delete(&txn, b"k", Some(b"other")),
        Err(Error::NotFound)
    );
    tree.delete(&txn, b"k", Some(b"v")).unwrap();
    assert_eq!(tree.get(&txn, b"k"), Err(Error::NotFound));
}

#[test]
fn test_get_equal_or_greater() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    for key in [&b"apple"[..], b"banana", b"cherry"] {
        tree.put(&txn, key, b"fruit", WriteFlags::empty()).unwrap();
    }

    let (key, value) = tree.get_equal_or_greater(&txn, b"b").unwrap();
    assert_eq!(key, b"banana");
    assert_eq!(value, b"fruit");

    let (key, _) = tree.get_equal_or_greater(&txn, b"banana").unwrap();
    assert_eq!(key, b"banana");

    assert_eq!(
        tree.get_equal_or_greater(&txn, b"zebra"),
        Err(Error::NotFound)
    );
}

#[test]
fn test_append_requires_order() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    tree.put(&txn, b"aaa", b"1", WriteFlags::APPEND).unwrap();
    tree.put(&txn, b"bbb", b"2", WriteFlags::APPEND).unwrap();
    assert_eq!(
        tree.put(&txn, b"abc", b"3", WriteFlags::APPEND),
        Err(Error::KeyExist)
    );
}

#[test]
fn test_reserve_zero_fills() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    tree.put(&txn, b"reserved", &[0xffu8; 8], WriteFlags::RESERVE)
        .unwrap();
    assert_eq!(tree.get(&txn, b"reserved").unwrap(), &[0u8; 8]);
}

#[test]
fn test_overflow_value_roundtrip() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    // Large enough to span several overflow pages.
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    tree.put(&txn, b"big", &big, WriteFlags::empty()).unwrap();
    assert_eq!(tree.get(&txn, b"big").unwrap(), &big[..]);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(tree.get(&txn, b"big").unwrap(), &big[..]);
}

#[test]
fn test_named_trees() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();

    // Missing without CREATE
    assert_eq!(
        Tree::open(&txn, Some("missing"), TreeFlags::empty()),
        Err(Error::NotFound)
    );

    let tree = Tree::open(&txn, Some("scores"), TreeFlags::CREATE).unwrap();
    tree.put(&txn, b"alice", b"10", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    // Visible by name after commit, including to readers.
    let txn = env.begin_ro_txn().unwrap();
    let reopened = Tree::open(&txn, Some("scores"), TreeFlags::empty()).unwrap();
    assert_eq!(reopened.id(), tree.id());
    assert_eq!(reopened.get(&txn, b"alice").unwrap(), b"10");

    // Readers cannot create.
    assert_eq!(
        Tree::open(&txn, Some("other"), TreeFlags::CREATE),
        Err(Error::Access)
    );
}

#[test]
fn test_tree_stat_counts_entries() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    let stat = tree.stat(&txn).unwrap();
    assert_eq!(stat.entries, 0);

    for i in 0..5 {
        let key = format!("key_{}", i);
        let value = format!("value_{}", i);
        tree.put(&txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty())
            .unwrap();
    }

    let stat = tree.stat(&txn).unwrap();
    assert_eq!(stat.entries, 5);
    assert_eq!(stat.keys, 5);
}

#[test]
fn test_meta_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.strata");

    let env = Environment::new()
        .unwrap()
        .open(&path, EnvFlags::empty())
        .unwrap();
    {
        let txn = env.begin_txn().unwrap();
        let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
        tree.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    let committed_txnid = env.info().unwrap().last_txnid;
    drop(env);

    let env = Environment::new()
        .unwrap()
        .open(&path, EnvFlags::empty())
        .unwrap();
    assert_eq!(env.info().unwrap().last_txnid, committed_txnid);
}

#[test]
fn test_env_info_tracks_commits() {
    let (_dir, env) = setup_env();
    let before = env.info().unwrap().last_txnid;

    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    tree.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, before + 1);
    assert!(info.last_pgno > 0);
}
