use stratadb::{
    CommitOutcome, EnvFlags, Environment, Error, Preserved, Tree, TreeFlags, ValueBuf,
    WriteFlags,
};
use tempfile::TempDir;

fn setup_env() -> (TempDir, Environment) {
    let dir = TempDir::new().unwrap();
    let env = Environment::new()
        .unwrap()
        .open(dir.path().join("data.strata"), EnvFlags::empty())
        .unwrap();
    (dir, env)
}

#[test]
fn test_replace_captures_previous_value_from_clean_page() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    tree.put(&txn, b"k", b"old", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    // The committed page is clean for the next writer, so the previous
    // value survives the copy-on-write as a stable borrow.
    let txn = env.begin_txn().unwrap();
    let mut backing = [0u8; 16];
    let mut old = ValueBuf::new(&mut backing);
    let preserved = tree
        .replace(&txn, b"k", Some(b"new"), &mut old, WriteFlags::empty())
        .unwrap();
    assert_eq!(preserved, Preserved::Stable(&b"old"[..]));
    assert_eq!(tree.get(&txn, b"k").unwrap(), b"new");
    // The stable borrow still reads the pre-call bytes.
    assert_eq!(preserved.bytes(&old), Some(&b"old"[..]));
}

#[test]
fn test_replace_copies_previous_value_from_dirty_page() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    // Written in this transaction: the page is dirty and may be
    // rewritten by the update, so the old bytes must be copied out.
    tree.put(&txn, b"k", b"old", WriteFlags::empty()).unwrap();

    let mut backing = [0u8; 16];
    let mut old = ValueBuf::new(&mut backing);
    let preserved = tree
        .replace(&txn, b"k", Some(b"new"), &mut old, WriteFlags::empty())
        .unwrap();
    assert_eq!(preserved, Preserved::Copied);
    assert_eq!(old.filled(), b"old");
    assert_eq!(tree.get(&txn, b"k").unwrap(), b"new");
}

#[test]
fn test_replace_inserts_when_absent() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();

    let mut backing = [0u8; 16];
    let mut old = ValueBuf::new(&mut backing);
    let preserved = tree
        .replace(&txn, b"k", Some(b"v"), &mut old, WriteFlags::empty())
        .unwrap();
    assert_eq!(preserved, Preserved::Absent);
    assert_eq!(preserved.bytes(&old), None);
    assert_eq!(tree.get(&txn, b"k").unwrap(), b"v");

    // With CURRENT an absent key is an error instead.
    let mut old = ValueBuf::new(&mut backing);
    assert!(matches!(
        tree.replace(&txn, b"missing", Some(b"v"), &mut old, WriteFlags::CURRENT),
        Err(Error::NotFound)
    ));
}

#[test]
fn test_replace_delete_mode() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    tree.put(&txn, b"k", b"bye", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_txn().unwrap();
    let mut backing = [0u8; 16];
    let mut old = ValueBuf::new(&mut backing);
    let preserved = tree
        .replace(&txn, b"k", None, &mut old, WriteFlags::CURRENT)
        .unwrap();
    assert_eq!(preserved.bytes(&old), Some(&b"bye"[..]));
    assert_eq!(tree.get(&txn, b"k"), Err(Error::NotFound));

    // Delete mode without CURRENT is malformed.
    let mut old = ValueBuf::new(&mut backing);
    assert!(matches!(
        tree.replace(&txn, b"k", None, &mut old, WriteFlags::empty()),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn test_replace_equal_value_is_noop() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    tree.put(&txn, b"k", b"same", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_txn().unwrap();
    let mut backing = [0u8; 16];
    let mut old = ValueBuf::new(&mut backing);
    let preserved = tree
        .replace(&txn, b"k", Some(b"same"), &mut old, WriteFlags::empty())
        .unwrap();
    assert_eq!(preserved, Preserved::Stable(&b"same"[..]));
    // No structural mutation happened: the transaction is still clean.
    assert_eq!(txn.commit().unwrap(), CommitOutcome::NothingToCommit);
}

#[test]
fn test_replace_buffer_too_small_leaves_store_untouched() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    tree.put(&txn, b"k", b"a-long-previous-value", WriteFlags::empty())
        .unwrap();

    let mut backing = [0u8; 4];
    let mut old = ValueBuf::new(&mut backing);
    assert_eq!(
        tree.replace(&txn, b"k", Some(b"new"), &mut old, WriteFlags::empty()),
        Err(Error::ResultTrue)
    );
    assert_eq!(old.required(), b"a-long-previous-value".len());
    // The failed preserve aborted the call before any mutation.
    assert_eq!(tree.get(&txn, b"k").unwrap(), b"a-long-previous-value");
}

#[test]
fn test_replace_no_overwrite_reports_existing() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    tree.put(&txn, b"k", b"held", WriteFlags::empty()).unwrap();

    let mut backing = [0u8; 16];
    let mut old = ValueBuf::new(&mut backing);
    assert_eq!(
        tree.replace(&txn, b"k", Some(b"new"), &mut old, WriteFlags::NO_OVERWRITE),
        Err(Error::KeyExist)
    );
    assert_eq!(old.filled(), b"held");
    assert_eq!(tree.get(&txn, b"k").unwrap(), b"held");
}

#[test]
fn test_replace_with_custom_preserver() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    tree.put(&txn, b"k", b"seen", WriteFlags::empty()).unwrap();

    let mut captured = Vec::new();
    let mut backing = [0u8; 16];
    let mut old = ValueBuf::new(&mut backing);
    let mut preserver = |_target: &mut ValueBuf<'_>, src: &[u8]| -> stratadb::Result<()> {
        captured.extend_from_slice(src);
        Ok(())
    };
    tree.replace_with(
        &txn,
        b"k",
        Some(b"new"),
        &mut old,
        WriteFlags::empty(),
        &mut preserver,
    )
    .unwrap();
    assert_eq!(captured, b"seen");
    assert_eq!(tree.get(&txn, b"k").unwrap(), b"new");
}

#[test]
fn test_replace_selects_duplicate() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, Some("dups"), TreeFlags::CREATE | TreeFlags::DUP_SORT).unwrap();
    for value in [&b"1"[..], b"2", b"3"] {
        tree.put(&txn, b"a", value, WriteFlags::empty()).unwrap();
    }

    // Replace duplicate "2" with "9".
    let mut backing = *b"2";
    let mut selection = ValueBuf::with_filled(&mut backing, 1);
    tree.replace(
        &txn,
        b"a",
        Some(b"9"),
        &mut selection,
        WriteFlags::CURRENT | WriteFlags::NO_OVERWRITE,
    )
    .unwrap();
    assert_eq!(tree.get_with_count(&txn, b"a").unwrap(), (&b"1"[..], 3));
    assert_eq!(tree.delete(&txn, b"a", Some(b"2")), Err(Error::NotFound));

    // Delete duplicate "3" via the same selection mode.
    let mut backing = *b"3";
    let mut selection = ValueBuf::with_filled(&mut backing, 1);
    tree.replace(
        &txn,
        b"a",
        None,
        &mut selection,
        WriteFlags::CURRENT | WriteFlags::NO_OVERWRITE,
    )
    .unwrap();
    assert_eq!(tree.get_with_count(&txn, b"a").unwrap(), (&b"1"[..], 2));

    // Selecting a duplicate that does not exist fails.
    let mut backing = *b"7";
    let mut selection = ValueBuf::with_filled(&mut backing, 1);
    assert!(matches!(
        tree.replace(
            &txn,
            b"a",
            Some(b"8"),
            &mut selection,
            WriteFlags::CURRENT | WriteFlags::NO_OVERWRITE,
        ),
        Err(Error::NotFound)
    ));

    // Selection mode is meaningless without dup-sort.
    let plain = Tree::open(&txn, None, TreeFlags::empty()).unwrap();
    plain.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();
    let mut backing = *b"v";
    let mut selection = ValueBuf::with_filled(&mut backing, 1);
    assert!(matches!(
        plain.replace(
            &txn,
            b"k",
            Some(b"w"),
            &mut selection,
            WriteFlags::CURRENT | WriteFlags::NO_OVERWRITE,
        ),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn test_replace_multivalue_requires_selection() {
    let (_dir, env) = setup_env();
    let txn = env.begin_txn().unwrap();
    let tree = Tree::open(&txn, Some("dups"), TreeFlags::CREATE | TreeFlags::DUP_SORT).unwrap();
    tree.put(&txn, b"a", b"1", WriteFlags::empty()).unwrap();
    tree.put(&txn, b"a", b"2", WriteFlags::empty()).unwrap();

    let mut backing = [0u8; 16];
    let mut old = ValueBuf::new(&mut backing);
    assert!(matches!(
        tree.replace(&txn, b"a", Some(b"9"), &mut old, WriteFlags::CURRENT),
        Err(Error::MultiValue)
    ));
}
