//! Commit, rollback, recovery and page-recycling behavior.

mod common;

use common::{build_db, scan_keys, Item};
use burrowdb::Db;

fn two_leaf_db(path: &std::path::Path) -> std::path::PathBuf {
    let left: &[Item<'_>] = &[(b"a", b"1"), (b"b", b"2")];
    let right: &[Item<'_>] = &[(b"c", b"3"), (b"d", b"4")];
    build_db(path, &[left, right])
}

#[test]
fn committed_deletes_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("persist.db"));

    {
        let db = Db::open(&path).unwrap();
        let tx = db.begin_rw().unwrap();
        {
            let mut cursor = tx.cursor().unwrap();
            cursor.seek(b"b").unwrap().unwrap();
            cursor.delete().unwrap();
        }
        tx.commit().unwrap();

        assert_eq!(scan_keys(&db), vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    let db = Db::open(&path).unwrap();
    assert_eq!(scan_keys(&db), vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);
}

#[test]
fn commit_frees_the_rewritten_pages() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("frees.db"));
    let db = Db::open(&path).unwrap();

    let tx = db.begin_rw().unwrap();
    {
        let mut cursor = tx.cursor().unwrap();
        cursor.seek(b"b").unwrap().unwrap();
        cursor.delete().unwrap();
    }
    tx.commit().unwrap();

    // Old root (3), old left leaf (4) and old freelist page (2) were all
    // rewritten copy-on-write; the untouched right leaf (5) was not.
    assert!(db.freed(2));
    assert!(db.freed(3));
    assert!(db.freed(4));
    assert!(!db.freed(5));
}

#[test]
fn rollback_discards_deletes_and_frees() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("rollback.db"));
    let db = Db::open(&path).unwrap();

    let tx = db.begin_rw().unwrap();
    {
        let mut cursor = tx.cursor().unwrap();
        cursor.seek(b"b").unwrap().unwrap();
        cursor.delete().unwrap();
    }
    tx.rollback().unwrap();

    assert_eq!(
        scan_keys(&db),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    );
    assert!(!db.freed(3));
    assert!(!db.freed(4));
}

#[test]
fn dropping_a_write_transaction_rolls_it_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("drop.db"));
    let db = Db::open(&path).unwrap();

    {
        let tx = db.begin_rw().unwrap();
        let mut cursor = tx.cursor().unwrap();
        cursor.seek(b"a").unwrap().unwrap();
        cursor.delete().unwrap();
    }

    assert_eq!(scan_keys(&db).first().unwrap(), b"a");
}

#[test]
fn readers_keep_their_snapshot_across_a_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("mvcc.db"));
    let db = Db::open(&path).unwrap();

    let reader = db.begin().unwrap();

    let tx = db.begin_rw().unwrap();
    {
        let mut cursor = tx.cursor().unwrap();
        cursor.seek(b"a").unwrap().unwrap();
        cursor.delete().unwrap();
    }
    tx.commit().unwrap();

    // The old reader still resolves the pre-commit tree.
    let mut cursor = reader.cursor().unwrap();
    let (k, _) = cursor.first().unwrap().unwrap();
    assert_eq!(k, b"a");

    // A new reader sees the commit.
    let fresh = db.begin().unwrap();
    let mut cursor = fresh.cursor().unwrap();
    let (k, _) = cursor.first().unwrap().unwrap();
    assert_eq!(k, b"b");
}

#[test]
fn released_pages_are_recycled_instead_of_growing_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("recycle.db"));
    let db = Db::open(&path).unwrap();

    let tx = db.begin_rw().unwrap();
    {
        let mut cursor = tx.cursor().unwrap();
        cursor.seek(b"b").unwrap().unwrap();
        cursor.delete().unwrap();
    }
    tx.commit().unwrap();

    let grown = std::fs::metadata(&path).unwrap().len();

    // With no readers pinning them, the freed pages satisfy the next
    // commit's allocations and the file stops growing.
    for _ in 0..5 {
        let tx = db.begin_rw().unwrap();
        tx.commit().unwrap();
    }

    assert_eq!(std::fs::metadata(&path).unwrap().len(), grown);
}

#[test]
fn torn_meta_falls_back_to_the_previous_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("torn.db"));

    {
        let db = Db::open(&path).unwrap();
        let tx = db.begin_rw().unwrap();
        {
            let mut cursor = tx.cursor().unwrap();
            cursor.seek(b"b").unwrap().unwrap();
            cursor.delete().unwrap();
        }
        tx.commit().unwrap();
    }

    // That commit had txid 2 and wrote meta slot 0. Tear it.
    let mut buf = std::fs::read(&path).unwrap();
    buf[40] ^= 0xFF;
    std::fs::write(&path, &buf).unwrap();

    let db = Db::open(&path).unwrap();
    assert_eq!(
        scan_keys(&db),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    );
}

#[test]
fn commit_of_a_read_only_transaction_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("rocommit.db"));
    let db = Db::open(&path).unwrap();

    let tx = db.begin().unwrap();
    let err = tx.commit().unwrap_err();
    assert_eq!(err.downcast_ref(), Some(&burrowdb::Error::TxNotWritable));
}

#[test]
fn transaction_ids_advance_with_each_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = two_leaf_db(&dir.path().join("txid.db"));
    let db = Db::open(&path).unwrap();

    for expected in 2..6u64 {
        let tx = db.begin_rw().unwrap();
        assert_eq!(tx.id(), expected);
        tx.commit().unwrap();
    }

    let reader = db.begin().unwrap();
    assert_eq!(reader.id(), 5);
}
