//! Shared fixtures: builds database files with hand-laid-out tree pages,
//! since the engine's public surface intentionally has no insert path.

use std::path::{Path, PathBuf};

use burrowdb::storage::{
    Meta, PageMut, BRANCH_ELEMENT_SIZE, BRANCH_PAGE_FLAG, LEAF_ELEMENT_SIZE, LEAF_PAGE_FLAG,
};
use burrowdb::Db;

pub type Item<'a> = (&'a [u8], &'a [u8]);

pub fn write_leaf_page(buf: &mut [u8], pgid: u64, items: &[Item<'_>]) {
    let mut page = PageMut::new(buf).unwrap();
    page.set_id(pgid);
    page.set_flags(LEAF_PAGE_FLAG);
    page.set_count(items.len() as u16);

    let body = page.body_mut();
    let mut koff = items.len() * LEAF_ELEMENT_SIZE;
    for (i, (key, value)) in items.iter().enumerate() {
        let off = i * LEAF_ELEMENT_SIZE;
        body[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
        body[off + 4..off + 8].copy_from_slice(&((koff - off) as u32).to_le_bytes());
        body[off + 8..off + 12].copy_from_slice(&(key.len() as u32).to_le_bytes());
        body[off + 12..off + 16].copy_from_slice(&(value.len() as u32).to_le_bytes());
        body[koff..koff + key.len()].copy_from_slice(key);
        koff += key.len();
        body[koff..koff + value.len()].copy_from_slice(value);
        koff += value.len();
    }
}

pub fn write_branch_page(buf: &mut [u8], pgid: u64, children: &[(&[u8], u64)]) {
    let mut page = PageMut::new(buf).unwrap();
    page.set_id(pgid);
    page.set_flags(BRANCH_PAGE_FLAG);
    page.set_count(children.len() as u16);

    let body = page.body_mut();
    let mut koff = children.len() * BRANCH_ELEMENT_SIZE;
    for (i, (key, child)) in children.iter().enumerate() {
        let off = i * BRANCH_ELEMENT_SIZE;
        body[off..off + 4].copy_from_slice(&((koff - off) as u32).to_le_bytes());
        body[off + 4..off + 8].copy_from_slice(&(key.len() as u32).to_le_bytes());
        body[off + 8..off + 16].copy_from_slice(&child.to_le_bytes());
        body[koff..koff + key.len()].copy_from_slice(key);
        koff += key.len();
    }
}

/// Creates a database at `path` whose tree holds the given leaves. One leaf
/// becomes the root; several become children of a branch root, with each
/// leaf's first key as its separator.
pub fn build_db(path: &Path, leaves: &[&[Item<'_>]]) -> PathBuf {
    let page_size = {
        let db = Db::open(path).unwrap();
        db.page_size()
    };

    let mut buf = std::fs::read(path).unwrap();
    if leaves.len() == 1 {
        write_leaf_page(&mut buf[3 * page_size..4 * page_size], 3, leaves[0]);
    } else {
        let n = leaves.len();
        buf.resize((4 + n) * page_size, 0);

        let mut children: Vec<(&[u8], u64)> = Vec::new();
        for (i, items) in leaves.iter().enumerate() {
            children.push((items[0].0, 4 + i as u64));
            let off = (4 + i) * page_size;
            write_leaf_page(&mut buf[off..off + page_size], 4 + i as u64, items);
        }
        write_branch_page(&mut buf[3 * page_size..4 * page_size], 3, &children);

        // The metas must account for the extra pages.
        for slot in 0..2u64 {
            let meta = Meta::new(page_size as u32, 3, 2, (4 + n) as u64, slot);
            let start = slot as usize * page_size;
            let mut page = PageMut::new(&mut buf[start..start + page_size]).unwrap();
            meta.write_to(&mut page, slot);
        }
    }
    std::fs::write(path, &buf).unwrap();
    path.to_path_buf()
}

/// Collects every key reachable by a forward scan.
#[allow(dead_code)]
pub fn scan_keys(db: &Db) -> Vec<Vec<u8>> {
    let tx = db.begin().unwrap();
    let mut cursor = tx.cursor().unwrap();
    let mut keys = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((key, _)) = entry {
        keys.push(key);
        entry = cursor.next().unwrap();
    }
    keys
}
