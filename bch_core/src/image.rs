//! Whole-filesystem images: the serialized form of the trees, superblock,
//! snapshot table and journal that the management tool reads and writes.
//!
//! A clean image has an empty journal (everything flushed); a dirty image
//! carries pending journal keys and relies on mount-time replay.

use serde::{Deserialize, Serialize};

use crate::bkey::BkeyI;
use crate::btree::BtreeId;
use crate::errcode::BchResult;
use crate::fs::Fs;
use crate::journal::{Journal, JournalKey};
use crate::opts::Opts;
use crate::sb::SuperBlock;
use crate::snapshot::SnapshotTable;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Image {
    pub sb: SuperBlock,
    pub snapshots: SnapshotTable,
    pub journal_seq: u64,
    pub journal: Vec<JournalKey>,
    pub clean: bool,
    pub inodes: Vec<BkeyI>,
    pub dirents: Vec<BkeyI>,
    pub xattrs: Vec<BkeyI>,
    pub subvolumes: Vec<BkeyI>,
    pub accounting: Vec<BkeyI>,
}

/// Capture the filesystem state. `clean` flushes the write buffer and
/// empties the journal first — the clean-shutdown path.
pub fn fs_to_image(fs: &Fs, clean: bool) -> Image {
    if clean {
        fs.unmount_clean();
    }

    Image {
        sb: fs.sb.read().clone(),
        snapshots: fs.snapshots.read().clone(),
        journal_seq: fs.journal.cur_seq(),
        journal: fs.journal.keys.lock().clone(),
        clean,
        inodes: fs.btree.keys(BtreeId::Inodes),
        dirents: fs.btree.keys(BtreeId::Dirents),
        xattrs: fs.btree.keys(BtreeId::Xattrs),
        subvolumes: fs.btree.keys(BtreeId::Subvolumes),
        accounting: fs.btree.keys(BtreeId::Accounting),
    }
}

/// Open an image: assemble the handle, load the trees, run mount-time
/// recovery (accounting replay included).
pub fn image_open(img: Image, opts: Opts) -> BchResult<Fs> {
    let fs = Fs::assemble(
        img.sb,
        img.snapshots,
        Journal::from_parts(img.journal_seq, img.journal),
        opts,
    )?;

    fs.btree.load(BtreeId::Inodes, img.inodes);
    fs.btree.load(BtreeId::Dirents, img.dirents);
    fs.btree.load(BtreeId::Xattrs, img.xattrs);
    fs.btree.load(BtreeId::Subvolumes, img.subvolumes);
    fs.btree.load(BtreeId::Accounting, img.accounting);

    fs.mount_finish()?;
    Ok(fs)
}
