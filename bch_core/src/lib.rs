//! Core engine of a copy-on-write filesystem, in userspace: transactional
//! disk accounting, namespace mutation transactions, and the inode cache
//! binding them to callers.
//!
//! Everything hangs off an [`fs::Fs`] handle. Mutations run as retryable
//! transactions ([`trans::BtreeTrans`]) against in-memory storage trees with
//! snapshot visibility; accounting deltas ride the transaction's
//! write-buffer list and land in both the persistent accounting tree and a
//! per-CPU in-memory counter table kept consistent through commit, GC
//! recount, and mount-time journal replay.

pub mod accounting;
pub mod bkey;
pub mod btree;
pub mod dirent;
pub mod errcode;
pub mod eytzinger;
pub mod fid;
pub mod fs;
pub mod fs_common;
pub mod fs_usage;
pub mod image;
pub mod inode;
pub mod journal;
pub mod opts;
pub mod percpu;
pub mod sb;
pub mod snapshot;
pub mod str_hash;
pub mod subvolume;
pub mod trans;
pub mod vfs;
pub mod xattr;

pub use bkey::{BkeyI, Bpos, SubvolInum};
pub use errcode::{BchResult, Errcode};
pub use fs::Fs;
pub use opts::Opts;
