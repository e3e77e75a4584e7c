use std::fmt;

/// Error codes used throughout the filesystem core.
///
/// Codes come in two classes: internal codes (`TransactionRestart`,
/// `NeedMarkReplicas`) that are consumed by the commit loop and must never
/// escape a transaction boundary, and surfaced codes that translate to OS
/// errnos at the outermost API via [`Errcode::to_errno`].
///
/// Specific codes refine a generic parent (e.g. `NoentNotSubvol` refines
/// `Noent`); `matches()` compares against the parent class, mirroring how
/// call sites usually only care about the class.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Errcode {
    /// Internal: the transaction must be retried from the top.
    TransactionRestart,
    /// Internal: commit must mark a replicas entry in the superblock, then retry.
    NeedMarkReplicas,
    /// Counter vector or table allocation failed.
    NomemDiskAccounting,
    /// Cached inode allocation failed.
    NomemInodeCache,
    Noent,
    /// Unlink with `deleting_subvol` on an inode that isn't a subvolume root.
    NoentNotSubvol,
    /// Path walk hit an inode with no back-pointer.
    NoentInodeNoBackpointer,
    /// Dirent resolved to an inode that doesn't exist.
    NoentDirentToMissingInode,
    /// A dirent's target inode doesn't point back at it.
    NoentDirentToMissingBackpointer,
    Exist,
    /// Cross-subvolume link or rename.
    Xdev,
    NotDir,
    NotEmpty,
    /// nlink would overflow, or the inode is unlinked/immutable.
    Mlink,
    Perm,
    Nospc,
    /// The subvolume or the whole filesystem is read-only.
    Rofs,
    /// Export handle no longer resolves.
    Stale,
    Inval,
    /// Structural inconsistency; recoverable only via the fsck channel.
    FsckErrors,
    /// Unrecoverable I/O or internal failure; triggers emergency read-only.
    Io,
}

pub use Errcode::*;

impl Errcode {
    /// Class comparison: specific codes match their generic parent.
    pub fn matches(self, class: Errcode) -> bool {
        if self == class {
            return true;
        }
        match class {
            Noent => matches!(
                self,
                NoentNotSubvol
                    | NoentInodeNoBackpointer
                    | NoentDirentToMissingInode
                    | NoentDirentToMissingBackpointer
            ),
            TransactionRestart => self == NeedMarkReplicas,
            _ => false,
        }
    }

    /// True for codes the commit loop consumes; these must never be surfaced.
    pub fn is_internal(self) -> bool {
        matches!(self, TransactionRestart | NeedMarkReplicas)
    }

    /// Translate to the platform error code for the outermost API boundary.
    pub fn to_errno(self) -> i32 {
        match self {
            TransactionRestart | NeedMarkReplicas => libc::EAGAIN,
            NomemDiskAccounting | NomemInodeCache => libc::ENOMEM,
            Noent
            | NoentNotSubvol
            | NoentInodeNoBackpointer
            | NoentDirentToMissingInode
            | NoentDirentToMissingBackpointer => libc::ENOENT,
            Exist => libc::EEXIST,
            Xdev => libc::EXDEV,
            NotDir => libc::ENOTDIR,
            NotEmpty => libc::ENOTEMPTY,
            Mlink => libc::EMLINK,
            Perm => libc::EPERM,
            Nospc => libc::ENOSPC,
            Rofs => libc::EROFS,
            Stale => libc::ESTALE,
            Inval => libc::EINVAL,
            FsckErrors | Io => libc::EIO,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TransactionRestart => "transaction_restart",
            NeedMarkReplicas => "transaction_restart_mark_replicas",
            NomemDiskAccounting => "ENOMEM_disk_accounting",
            NomemInodeCache => "ENOMEM_inode_cache",
            Noent => "ENOENT",
            NoentNotSubvol => "ENOENT_not_subvol",
            NoentInodeNoBackpointer => "ENOENT_inode_no_backpointer",
            NoentDirentToMissingInode => "ENOENT_dirent_to_missing_inode",
            NoentDirentToMissingBackpointer => "ENOENT_dirent_to_missing_backpointer",
            Exist => "EEXIST",
            Xdev => "EXDEV",
            NotDir => "ENOTDIR",
            NotEmpty => "ENOTEMPTY",
            Mlink => "EMLINK",
            Perm => "EPERM",
            Nospc => "ENOSPC",
            Rofs => "EROFS",
            Stale => "ESTALE",
            Inval => "EINVAL",
            FsckErrors => "fsck_errors_not_fixed",
            Io => "EIO",
        }
    }
}

impl fmt::Display for Errcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_internal() || matches!(self, FsckErrors) {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{} ({})", self.name(), errno::Errno(self.to_errno()))
        }
    }
}

impl std::error::Error for Errcode {}

pub type BchResult<T> = Result<T, Errcode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_codes_match_their_class() {
        assert!(NoentNotSubvol.matches(Noent));
        assert!(NoentInodeNoBackpointer.matches(Noent));
        assert!(Noent.matches(Noent));
        assert!(!Noent.matches(NoentNotSubvol));
        assert!(NeedMarkReplicas.matches(TransactionRestart));
        assert!(!Exist.matches(Noent));
    }

    #[test]
    fn internal_codes_never_map_to_fs_errnos() {
        for e in [TransactionRestart, NeedMarkReplicas] {
            assert!(e.is_internal());
            assert_eq!(e.to_errno(), libc::EAGAIN);
        }
        assert!(!Noent.is_internal());
    }

    #[test]
    fn errno_translation() {
        assert_eq!(Xdev.to_errno(), libc::EXDEV);
        assert_eq!(NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(Rofs.to_errno(), libc::EROFS);
        assert_eq!(Stale.to_errno(), libc::ESTALE);
        assert_eq!(NomemDiskAccounting.to_errno(), libc::ENOMEM);
    }
}
