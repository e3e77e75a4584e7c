use strum_macros::{Display, EnumString};

/// What to do when an inconsistency is found.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FixErrors {
    /// Repair without asking.
    Yes,
    /// Report only.
    No,
    /// Give up on the first error.
    Exit,
}

/// Mount options.
#[derive(Clone, Debug)]
pub struct Opts {
    pub read_only: bool,
    /// Policy for counter-mismatch class errors; structural-integrity class
    /// errors fail regardless unless explicitly set to `Yes`.
    pub fix_errors: FixErrors,
    /// Assumed average on-disk inode footprint, used to estimate available
    /// inodes from free space.
    pub avg_inode_bytes: u32,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            read_only: false,
            fix_errors: FixErrors::Yes,
            avg_inode_bytes: 64,
        }
    }
}
