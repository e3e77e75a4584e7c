//! Export file handles: a stable reference to an inode that survives cache
//! eviction, optionally carrying the parent for disconnected-dentry
//! reconnection.

use crate::bkey::SubvolInum;
use crate::errcode::{BchResult, Errcode};
use crate::inode::InodeUnpacked;

pub const FILEID_WITHOUT_PARENT: u8 = 0x81;
pub const FILEID_WITH_PARENT: u8 = 0x82;

/// One handle: 4 x u32 on the wire (inum lo/hi, subvol, generation).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Fid {
    pub inum: u64,
    pub subvol: u32,
    pub gen: u32,
}

const FID_WORDS: usize = 4;

impl Fid {
    pub fn from_inode(inum: SubvolInum, bi: &InodeUnpacked) -> Self {
        Fid {
            inum: inum.inum,
            subvol: inum.subvol,
            gen: bi.bi_generation,
        }
    }

    fn write(self, out: &mut Vec<u32>) {
        out.push(self.inum as u32);
        out.push((self.inum >> 32) as u32);
        out.push(self.subvol);
        out.push(self.gen);
    }

    fn read(words: &[u32]) -> Self {
        Fid {
            inum: words[0] as u64 | ((words[1] as u64) << 32),
            subvol: words[2],
            gen: words[3],
        }
    }
}

/// Encode a handle; returns the type code and the raw words.
pub fn encode_fh(fid: Fid, parent: Option<Fid>) -> (u8, Vec<u32>) {
    let mut words = Vec::with_capacity(2 * FID_WORDS);
    fid.write(&mut words);

    match parent {
        Some(p) => {
            p.write(&mut words);
            (FILEID_WITH_PARENT, words)
        }
        None => (FILEID_WITHOUT_PARENT, words),
    }
}

/// Decode a handle. Unknown type codes and short buffers are stale handles,
/// not corruption.
pub fn decode_fh(fh_type: u8, words: &[u32]) -> BchResult<(Fid, Option<Fid>)> {
    match fh_type {
        FILEID_WITHOUT_PARENT if words.len() >= FID_WORDS => {
            Ok((Fid::read(words), None))
        }
        FILEID_WITH_PARENT if words.len() >= 2 * FID_WORDS => {
            Ok((Fid::read(words), Some(Fid::read(&words[FID_WORDS..]))))
        }
        _ => Err(Errcode::Stale),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_and_without_parent() {
        let f = Fid { inum: 0x1_0000_2222, subvol: 3, gen: 9 };
        let p = Fid { inum: 4096, subvol: 1, gen: 0 };

        let (ty, words) = encode_fh(f, None);
        assert_eq!(ty, FILEID_WITHOUT_PARENT);
        assert_eq!(decode_fh(ty, &words).unwrap(), (f, None));

        let (ty, words) = encode_fh(f, Some(p));
        assert_eq!(ty, FILEID_WITH_PARENT);
        assert_eq!(decode_fh(ty, &words).unwrap(), (f, Some(p)));
    }

    #[test]
    fn bad_handles_are_stale() {
        let f = Fid { inum: 1, subvol: 1, gen: 1 };
        let (ty, words) = encode_fh(f, None);
        assert_eq!(decode_fh(0x7f, &words), Err(Errcode::Stale));
        assert_eq!(decode_fh(ty, &words[..2]), Err(Errcode::Stale));
        assert_eq!(decode_fh(FILEID_WITH_PARENT, &words), Err(Errcode::Stale));
    }
}
