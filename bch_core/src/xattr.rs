//! Extended attributes, just enough to carry POSIX ACLs.
//!
//! ACL payloads are opaque bytes here; their encoding belongs to the
//! platform layer. Entries share the string-hash layout with dirents, keyed
//! by (inode, hash(name), snapshot).

use serde::{Deserialize, Serialize};

use crate::bkey::{KeyValue, SubvolInum};
use crate::btree::BtreeId;
use crate::errcode::BchResult;
use crate::str_hash::{self, HashDesc, HashInfo};
use crate::trans::BtreeTrans;

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Xattr {
    pub name: String,
    pub val: Vec<u8>,
}

pub const XATTR_HASH_DESC: HashDesc = HashDesc {
    btree: BtreeId::Xattrs,
    name_of: |v| match v {
        KeyValue::Xattr(x) => Some(&x.name),
        _ => None,
    },
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AclType {
    Access,
    Default,
}

impl AclType {
    pub fn xattr_name(self) -> &'static str {
        match self {
            AclType::Access => "system.posix_acl_access",
            AclType::Default => "system.posix_acl_default",
        }
    }
}

/// Store an ACL on an inode (at `snapshot`), replacing any existing one.
pub fn set_acl_trans(
    trans: &BtreeTrans,
    inum: SubvolInum,
    snapshot: u32,
    hash_info: &HashInfo,
    acl: &[u8],
    acl_type: AclType,
) -> BchResult<()> {
    let x = Xattr {
        name: acl_type.xattr_name().to_owned(),
        val: acl.to_vec(),
    };

    str_hash::hash_create(
        trans,
        &XATTR_HASH_DESC,
        hash_info,
        inum.inum,
        snapshot,
        KeyValue::Xattr(x),
        false,
    )?;
    Ok(())
}

/// Read an ACL back, if present.
pub fn get_acl_trans(
    trans: &BtreeTrans,
    inum: SubvolInum,
    snapshot: u32,
    hash_info: &HashInfo,
    acl_type: AclType,
) -> BchResult<Option<Vec<u8>>> {
    match str_hash::hash_lookup(
        trans,
        &XATTR_HASH_DESC,
        hash_info,
        inum.inum,
        snapshot,
        acl_type.xattr_name(),
    ) {
        Ok((_, k)) => match k.v {
            KeyValue::Xattr(x) => Ok(Some(x.val)),
            _ => Ok(None),
        },
        Err(crate::errcode::Errcode::Noent) => Ok(None),
        Err(e) => Err(e),
    }
}
