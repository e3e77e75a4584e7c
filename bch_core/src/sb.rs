//! The superblock: filesystem identity, member devices, and the registry of
//! replicas entries known to hold data.
//!
//! The registry is what makes degraded mounts safe to reason about: every
//! replicas entry with a nonzero counter must be registered here before the
//! commit that creates it completes, so mount can tell whether all data is
//! reachable from the devices present.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accounting::ReplicasEntry;
use crate::errcode::{BchResult, Errcode};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Member {
    /// Bucket size in sectors.
    pub bucket_size: u32,
    pub nbuckets: u64,
    pub first_bucket: u64,
}

impl Member {
    pub fn usable_buckets(&self) -> u64 {
        self.nbuckets - self.first_bucket
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuperBlock {
    pub uuid: Uuid,
    pub members: Vec<Member>,
    /// Registered replicas entries, kept sorted by canonical form.
    pub replicas: Vec<ReplicasEntry>,
}

impl SuperBlock {
    pub fn new(members: Vec<Member>) -> Self {
        SuperBlock {
            uuid: Uuid::new_v4(),
            members,
            replicas: Vec::new(),
        }
    }

    pub fn member(&self, dev: u8) -> Option<&Member> {
        self.members.get(dev as usize)
    }

    /// Capacity in sectors across all members.
    pub fn capacity(&self) -> u64 {
        self.members
            .iter()
            .map(|m| m.usable_buckets() * m.bucket_size as u64)
            .sum()
    }

    pub fn replicas_marked(&self, e: &ReplicasEntry) -> bool {
        self.replicas.iter().any(|r| r == e)
    }

    /// Structural validation against the member list.
    pub fn replicas_entry_validate(&self, e: &ReplicasEntry) -> BchResult<()> {
        e.validate()?;
        for dev in &e.devs {
            if self.member(*dev).is_none() {
                return Err(Errcode::Inval);
            }
        }
        Ok(())
    }

    /// Register a replicas entry; validates first, idempotent.
    pub fn mark_replicas(&mut self, e: &ReplicasEntry) -> BchResult<()> {
        self.replicas_entry_validate(e)?;
        if !self.replicas_marked(e) {
            log::debug!("marking replicas {}", e);
            self.replicas.push(e.clone());
            self.replicas.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_usage::DataType;

    fn sb() -> SuperBlock {
        SuperBlock::new(vec![
            Member { bucket_size: 8, nbuckets: 128, first_bucket: 4 },
            Member { bucket_size: 8, nbuckets: 64, first_bucket: 4 },
        ])
    }

    fn user_entry(devs: Vec<u8>) -> ReplicasEntry {
        ReplicasEntry { data_type: DataType::User, nr_required: 1, devs }
    }

    #[test]
    fn capacity_excludes_reserved_buckets() {
        assert_eq!(sb().capacity(), (124 + 60) * 8);
    }

    #[test]
    fn mark_is_idempotent() {
        let mut sb = sb();
        let e = user_entry(vec![0, 1]);
        assert!(!sb.replicas_marked(&e));
        sb.mark_replicas(&e).unwrap();
        sb.mark_replicas(&e).unwrap();
        assert!(sb.replicas_marked(&e));
        assert_eq!(sb.replicas.len(), 1);
    }

    #[test]
    fn mark_rejects_unknown_devices() {
        let mut sb = sb();
        assert_eq!(sb.mark_replicas(&user_entry(vec![0, 7])), Err(Errcode::Inval));
        assert!(sb.replicas.is_empty());
    }
}
