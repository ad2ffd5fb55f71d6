//! Group bookkeeping: a named, addressable subset of the session's players.

use ahash::HashSet;

use crate::GroupId;

/// A group as tracked locally. Note that membership here is this peer's
/// *view* of the group; `GROUP_JOIN`/`GROUP_LEAVE` flows are linearised by
/// the target player, not by the group, so different peers can briefly
/// disagree before the join/leave broadcast reaches them.
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub data: Vec<u8>,
    pub flags: u32,
    pub context: u64,
    pub members: HashSet<crate::PlayerId>,
    /// Set once `GROUP_DESTROY` has been processed; the id is retired and
    /// must never be reused even if a stale message for it arrives late.
    pub destroyed: bool,
}

impl Group {
    pub fn new(id: GroupId, name: String, data: Vec<u8>, flags: u32) -> Self {
        Self {
            id,
            name,
            data,
            flags,
            context: 0,
            members: HashSet::default(),
            destroyed: false,
        }
    }
}
