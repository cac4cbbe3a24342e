//! Tag and fid bookkeeping for one connection.
//!
//! Tags identify in-flight requests; fids are the protocol's file handles.
//! Both tables hand out values from a freed pool before advancing a
//! high-water cursor, and both reserve the protocol's sentinel value
//! (NOTAG / NOFID). All access happens under the connection mutex.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::proto::{OpenMode, Qid, NOFID, NOTAG};

// =============================================================================
// Tags
// =============================================================================

#[derive(Debug)]
pub(crate) enum TagEntry {
    /// A request owned by an operation; the reply routes to it.
    InFlight { op: u64 },
    /// A Tflush was issued for this tag: a genuine reply is discarded and
    /// the tag stays quarantined until the flush's own reply frees it.
    Flushing,
    /// The tag of a Tflush itself, remembering which tag it cancels.
    Flush { oldtag: u16 },
}

#[derive(Debug, Default)]
pub(crate) struct TagTable {
    entries: HashMap<u16, TagEntry>,
    free: Vec<u16>,
    next: u16,
}

impl TagTable {
    pub fn alloc(&mut self, op: u64) -> Result<u16> {
        let tag = self.next_tag()?;
        self.entries.insert(tag, TagEntry::InFlight { op });
        Ok(tag)
    }

    pub fn alloc_flush(&mut self, oldtag: u16) -> Result<u16> {
        let tag = self.next_tag()?;
        self.entries.insert(tag, TagEntry::Flush { oldtag });
        Ok(tag)
    }

    fn next_tag(&mut self) -> Result<u16> {
        if let Some(tag) = self.free.pop() {
            return Ok(tag);
        }
        if self.next == NOTAG {
            return Err(Error::Usage("tag space exhausted".into()));
        }
        let tag = self.next;
        self.next += 1;
        Ok(tag)
    }

    pub fn get(&self, tag: u16) -> Option<&TagEntry> {
        self.entries.get(&tag)
    }

    /// Release a tag back to the pool.
    pub fn free(&mut self, tag: u16) {
        if self.entries.remove(&tag).is_some() {
            self.free.push(tag);
        }
    }

    /// Quarantine a tag whose request is being flushed.
    pub fn set_flushing(&mut self, tag: u16) {
        if let Some(entry) = self.entries.get_mut(&tag) {
            *entry = TagEntry::Flushing;
        }
    }

    /// Every in-flight tag owned by the given operation.
    pub fn tags_of(&self, op: u64) -> Vec<u16> {
        self.entries
            .iter()
            .filter_map(|(tag, entry)| match entry {
                TagEntry::InFlight { op: owner } if *owner == op => Some(*tag),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.free.clear();
    }
}

// =============================================================================
// Fids
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FidState {
    /// Allocated locally; a walk naming it is outstanding.
    Reserved,
    /// Points at a file on the server.
    Bound { qid: Qid },
    /// Bound and opened for I/O.
    Open {
        qid: Qid,
        mode: OpenMode,
        iounit: u32,
    },
}

#[derive(Debug, Default)]
pub(crate) struct FidTable {
    fids: HashMap<u32, FidState>,
    free: Vec<u32>,
    next: u32,
}

impl FidTable {
    /// Allocate a fresh fid in the reserved state.
    pub fn alloc(&mut self) -> Result<u32> {
        let fid = if let Some(fid) = self.free.pop() {
            fid
        } else {
            if self.next == NOFID {
                return Err(Error::Usage("fid space exhausted".into()));
            }
            let fid = self.next;
            self.next += 1;
            fid
        };
        self.fids.insert(fid, FidState::Reserved);
        Ok(fid)
    }

    pub fn get(&self, fid: u32) -> Option<&FidState> {
        self.fids.get(&fid)
    }

    pub fn bind(&mut self, fid: u32, qid: Qid) -> Result<()> {
        match self.fids.get_mut(&fid) {
            Some(state @ (FidState::Reserved | FidState::Bound { .. })) => {
                *state = FidState::Bound { qid };
                Ok(())
            }
            Some(FidState::Open { .. }) => {
                Err(Error::Usage(format!("fid {fid} is already open")))
            }
            None => Err(Error::Usage(format!("fid {fid} is not allocated"))),
        }
    }

    pub fn open(&mut self, fid: u32, qid: Qid, mode: OpenMode, iounit: u32) -> Result<()> {
        match self.fids.get_mut(&fid) {
            Some(state @ (FidState::Reserved | FidState::Bound { .. })) => {
                *state = FidState::Open { qid, mode, iounit };
                Ok(())
            }
            Some(FidState::Open { .. }) => {
                Err(Error::Usage(format!("fid {fid} is already open")))
            }
            None => Err(Error::Usage(format!("fid {fid} is not allocated"))),
        }
    }

    /// Return a fid to the pool, whatever its state.
    pub fn release(&mut self, fid: u32) {
        if self.fids.remove(&fid).is_some() {
            self.free.push(fid);
        }
    }

    pub fn clear(&mut self) {
        self.fids.clear();
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::QidType;

    fn qid(path: u64) -> Qid {
        Qid {
            typ: QidType::FILE,
            version: 0,
            path,
        }
    }

    #[test]
    fn test_tag_alloc_and_reuse() {
        let mut tags = TagTable::default();
        let a = tags.alloc(1).unwrap();
        let b = tags.alloc(1).unwrap();
        assert_ne!(a, b);

        tags.free(a);
        let c = tags.alloc(2).unwrap();
        assert_eq!(c, a);
        assert!(matches!(tags.get(c), Some(TagEntry::InFlight { op: 2 })));
    }

    #[test]
    fn test_tag_space_exhaustion_spares_notag() {
        let mut tags = TagTable::default();
        tags.next = NOTAG - 1;
        let last = tags.alloc(1).unwrap();
        assert_eq!(last, NOTAG - 1);
        assert!(tags.alloc(1).is_err());
    }

    #[test]
    fn test_flushing_tag_stays_out_of_pool() {
        let mut tags = TagTable::default();
        let t = tags.alloc(1).unwrap();
        tags.set_flushing(t);
        assert!(matches!(tags.get(t), Some(TagEntry::Flushing)));
        assert!(tags.tags_of(1).is_empty());

        // Freed only when the flush reply arrives.
        tags.free(t);
        assert!(tags.get(t).is_none());
    }

    #[test]
    fn test_tags_of_filters_by_operation() {
        let mut tags = TagTable::default();
        let a = tags.alloc(7).unwrap();
        let _b = tags.alloc(8).unwrap();
        let c = tags.alloc(7).unwrap();

        let mut mine = tags.tags_of(7);
        mine.sort_unstable();
        assert_eq!(mine, vec![a, c]);
    }

    #[test]
    fn test_fid_lifecycle() {
        let mut fids = FidTable::default();
        let f = fids.alloc().unwrap();
        assert!(matches!(fids.get(f), Some(FidState::Reserved)));

        fids.bind(f, qid(9)).unwrap();
        assert!(matches!(fids.get(f), Some(FidState::Bound { .. })));

        fids.open(f, qid(9), OpenMode::READ, 8192).unwrap();
        assert!(fids.bind(f, qid(9)).is_err());
        assert!(fids.open(f, qid(9), OpenMode::READ, 8192).is_err());

        fids.release(f);
        assert!(fids.get(f).is_none());
        assert_eq!(fids.alloc().unwrap(), f);
    }

    #[test]
    fn test_fid_exhaustion_spares_nofid() {
        let mut fids = FidTable::default();
        fids.next = NOFID;
        assert!(fids.alloc().is_err());

        fids.free.push(3);
        assert_eq!(fids.alloc().unwrap(), 3);
    }
}
