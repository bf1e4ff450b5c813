use std::collections::HashMap;

use crate::error::{Error, Result};

/// In-memory record locating the current revision of one document.
///
/// A header exists for every logically known document id, alive or
/// tombstoned. `deletion` is the tick of the deletion marker, 0 while
/// the document is alive. `fid`/`offset` locate the marker inside a
/// datafile; `body_offset`/`body_length` address the opaque body
/// within it. Tombstones created from a deletion marker without a
/// preceding document carry `fid == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentHeader {
    pub did: u64,
    pub rid: u64,
    pub deletion: u64,
    pub fid: u64,
    pub offset: u32,
    pub body_offset: u32,
    pub body_length: u32,
    pub shape: u32,
}

impl DocumentHeader {
    /// Size of the fixed marker prefix in front of the body.
    pub fn prefix_size(&self) -> u32 {
        self.body_offset - self.offset
    }
}

/// Hash map from document id to document header. Consulted under the
/// collection read lock, mutated under the write lock.
pub struct PrimaryIndex {
    map: HashMap<u64, DocumentHeader>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        PrimaryIndex { map: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn lookup(&self, did: u64) -> Option<&DocumentHeader> {
        self.map.get(&did)
    }

    pub fn lookup_mut(&mut self, did: u64) -> Option<&mut DocumentHeader> {
        self.map.get_mut(&did)
    }

    /// Insert a header for a new document id. Fails when the id is
    /// already known.
    pub fn insert(&mut self, header: DocumentHeader) -> Result<()> {
        use std::collections::hash_map::Entry;
        match self.map.entry(header.did) {
            Entry::Vacant(entry) => {
                entry.insert(header);
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::DuplicateIdentifier(header.did)),
        }
    }

    pub fn remove(&mut self, did: u64) -> Option<DocumentHeader> {
        self.map.remove(&did)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DocumentHeader> {
        self.map.values()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(did: u64) -> DocumentHeader {
        DocumentHeader {
            did,
            rid: did,
            deletion: 0,
            fid: 1,
            offset: 32,
            body_offset: 72,
            body_length: 10,
            shape: 0,
        }
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut index = PrimaryIndex::new();
        index.insert(header(1)).unwrap();

        match index.insert(header(1)) {
            Err(Error::DuplicateIdentifier(1)) => {}
            _ => panic!("expected duplicate identifier error"),
        }
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn lookup_and_remove() {
        let mut index = PrimaryIndex::new();
        index.insert(header(5)).unwrap();

        assert_eq!(index.lookup(5).unwrap().rid, 5);
        assert!(index.lookup(6).is_none());

        let removed = index.remove(5).unwrap();
        assert_eq!(removed.did, 5);
        assert!(index.is_empty());
    }
}
