//! UID to dense internal doc-id mapping.
//!
//! Readers publish a mapper built from their live uid set; the default
//! implementation binary-searches a sorted array.

/// Maps caller-provided uids to dense per-reader internal ids and back.
pub trait DocIdMapper: Send + Sync {
    fn doc_id(&self, uid: u64) -> Option<u32>;
    fn uid(&self, doc_id: u32) -> Option<u64>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds a [`DocIdMapper`] for a reader at publication time.
///
/// `uids` is sorted ascending and deduplicated.
pub trait DocIdMapperFactory: Send + Sync {
    fn build(&self, uids: &[u64]) -> Box<dyn DocIdMapper>;
}

/// Sorted-array mapper: internal id is the uid's rank.
struct SortedDocIdMapper {
    uids: Vec<u64>,
}

impl DocIdMapper for SortedDocIdMapper {
    fn doc_id(&self, uid: u64) -> Option<u32> {
        self.uids.binary_search(&uid).ok().map(|i| i as u32)
    }

    fn uid(&self, doc_id: u32) -> Option<u64> {
        self.uids.get(doc_id as usize).copied()
    }

    fn len(&self) -> usize {
        self.uids.len()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDocIdMapperFactory;

impl DocIdMapperFactory for DefaultDocIdMapperFactory {
    fn build(&self, uids: &[u64]) -> Box<dyn DocIdMapper> {
        Box::new(SortedDocIdMapper {
            uids: uids.to_vec(),
        })
    }
}
