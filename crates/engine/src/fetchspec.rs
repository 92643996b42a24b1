//! Fetch specifications
//!
//! A fetch spec is the projection half of a query: an ordered list of
//! items, one per result column, each naming the attribute to fetch (or
//! `None` for "everything"), the source preference deciding between
//! conflicting sources, and whether the entry's own pair and/or its
//! attribute tuples are wanted.

use bitflags::bitflags;
use sonata_core::SourcePref;
use std::sync::Arc;

bitflags! {
    /// What a fetch item pulls out of a matched entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FetchFlags: u32 {
        /// Include the entry's own `(key, value)` pair
        const PARENT = 1;
        /// Include matching attribute tuples
        const DATA = 2;
    }
}

/// One column of the projection.
pub struct FetchItem {
    pub(crate) key: Option<String>,
    pub(crate) sourcepref: Option<Arc<SourcePref>>,
    pub(crate) flags: FetchFlags,
}

/// An ordered list of fetch items.
#[derive(Default)]
pub struct FetchSpec {
    items: Vec<FetchItem>,
}

impl FetchSpec {
    /// Creates an empty spec.
    pub fn new() -> FetchSpec {
        FetchSpec { items: Vec::new() }
    }

    /// Appends a column. `key == None` fetches every attribute of the
    /// entry.
    pub fn add(
        &mut self,
        key: Option<&str>,
        sourcepref: Option<Arc<SourcePref>>,
        flags: FetchFlags,
    ) {
        self.items.push(FetchItem {
            key: key.map(str::to_string),
            sourcepref,
            flags,
        });
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no column was added.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The key of column `i`.
    pub fn key(&self, i: usize) -> Option<&str> {
        self.items.get(i).and_then(|item| item.key.as_deref())
    }

    /// The flags of column `i`.
    pub fn flags(&self, i: usize) -> Option<FetchFlags> {
        self.items.get(i).map(|item| item.flags)
    }

    /// The source preference of column `i`.
    pub fn sourcepref(&self, i: usize) -> Option<&Arc<SourcePref>> {
        self.items.get(i).and_then(|item| item.sourcepref.as_ref())
    }

    pub(crate) fn items(&self) -> &[FetchItem] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_accumulates_columns() {
        let mut fs = FetchSpec::new();
        assert!(fs.is_empty());
        fs.add(Some("artist"), None, FetchFlags::DATA);
        fs.add(None, None, FetchFlags::PARENT | FetchFlags::DATA);

        assert_eq!(fs.len(), 2);
        assert_eq!(fs.key(0), Some("artist"));
        assert_eq!(fs.key(1), None);
        assert_eq!(fs.flags(1), Some(FetchFlags::PARENT | FetchFlags::DATA));
    }
}
