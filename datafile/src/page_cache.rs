// Copyright 2024 Oxide Computer Company
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct PageContents {
    data: Vec<u8>,
    /// Set once `data` has been verified against its parent digest
    checked: bool,
}

#[derive(Debug, Default)]
pub(crate) struct CachedPage {
    contents: Mutex<PageContents>,
}

impl CachedPage {
    /// Copy `out.len()` bytes at `offset` if this page has been verified
    pub fn read_checked(&self, offset: usize, out: &mut [u8]) -> bool {
        let contents = self.contents.lock().unwrap();
        if !contents.checked || offset + out.len() > contents.data.len() {
            return false;
        }
        out.copy_from_slice(&contents.data[offset..offset + out.len()]);
        true
    }

    /// Store verified contents
    pub fn fill_checked(&self, data: &[u8]) {
        let mut contents = self.contents.lock().unwrap();
        contents.data.clear();
        contents.data.extend_from_slice(data);
        contents.checked = true;
    }

    pub fn is_checked(&self) -> bool {
        self.contents.lock().unwrap().checked
    }
}

/**
 * Per-file cache of hash tree pages, keyed by page index past the end of
 * the data.
 *
 * The map lock is only held to find or insert a page; page contents have
 * their own lock, and no caller holds two page locks at once.
 */
#[derive(Debug, Default)]
pub(crate) struct HashPageCache {
    pages: Mutex<HashMap<u64, Arc<CachedPage>>>,
}

impl HashPageCache {
    pub fn find(&self, index: u64) -> Option<Arc<CachedPage>> {
        self.pages.lock().unwrap().get(&index).cloned()
    }

    /// Find the page at `index`, inserting an empty one if needed
    pub fn grab(&self, index: u64) -> Arc<CachedPage> {
        self.pages.lock().unwrap().entry(index).or_default().clone()
    }

    pub fn is_checked(&self, index: u64) -> bool {
        self.find(index).is_some_and(|p| p.is_checked())
    }

    pub fn len(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unchecked_pages_are_not_trusted() {
        let cache = HashPageCache::default();
        let page = cache.grab(7);
        let mut out = [0u8; 4];
        assert!(!page.read_checked(0, &mut out));
        assert!(!cache.is_checked(7));

        page.fill_checked(&[1, 2, 3, 4, 5, 6]);
        assert!(page.read_checked(2, &mut out));
        assert_eq!(out, [3, 4, 5, 6]);
        assert!(cache.is_checked(7));
        assert!(!page.read_checked(4, &mut out));
        assert_eq!(cache.len(), 1);
    }
}
