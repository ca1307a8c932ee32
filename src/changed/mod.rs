//! Changed-page sources consulted by the incremental read filters.
//!
//! Both sources are built before copying starts and are read-only while
//! workers run, so they are shared behind an `Arc` without locking.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    ops::Range,
};

use crate::page::DICT_SPACE_ID;

const WORD_BITS: u64 = 64;

/// Per-space bitmap of pages modified since a reference LSN.
#[derive(Debug, Default, Clone)]
pub struct ChangedPageBitmap {
    spaces: HashMap<u32, Vec<u64>>,
}

impl ChangedPageBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, space_id: u32, page_no: u64) {
        let words = self.spaces.entry(space_id).or_default();
        let word = (page_no / WORD_BITS) as usize;
        if words.len() <= word {
            words.resize(word + 1, 0);
        }
        words[word] |= 1u64 << (page_no % WORD_BITS);
    }

    /// Mark pages `first..=last`.
    pub fn mark_range(&mut self, space_id: u32, first: u64, last: u64) {
        for page_no in first..=last {
            self.mark(space_id, page_no);
        }
    }

    pub fn is_changed(&self, space_id: u32, page_no: u64) -> bool {
        self.spaces
            .get(&space_id)
            .and_then(|w| w.get((page_no / WORD_BITS) as usize))
            .is_some_and(|w| *w & (1u64 << (page_no % WORD_BITS)) != 0)
    }

    pub fn has_space(&self, space_id: u32) -> bool {
        self.spaces.contains_key(&space_id)
    }

    /// First run of set bits at or after `from`, at most `max_pages` long.
    /// Whole zero words are skipped, and the run scan stops at the cap.
    pub fn next_run(&self, space_id: u32, from: u64, max_pages: u64) -> Option<Range<u64>> {
        let words = self.spaces.get(&space_id)?;
        let total_bits = words.len() as u64 * WORD_BITS;

        let mut start = from;
        while start < total_bits {
            let word = words[(start / WORD_BITS) as usize] >> (start % WORD_BITS);
            if word == 0 {
                start = (start / WORD_BITS + 1) * WORD_BITS;
                continue;
            }
            start += u64::from(word.trailing_zeros());
            break;
        }
        if start >= total_bits {
            return None;
        }

        let mut end = start;
        while end < total_bits && end - start < max_pages.max(1) && self.is_changed(space_id, end) {
            end += 1;
        }
        Some(start..end)
    }
}

/// Pages written since backup start, as reported by the engine's page
/// tracking, plus spaces that must be copied whole regardless.
#[derive(Debug, Default, Clone)]
pub struct PageTracking {
    spaces: HashMap<u32, BTreeSet<u64>>,
    full_scan: HashSet<u32>,
}

impl PageTracking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, space_id: u32, page_no: u64) {
        self.spaces.entry(space_id).or_default().insert(page_no);
    }

    pub fn add_pages<I: IntoIterator<Item = u64>>(&mut self, space_id: u32, pages: I) {
        self.spaces.entry(space_id).or_default().extend(pages);
    }

    /// Force a full copy of `space_id`, e.g. after a schema change that
    /// rewrote it outside the tracked range.
    pub fn mark_full_scan(&mut self, space_id: u32) {
        self.full_scan.insert(space_id);
    }

    /// The dictionary space is always copied whole.
    pub fn needs_full_scan(&self, space_id: u32) -> bool {
        space_id == DICT_SPACE_ID || self.full_scan.contains(&space_id)
    }

    pub fn is_tracked(&self, space_id: u32) -> bool {
        self.spaces.contains_key(&space_id)
    }

    /// First contiguous run of tracked pages at or after `from`, at most
    /// `max_pages` long.
    pub fn next_run(&self, space_id: u32, from: u64, max_pages: u64) -> Option<Range<u64>> {
        let pages = self.spaces.get(&space_id)?;
        let mut iter = pages.range(from..);
        let start = *iter.next()?;
        let mut end = start + 1;
        for &page in iter {
            if page != end || end - start >= max_pages.max(1) {
                break;
            }
            end += 1;
        }
        Some(start..end)
    }
}
