//! Whole-cache iteration.
//!
//! An iterator session walks pages in order, locking one page at a time and
//! yielding every live, unexpired entry from its slot table. Because only
//! one lock is ever held, concurrent mutators keep working on other pages;
//! the trade-off is that entries may appear or disappear between calls and
//! there is no snapshot of the cache as a whole.

use super::layout;
use super::{Cache, EntryView};
use crate::error::Result;

/// Created by [`Cache::iter`]. Borrows the handle exclusively, so the
/// underlying session cannot be used for anything else until the iterator
/// is closed or dropped (either releases any held page lock).
pub struct CacheIter<'c> {
    cache: &'c mut Cache,
    next_page: usize,
    next_slot: usize,
    finished: bool,
}

impl<'c> CacheIter<'c> {
    pub(crate) fn new(cache: &'c mut Cache) -> Self {
        CacheIter {
            cache,
            next_page: 0,
            next_slot: 0,
            finished: false,
        }
    }

    /// Advance to the next live entry and return a view of it.
    ///
    /// The view borrows the mapping and is valid until the next call (which
    /// may unlock the page it lives on). `None` means the whole cache has
    /// been visited and no lock is held any more.
    pub fn next_entry(&mut self) -> Result<Option<EntryView<'_>>> {
        let (page_index, off) = match self.advance()? {
            Some(found) => found,
            None => return Ok(None),
        };
        let page = self.cache.file.page(page_index, self.cache.opts.page_size);
        Ok(Some(EntryView {
            key: layout::entry_key(page, off),
            value: layout::entry_val(page, off),
            last_access: layout::entry_last_access(page, off),
            expire_time: layout::entry_expire_time(page, off),
            flags: layout::entry_flags(page, off),
        }))
    }

    /// Release any held lock and finish the iteration.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    /// Walk slots (locking pages as needed) until a live, unexpired entry
    /// turns up; returns its page and data offset.
    fn advance(&mut self) -> Result<Option<(usize, usize)>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let (page_index, num_slots) = match &self.cache.session {
                Some(s) => (s.page, s.hdr.num_slots as usize),
                None => {
                    if self.next_page == self.cache.opts.num_pages {
                        self.finished = true;
                        return Ok(None);
                    }
                    self.cache.lock(self.next_page)?;
                    self.next_slot = 0;
                    continue;
                }
            };

            if self.next_slot >= num_slots {
                self.cache.unlock()?;
                self.next_page += 1;
                continue;
            }

            let slot = self.next_slot;
            self.next_slot += 1;

            let page = self.cache.file.page(page_index, self.cache.opts.page_size);
            let offset = layout::get_slot(page, slot);
            if offset <= layout::SLOT_TOMBSTONE {
                continue;
            }
            let off = offset as usize;
            let expire = layout::entry_expire_time(page, off);
            if expire != 0 && super::unix_now() > expire {
                continue;
            }
            return Ok(Some((page_index, off)));
        }
    }

    fn release(&mut self) -> Result<()> {
        self.finished = true;
        if self.cache.is_locked() {
            self.cache.unlock()?;
        }
        Ok(())
    }
}

impl Drop for CacheIter<'_> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
