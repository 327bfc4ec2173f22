//! Shared-memory page engine.
//!
//! Provides [`Cache`] — a multi-process key/value cache over a memory-mapped
//! file. The file is an array of fixed-size pages; each page carries its own
//! open-addressed slot table and data arena and is guarded by an exclusive
//! byte-range lock, so processes working on different pages never contend.
//!
//! A handle is a session that is either unlocked or locked on exactly one
//! page. Locking reads the page header into the session and validates it;
//! reads, writes, deletes and expunge runs then operate on the locked page;
//! unlocking writes the header back if anything changed. Entries are evicted
//! lazily: deletes and expiry leave tombstones, and the expunge pass compacts
//! the arena, drops expired or least-recently-used entries and grows the slot
//! table when it is running out.

pub(crate) mod iter;
pub(crate) mod layout;
mod lock;
mod region;
mod validate;

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use crate::error::{CacheError, Result};
use crate::hash::hash_key;
use crate::options::CacheOptions;
use layout::{PageHeader, SLOT_TOMBSTONE, WORD};
use region::MappedFile;

/// Passing this as `expire_seconds` to [`Cache::write`] applies the
/// cache-wide `expire_time` default instead of an explicit expiry.
/// (`0` means the entry never expires.)
pub const EXPIRE_DEFAULT: u64 = u64::MAX;

/// Outcome of a [`Cache::write`].
///
/// `NotStored` means the page had no usable slot or not enough arena space;
/// the caller is expected to run an expunge pass and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WriteOutcome {
    Stored,
    NotStored,
}

impl WriteOutcome {
    pub fn is_stored(self) -> bool {
        matches!(self, WriteOutcome::Stored)
    }
}

/// What an expunge pass should get rid of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpungeMode {
    /// Drop only entries whose expiry has passed.
    Expired,
    /// Drop everything.
    All,
    /// Drop expired entries, then the least recently used survivors until
    /// the arena is under 60% occupancy.
    MakeRoom,
}

/// An eviction/compaction plan produced by [`Cache::calc_expunge`], applied
/// by [`Cache::do_expunge`] under the same page lock.
#[derive(Debug, Clone)]
pub struct ExpungePlan {
    /// Data offsets of the entries to keep, in the order they will be laid
    /// back into the arena.
    pub keep: Vec<u64>,
    /// Slot-table size after the pass (grown to `2n+1` when occupancy
    /// warrants it).
    pub new_num_slots: u64,
    /// Number of entries the plan discards.
    pub evicted: usize,
}

/// Header snapshot of the currently locked page.
#[derive(Debug, Clone, Copy)]
pub struct PageStats {
    pub num_slots: u64,
    pub free_slots: u64,
    pub old_slots: u64,
    pub free_data: u64,
    pub free_bytes: u64,
    pub n_reads: u64,
    pub n_read_hits: u64,
}

/// A stored entry, borrowed from the mapping. Valid only while the page it
/// lives on stays locked.
#[derive(Debug)]
pub struct EntryView<'p> {
    pub key: &'p [u8],
    pub value: &'p [u8],
    pub last_access: u64,
    pub expire_time: u64,
    pub flags: u64,
}

/// Session state while a page is locked.
pub(crate) struct Session {
    pub(crate) page: usize,
    pub(crate) hdr: PageHeader,
    pub(crate) changed: bool,
}

/// A handle onto a shared cache file.
///
/// Handles are independent: every process (or every thread that wants one)
/// opens its own. A handle owns one file descriptor and one mapping, and
/// holds at most one page lock at a time. POSIX record locks do not exclude
/// within a single process, so two handles in the same process must not be
/// used to "lock against" each other.
pub struct Cache {
    pub(crate) file: MappedFile,
    pub(crate) opts: CacheOptions,
    pub(crate) session: Option<Session>,
    pub(crate) last_error: Option<String>,
}

/// Seconds since the epoch, as stored in entry timestamps.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Linear-probe the slot table for `key`, starting at `intra % num_slots`
/// and wrapping once through the whole table.
///
/// Returns the index of the slot holding the key, or of the empty slot that
/// ends its probe chain. In write mode the first tombstone seen is
/// remembered and returned if the full scan finds neither the key nor an
/// empty slot, so writes can reuse deleted slots in a full table. `None`
/// means no usable slot at all.
pub(crate) fn find_slot(
    page: &[u8],
    num_slots: usize,
    intra: u64,
    key: &[u8],
    for_write: bool,
) -> Option<usize> {
    let mut idx = (intra % num_slots as u64) as usize;
    let mut first_tombstone = None;

    for _ in 0..num_slots {
        let offset = layout::get_slot(page, idx);
        if offset == layout::SLOT_EMPTY {
            return Some(idx);
        }
        if offset == SLOT_TOMBSTONE {
            if for_write && first_tombstone.is_none() {
                first_tombstone = Some(idx);
            }
        } else if layout::entry_key(page, offset as usize) == key {
            return Some(idx);
        }
        idx += 1;
        if idx == num_slots {
            idx = 0;
        }
    }

    if for_write {
        first_tombstone
    } else {
        None
    }
}

impl Cache {
    /// Open (creating or re-creating as needed) the share file described by
    /// `opts` and return a handle onto it.
    ///
    /// A missing file, a size that disagrees with the configured geometry,
    /// or `init_file` all cause the file to be built fresh; concurrent
    /// openers block on the whole-file lock until every page is formatted.
    /// With `test_file`, every page is then validated and any page that
    /// fails is reformatted in place.
    pub fn new(opts: CacheOptions) -> Result<Self> {
        opts.validate()?;
        let (file, fresh) = MappedFile::open(&opts)?;
        let mut cache = Cache {
            file,
            opts,
            session: None,
            last_error: None,
        };

        if fresh {
            let (num_pages, page_size, start_slots) = (
                cache.opts.num_pages,
                cache.opts.page_size,
                cache.opts.start_slots,
            );
            for p in 0..num_pages {
                layout::format_page(cache.file.page_mut(p, page_size), start_slots);
            }
            cache.file.finish_init()?;
            debug!(
                path = %cache.file.path().display(),
                num_pages,
                page_size,
                "formatted fresh cache"
            );
        }

        if cache.opts.test_file {
            for p in 0..cache.opts.num_pages {
                cache.check_or_recover(p)?;
            }
        }

        Ok(cache)
    }

    /// The most recent error message recorded on this handle.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn options(&self) -> &CacheOptions {
        &self.opts
    }

    /// Hash a key into `(page_index, intra_page_hash)` for this cache's
    /// geometry.
    pub fn hash(&self, key: &[u8]) -> (usize, u64) {
        hash_key(key, self.opts.num_pages)
    }

    /// Whether this handle currently holds a page lock.
    pub fn is_locked(&self) -> bool {
        self.session.is_some()
    }

    /// Acquire the exclusive lock on `page_index` and load its header.
    ///
    /// Fails with *corrupt-page* (releasing the lock again) if the header
    /// does not validate; [`reformat_page`](Self::reformat_page) recovers
    /// such a page at the cost of its contents.
    pub fn lock(&mut self, page_index: usize) -> Result<()> {
        if page_index >= self.opts.num_pages {
            let num_pages = self.opts.num_pages;
            return self.fail(CacheError::Usage(format!(
                "page {page_index} is outside the {num_pages}-page cache"
            )));
        }
        if let Some(cur) = self.session.as_ref().map(|s| s.page) {
            return self.fail(CacheError::Usage(format!(
                "page {cur} is already locked; a session holds one page at a time"
            )));
        }

        let page_size = self.opts.page_size as u64;
        let offset = page_index as u64 * page_size;
        if let Err(e) = lock::acquire(
            self.file.fd(),
            offset,
            page_size,
            self.opts.catch_deadlocks,
        ) {
            return self.fail(CacheError::io(format!("locking page {page_index}"), e));
        }

        let (magic, hdr) = PageHeader::load(self.file.page(page_index, self.opts.page_size));
        if let Err(reason) = self.check_header(magic, &hdr) {
            let _ = lock::release(self.file.fd(), offset, page_size);
            return self.fail(CacheError::CorruptPage {
                page: page_index,
                reason,
            });
        }

        self.session = Some(Session {
            page: page_index,
            hdr,
            changed: false,
        });
        Ok(())
    }

    /// Write the header back if this session changed it, then release the
    /// page lock.
    pub fn unlock(&mut self) -> Result<()> {
        let (file, s, opts) = self.locked_parts()?;
        let was_changed = s.changed;
        if was_changed {
            s.hdr.store(file.page_mut(s.page, opts.page_size));
            s.changed = false;
        }
        let page_index = s.page;

        // A session that mutated the page must leave it valid.
        #[cfg(debug_assertions)]
        if was_changed {
            if let Err(reason) = self.check_current() {
                panic!("page {page_index} invalid at unlock: {reason}");
            }
        }

        self.session = None;
        let page_size = self.opts.page_size as u64;
        let offset = page_index as u64 * page_size;
        if let Err(e) = lock::release(self.file.fd(), offset, page_size) {
            return self.fail(CacheError::io(format!("unlocking page {page_index}"), e));
        }
        Ok(())
    }

    /// Look up `key` on the locked page.
    ///
    /// A hit refreshes the entry's last-access time and returns the value
    /// bytes (borrowed from the mapping, valid while the page stays locked)
    /// and the entry's flags. An entry whose expiry has passed is converted
    /// to a tombstone and reported as a miss.
    pub fn read(&mut self, intra_hash: u64, key: &[u8]) -> Result<Option<(&[u8], u64)>> {
        let (file, s, opts) = self.locked_parts()?;
        let page = file.page_mut(s.page, opts.page_size);

        if opts.enable_stats {
            s.changed = true;
            s.hdr.n_reads += 1;
        }

        let slot = match find_slot(page, s.hdr.num_slots as usize, intra_hash, key, false) {
            Some(i) => i,
            None => return Ok(None),
        };
        let offset = layout::get_slot(page, slot);
        if offset <= SLOT_TOMBSTONE {
            return Ok(None);
        }

        let off = offset as usize;
        let now = unix_now();
        let expire = layout::entry_expire_time(page, off);
        if expire != 0 && now > expire {
            layout::set_slot(page, slot, SLOT_TOMBSTONE);
            s.hdr.free_slots += 1;
            s.hdr.old_slots += 1;
            s.changed = true;
            return Ok(None);
        }

        layout::set_entry_last_access(page, off, now);
        if opts.enable_stats {
            s.hdr.n_read_hits += 1;
        }

        let flags = layout::entry_flags(page, off);
        Ok(Some((layout::entry_val(page, off), flags)))
    }

    /// Store `key` → `val` on the locked page.
    ///
    /// An existing entry for the key is tombstoned first; the new entry
    /// always goes to fresh arena bytes, since the sizes may differ.
    /// Returns [`WriteOutcome::NotStored`] when no slot or not enough arena
    /// space is available; callers wanting the write to succeed run
    /// [`calc_expunge`](Self::calc_expunge) / [`do_expunge`](Self::do_expunge)
    /// and retry.
    pub fn write(
        &mut self,
        intra_hash: u64,
        key: &[u8],
        val: &[u8],
        expire_seconds: u64,
        flags: u64,
    ) -> Result<WriteOutcome> {
        let (file, s, opts) = self.locked_parts()?;
        let page = file.page_mut(s.page, opts.page_size);
        let needed = layout::round_len(layout::entry_size(key.len(), val.len())) as u64;

        let slot = match find_slot(page, s.hdr.num_slots as usize, intra_hash, key, true) {
            Some(i) => i,
            None => return Ok(WriteOutcome::NotStored),
        };

        if layout::get_slot(page, slot) > SLOT_TOMBSTONE {
            // Same key, old value: tombstone it and relocate.
            layout::set_slot(page, slot, SLOT_TOMBSTONE);
            s.hdr.free_slots += 1;
            s.hdr.old_slots += 1;
            s.changed = true;
        }

        if s.hdr.free_bytes < needed {
            return Ok(WriteOutcome::NotStored);
        }

        let now = unix_now();
        let secs = if expire_seconds == EXPIRE_DEFAULT {
            opts.expire_time
        } else {
            expire_seconds
        };
        let expire_time = if secs == 0 { 0 } else { now.saturating_add(secs) };

        layout::write_entry(
            page,
            s.hdr.free_data as usize,
            now,
            expire_time,
            intra_hash,
            flags,
            key,
            val,
        );

        if layout::get_slot(page, slot) == SLOT_TOMBSTONE {
            s.hdr.old_slots -= 1;
        }
        s.hdr.free_slots -= 1;
        layout::set_slot(page, slot, s.hdr.free_data);
        s.hdr.free_data += needed;
        s.hdr.free_bytes -= needed;
        s.changed = true;

        Ok(WriteOutcome::Stored)
    }

    /// Delete `key` from the locked page, returning its flags on a hit.
    ///
    /// Only the slot is tombstoned; the arena bytes are reclaimed by the
    /// next expunge pass.
    pub fn delete(&mut self, intra_hash: u64, key: &[u8]) -> Result<Option<u64>> {
        let (file, s, opts) = self.locked_parts()?;
        let page = file.page_mut(s.page, opts.page_size);

        let slot = match find_slot(page, s.hdr.num_slots as usize, intra_hash, key, false) {
            Some(i) => i,
            None => return Ok(None),
        };
        let offset = layout::get_slot(page, slot);
        if offset <= SLOT_TOMBSTONE {
            return Ok(None);
        }

        let flags = layout::entry_flags(page, offset as usize);
        layout::set_slot(page, slot, SLOT_TOMBSTONE);
        s.hdr.free_slots += 1;
        s.hdr.old_slots += 1;
        s.changed = true;
        Ok(Some(flags))
    }

    /// Work out what an expunge pass on the locked page would evict.
    ///
    /// `len`, when given, is the combined key+value length of a write the
    /// caller wants to make room for; if the page still has over 30%
    /// never-used slots and enough free arena bytes for it, there is nothing
    /// to do and `None` is returned. Otherwise the plan keeps everything
    /// unexpired (for [`ExpungeMode::MakeRoom`], trimmed oldest-first until
    /// the arena drops under 60% occupancy) and decides whether the slot
    /// table should grow to `2n+1`.
    ///
    /// The plan must be applied with [`do_expunge`](Self::do_expunge) under
    /// the same page lock.
    pub fn calc_expunge(
        &mut self,
        mode: ExpungeMode,
        len: Option<usize>,
    ) -> Result<Option<ExpungePlan>> {
        let (file, s, opts) = self.locked_parts()?;
        let page = file.page(s.page, opts.page_size);
        let page_size = opts.page_size as u64;
        let num_slots = s.hdr.num_slots;

        if let Some(len) = len {
            let needed = layout::round_len(layout::entry_size(len, 0)) as u64;
            let fresh_free = (s.hdr.free_slots - s.hdr.old_slots) as f64 / num_slots as f64;
            if fresh_free > 0.3 && s.hdr.free_bytes >= needed {
                return Ok(None);
            }
        }

        let now = unix_now();
        let arena_size = page_size - layout::arena_start(num_slots as usize) as u64;
        let mut keep: Vec<u64> = Vec::new();
        let mut evicted = 0usize;
        let mut used_data = 0u64;

        for i in 0..num_slots as usize {
            let offset = layout::get_slot(page, i);
            if offset <= SLOT_TOMBSTONE {
                continue;
            }
            if mode == ExpungeMode::All {
                evicted += 1;
                continue;
            }
            let off = offset as usize;
            let expire = layout::entry_expire_time(page, off);
            if expire != 0 && now >= expire {
                evicted += 1;
                continue;
            }
            used_data += layout::round_len(layout::entry_len(page, off)) as u64;
            keep.push(offset);
        }

        // Grow the slot table if the survivors crowd it and either the
        // arena can spare a bigger table or we are making room anyway. This
        // is decided before the LRU trim so a make-room pass both compacts
        // and rehashes.
        let mut new_num_slots = num_slots;
        let keep_ratio = keep.len() as f64 / num_slots as f64;
        if keep_ratio > 0.3
            && (arena_size.saturating_sub(used_data) > (num_slots + 1) * WORD as u64
                || mode == ExpungeMode::MakeRoom)
        {
            new_num_slots = num_slots * 2 + 1;
        }
        let new_arena_size = page_size - layout::arena_start(new_num_slots as usize) as u64;

        if mode != ExpungeMode::MakeRoom {
            trace!(
                page = s.page,
                kept = keep.len(),
                evicted,
                new_num_slots,
                "expunge plan"
            );
            return Ok(Some(ExpungePlan {
                keep,
                new_num_slots,
                evicted,
            }));
        }

        keep.sort_by_key(|&off| layout::entry_last_access(page, off as usize));
        let threshold = (0.6 * new_arena_size as f64) as u64;
        let mut trim = 0;
        while trim < keep.len() && used_data >= threshold {
            used_data -= layout::round_len(layout::entry_len(page, keep[trim] as usize)) as u64;
            trim += 1;
        }
        evicted += trim;
        keep.drain(..trim);

        trace!(
            page = s.page,
            kept = keep.len(),
            evicted,
            new_num_slots,
            "expunge plan"
        );
        Ok(Some(ExpungePlan {
            keep,
            new_num_slots,
            evicted,
        }))
    }

    /// Apply an expunge plan to the locked page: rebuild the slot table at
    /// its new size and compact the kept entries to the bottom of the arena.
    ///
    /// Kept entries are rehashed into the new table from their stored intra
    /// hash, so keys never need re-reading.
    pub fn do_expunge(&mut self, plan: ExpungePlan) -> Result<()> {
        let page_size = self.opts.page_size;
        let ns = plan.new_num_slots as usize;
        let arena_base = layout::arena_start(ns);
        if arena_base >= page_size || plan.keep.len() > ns {
            return self.fail(CacheError::Usage(format!(
                "expunge plan with {} slots does not fit a {page_size}-byte page",
                plan.new_num_slots
            )));
        }

        let (file, s, opts) = self.locked_parts()?;
        let page = file.page_mut(s.page, opts.page_size);
        let arena_size = opts.page_size - arena_base;
        let mut new_slots = vec![0u64; ns];
        let mut new_arena = vec![0u8; arena_size];
        let mut write_off = 0usize;

        for &offset in &plan.keep {
            let off = offset as usize;
            let mut slot = (layout::entry_slot_hash(page, off) % ns as u64) as usize;
            while new_slots[slot] != 0 {
                slot += 1;
                if slot == ns {
                    slot = 0;
                }
            }
            let len = layout::entry_len(page, off);
            new_arena[write_off..write_off + len].copy_from_slice(&page[off..off + len]);
            new_slots[slot] = (arena_base + write_off) as u64;
            write_off += layout::round_len(len);
        }

        for (i, &w) in new_slots.iter().enumerate() {
            layout::set_slot(page, i, w);
        }
        page[arena_base..arena_base + write_off].copy_from_slice(&new_arena[..write_off]);

        s.hdr.num_slots = ns as u64;
        s.hdr.free_slots = (ns - plan.keep.len()) as u64;
        s.hdr.old_slots = 0;
        s.hdr.free_data = (arena_base + write_off) as u64;
        s.hdr.free_bytes = (arena_size - write_off) as u64;
        s.changed = true;
        Ok(())
    }

    /// Header snapshot of the locked page, including the read counters.
    pub fn page_stats(&mut self) -> Result<PageStats> {
        let (_, s, _) = self.locked_parts()?;
        Ok(PageStats {
            num_slots: s.hdr.num_slots,
            free_slots: s.hdr.free_slots,
            old_slots: s.hdr.old_slots,
            free_data: s.hdr.free_data,
            free_bytes: s.hdr.free_bytes,
            n_reads: s.hdr.n_reads,
            n_read_hits: s.hdr.n_read_hits,
        })
    }

    /// Zero the locked page's read counters.
    pub fn reset_page_stats(&mut self) -> Result<()> {
        let (_, s, _) = self.locked_parts()?;
        s.hdr.n_reads = 0;
        s.hdr.n_read_hits = 0;
        s.changed = true;
        Ok(())
    }

    /// Details of the entry at `data_offset` on the locked page, e.g. an
    /// offset taken from an [`ExpungePlan`] keep list.
    pub fn entry_details(&mut self, data_offset: u64) -> Result<EntryView<'_>> {
        let arena_base = match &self.session {
            Some(s) => layout::arena_start(s.hdr.num_slots as usize) as u64,
            None => return self.fail(CacheError::Usage("no page is locked".into())),
        };
        if data_offset < arena_base
            || data_offset >= self.opts.page_size as u64
            || data_offset % WORD as u64 != 0
        {
            return self.fail(CacheError::Usage(format!(
                "{data_offset} is not an entry offset"
            )));
        }

        let (file, s, opts) = self.locked_parts()?;
        let page = file.page(s.page, opts.page_size);
        let off = data_offset as usize;
        Ok(EntryView {
            key: layout::entry_key(page, off),
            value: layout::entry_val(page, off),
            last_access: layout::entry_last_access(page, off),
            expire_time: layout::entry_expire_time(page, off),
            flags: layout::entry_flags(page, off),
        })
    }

    /// Run the full invariant scan on the locked page.
    pub fn verify_page(&mut self) -> Result<()> {
        let page_index = match &self.session {
            Some(s) => s.page,
            None => {
                return self.fail(CacheError::Usage(
                    "verify_page requires a locked page".into(),
                ))
            }
        };
        match self.check_current() {
            Ok(()) => Ok(()),
            Err(reason) => self.fail(CacheError::CorruptPage {
                page: page_index,
                reason,
            }),
        }
    }

    /// Reformat `page_index` as empty, sacrificing its contents. Acquires
    /// the page's byte-range lock itself, so the handle must be unlocked.
    ///
    /// This is the recovery path for *corrupt-page* errors.
    pub fn reformat_page(&mut self, page_index: usize) -> Result<()> {
        if page_index >= self.opts.num_pages {
            let num_pages = self.opts.num_pages;
            return self.fail(CacheError::Usage(format!(
                "page {page_index} is outside the {num_pages}-page cache"
            )));
        }
        if self.session.is_some() {
            return self.fail(CacheError::Usage(
                "cannot reformat while a page is locked".into(),
            ));
        }

        let page_size = self.opts.page_size as u64;
        let offset = page_index as u64 * page_size;
        if let Err(e) = lock::acquire(
            self.file.fd(),
            offset,
            page_size,
            self.opts.catch_deadlocks,
        ) {
            return self.fail(CacheError::io(format!("locking page {page_index}"), e));
        }
        layout::format_page(
            self.file.page_mut(page_index, self.opts.page_size),
            self.opts.start_slots,
        );
        if let Err(e) = lock::release(self.file.fd(), offset, page_size) {
            return self.fail(CacheError::io(format!("unlocking page {page_index}"), e));
        }
        Ok(())
    }

    /// Render the locked page's header and live slots as text, for
    /// diagnostics.
    pub fn debug_dump(&mut self) -> Result<String> {
        let (file, s, opts) = self.locked_parts()?;
        let page = file.page(s.page, opts.page_size);
        let mut out = String::new();
        let _ = writeln!(out, "page {} ({} bytes)", s.page, opts.page_size);
        let _ = writeln!(
            out,
            "num_slots={} free_slots={} old_slots={} free_data={} free_bytes={}",
            s.hdr.num_slots, s.hdr.free_slots, s.hdr.old_slots, s.hdr.free_data, s.hdr.free_bytes
        );
        for i in 0..s.hdr.num_slots as usize {
            let offset = layout::get_slot(page, i);
            if offset <= SLOT_TOMBSTONE {
                continue;
            }
            let off = offset as usize;
            let _ = writeln!(
                out,
                "slot {i}: off={offset} la={} et={} hash={} flags={} key={:?} val_len={}",
                layout::entry_last_access(page, off),
                layout::entry_expire_time(page, off),
                layout::entry_slot_hash(page, off),
                layout::entry_flags(page, off),
                String::from_utf8_lossy(&layout::entry_key(page, off)
                    [..layout::entry_key_len(page, off).min(32)]),
                layout::entry_val_len(page, off),
            );
        }
        Ok(out)
    }

    /// Unlock (if needed) and drop the handle, releasing the mapping and
    /// descriptor.
    pub fn close(mut self) -> Result<()> {
        if self.session.is_some() {
            self.unlock()?;
        }
        Ok(())
    }

    /// Start iterating over every live entry in the cache. The handle must
    /// be unlocked; the iterator holds at most one page lock at a time.
    pub fn iter(&mut self) -> Result<iter::CacheIter<'_>> {
        if self.session.is_some() {
            return self.fail(CacheError::Usage(
                "iteration requires an unlocked handle".into(),
            ));
        }
        Ok(iter::CacheIter::new(self))
    }

    // Internal helpers.

    fn fail<T>(&mut self, err: CacheError) -> Result<T> {
        self.last_error = Some(err.to_string());
        Err(err)
    }

    /// Split borrows for operations on the locked page; usage error when
    /// unlocked.
    fn locked_parts(&mut self) -> Result<(&mut MappedFile, &mut Session, &CacheOptions)> {
        let Cache {
            file,
            session,
            opts,
            last_error,
        } = self;
        match session.as_mut() {
            Some(s) => Ok((file, s, opts)),
            None => {
                let e = CacheError::Usage("no page is locked".into());
                *last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Lock-time header validation: magic, size bounds, counter and space
    /// arithmetic.
    fn check_header(&self, magic: u64, hdr: &PageHeader) -> std::result::Result<(), String> {
        let page_size = self.opts.page_size as u64;
        if magic != layout::PAGE_MAGIC {
            return Err(format!("magic {magic:#x} is not a page marker"));
        }
        if hdr.num_slots < self.opts.start_slots as u64 || hdr.num_slots >= page_size {
            return Err(format!("num_slots {} out of bounds", hdr.num_slots));
        }
        if hdr.free_slots > hdr.num_slots {
            return Err(format!(
                "free_slots {} > num_slots {}",
                hdr.free_slots, hdr.num_slots
            ));
        }
        if hdr.old_slots > hdr.free_slots {
            return Err(format!(
                "old_slots {} > free_slots {}",
                hdr.old_slots, hdr.free_slots
            ));
        }
        if hdr.free_data.checked_add(hdr.free_bytes) != Some(page_size) {
            return Err(format!(
                "free_data {} + free_bytes {} != page_size {page_size}",
                hdr.free_data, hdr.free_bytes
            ));
        }
        if hdr.free_data < layout::arena_start(hdr.num_slots as usize) as u64 {
            return Err(format!("free_data {} inside the slot table", hdr.free_data));
        }
        Ok(())
    }

    /// Full invariant scan of the locked page (no error recording).
    pub(crate) fn check_current(&self) -> std::result::Result<(), String> {
        let s = match &self.session {
            Some(s) => s,
            None => return Err("no page is locked".into()),
        };
        validate::check_page(
            self.file.page(s.page, self.opts.page_size),
            &s.hdr,
            self.opts.start_slots,
            self.opts.num_pages,
        )
    }

    /// `test_file` path: validate a page, reformatting it if needed.
    fn check_or_recover(&mut self, page_index: usize) -> Result<()> {
        if self.page_is_valid(page_index)? {
            return Ok(());
        }
        warn!(page = page_index, "page failed validation, reformatting");
        self.reformat_page(page_index)?;
        if self.page_is_valid(page_index)? {
            return Ok(());
        }
        self.fail(CacheError::CorruptPage {
            page: page_index,
            reason: "page still invalid after reformat".into(),
        })
    }

    fn page_is_valid(&mut self, page_index: usize) -> Result<bool> {
        match self.lock(page_index) {
            Ok(()) => {
                let ok = self.check_current().is_ok();
                self.unlock()?;
                Ok(ok)
            }
            Err(CacheError::CorruptPage { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // Best-effort unlock without the debug-time invariant scan; a panic
        // mid-transaction must still release the page for other processes.
        if let Some(s) = self.session.take() {
            if s.changed {
                s.hdr.store(self.file.page_mut(s.page, self.opts.page_size));
            }
            let page_size = self.opts.page_size as u64;
            let _ = lock::release(self.file.fd(), s.page as u64 * page_size, page_size);
        }
    }
}
