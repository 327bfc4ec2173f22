//! Full-page integrity scan.
//!
//! Re-derives everything the header claims from the slot table itself:
//! counter recounts, offset bounds and alignment, entry length sanity, and
//! for every live entry that its stored intra hash matches a fresh hash of
//! the key and that probing from it reaches the same slot (the chain is not
//! broken by a stray empty slot).
//!
//! Runs under `debug_assertions` around every unlock, during `test_file`
//! recovery at init, and on demand via `Cache::verify_page`.

use super::find_slot;
use super::layout::{
    self, PageHeader, PAGE_MAGIC, SLOT_EMPTY, SLOT_TOMBSTONE, WORD,
};
use crate::hash::hash_key;

/// Check one page against its session header. Returns the first violated
/// invariant as a human-readable reason.
pub(crate) fn check_page(
    page: &[u8],
    hdr: &PageHeader,
    start_slots: usize,
    num_pages: usize,
) -> Result<(), String> {
    let page_size = page.len() as u64;

    let (magic, _) = PageHeader::load(page);
    if magic != PAGE_MAGIC {
        return Err(format!("magic {magic:#x} != {PAGE_MAGIC:#x}"));
    }
    if hdr.num_slots < start_slots as u64 || hdr.num_slots >= page_size {
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

    let num_slots = hdr.num_slots as usize;
    let arena_start = layout::arena_start(num_slots) as u64;
    if hdr.free_data < arena_start {
        return Err(format!(
            "free_data {} below arena start {arena_start}",
            hdr.free_data
        ));
    }

    let arena_size = page_size - arena_start;
    let mut count_free = 0u64;
    let mut count_old = 0u64;
    let mut used_data = 0u64;
    let mut max_end = 0u64;

    for i in 0..num_slots {
        let offset = layout::get_slot(page, i);
        if offset == SLOT_TOMBSTONE {
            count_old += 1;
        }
        if offset == SLOT_EMPTY || offset == SLOT_TOMBSTONE {
            count_free += 1;
            continue;
        }

        if offset < arena_start || offset >= page_size {
            return Err(format!("slot {i} offset {offset} outside arena"));
        }
        if offset % WORD as u64 != 0 {
            return Err(format!("slot {i} offset {offset} misaligned"));
        }

        let off = offset as usize;
        let key_len = layout::entry_key_len(page, off) as u64;
        let val_len = layout::entry_val_len(page, off) as u64;
        if key_len >= page_size || val_len >= page_size {
            return Err(format!(
                "slot {i} entry lengths {key_len}/{val_len} exceed page"
            ));
        }
        let rounded = layout::round_len(layout::entry_size(
            key_len as usize,
            val_len as usize,
        )) as u64;
        if offset + rounded > page_size {
            return Err(format!("slot {i} entry overruns page end"));
        }
        used_data += rounded;
        if used_data > arena_size {
            return Err(format!(
                "live entries occupy {used_data} of {arena_size} arena bytes"
            ));
        }
        if offset + rounded > max_end {
            max_end = offset + rounded;
        }

        // The stored intra hash must be what the key actually hashes to, and
        // probing from it must land back on this very slot.
        let key = layout::entry_key(page, off);
        let slot_hash = layout::entry_slot_hash(page, off);
        let (_, intra) = hash_key(key, num_pages);
        if intra != slot_hash {
            return Err(format!(
                "slot {i} stored hash {slot_hash} != key hash {intra}"
            ));
        }
        match find_slot(page, num_slots, slot_hash, key, false) {
            Some(found) if found == i => {}
            other => {
                return Err(format!(
                    "slot {i} not reachable by probe (got {other:?})"
                ));
            }
        }
    }

    if count_free != hdr.free_slots {
        return Err(format!(
            "free_slots {} but table holds {count_free}",
            hdr.free_slots
        ));
    }
    if count_old != hdr.old_slots {
        return Err(format!(
            "old_slots {} but table holds {count_old}",
            hdr.old_slots
        ));
    }
    if max_end > hdr.free_data {
        return Err(format!(
            "entry data ends at {max_end}, past free_data {}",
            hdr.free_data
        ));
    }

    Ok(())
}
