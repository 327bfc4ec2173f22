//! Dual-level key hash.
//!
//! One rolling shift-add pass over the key bytes yields a single word `h`.
//! `h % num_pages` selects the page; `h / num_pages` is the intra-page hash
//! used to pick a starting slot (`intra % num_slots` at probe time) and is
//! stored with each entry so a page can be rehashed into a larger slot table
//! without re-reading keys.
//!
//! Dividing (rather than taking a second modulo) keeps the intra hash
//! independent of the slot-table size, which grows over a page's lifetime.
//! The function is deterministic and identical across processes and restarts;
//! it must never be replaced with a seeded/randomized hasher.

const HASH_SEED: u64 = 0x92f7_e3b1;

/// Hash `key` into `(page_index, intra_page_hash)` for a cache with
/// `num_pages` pages.
pub fn hash_key(key: &[u8], num_pages: usize) -> (usize, u64) {
    let mut h = HASH_SEED;
    for &b in key {
        h = (h << 4).wrapping_add(h >> 60).wrapping_add(b as u64);
    }
    let pages = num_pages as u64;
    ((h % pages) as usize, h / pages)
}
