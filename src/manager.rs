// Copyright (C) 2024 Ryan Daum <ryan.daum@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! `PageManager` fronts the [`Pool`]: it hands out addressable pages and
//! owns the allocation bookkeeping, leaving the actual memory to the pool
//! underneath. There is no page table translating opaque ids to buffer
//! slots, since a `DbAddress` already *is* a pool offset, so what is left is
//! simpler: a high-water mark for pages never touched, a free list of pages
//! released by abandoned-page reclamation and ready for immediate reuse, and
//! the copy-on-write copy performed by [`PageManager::ensure_writable`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use human_bytes::human_bytes;
use tracing::{debug, warn};

use crate::address::DbAddress;
use crate::error::{Error, Result};
use crate::page::{Page, PageMut, PAGE_SIZE};
use crate::pool::Pool;

pub struct PageManager {
    pool: Pool,
    /// Pages that have been through `AbandonedPage` recycling and are free
    /// for immediate reuse, regardless of the high-water mark.
    free_list: SegQueue<DbAddress>,
    /// First page index never yet handed out by `bump_allocate`.
    next_unallocated: AtomicU32,
    /// Count of pages currently considered live (bumped + not yet recycled),
    /// for the capacity/usage statistics surface.
    live_pages: AtomicU64,
}

impl PageManager {
    /// `first_allocatable_page` reserves the low pages (the root history
    /// ring) from ever being handed out by this allocator; `db` owns those
    /// directly.
    pub fn new(pool: Pool, first_allocatable_page: u32) -> Self {
        Self {
            pool,
            free_list: SegQueue::new(),
            next_unallocated: AtomicU32::new(first_allocatable_page),
            live_pages: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn capacity_bytes(&self) -> usize {
        self.pool.capacity_bytes()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.live_pages.load(Ordering::Relaxed) * PAGE_SIZE as u64
    }

    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes() as u64 - self.allocated_bytes()
    }

    /// Borrow the page at `addr` for reading.
    pub fn get_at(&self, addr: DbAddress) -> Page<'_> {
        assert!(!addr.is_null(), "cannot read the null address");
        Page::from_bytes(self.pool.page(addr.page_index().expect("checked non-null above")))
    }

    /// Borrow the page at `addr` for writing, without any ownership check.
    /// Callers must already know this page belongs to the current batch
    /// (either just allocated, or returned by `ensure_writable`).
    pub fn get_mut_at(&self, addr: DbAddress) -> PageMut<'_> {
        assert!(!addr.is_null(), "cannot write the null address");
        PageMut::from_bytes(self.pool.page_mut(addr.page_index().expect("checked non-null above")))
    }

    /// Inverse of `get_at`: recover the address a page borrow came from.
    pub fn address_of(&self, page: &Page) -> DbAddress {
        DbAddress::new(self.pool.index_of(page.bytes()))
    }

    fn bump_allocate(&self) -> Result<DbAddress> {
        let index = self.next_unallocated.fetch_add(1, Ordering::SeqCst);
        if index >= self.pool.page_count() {
            self.next_unallocated.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::OutOfSpace { capacity_pages: self.pool.page_count() });
        }
        Ok(DbAddress::new(index))
    }

    /// Allocate a fresh page stamped with `batch_id`. Prefers a recycled
    /// page from the free list before growing the high-water mark.
    pub fn allocate(&self, batch_id: u32, clear: bool) -> Result<DbAddress> {
        let addr = match self.free_list.pop() {
            Some(addr) => addr,
            None => self.bump_allocate()?,
        };
        self.live_pages.fetch_add(1, Ordering::Relaxed);

        let mut page = self.get_mut_at(addr);
        page.stamp(batch_id);
        if clear {
            page.zero_body();
        }

        let available = self.available_bytes();
        if available < (PAGE_SIZE as u64) * 64 {
            warn!(available = %human_bytes(available as f64), "page pool is nearly exhausted");
        } else {
            debug!(available = %human_bytes(available as f64), addr = ?addr, "allocated page");
        }
        Ok(addr)
    }

    /// Return a batch of pages released by abandoned-list reclamation to the
    /// free list, so future `allocate` calls reuse them before growing the
    /// file further.
    pub fn recycle(&self, addrs: impl IntoIterator<Item = DbAddress>) {
        for addr in addrs {
            self.pool.advise_page_free(addr.page_index().expect("recycled address must not be null"));
            self.live_pages.fetch_sub(1, Ordering::Relaxed);
            self.free_list.push(addr);
        }
    }

    /// Ensure `addr` is writable by the batch `current_batch_id`: if the
    /// page there is already stamped with that batch, it was allocated or
    /// copied earlier in the same batch and can be mutated in place. Else,
    /// copy it forward into a freshly allocated page stamped with
    /// `current_batch_id` and hand the old address to `on_abandoned` so the
    /// caller can thread it onto that batch's abandoned-page list — the
    /// original must outlive any reader still pinned to the batch that
    /// wrote it.
    pub fn ensure_writable(
        &self,
        addr: DbAddress,
        current_batch_id: u32,
        mut on_abandoned: impl FnMut(DbAddress),
    ) -> Result<DbAddress> {
        assert!(!addr.is_null());
        if self.get_at(addr).batch_id() == current_batch_id {
            return Ok(addr);
        }

        let new_addr = self.allocate(current_batch_id, false)?;
        {
            let old_index = addr.page_index().expect("checked non-null above");
            let new_index = new_addr.page_index().expect("just allocated");
            // Safe: `old_index != new_index` always holds because `new_addr`
            // was just allocated and cannot alias a page already in use.
            let src = self.pool.page(old_index).to_vec();
            self.pool.page_mut(new_index).copy_from_slice(&src);
        }
        self.get_mut_at(new_addr).stamp(current_batch_id);
        on_abandoned(addr);
        Ok(new_addr)
    }

    /// `msync` the data pages: atomic but not yet durable against a crash
    /// that loses the root pointer.
    pub fn flush_data(&self) -> Result<()> {
        self.pool.msync()
    }

    /// `fsync` the backing file: atomic and durable.
    pub fn flush_root(&self) -> Result<()> {
        self.pool.fsync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(pages: u32) -> PageManager {
        let pool = Pool::anonymous(PAGE_SIZE * pages as usize).unwrap();
        PageManager::new(pool, 0)
    }

    #[test]
    fn allocate_advances_the_high_water_mark_and_stamps() {
        let mgr = manager(4);
        let a = mgr.allocate(1, true).unwrap();
        let b = mgr.allocate(1, true).unwrap();
        assert_ne!(a, b);
        assert_eq!(mgr.get_at(a).batch_id(), 1);
        assert_eq!(mgr.get_at(b).batch_id(), 1);
    }

    #[test]
    fn allocate_past_capacity_errors() {
        let mgr = manager(1);
        mgr.allocate(1, true).unwrap();
        assert!(matches!(mgr.allocate(1, true), Err(Error::OutOfSpace { .. })));
    }

    #[test]
    fn recycled_pages_are_reused_before_growing() {
        let mgr = manager(2);
        let a = mgr.allocate(1, true).unwrap();
        mgr.recycle([a]);
        let b = mgr.allocate(2, true).unwrap();
        assert_eq!(a, b, "the only free page should be reused rather than bumping past capacity");
    }

    #[test]
    fn ensure_writable_is_idempotent_within_a_batch() {
        let mgr = manager(4);
        let a = mgr.allocate(1, true).unwrap();
        let mut abandoned = Vec::new();
        let still_a = mgr.ensure_writable(a, 1, |addr| abandoned.push(addr)).unwrap();
        assert_eq!(a, still_a);
        assert!(abandoned.is_empty());
    }

    #[test]
    fn ensure_writable_copies_forward_across_batches() {
        let mgr = manager(4);
        let a = mgr.allocate(1, true).unwrap();
        mgr.get_mut_at(a).body_mut()[0] = 0xAB;

        let mut abandoned = Vec::new();
        let b = mgr.ensure_writable(a, 2, |addr| abandoned.push(addr)).unwrap();
        assert_ne!(a, b);
        assert_eq!(abandoned, vec![a]);
        assert_eq!(mgr.get_at(b).batch_id(), 2);
        assert_eq!(mgr.get_at(b).body()[0], 0xAB, "contents must be copied forward");
        assert_eq!(mgr.get_at(a).body()[0], 0xAB, "the original page is untouched until reclaimed");
    }

    #[test]
    fn address_of_recovers_the_address_a_page_was_read_at() {
        let mgr = manager(4);
        let a = mgr.allocate(1, true).unwrap();
        let b = mgr.allocate(1, true).unwrap();
        assert_eq!(mgr.address_of(&mgr.get_at(a)), a);
        assert_eq!(mgr.address_of(&mgr.get_at(b)), b);
    }

    #[test]
    fn statistics_track_allocation_and_recycling() {
        let mgr = manager(4);
        assert_eq!(mgr.allocated_bytes(), 0);
        let a = mgr.allocate(1, true).unwrap();
        assert_eq!(mgr.allocated_bytes(), PAGE_SIZE as u64);
        mgr.recycle([a]);
        assert_eq!(mgr.allocated_bytes(), 0);
    }
}
