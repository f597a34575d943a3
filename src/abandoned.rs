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

//! A queue node holding pages abandoned by copy-on-write. Nodes anchored at
//! the same root-page history slot all carry the same
//! `batch_id_at_abandonment` and chain together via `next` once one fills
//! up. Mutating a node that belongs to an earlier batch goes through the
//! same copy-on-write discipline as any other page — even the bookkeeping
//! pages come from the allocator.

use binary_layout::binary_layout;

use crate::address::DbAddress;
use crate::error::Result;
use crate::manager::PageManager;
use crate::page::PAGE_BODY_LEN;

binary_layout!(abandoned_fixed, LittleEndian, {
    batch_id_at_abandonment: u32,
    count: u32,
    next: u32,
});

const FIXED_LEN: usize = 4 + 4 + 4;

/// How many `DbAddress` entries fit in one node after the fixed header.
pub const MAX_ENTRIES: usize = (PAGE_BODY_LEN - FIXED_LEN) / 4;

const ENTRIES_OFFSET: usize = FIXED_LEN;

pub struct AbandonedPageView<'a> {
    body: &'a [u8],
}

impl<'a> AbandonedPageView<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        assert!(body.len() >= ENTRIES_OFFSET + MAX_ENTRIES * 4);
        Self { body }
    }

    fn fixed(&self) -> abandoned_fixed::View<&[u8]> {
        abandoned_fixed::View::new(&self.body[..FIXED_LEN])
    }

    pub fn batch_id_at_abandonment(&self) -> u32 {
        self.fixed().batch_id_at_abandonment().read()
    }

    pub fn count(&self) -> u32 {
        self.fixed().count().read()
    }

    pub fn next(&self) -> DbAddress {
        DbAddress::from_le_bytes(self.fixed().next().read().to_le_bytes())
    }

    pub fn entry(&self, i: u32) -> DbAddress {
        assert!(i < MAX_ENTRIES as u32);
        let off = ENTRIES_OFFSET + i as usize * 4;
        DbAddress::from_le_bytes(self.body[off..off + 4].try_into().unwrap())
    }
}

pub struct AbandonedPageViewMut<'a> {
    body: &'a mut [u8],
}

impl<'a> AbandonedPageViewMut<'a> {
    pub fn new(body: &'a mut [u8]) -> Self {
        assert!(body.len() >= ENTRIES_OFFSET + MAX_ENTRIES * 4);
        Self { body }
    }

    fn fixed_mut(&mut self) -> abandoned_fixed::View<&mut [u8]> {
        abandoned_fixed::View::new(&mut self.body[..FIXED_LEN])
    }

    pub fn as_view(&self) -> AbandonedPageView<'_> {
        AbandonedPageView { body: self.body }
    }

    pub fn count(&self) -> u32 {
        self.as_view().count()
    }

    /// Reset to an empty node for `batch_id_at_abandonment`, chained onto
    /// `next`.
    pub fn init(&mut self, batch_id_at_abandonment: u32, next: DbAddress) {
        self.body.fill(0);
        let mut fixed = self.fixed_mut();
        fixed.batch_id_at_abandonment_mut().write(batch_id_at_abandonment);
        fixed.count_mut().write(0);
        fixed.next_mut().write(next.as_u32());
    }

    fn set_count(&mut self, count: u32) {
        self.fixed_mut().count_mut().write(count);
    }

    fn set_entry(&mut self, i: u32, addr: DbAddress) {
        assert!(i < MAX_ENTRIES as u32);
        let off = ENTRIES_OFFSET + i as usize * 4;
        self.body[off..off + 4].copy_from_slice(&addr.to_le_bytes());
    }

    /// Append `addr`; returns `false` if the node is already full.
    pub fn push(&mut self, addr: DbAddress) -> bool {
        let count = self.count();
        if count as usize >= MAX_ENTRIES {
            return false;
        }
        self.set_entry(count, addr);
        self.set_count(count + 1);
        true
    }

    /// Remove and return the last entry, or `None` if the node is empty.
    pub fn pop(&mut self) -> Option<DbAddress> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let addr = self.as_view().entry(count - 1);
        self.set_count(count - 1);
        Some(addr)
    }
}

/// Append `addr` to the abandoned list anchored at `head` (may be
/// `DbAddress::NULL` for a fresh list), returning the (possibly new) head.
/// `current_batch_id` both stamps any newly allocated node and is the
/// abandonment batch recorded on it.
pub fn enqueue(
    manager: &PageManager,
    head: DbAddress,
    current_batch_id: u32,
    addr: DbAddress,
    mut on_abandoned: impl FnMut(DbAddress),
) -> Result<DbAddress> {
    if head.is_null() {
        let node = manager.allocate(current_batch_id, true)?;
        let mut view = AbandonedPageViewMut::new(manager.get_mut_at(node).body_mut());
        view.init(current_batch_id, DbAddress::NULL);
        view.push(addr);
        return Ok(node);
    }

    let writable_head = manager.ensure_writable(head, current_batch_id, &mut on_abandoned)?;
    {
        let mut view = AbandonedPageViewMut::new(manager.get_mut_at(writable_head).body_mut());
        if view.push(addr) {
            return Ok(writable_head);
        }
    }

    let node = manager.allocate(current_batch_id, true)?;
    let mut view = AbandonedPageViewMut::new(manager.get_mut_at(node).body_mut());
    view.init(current_batch_id, writable_head);
    view.push(addr);
    Ok(node)
}

/// Pop one reclaimable page off the list anchored at `head`, if the node
/// there is old enough (`current_batch_id - batch_id_at_abandonment >=
/// history_depth`). Returns the (possibly new, possibly unchanged) head;
/// `on_free_page` receives both the popped data page and, when a node
/// empties out, the node's own now-reclaimable address.
pub fn dequeue_one(
    manager: &PageManager,
    head: DbAddress,
    current_batch_id: u32,
    history_depth: u32,
    mut on_abandoned: impl FnMut(DbAddress),
    mut on_free_page: impl FnMut(DbAddress),
) -> Result<DbAddress> {
    if head.is_null() {
        return Ok(head);
    }

    let batch_id_at_abandonment = AbandonedPageView::new(manager.get_at(head).body()).batch_id_at_abandonment();
    if current_batch_id.saturating_sub(batch_id_at_abandonment) < history_depth {
        return Ok(head);
    }

    let writable_head = manager.ensure_writable(head, current_batch_id, &mut on_abandoned)?;
    let (popped, remaining, next) = {
        let mut view = AbandonedPageViewMut::new(manager.get_mut_at(writable_head).body_mut());
        let popped = view.pop();
        let remaining = view.count();
        let next = view.as_view().next();
        (popped, remaining, next)
    };

    if let Some(addr) = popped {
        on_free_page(addr);
    }

    if remaining == 0 {
        on_free_page(writable_head);
        Ok(next)
    } else {
        Ok(writable_head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;
    use crate::pool::Pool;

    fn manager(pages: u32) -> PageManager {
        let pool = Pool::anonymous(PAGE_SIZE * pages as usize).unwrap();
        PageManager::new(pool, 0)
    }

    #[test]
    fn enqueue_creates_a_node_on_first_use() {
        let mgr = manager(8);
        let head = enqueue(&mgr, DbAddress::NULL, 1, DbAddress::new(5), |_| panic!("no abandonment yet")).unwrap();
        assert!(!head.is_null());
        let view = AbandonedPageView::new(mgr.get_at(head).body());
        assert_eq!(view.count(), 1);
        assert_eq!(view.entry(0), DbAddress::new(5));
        assert_eq!(view.batch_id_at_abandonment(), 1);
        assert!(view.next().is_null());
    }

    #[test]
    fn enqueue_chains_a_new_node_once_full() {
        let mgr = manager(MAX_ENTRIES as u32 + 8);
        let mut head = DbAddress::NULL;
        for i in 0..MAX_ENTRIES as u32 {
            head = enqueue(&mgr, head, 1, DbAddress::new(i + 1), |_| {}).unwrap();
        }
        let full_node = head;
        assert_eq!(AbandonedPageView::new(mgr.get_at(full_node).body()).count(), MAX_ENTRIES as u32);

        let new_head = enqueue(&mgr, head, 1, DbAddress::new(999), |_| {}).unwrap();
        assert_ne!(new_head, full_node);
        let view = AbandonedPageView::new(mgr.get_at(new_head).body());
        assert_eq!(view.count(), 1);
        assert_eq!(view.next(), full_node);
    }

    #[test]
    fn dequeue_respects_history_depth() {
        let mgr = manager(8);
        let head = enqueue(&mgr, DbAddress::NULL, 1, DbAddress::new(5), |_| {}).unwrap();

        let unchanged = dequeue_one(&mgr, head, 2, 4, |_| {}, |_| panic!("not old enough yet")).unwrap();
        assert_eq!(unchanged, head);

        let mut freed = Vec::new();
        let after = dequeue_one(&mgr, head, 5, 4, |_| {}, |addr| freed.push(addr)).unwrap();
        assert_eq!(freed, vec![DbAddress::new(5), head], "both the entry and the now-empty node are freed");
        assert!(after.is_null());
    }

    #[test]
    fn dequeue_copies_node_forward_when_crossing_a_batch() {
        let mgr = manager(8);
        let head = enqueue(&mgr, DbAddress::NULL, 1, DbAddress::new(5), |_| {}).unwrap();
        let mut abandoned = Vec::new();
        let mut freed = Vec::new();
        let new_head = dequeue_one(&mgr, head, 5, 4, |addr| abandoned.push(addr), |addr| freed.push(addr)).unwrap();
        assert!(new_head.is_null(), "node became empty and was freed in the same step");
        assert!(freed.contains(&DbAddress::new(5)));
        assert_eq!(abandoned, vec![head], "the batch-1 node itself was COW'd forward before being emptied");
    }
}
