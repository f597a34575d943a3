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

//! The root page: one slot in the history ring. Carries a copy of `batch_id`
//! in the typed body (in addition to the one in the shared page header) so
//! that discovery-on-open can tell a fully-written root from one truncated
//! mid-write — the two must agree for the slot to be considered
//! self-consistent. Beyond that: the block number and state hash the
//! pre-commit hook published, the 256-wide first-level fan-out table keyed
//! by the leading byte (two nibbles) of a path, and a ring of recent
//! abandoned-page list heads keyed by the batch that abandoned them.

use binary_layout::binary_layout;

use crate::address::DbAddress;
use crate::page::PAGE_BODY_LEN;

/// Fixed fan-out width for the top of the page tree, chosen over a 16-wide
/// table for flatter, more uniform prefix dispatch.
pub const FAN_OUT_PAGES: usize = 256;

const FAN_OUT_BYTES: usize = FAN_OUT_PAGES * 4;
const ABANDONED_HEAD_BYTES: usize = 8; // u32 batch_id + 4-byte DbAddress

binary_layout!(root_fixed, LittleEndian, {
    batch_id: u32,
    block_number: u64,
    state_hash: [u8; 32],
    next_free_page: u32,
    abandoned_list_count: u32,
});

const FIXED_LEN: usize = 4 + 8 + 32 + 4 + 4;

/// How many `{batch_id, head}` abandoned-list-head entries fit after the
/// fixed fields and the fan-out table, within one page body.
pub const MAX_ABANDONED_HEADS: usize = (PAGE_BODY_LEN - FIXED_LEN - FAN_OUT_BYTES) / ABANDONED_HEAD_BYTES;

const FAN_OUT_OFFSET: usize = FIXED_LEN;
const ABANDONED_HEADS_OFFSET: usize = FAN_OUT_OFFSET + FAN_OUT_BYTES;

/// A read-only view over a root page's body (the page bytes after the
/// shared 8-byte header).
pub struct RootPageView<'a> {
    body: &'a [u8],
}

impl<'a> RootPageView<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        assert!(body.len() >= ABANDONED_HEADS_OFFSET + MAX_ABANDONED_HEADS * ABANDONED_HEAD_BYTES);
        Self { body }
    }

    fn fixed(&self) -> root_fixed::View<&[u8]> {
        root_fixed::View::new(&self.body[..FIXED_LEN])
    }

    pub fn batch_id(&self) -> u32 {
        self.fixed().batch_id().read()
    }
    pub fn block_number(&self) -> u64 {
        self.fixed().block_number().read()
    }
    pub fn state_hash(&self) -> [u8; 32] {
        self.fixed().state_hash().read()
    }
    pub fn next_free_page(&self) -> u32 {
        self.fixed().next_free_page().read()
    }
    pub fn abandoned_list_count(&self) -> u32 {
        self.fixed().abandoned_list_count().read()
    }

    /// Fan-out entry for leading byte (two nibbles) `key_prefix`.
    pub fn fan_out(&self, key_prefix: u8) -> DbAddress {
        let off = FAN_OUT_OFFSET + key_prefix as usize * 4;
        DbAddress::from_le_bytes(self.body[off..off + 4].try_into().unwrap())
    }

    /// `(batch_id, head)` at abandoned-heads ring slot `i`.
    pub fn abandoned_head(&self, i: usize) -> (u32, DbAddress) {
        assert!(i < MAX_ABANDONED_HEADS);
        let off = ABANDONED_HEADS_OFFSET + i * ABANDONED_HEAD_BYTES;
        let batch_id = u32::from_le_bytes(self.body[off..off + 4].try_into().unwrap());
        let head = DbAddress::from_le_bytes(self.body[off + 4..off + 8].try_into().unwrap());
        (batch_id, head)
    }

    /// Structural check cheap enough to run at a trust boundary (database
    /// open, `reorganize_back_to_and_start_new`, picking a historical root
    /// for a `ReadBatch`): every address this root page claims to own must
    /// actually address a page within the backing store. Internal descent
    /// (`data_page::get`/`set`) does not repeat this check; hot paths assume
    /// the invariants this check verifies once at the boundary.
    pub fn validate(&self, page_count: u32) -> std::result::Result<(), (DbAddress, &'static str)> {
        for prefix in 0u16..=255 {
            let addr = self.fan_out(prefix as u8);
            if let Some(idx) = addr.page_index() {
                if idx >= page_count {
                    return Err((addr, "fan-out entry points beyond the backing store"));
                }
            }
        }
        for i in 0..MAX_ABANDONED_HEADS {
            let (_, head) = self.abandoned_head(i);
            if let Some(idx) = head.page_index() {
                if idx >= page_count {
                    return Err((head, "abandoned-list head points beyond the backing store"));
                }
            }
        }
        Ok(())
    }
}

/// A writable view over a root page's body.
pub struct RootPageViewMut<'a> {
    body: &'a mut [u8],
}

impl<'a> RootPageViewMut<'a> {
    pub fn new(body: &'a mut [u8]) -> Self {
        assert!(body.len() >= ABANDONED_HEADS_OFFSET + MAX_ABANDONED_HEADS * ABANDONED_HEAD_BYTES);
        Self { body }
    }

    fn fixed_mut(&mut self) -> root_fixed::View<&mut [u8]> {
        root_fixed::View::new(&mut self.body[..FIXED_LEN])
    }

    pub fn as_view(&self) -> RootPageView<'_> {
        RootPageView { body: self.body }
    }

    pub fn batch_id(&self) -> u32 {
        self.as_view().batch_id()
    }

    /// Reset to an empty root: zero state hash, zero block number, no
    /// fan-out pages yet, no abandoned lists, stamped with `batch_id`. Used
    /// both for the very first root page on a fresh file and as the starting
    /// point for each new batch's working root before it mutates fields.
    pub fn init_empty(&mut self, batch_id: u32) {
        self.body.fill(0);
        let mut fixed = self.fixed_mut();
        fixed.batch_id_mut().write(batch_id);
        fixed.block_number_mut().write(0);
        fixed.state_hash_mut().write([0u8; 32]);
        fixed.next_free_page_mut().write(0);
        fixed.abandoned_list_count_mut().write(0);
        for i in 0..FAN_OUT_PAGES {
            self.set_fan_out(i as u8, DbAddress::NULL);
        }
        for i in 0..MAX_ABANDONED_HEADS {
            self.set_abandoned_head(i, 0, DbAddress::NULL);
        }
    }

    pub fn set_batch_id(&mut self, v: u32) {
        self.fixed_mut().batch_id_mut().write(v);
    }
    pub fn set_block_number(&mut self, v: u64) {
        self.fixed_mut().block_number_mut().write(v);
    }
    pub fn set_state_hash(&mut self, v: [u8; 32]) {
        self.fixed_mut().state_hash_mut().write(v);
    }
    pub fn set_next_free_page(&mut self, v: u32) {
        self.fixed_mut().next_free_page_mut().write(v);
    }
    pub fn set_abandoned_list_count(&mut self, v: u32) {
        self.fixed_mut().abandoned_list_count_mut().write(v);
    }

    pub fn set_fan_out(&mut self, key_prefix: u8, addr: DbAddress) {
        let off = FAN_OUT_OFFSET + key_prefix as usize * 4;
        self.body[off..off + 4].copy_from_slice(&addr.to_le_bytes());
    }

    pub fn set_abandoned_head(&mut self, i: usize, batch_id: u32, head: DbAddress) {
        assert!(i < MAX_ABANDONED_HEADS);
        let off = ABANDONED_HEADS_OFFSET + i * ABANDONED_HEAD_BYTES;
        self.body[off..off + 4].copy_from_slice(&batch_id.to_le_bytes());
        self.body[off + 4..off + 8].copy_from_slice(&head.to_le_bytes());
    }

    /// Copy every field from `other` (used to seed a new batch's working
    /// root from the previous committed one).
    pub fn copy_from(&mut self, other: &RootPageView) {
        self.set_batch_id(other.batch_id());
        self.set_block_number(other.block_number());
        self.set_state_hash(other.state_hash());
        self.set_next_free_page(other.next_free_page());
        self.set_abandoned_list_count(other.abandoned_list_count());
        for i in 0..FAN_OUT_PAGES {
            self.set_fan_out(i as u8, other.fan_out(i as u8));
        }
        for i in 0..MAX_ABANDONED_HEADS {
            let (b, h) = other.abandoned_head(i);
            self.set_abandoned_head(i, b, h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_BODY_LEN;

    #[test]
    fn init_then_roundtrip_fields() {
        let mut body = vec![0xFFu8; PAGE_BODY_LEN];
        let mut view = RootPageViewMut::new(&mut body);
        view.init_empty(7);
        assert_eq!(view.batch_id(), 7);
        assert_eq!(view.as_view().block_number(), 0);
        assert_eq!(view.as_view().state_hash(), [0u8; 32]);
        assert!(view.as_view().fan_out(0x12).is_null());
        assert_eq!(view.as_view().abandoned_head(10), (0, DbAddress::NULL));
    }

    #[test]
    fn fan_out_and_abandoned_heads_roundtrip() {
        let mut body = vec![0u8; PAGE_BODY_LEN];
        let mut view = RootPageViewMut::new(&mut body);
        view.init_empty(1);
        view.set_fan_out(0xAB, DbAddress::new(99));
        view.set_abandoned_head(3, 5, DbAddress::new(123));

        let read = view.as_view();
        assert_eq!(read.fan_out(0xAB).page_index(), Some(99));
        assert_eq!(read.abandoned_head(3), (5, DbAddress::new(123)));
        assert!(read.fan_out(0x00).is_null());
    }

    #[test]
    fn copy_from_duplicates_every_field() {
        let mut src_body = vec![0u8; PAGE_BODY_LEN];
        let mut src = RootPageViewMut::new(&mut src_body);
        src.init_empty(42);
        src.set_block_number(1000);
        src.set_state_hash([9u8; 32]);
        src.set_fan_out(0x01, DbAddress::new(5));
        src.set_abandoned_head(0, 42, DbAddress::new(7));

        let mut dst_body = vec![0xFFu8; PAGE_BODY_LEN];
        let mut dst = RootPageViewMut::new(&mut dst_body);
        dst.copy_from(&src.as_view());

        assert_eq!(dst.as_view().batch_id(), 42);
        assert_eq!(dst.as_view().block_number(), 1000);
        assert_eq!(dst.as_view().state_hash(), [9u8; 32]);
        assert_eq!(dst.as_view().fan_out(0x01).page_index(), Some(5));
        assert_eq!(dst.as_view().abandoned_head(0), (42, DbAddress::new(7)));
    }

    #[test]
    fn max_abandoned_heads_fits_the_page_body() {
        assert!(ABANDONED_HEADS_OFFSET + MAX_ABANDONED_HEADS * ABANDONED_HEAD_BYTES <= PAGE_BODY_LEN);
    }

    #[test]
    fn validate_accepts_in_bounds_pointers() {
        let mut body = vec![0u8; PAGE_BODY_LEN];
        let mut view = RootPageViewMut::new(&mut body);
        view.init_empty(1);
        view.set_fan_out(0x01, DbAddress::new(3));
        view.set_abandoned_head(0, 1, DbAddress::new(4));
        assert!(view.as_view().validate(8).is_ok());
    }

    #[test]
    fn validate_rejects_a_fan_out_pointer_past_the_backing_store() {
        let mut body = vec![0u8; PAGE_BODY_LEN];
        let mut view = RootPageViewMut::new(&mut body);
        view.init_empty(1);
        view.set_fan_out(0x01, DbAddress::new(100));
        let err = view.as_view().validate(8).unwrap_err();
        assert_eq!(err.0, DbAddress::new(100));
    }

    #[test]
    fn validate_rejects_an_abandoned_head_past_the_backing_store() {
        let mut body = vec![0u8; PAGE_BODY_LEN];
        let mut view = RootPageViewMut::new(&mut body);
        view.init_empty(1);
        view.set_abandoned_head(0, 1, DbAddress::new(100));
        let err = view.as_view().validate(8).unwrap_err();
        assert_eq!(err.0, DbAddress::new(100));
    }
}
