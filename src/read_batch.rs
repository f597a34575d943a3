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

//! A read-only snapshot pinned to one committed root. Any number of
//! `ReadBatch`es may be open alongside each other and alongside the single
//! writer: none of them block a `Batch`, and a `Batch` never blocks them,
//! since COW means a reader's root and the pages it reaches are never
//! mutated in place once published. What a live `ReadBatch` *does* do is
//! hold back reclamation: it registers a lease on the batch it anchors to,
//! and [`crate::db::PagedDb`] folds the oldest still-registered lease into
//! the abandoned-page reclaim threshold so a page freed after this snapshot
//! was taken is never actually reused while this snapshot might still read it.

use crate::db::PagedDb;
use crate::nibble::{self, NibblePath};
use crate::{data_page, root_page::RootPageView};

/// The header fields carried by a root page, surfaced to callers without
/// exposing the page layout itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub batch_id: u32,
    pub block_number: u64,
    pub state_hash: [u8; 32],
}

/// A read-only view of the database as of whichever batch it was opened
/// against.
pub struct ReadBatch<'db> {
    db: &'db PagedDb,
    lease_id: u64,
    root_buf: Vec<u8>,
}

impl<'db> ReadBatch<'db> {
    pub(crate) fn new(db: &'db PagedDb, lease_id: u64, root_buf: Vec<u8>) -> Self {
        Self { db, lease_id, root_buf }
    }

    pub fn metadata(&self) -> Metadata {
        let view = RootPageView::new(&self.root_buf);
        Metadata { batch_id: view.batch_id(), block_number: view.block_number(), state_hash: view.state_hash() }
    }

    pub fn get(&self, key: NibblePath) -> Option<&[u8]> {
        self.get_raw(key)
    }

    pub fn get_account(&self, key: NibblePath) -> Option<&[u8]> {
        self.get_raw(key)
    }

    pub fn get_storage(&self, account_key: NibblePath, storage_key: NibblePath) -> Option<&[u8]> {
        let (bytes, len) = crate::batch::compose_storage_key(account_key, storage_key);
        self.get_raw(NibblePath::new(&bytes, false, len))
    }

    pub fn visit(&self, callback: &mut dyn FnMut(NibblePath, &[u8])) {
        let view = RootPageView::new(&self.root_buf);
        let mut prefix = Vec::with_capacity(nibble::MAX_NIBBLES);
        for byte in 0u16..=255 {
            let top = view.fan_out(byte as u8);
            if top.is_null() {
                continue;
            }
            prefix.clear();
            prefix.push((byte as u8) >> 4);
            prefix.push((byte as u8) & 0x0F);
            data_page::visit(self.db.manager(), top, &mut prefix, callback);
        }
    }

    fn get_raw(&self, key: NibblePath) -> Option<&[u8]> {
        if key.len() < 2 {
            return None;
        }
        let prefix = crate::batch::fan_out_prefix(&key);
        let top = RootPageView::new(&self.root_buf).fan_out(prefix);
        if top.is_null() {
            return None;
        }
        data_page::get(self.db.manager(), top, key.slice_from(2))
    }
}

impl<'db> Drop for ReadBatch<'db> {
    fn drop(&mut self) {
        self.db.release_reader_lease(self.lease_id);
    }
}
