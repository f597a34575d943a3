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

//! The single-writer transaction. A `Batch` works against a private,
//! in-memory working copy of the root page (`root_buf`) seeded from whatever
//! root the database considers current when the batch began; nothing becomes
//! visible to readers until [`Batch::commit`] publishes a new ring slot. This
//! follows the "accumulate a working view, then validate and publish it"
//! pattern, narrowed to a serialized single-writer COW commit with no
//! conflicting-writer detection, since only one writer is ever open at a time.

use std::collections::VecDeque;

use strum::Display;
use tracing::{debug, instrument, trace, warn};

use crate::abandoned;
use crate::address::DbAddress;
use crate::data_page;
use crate::db::PagedDb;
use crate::error::{Error, Result};
use crate::nibble::{self, NibblePath};
use crate::page::PAGE_BODY_LEN;
use crate::root_page::{RootPageView, RootPageViewMut, MAX_ABANDONED_HEADS};

/// Upper bound on a single value's length: generous enough for serialized
/// account/storage payloads, small enough that one value can never dominate
/// a 4 KiB page on its own.
pub const MAX_VALUE_LEN: usize = PAGE_BODY_LEN / 4;

/// What kind of trie entry a key identifies. Purely a discriminator forwarded
/// to the pre-commit hook (so Merkle computation can tell an account leaf
/// from a storage cell) — it has no effect on how the core routes or stores
/// the key.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum DataType {
    Account,
    StorageCell,
}

/// The two commit durability levels.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum CommitMode {
    /// Dirtied data pages are flushed; the new root is written to its ring
    /// slot but not forced to disk. Atomic but not durable.
    FlushDataOnly,
    /// As above, plus a second flush covering the root slot. Atomic and
    /// durable.
    FlushDataAndRoot,
}

/// The opaque Merkle/state-root pre-commit callback. Its algorithm is out of
/// scope for this crate; only the shape of the interface it is handed here.
pub trait PreCommitHook: Send + Sync {
    /// Called once per commit, after all of the batch's own `set`/`set_storage`
    /// calls have been applied, before the new root is published. `store`
    /// gives the hook read/write access to the batch's own working view (so
    /// it may additionally write Merkle branch/leaf material); `prior_state_hash`
    /// is the state hash of the root this batch started from. Returns the new
    /// state hash to record in the committed root.
    fn run(&self, store: &mut dyn PreCommitStore, block_number: u64, prior_state_hash: [u8; 32]) -> Result<[u8; 32]>;
}

/// The interface a pre-commit hook is given onto the batch's own working
/// view. A `Batch` satisfies this by reading/writing through its own COW
/// view of the page tree; the hook never touches the page manager directly.
pub trait PreCommitStore {
    fn get(&self, key: NibblePath) -> Option<&[u8]>;
    fn set(&mut self, key: NibblePath, value: &[u8]) -> Result<()>;
    /// Store an internal (branch) trie node's encoded material at `key`.
    /// Structurally identical to `set`; kept as a separate name because the
    /// Merkle algorithm distinguishes branch nodes from leaves.
    fn set_branch(&mut self, key: NibblePath, value: &[u8]) -> Result<()>;
    /// Store a leaf's encoded material at `key`. Structurally identical to
    /// `set`.
    fn set_leaf(&mut self, key: NibblePath, value: &[u8]) -> Result<()>;
    fn visit(&self, callback: &mut dyn FnMut(NibblePath, &[u8]));
}

/// A hook that performs no Merkle computation at all, reusing the prior
/// state hash unchanged. Used internally for the structural-only batch that
/// `Config::preallocate_fanout` runs at `open`, and available to callers
/// (tests, tools) that don't need Merkle material.
pub struct NoopPreCommitHook;

impl PreCommitHook for NoopPreCommitHook {
    fn run(&self, _store: &mut dyn PreCommitStore, _block_number: u64, prior_state_hash: [u8; 32]) -> Result<[u8; 32]> {
        Ok(prior_state_hash)
    }
}

/// A single-writer transaction over a chosen root. Only one `Batch` may be
/// open against a [`PagedDb`] at a time; `PagedDb::begin_batch` enforces
/// this and the writer slot is released when this value is dropped,
/// whichever of `commit`/`abort`/an early return released it.
pub struct Batch<'db> {
    db: &'db PagedDb,
    batch_id: u32,
    block_number: u64,
    root_buf: Vec<u8>,
    abandoned: Vec<DbAddress>,
    finished: bool,
}

impl<'db> Batch<'db> {
    pub(crate) fn new(db: &'db PagedDb, batch_id: u32, block_number: u64, root_buf: Vec<u8>) -> Self {
        Self { db, batch_id, block_number, root_buf, abandoned: Vec::new(), finished: false }
    }

    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn set_block_number(&mut self, block_number: u64) {
        self.block_number = block_number;
    }

    /// Store `value` at `key`. `data_type` is forwarded to the pre-commit
    /// hook only; it has no bearing on where the key is stored.
    pub fn set(&mut self, key: NibblePath, data_type: DataType, value: &[u8]) -> Result<()> {
        trace!(%data_type, "set");
        self.set_raw(key, value)
    }

    /// Store a storage cell. The effective key is the concatenation of up to
    /// the first 32 nibbles of `account_key` and the first 32 nibbles of
    /// `storage_key` (see `compose_storage_key`): two full 64-nibble Keccak
    /// paths cannot both fit in one 64-nibble `NibblePath`, so each is
    /// truncated to its leading half before routing.
    pub fn set_storage(&mut self, account_key: NibblePath, storage_key: NibblePath, value: &[u8]) -> Result<()> {
        let (bytes, len) = compose_storage_key(account_key, storage_key);
        self.set_raw(NibblePath::new(&bytes, false, len), value)
    }

    pub fn get(&self, key: NibblePath) -> Option<&[u8]> {
        self.get_raw(key)
    }

    pub fn get_account(&self, key: NibblePath) -> Option<&[u8]> {
        self.get_raw(key)
    }

    pub fn get_storage(&self, account_key: NibblePath, storage_key: NibblePath) -> Option<&[u8]> {
        let (bytes, len) = compose_storage_key(account_key, storage_key);
        self.get_raw(NibblePath::new(&bytes, false, len))
    }

    /// Walk every live entry currently visible to this batch.
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

    /// Ensure every one of the 256 top-level fan-out pages exists, even if
    /// empty. Used once, lazily, by the first batch run against a database
    /// opened with `Config::preallocate_fanout`.
    pub(crate) fn preallocate_fan_out(&mut self) -> Result<()> {
        let manager = self.db.manager();
        for prefix in 0u16..=255 {
            let prefix = prefix as u8;
            let existing = RootPageView::new(&self.root_buf).fan_out(prefix);
            if existing.is_null() {
                let addr = manager.allocate(self.batch_id, true)?;
                data_page::init(manager.get_mut_at(addr).into_body_mut());
                RootPageViewMut::new(&mut self.root_buf).set_fan_out(prefix, addr);
            }
        }
        Ok(())
    }

    fn set_raw(&mut self, key: NibblePath, value: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidArgument("commit/abort on a batch that already finished".into()));
        }
        validate_path(&key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::InvalidArgument(format!("value length {} exceeds {MAX_VALUE_LEN}", value.len())));
        }

        let manager = self.db.manager();
        let prefix = fan_out_prefix(&key);

        let top = {
            let mut root = RootPageViewMut::new(&mut self.root_buf);
            let existing = root.as_view().fan_out(prefix);
            if existing.is_null() {
                let addr = manager.allocate(self.batch_id, true)?;
                data_page::init(manager.get_mut_at(addr).into_body_mut());
                root.set_fan_out(prefix, addr);
                addr
            } else {
                existing
            }
        };

        let abandoned = &mut self.abandoned;
        let new_top = data_page::set(manager, top, self.batch_id, key.slice_from(2), value, |a| abandoned.push(a))?;
        if new_top != top {
            RootPageViewMut::new(&mut self.root_buf).set_fan_out(prefix, new_top);
        }
        Ok(())
    }

    fn get_raw(&self, key: NibblePath) -> Option<&[u8]> {
        if key.len() < 2 {
            return None;
        }
        let prefix = fan_out_prefix(&key);
        let top = RootPageView::new(&self.root_buf).fan_out(prefix);
        if top.is_null() {
            return None;
        }
        data_page::get(self.db.manager(), top, key.slice_from(2))
    }

    /// Discard the batch. No state it wrote becomes visible.
    pub fn abort(mut self) {
        self.finished = true;
        debug!(batch_id = self.batch_id, "batch aborted");
    }

    /// Run the pre-commit hook, then publish the new root according to
    /// `mode`.
    #[instrument(level = "debug", skip(self, hook), fields(batch_id = self.batch_id))]
    pub fn commit(mut self, hook: &dyn PreCommitHook, mode: CommitMode) -> Result<[u8; 32]> {
        if self.finished {
            return Err(Error::InvalidArgument("commit on a batch that already finished".into()));
        }

        let prior_state_hash = RootPageView::new(&self.root_buf).state_hash();
        let block_number = self.block_number;
        let state_hash = hook.run(&mut self, block_number, prior_state_hash)?;

        let batch_id = self.batch_id;
        let history_depth = self.db.history_depth();
        let manager = self.db.manager();

        // Reclaim every abandoned-list ring slot old enough to be safely
        // freed, not just the one slot this batch's own abandonments will be
        // filed under — otherwise pages sit unreclaimed in the other
        // `MAX_ABANDONED_HEADS - 1` slots for hundreds of batches regardless
        // of `history_depth`.
        let min_anchor = self.db.min_active_reader_anchor();
        let effective_current = match min_anchor {
            Some(anchor) => batch_id.min(anchor.saturating_add(history_depth)),
            None => batch_id,
        };

        let slot_index = (batch_id as usize) % MAX_ABANDONED_HEADS;
        let heads: Vec<(u32, DbAddress)> = {
            let view = RootPageView::new(&self.root_buf);
            (0..MAX_ABANDONED_HEADS).map(|i| view.abandoned_head(i)).collect()
        };

        let mut recycle = Vec::new();
        let mut new_heads = Vec::with_capacity(MAX_ABANDONED_HEADS);
        let mut slot_index_drained = true;
        for (i, (head_batch_id, mut head)) in heads.into_iter().enumerate() {
            while !head.is_null() {
                let next = abandoned::dequeue_one(
                    manager,
                    head,
                    effective_current,
                    history_depth,
                    |a| self.abandoned.push(a),
                    |a| recycle.push(a),
                )?;
                if next == head {
                    if i == slot_index {
                        slot_index_drained = false;
                    }
                    break;
                }
                head = next;
            }
            new_heads.push((head_batch_id, head));
        }
        manager.recycle(recycle);

        let mut queue: VecDeque<DbAddress> = self.abandoned.drain(..).collect();
        if slot_index_drained {
            let mut head = DbAddress::NULL;
            while let Some(addr) = queue.pop_front() {
                head = abandoned::enqueue(manager, head, batch_id, addr, |a| queue.push_back(a))?;
            }
            new_heads[slot_index] = (batch_id, head);
        } else if !queue.is_empty() {
            warn!(
                slot = slot_index,
                dropped = queue.len(),
                "abandoned-list ring slot still occupied at reuse time; this batch's own \
                 abandonments were not recorded and will not be reclaimed"
            );
        }

        let mut root = RootPageViewMut::new(&mut self.root_buf);
        for (i, (b, h)) in new_heads.into_iter().enumerate() {
            root.set_abandoned_head(i, b, h);
        }
        root.set_batch_id(batch_id);
        root.set_block_number(block_number);
        root.set_state_hash(state_hash);
        drop(root);

        let next_slot = (self.db.current_slot() + 1) % history_depth;
        {
            let mut page = manager.get_mut_at(DbAddress::new(next_slot));
            page.stamp(batch_id);
            page.body_mut().copy_from_slice(&self.root_buf);
        }

        if self.db.flush_to_disk() {
            manager.flush_data()?;
            if mode == CommitMode::FlushDataAndRoot {
                manager.flush_root()?;
            }
        }

        self.db.publish(next_slot, batch_id);
        self.finished = true;
        debug!(batch_id, block_number, slot = next_slot, %mode, "batch committed");
        Ok(state_hash)
    }
}

impl<'db> Drop for Batch<'db> {
    fn drop(&mut self) {
        self.db.release_writer();
    }
}

impl<'db> PreCommitStore for Batch<'db> {
    fn get(&self, key: NibblePath) -> Option<&[u8]> {
        self.get_raw(key)
    }

    fn set(&mut self, key: NibblePath, value: &[u8]) -> Result<()> {
        self.set_raw(key, value)
    }

    fn set_branch(&mut self, key: NibblePath, value: &[u8]) -> Result<()> {
        self.set_raw(key, value)
    }

    fn set_leaf(&mut self, key: NibblePath, value: &[u8]) -> Result<()> {
        self.set_raw(key, value)
    }

    fn visit(&self, callback: &mut dyn FnMut(NibblePath, &[u8])) {
        Batch::visit(self, callback)
    }
}

fn validate_path(path: &NibblePath) -> Result<()> {
    if path.len() > nibble::MAX_NIBBLES {
        return Err(Error::InvalidArgument(format!("path length {} exceeds {}", path.len(), nibble::MAX_NIBBLES)));
    }
    if path.len() < 2 {
        return Err(Error::InvalidArgument("path must be at least 2 nibbles (consumed by top-level fan-out)".into()));
    }
    Ok(())
}

pub(crate) fn fan_out_prefix(path: &NibblePath) -> u8 {
    (path.nibble_at(0) << 4) | path.nibble_at(1)
}

/// Compose the routing key for a storage cell: the leading 32 nibbles of
/// `account_key` followed by the leading 32 nibbles of `storage_key`, capped
/// at 64 nibbles total so the result always fits one `NibblePath`. See
/// `DESIGN.md` for why this truncation, rather than a second fan-out
/// dimension or a nested per-account trie, was chosen.
pub(crate) fn compose_storage_key(account_key: NibblePath, storage_key: NibblePath) -> ([u8; 32], usize) {
    let mut nibbles = [0u8; 64];
    let mut len = 0usize;
    for i in 0..account_key.len().min(32) {
        nibbles[len] = account_key.nibble_at(i);
        len += 1;
    }
    for i in 0..storage_key.len().min(32) {
        nibbles[len] = storage_key.nibble_at(i);
        len += 1;
    }
    let mut bytes = [0u8; 32];
    for (i, pair) in nibbles[..len].chunks(2).enumerate() {
        bytes[i] = if pair.len() == 2 { (pair[0] << 4) | pair[1] } else { pair[0] << 4 };
    }
    (bytes, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Config;

    fn test_db(history_depth: u32, capacity_pages: u32) -> PagedDb {
        PagedDb::open(
            None,
            Config {
                capacity_bytes: capacity_pages as usize * crate::page::PAGE_SIZE,
                history_depth,
                flush_to_disk: false,
                preallocate_fanout: false,
            },
        )
        .unwrap()
    }

    fn key(bytes: &[u8]) -> NibblePath<'_> {
        NibblePath::from_bytes(bytes)
    }

    #[test]
    fn set_then_get_roundtrips_and_commit_publishes() {
        let db = test_db(4, 64);
        let mut batch = db.begin_batch().unwrap();
        batch.set(key(&[0x01; 32]), DataType::Account, b"account-a").unwrap();
        assert_eq!(batch.get(key(&[0x01; 32])), Some(&b"account-a"[..]));
        let hash = batch.commit(&NoopPreCommitHook, CommitMode::FlushDataAndRoot).unwrap();
        assert_eq!(hash, [0u8; 32]);

        let read = db.begin_read_only_batch();
        assert_eq!(read.get(key(&[0x01; 32])), Some(&b"account-a"[..]));
    }

    #[test]
    fn only_one_batch_may_be_open_at_a_time() {
        let db = test_db(4, 64);
        let _first = db.begin_batch().unwrap();
        assert!(matches!(db.begin_batch(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn dropping_a_batch_without_committing_releases_the_writer_slot() {
        let db = test_db(4, 64);
        {
            let mut batch = db.begin_batch().unwrap();
            batch.set(key(&[0x02; 32]), DataType::Account, b"v").unwrap();
            // batch dropped here without commit/abort
        }
        let batch = db.begin_batch().unwrap();
        assert_eq!(batch.get(key(&[0x02; 32])), None, "uncommitted writes must not be visible");
    }

    #[test]
    fn rejects_paths_shorter_than_two_nibbles() {
        let db = test_db(4, 64);
        let mut batch = db.begin_batch().unwrap();
        assert!(matches!(batch.set(key(&[0x01]), DataType::Account, b"v"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn set_storage_composes_account_and_storage_nibbles() {
        let db = test_db(4, 64);
        let mut batch = db.begin_batch().unwrap();
        let account = key(&[0xAA; 32]);
        let slot = key(&[0xBB; 32]);
        batch.set_storage(account, slot, b"cell").unwrap();
        assert_eq!(batch.get_storage(account, slot), Some(&b"cell"[..]));
        // A different storage slot under the same account must not collide.
        let other_slot = key(&[0xCC; 32]);
        assert_eq!(batch.get_storage(account, other_slot), None);
    }

    #[test]
    fn visit_sees_every_committed_entry() {
        let db = test_db(4, 256);
        let mut batch = db.begin_batch().unwrap();
        let mut expected = std::collections::HashSet::new();
        for i in 0u8..64 {
            let mut k = [0u8; 32];
            k[0] = i;
            batch.set(key(&k), DataType::Account, b"v").unwrap();
            expected.insert(k.to_vec());
        }
        let mut seen = std::collections::HashSet::new();
        batch.visit(&mut |path, _value| {
            seen.insert(path.to_vec());
        });
        assert_eq!(seen, expected);
    }
}
