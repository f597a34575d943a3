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

//! The top-level handle: a backing store plus a history of roots. The root
//! history is a ring of `history_depth` pages living at the very front of
//! the pool's address space (indices `0..history_depth`), each holding a
//! copy of the same `RootPage` layout stamped with the batch that wrote it.
//! Opening a database means scanning that ring for the self-consistent slot
//! with the largest `batch_id`, the same way a write-ahead log replay finds
//! the last fully-written frame, generalized here to a fixed-size ring
//! instead of an append-only log since only `history_depth` roots are kept
//! rather than the whole history.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use tracing::{info, instrument, warn};

use crate::address::DbAddress;
use crate::batch::{Batch, NoopPreCommitHook};
use crate::error::{Error, Result};
use crate::manager::PageManager;
use crate::page::PAGE_SIZE;
use crate::pool::Pool;
use crate::read_batch::ReadBatch;
use crate::root_page::{RootPageView, RootPageViewMut};

/// Configuration for [`PagedDb::open`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Total size of the backing pool, in bytes. Must be a positive multiple
    /// of the page size and must fit the 24-bit page address space.
    pub capacity_bytes: usize,
    /// Number of root-history slots retained (`HISTORY_DEPTH`).
    /// Bounds both how far `reorganize_back_to_and_start_new` can reach and
    /// how long an abandoned page stays reclaimable-ineligible after being
    /// freed.
    pub history_depth: u32,
    /// Whether `Batch::commit` should flush at all. When `false`, commits
    /// are fully in-memory (useful for tests and for anonymous-pool use).
    pub flush_to_disk: bool,
    /// Eagerly allocate all 256 top-level fan-out pages when a fresh
    /// database is first opened, trading a slightly larger empty database
    /// for avoiding repeated first-write allocation later.
    pub preallocate_fanout: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { capacity_bytes: 1usize << 30, history_depth: 64, flush_to_disk: true, preallocate_fanout: false }
    }
}

/// A single self-consistent candidate found while scanning the root ring.
struct RingSlot {
    slot: u32,
    batch_id: u32,
    state_hash: [u8; 32],
}

/// The database handle. Owns the page pool and the root-history ring;
/// enforces the single-writer rule and tracks the reader leases that widen
/// the abandoned-page reclaim threshold.
pub struct PagedDb {
    manager: PageManager,
    history_depth: u32,
    flush_to_disk: bool,
    /// `(ring slot, batch_id)` of the most recently published root.
    current: RwLock<(u32, u32)>,
    writer_open: AtomicBool,
    next_batch_id: AtomicU32,
    next_lease_id: AtomicU64,
    /// Lease id -> the batch_id a live `ReadBatch` anchors to.
    reader_leases: DashMap<u64, u32>,
}

impl std::fmt::Debug for PagedDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (slot, batch_id) = *self.current.read().unwrap();
        f.debug_struct("PagedDb")
            .field("history_depth", &self.history_depth)
            .field("current_slot", &slot)
            .field("current_batch_id", &batch_id)
            .field("active_readers", &self.reader_leases.len())
            .finish()
    }
}

impl PagedDb {
    /// Open (or create) a database. `path` selects a file-backed pool;
    /// `None` maps anonymous memory instead, which never survives past the
    /// process.
    #[instrument(level = "info", skip(config), fields(history_depth = config.history_depth))]
    pub fn open(path: Option<&Path>, config: Config) -> Result<Self> {
        if config.history_depth == 0 {
            return Err(Error::InvalidArgument("history_depth must be at least 1".into()));
        }
        let min_pages = config.history_depth as usize + 1;
        if config.capacity_bytes < min_pages * PAGE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "capacity_bytes must hold at least {min_pages} pages ({history_depth} root slots + 1 allocatable page)",
                history_depth = config.history_depth
            )));
        }

        let pool = match path {
            Some(p) => Pool::file_backed(p, config.capacity_bytes)?,
            None => Pool::anonymous(config.capacity_bytes)?,
        };
        let manager = PageManager::new(pool, config.history_depth);

        let candidates = scan_ring(&manager, config.history_depth)?;
        let freshly_initialized = candidates.is_empty();
        let chosen = candidates.into_iter().max_by_key(|c| c.batch_id);

        let (slot, batch_id) = match chosen {
            Some(c) => {
                info!(slot = c.slot, batch_id = c.batch_id, "opened existing database");
                (c.slot, c.batch_id)
            }
            None => {
                info!("initializing a fresh database");
                let addr = DbAddress::new(0);
                let mut page = manager.get_mut_at(addr);
                page.stamp(1);
                RootPageViewMut::new(page.body_mut()).init_empty(1);
                (0, 1)
            }
        };

        let db = Self {
            manager,
            history_depth: config.history_depth,
            flush_to_disk: config.flush_to_disk,
            current: RwLock::new((slot, batch_id)),
            writer_open: AtomicBool::new(false),
            next_batch_id: AtomicU32::new(batch_id + 1),
            next_lease_id: AtomicU64::new(0),
            reader_leases: DashMap::new(),
        };

        if freshly_initialized && config.preallocate_fanout {
            let mut batch = db.begin_batch()?;
            batch.preallocate_fan_out()?;
            let mode = if config.flush_to_disk { crate::batch::CommitMode::FlushDataAndRoot } else { crate::batch::CommitMode::FlushDataOnly };
            batch.commit(&NoopPreCommitHook, mode)?;
        }

        Ok(db)
    }

    pub(crate) fn manager(&self) -> &PageManager {
        &self.manager
    }

    pub fn history_depth(&self) -> u32 {
        self.history_depth
    }

    pub(crate) fn flush_to_disk(&self) -> bool {
        self.flush_to_disk
    }

    pub fn capacity_bytes(&self) -> usize {
        self.manager.capacity_bytes()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.manager.allocated_bytes()
    }

    pub(crate) fn current_slot(&self) -> u32 {
        self.current.read().unwrap().0
    }

    pub fn current_batch_id(&self) -> u32 {
        self.current.read().unwrap().1
    }

    /// Open the single writer transaction. Only one may be open at a time;
    /// the slot is released when the returned `Batch` is dropped (whether
    /// via `commit`, `abort`, or an early return).
    pub fn begin_batch(&self) -> Result<Batch<'_>> {
        if self.writer_open.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidArgument("a batch is already open against this database".into()));
        }
        let (slot, _) = *self.current.read().unwrap();
        let root_buf = self.manager.get_at(DbAddress::new(slot)).body().to_vec();
        let block_number = RootPageView::new(&root_buf).block_number();
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        Ok(Batch::new(self, batch_id, block_number, root_buf))
    }

    /// Roll the writable head back to the committed root whose state hash
    /// is `target_state_hash` (which must still be present in the history
    /// ring) and start a new batch from it. Anything committed after that
    /// point remains on disk as abandoned
    /// pages; it is superseded, not erased, and is reclaimed by the
    /// ordinary `history_depth` aging mechanism like any other abandoned
    /// page.
    pub fn reorganize_back_to_and_start_new(&self, target_state_hash: [u8; 32]) -> Result<Batch<'_>> {
        if self.writer_open.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidArgument("a batch is already open against this database".into()));
        }
        let found = match scan_ring(&self.manager, self.history_depth) {
            Ok(candidates) => candidates.into_iter().find(|c| c.state_hash == target_state_hash),
            Err(e) => {
                self.release_writer();
                return Err(e);
            }
        };
        let (slot, target_batch_id) = match found {
            Some(c) => (c.slot, c.batch_id),
            None => {
                self.release_writer();
                return Err(Error::ReorgTargetNotFound);
            }
        };

        *self.current.write().unwrap() = (slot, target_batch_id);
        let root_buf = self.manager.get_at(DbAddress::new(slot)).body().to_vec();
        let block_number = RootPageView::new(&root_buf).block_number();
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        warn!(target_batch_id, new_batch_id = batch_id, "reorganizing to a prior root");
        Ok(Batch::new(self, batch_id, block_number, root_buf))
    }

    /// Pin a read-only snapshot to the latest committed root.
    pub fn begin_read_only_batch(&self) -> ReadBatch<'_> {
        let (slot, batch_id) = *self.current.read().unwrap();
        self.lease_snapshot(slot, batch_id)
    }

    /// Pin a read-only snapshot to a specific historical root still present
    /// in the ring, or the latest if `batch_id` is `None`.
    pub fn begin_read_only_batch_or_latest(&self, batch_id: Option<u32>) -> Result<ReadBatch<'_>> {
        match batch_id {
            Some(target) => self.begin_read_only_batch_at(target),
            None => Ok(self.begin_read_only_batch()),
        }
    }

    /// Pin a read-only snapshot to a specific historical root. Errors if
    /// that batch has aged out of the ring.
    pub fn begin_read_only_batch_at(&self, target_batch_id: u32) -> Result<ReadBatch<'_>> {
        let found = scan_ring(&self.manager, self.history_depth)?.into_iter().find(|c| c.batch_id == target_batch_id);
        match found {
            Some(c) => Ok(self.lease_snapshot(c.slot, c.batch_id)),
            None => Err(Error::ReorgTargetNotFound),
        }
    }

    fn lease_snapshot(&self, slot: u32, batch_id: u32) -> ReadBatch<'_> {
        let root_buf = self.manager.get_at(DbAddress::new(slot)).body().to_vec();
        let lease_id = self.next_lease_id.fetch_add(1, Ordering::SeqCst);
        self.reader_leases.insert(lease_id, batch_id);
        ReadBatch::new(self, lease_id, root_buf)
    }

    pub(crate) fn release_reader_lease(&self, lease_id: u64) {
        self.reader_leases.remove(&lease_id);
    }

    /// The oldest batch any currently live `ReadBatch` is anchored to, if
    /// any are open.
    pub(crate) fn min_active_reader_anchor(&self) -> Option<u32> {
        self.reader_leases.iter().map(|entry| *entry.value()).min()
    }

    pub(crate) fn release_writer(&self) {
        self.writer_open.store(false, Ordering::Release);
    }

    pub(crate) fn publish(&self, slot: u32, batch_id: u32) {
        *self.current.write().unwrap() = (slot, batch_id);
    }
}

/// Scan the root-history ring for every slot that is self-consistent (the
/// shared page header's `batch_id` agrees with the typed root body's own
/// copy). A slot whose body is entirely zero and whose header `batch_id` is
/// zero has simply never been written and is skipped rather than reported
/// as a spurious `batch_id == 0` candidate. A self-inconsistent, non-blank
/// slot indicates a write that was interrupted mid-page; it is logged and
/// skipped rather than trusted.
///
/// A self-consistent slot is still checked structurally: every fan-out and
/// abandoned-list-head pointer it carries must address a page actually
/// within the backing store. That failure is fatal, meaning the file was
/// corrupted or truncated after being written rather than a simple torn
/// write, so it is surfaced as `Error::Corruption` rather than silently
/// skipped.
fn scan_ring(manager: &PageManager, history_depth: u32) -> Result<Vec<RingSlot>> {
    let mut candidates = Vec::new();
    let page_count = manager.pool().page_count();
    for slot in 0..history_depth {
        let page = manager.get_at(DbAddress::new(slot));
        let header_batch_id = page.batch_id();
        let body = page.body();
        if header_batch_id == 0 && body.iter().all(|&b| b == 0) {
            continue;
        }
        let view = RootPageView::new(body);
        let body_batch_id = view.batch_id();
        if body_batch_id != header_batch_id {
            warn!(slot, header_batch_id, body_batch_id, "root ring slot is self-inconsistent, skipping");
            continue;
        }
        if let Err((address, detail)) = view.validate(page_count) {
            return Err(Error::Corruption { address, detail: format!("root ring slot {slot}: {detail}") });
        }
        candidates.push(RingSlot { slot, batch_id: header_batch_id, state_hash: view.state_hash() });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{CommitMode, DataType, PreCommitHook, PreCommitStore};
    use crate::nibble::NibblePath;

    fn key(bytes: &[u8]) -> NibblePath<'_> {
        NibblePath::from_bytes(bytes)
    }

    /// A hook that assigns each commit a distinct state hash (`NoopPreCommitHook`
    /// would make every commit share batch 1's all-zero hash, which defeats
    /// tests that reorg back to a specific earlier state by its hash).
    struct CountingHook(AtomicU32);

    impl CountingHook {
        fn new() -> Self {
            Self(AtomicU32::new(1))
        }
    }

    impl PreCommitHook for CountingHook {
        fn run(&self, _store: &mut dyn PreCommitStore, _block_number: u64, _prior_state_hash: [u8; 32]) -> Result<[u8; 32]> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            let mut hash = [0u8; 32];
            hash[..4].copy_from_slice(&n.to_le_bytes());
            Ok(hash)
        }
    }

    fn small_config() -> Config {
        Config { capacity_bytes: 64 * PAGE_SIZE, history_depth: 4, flush_to_disk: false, preallocate_fanout: false }
    }

    #[test]
    fn opening_a_fresh_anonymous_db_starts_at_batch_one() {
        let db = PagedDb::open(None, small_config()).unwrap();
        assert_eq!(db.current_batch_id(), 1);
    }

    #[test]
    fn file_backed_db_rediscovers_its_root_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paprika.db");
        let config = Config { flush_to_disk: true, ..small_config() };

        {
            let db = PagedDb::open(Some(&path), config.clone()).unwrap();
            let mut batch = db.begin_batch().unwrap();
            batch.set(key(&[0x05; 32]), DataType::Account, b"persisted").unwrap();
            batch.commit(&NoopPreCommitHook, CommitMode::FlushDataAndRoot).unwrap();
        }

        let reopened = PagedDb::open(Some(&path), config).unwrap();
        let read = reopened.begin_read_only_batch();
        assert_eq!(read.get(key(&[0x05; 32])), Some(&b"persisted"[..]));
    }

    #[test]
    fn reorg_to_an_unknown_state_hash_errors_and_releases_the_writer_slot() {
        let db = PagedDb::open(None, small_config()).unwrap();
        let err = db.reorganize_back_to_and_start_new([0xAB; 32]);
        assert!(matches!(err, Err(Error::ReorgTargetNotFound)));
        // the writer slot must have been released on the error path
        assert!(db.begin_batch().is_ok());
    }

    #[test]
    fn reorg_rolls_state_back_to_the_target_state_hash() {
        let db = PagedDb::open(None, small_config()).unwrap();
        let hook = CountingHook::new();
        let first_state_hash;
        {
            let mut batch = db.begin_batch().unwrap();
            batch.set(key(&[0x01; 32]), DataType::Account, b"v1").unwrap();
            first_state_hash = batch.commit(&hook, CommitMode::FlushDataOnly).unwrap();
        }
        {
            let mut batch = db.begin_batch().unwrap();
            batch.set(key(&[0x01; 32]), DataType::Account, b"v2").unwrap();
            batch.commit(&hook, CommitMode::FlushDataOnly).unwrap();
        }
        assert_eq!(db.begin_read_only_batch().get(key(&[0x01; 32])), Some(&b"v2"[..]));

        let batch = db.reorganize_back_to_and_start_new(first_state_hash).unwrap();
        assert_eq!(batch.get(key(&[0x01; 32])), Some(&b"v1"[..]));
        batch.commit(&hook, CommitMode::FlushDataOnly).unwrap();
        assert_eq!(db.begin_read_only_batch().get(key(&[0x01; 32])), Some(&b"v1"[..]));
    }

    #[test]
    fn open_detects_a_corrupt_fan_out_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.db");
        let config = Config { capacity_bytes: 64 * PAGE_SIZE, history_depth: 4, flush_to_disk: true, preallocate_fanout: false };

        {
            let db = PagedDb::open(Some(&path), config.clone()).unwrap();
            let mut batch = db.begin_batch().unwrap();
            batch.set(key(&[0x01; 32]), DataType::Account, b"v").unwrap();
            batch.commit(&NoopPreCommitHook, CommitMode::FlushDataAndRoot).unwrap();

            // Corrupt the just-committed root: point a fan-out entry at a
            // page index far beyond this store's 64-page capacity.
            let slot = db.current_slot();
            let mut page = db.manager().get_mut_at(DbAddress::new(slot));
            RootPageViewMut::new(page.body_mut()).set_fan_out(0x99, DbAddress::new(10_000));
            drop(page);
            db.manager().flush_root().unwrap();
        }

        let err = PagedDb::open(Some(&path), config);
        assert!(matches!(err, Err(Error::Corruption { .. })), "expected Corruption, got {err:?}");
    }

    #[test]
    fn preallocate_fanout_fills_every_top_level_slot_on_a_fresh_database() {
        let config = Config { preallocate_fanout: true, ..small_config() };
        let config = Config { capacity_bytes: 512 * PAGE_SIZE, ..config };
        let db = PagedDb::open(None, config).unwrap();
        let read = db.begin_read_only_batch();
        let view = RootPageView::new(&{
            let slot = db.current_slot();
            db.manager().get_at(DbAddress::new(slot)).body().to_vec()
        });
        for prefix in 0u16..=255 {
            assert!(!view.fan_out(prefix as u8).is_null(), "fan-out slot {prefix:#x} should be preallocated");
        }
        drop(read);
    }
}
