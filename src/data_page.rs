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

//! The radix node that stores actual key/value pairs: a 16-entry child
//! pointer table (by leading nibble), one per page, in front of an in-page
//! [`SlottedArray`] holding whatever keys still fit at this level. Instead
//! of splitting when the slotted array fills up, a data page "flushes down"
//! its heaviest leading-nibble bucket wholesale into a child page, trading
//! one more level of descent for a cheap bulk move instead of a rebalance.

use crate::address::DbAddress;
use crate::error::{Error, Result};
use crate::manager::PageManager;
use crate::nibble::NibblePath;
use crate::page::PAGE_BODY_LEN;
use crate::slotted::SlottedArray;

const CHILD_COUNT: usize = 16;
const CHILD_ENTRY_BYTES: usize = 4;
pub const CHILDREN_BYTES: usize = CHILD_COUNT * CHILD_ENTRY_BYTES;
const SLOTTED_OFFSET: usize = CHILDREN_BYTES;

fn read_child(children: &[u8], nibble: u8) -> DbAddress {
    let off = nibble as usize * CHILD_ENTRY_BYTES;
    DbAddress::from_le_bytes(children[off..off + 4].try_into().unwrap())
}

fn write_child(children: &mut [u8], nibble: u8, addr: DbAddress) {
    let off = nibble as usize * CHILD_ENTRY_BYTES;
    children[off..off + 4].copy_from_slice(&addr.to_le_bytes());
}

/// Initialize a freshly allocated page body as an empty data page: no
/// children, empty slotted array.
pub fn init(body: &mut [u8]) {
    assert_eq!(body.len(), PAGE_BODY_LEN);
    body[..CHILDREN_BYTES].fill(0xFF); // DbAddress::NULL is all-ones, not zero.
    SlottedArray::init(&mut body[SLOTTED_OFFSET..]);
}

/// Read `path` starting from the data page at `addr`, descending into
/// children as needed. `'m` ties the returned slice to the page manager, not
/// to any one page along the way, so callers can hold the result past the
/// point where the recursion itself has unwound.
pub fn get<'m>(manager: &'m PageManager, addr: DbAddress, path: NibblePath) -> Option<&'m [u8]> {
    let body = manager.get_mut_at(addr).into_body_mut();
    let (children, slotted_region) = body.split_at_mut(SLOTTED_OFFSET);
    let slotted = SlottedArray::open(slotted_region);
    if let Some(value) = slotted.try_get(path) {
        return Some(value);
    }
    if path.is_empty() {
        return None;
    }
    let child = read_child(children, path.nibble_at(0));
    if child.is_null() {
        return None;
    }
    get(manager, child, path.slice_from(1))
}

/// Set `path -> value` starting from the data page at `addr`, copying the
/// page forward under copy-on-write if it does not already belong to
/// `current_batch_id`. Returns the (possibly new) address of the page that
/// now owns `path` at this level — callers must thread this back into their
/// own parent pointer if it changed.
pub fn set<'m>(
    manager: &'m PageManager,
    addr: DbAddress,
    current_batch_id: u32,
    path: NibblePath,
    value: &[u8],
    mut on_abandoned: impl FnMut(DbAddress),
) -> Result<DbAddress> {
    let writable = manager.ensure_writable(addr, current_batch_id, &mut on_abandoned)?;

    if try_set_here(manager, writable, path, value) {
        return Ok(writable);
    }

    flush_down(manager, writable, current_batch_id, &mut on_abandoned)?;
    if try_set_here(manager, writable, path, value) {
        return Ok(writable);
    }

    // Flushing down the heaviest bucket did not make room for this
    // particular entry (it may not even belong to that bucket, or the page
    // is pathologically oversubscribed by one huge value). Descend into
    // (creating if necessary) the child that owns this entry's own leading
    // nibble, same as an already-flushed entry would have.
    if path.is_empty() {
        return Err(Error::OutOfSpace { capacity_pages: manager.pool().page_count() });
    }
    let nibble = path.nibble_at(0);
    let child = ensure_child(manager, writable, nibble, current_batch_id)?;
    let new_child = set(manager, child, current_batch_id, path.slice_from(1), value, &mut on_abandoned)?;
    if new_child != child {
        let body = manager.get_mut_at(writable).into_body_mut();
        write_child(&mut body[..CHILDREN_BYTES], nibble, new_child);
    }
    Ok(writable)
}

fn try_set_here(manager: &PageManager, addr: DbAddress, path: NibblePath, value: &[u8]) -> bool {
    let body = manager.get_mut_at(addr).into_body_mut();
    let (_children, slotted_region) = body.split_at_mut(SLOTTED_OFFSET);
    let mut slotted = SlottedArray::open(slotted_region);
    slotted.try_set(path, value)
}

/// Find (or create) the child page for `nibble`, writing the new pointer
/// back into `parent`'s children table if one had to be allocated.
fn ensure_child(manager: &PageManager, parent: DbAddress, nibble: u8, current_batch_id: u32) -> Result<DbAddress> {
    let existing = read_child(&manager.get_mut_at(parent).into_body_mut()[..CHILDREN_BYTES], nibble);
    if !existing.is_null() {
        return Ok(existing);
    }
    let child = manager.allocate(current_batch_id, true)?;
    init(manager.get_mut_at(child).into_body_mut());
    write_child(&mut manager.get_mut_at(parent).into_body_mut()[..CHILDREN_BYTES], nibble, child);
    Ok(child)
}

/// Move `addr`'s heaviest leading-nibble bucket wholesale into its child for
/// that nibble (allocating the child first if it does not exist yet, and
/// COW'ing it forward if it exists but belongs to an earlier batch).
fn flush_down(
    manager: &PageManager,
    addr: DbAddress,
    current_batch_id: u32,
    mut on_abandoned: impl FnMut(DbAddress),
) -> Result<()> {
    let best_nibble = {
        let body = manager.get_mut_at(addr).into_body_mut();
        let (_children, slotted_region) = body.split_at_mut(SLOTTED_OFFSET);
        let slotted = SlottedArray::open(slotted_region);
        let counts = slotted.count_by_leading_nibble();
        counts
            .iter()
            .enumerate()
            .max_by_key(|&(_, &count)| count)
            .map(|(nibble, _)| nibble as u8)
            .expect("there are always exactly 16 leading nibbles")
    };

    let child = ensure_child(manager, addr, best_nibble, current_batch_id)?;
    let writable_child = manager.ensure_writable(child, current_batch_id, &mut on_abandoned)?;
    if writable_child != child {
        let body = manager.get_mut_at(addr).into_body_mut();
        write_child(&mut body[..CHILDREN_BYTES], best_nibble, writable_child);
    }

    let parent_body = manager.get_mut_at(addr).into_body_mut();
    let (_parent_children, parent_slotted_region) = parent_body.split_at_mut(SLOTTED_OFFSET);
    let mut parent_slotted = SlottedArray::open(parent_slotted_region);

    let child_body = manager.get_mut_at(writable_child).into_body_mut();
    let (_child_children, child_slotted_region) = child_body.split_at_mut(SLOTTED_OFFSET);
    let mut child_slotted = SlottedArray::open(child_slotted_region);

    parent_slotted.move_nibble_bucket_to(best_nibble, &mut child_slotted);
    Ok(())
}

/// Walk every live entry reachable from the data page at `addr`, calling
/// `callback` with each entry's full path (relative to `addr`, with
/// `prefix_nibbles` already prepended) and value. `prefix_nibbles` is reused
/// as scratch space across the whole walk to avoid allocating per entry.
pub fn visit(manager: &PageManager, addr: DbAddress, prefix_nibbles: &mut Vec<u8>, callback: &mut dyn FnMut(NibblePath, &[u8])) {
    let body = manager.get_mut_at(addr).into_body_mut();
    let (children, slotted_region) = body.split_at_mut(SLOTTED_OFFSET);
    let slotted = SlottedArray::open(slotted_region);

    for (key, value) in slotted.enumerate_all() {
        let key_path = key.path();
        for i in 0..key_path.len() {
            prefix_nibbles.push(key_path.nibble_at(i));
        }
        let (bytes, len) = pack_nibbles(prefix_nibbles);
        callback(NibblePath::from_bytes(&bytes).slice_to(len), value);
        prefix_nibbles.truncate(prefix_nibbles.len() - key_path.len());
    }

    for nibble in 0u8..CHILD_COUNT as u8 {
        let child = read_child(children, nibble);
        if child.is_null() {
            continue;
        }
        prefix_nibbles.push(nibble);
        visit(manager, child, prefix_nibbles, callback);
        prefix_nibbles.pop();
    }
}

fn pack_nibbles(nibbles: &[u8]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(nibbles.len().div_ceil(2));
    for pair in nibbles.chunks(2) {
        if pair.len() == 2 {
            out.push((pair[0] << 4) | pair[1]);
        } else {
            out.push(pair[0] << 4);
        }
    }
    (out, nibbles.len())
}
