//! A B+ tree map ordered by a caller-supplied comparator.
//!
//! This crate provides [`BPlusTreeMap`], an in-memory ordered map over generic
//! key and value types. Unlike `BTreeMap`, the ordering is not taken from an
//! [`Ord`] bound: a three-way comparator is supplied at construction and the
//! tree is otherwise oblivious to what a key is.
//!
//! The second difference from the standard map is the [`Cursor`]: a
//! bidirectional enumerator that remains valid across mutations of the tree.
//! The tree keeps a monotonic version counter; a cursor remembers the version
//! it last observed and, when it detects a change, transparently re-seeks the
//! key it is anchored on before taking the next step. Mutating the map while
//! walking it is therefore fine: the cursor never reads freed pages, and the
//! tree never tracks live cursors.
//!
//! # Example
//!
//! ```
//! use tansu_tree::BPlusTreeMap;
//!
//! let mut events = BPlusTreeMap::new(|a: &u64, b: &u64| a.cmp(b));
//! events.set(30, "c");
//! events.set(10, "a");
//! events.set(20, "b");
//!
//! assert_eq!(events.get(&20), Some(&"b"));
//! assert_eq!(events.len(), 3);
//!
//! // Walk from the smallest key >= 15, deleting as we go.
//! let (mut cur, hit) = events.seek(15);
//! assert!(!hit);
//! while let Some((&k, _)) = cur.next(&events) {
//!     events.delete(&k);
//! }
//! assert_eq!(events.len(), 1);
//! assert_eq!(events.first_key_value(), Some((&10, &"a")));
//! ```
//!
//! # Structure
//!
//! The map is a B+ tree: all entries live in leaf pages linked into a doubly
//! linked chain in key order, and index pages above them hold separator keys
//! only. Pages are fixed-capacity arrays stored in an arena and addressed by
//! integer handles, so the whole crate is safe code. Leaves hold up to
//! `2 * KD` entries and index pages up to `2 * KX + 1` separators; see [`KD`]
//! and [`KX`].

#![no_std]
// These forbid rules and lint groups are meant to be very restrictive.
#![forbid(unsafe_code)]
#![forbid(keyword_idents)]
#![forbid(non_ascii_idents)]
#![forbid(unreachable_pub)]
#![warn(clippy::all)]
#![warn(clippy::cargo)]
#![warn(clippy::pedantic)]

extern crate alloc;

mod raw;

pub mod bplus_tree_map;

pub use bplus_tree_map::{BPlusTreeMap, Cursor, Iter};

/// Leaf page half-capacity: a non-root leaf holds between `KD` and `2 * KD`
/// entries.
///
/// Reduced under `cfg(test)` so the unit suites can drive multi-level trees
/// with small inputs.
#[cfg(not(test))]
pub const KD: usize = 64;
#[cfg(test)]
pub const KD: usize = 4;

/// Index page half-capacity: a non-root index page holds at least `KX - 1`
/// and at most `2 * KX + 1` separator keys. Overfull pages at `2 * KX + 1`
/// are split lazily, on the next descent through them.
#[cfg(not(test))]
pub const KX: usize = 128;
#[cfg(test)]
pub const KX: usize = 4;

const _: () = {
    assert!(KD >= 1, "leaf pages need at least one entry per half");
    assert!(KX >= 2, "top-down repair requires index pages of at least two separators");
};
