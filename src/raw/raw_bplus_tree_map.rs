use core::cmp::Ordering;
use core::mem;

use super::arena::Arena;
use super::handle::Handle;
use super::page::{IndexPage, LEAF_CAP, LeafPage, Page};
use crate::{KD, KX};

/// The B+ tree engine backing `BPlusTreeMap`.
///
/// All mutation is single-pass and top-down: the descent carries only the
/// current page and its `(parent, child index)` slot, never a full path.
/// Overfull index pages (left behind by an earlier child split) are split
/// while descending on the insert path, and underfull ones are refilled
/// while descending on the delete path, so by the time a leaf edit has to
/// push a separator up or pull one out, the parent is guaranteed to have
/// room for it (or a separator to spare).
pub(crate) struct RawBPlusTreeMap<K, V, C> {
    pages: Arena<Page<K, V>>,
    cmp: C,
    root: Option<Handle>,
    /// Leftmost leaf, the head of the sibling chain.
    first: Option<Handle>,
    /// Rightmost leaf, the tail of the sibling chain.
    last: Option<Handle>,
    len: usize,
    /// Bumped on every observable mutation, including value overwrites.
    /// Cursors compare against it before trusting their page handle.
    ver: u64,
}

enum SetStep {
    Descend { child_index: usize, overfull: bool },
    Overwrite(usize),
    Insert(usize),
}

enum DeleteStep {
    Descend { index: usize, found: bool, underfull: bool },
    Extract(usize),
    Missing,
}

impl<K, V, C> RawBPlusTreeMap<K, V, C> {
    pub(crate) const fn new(cmp: C) -> Self {
        Self {
            pages: Arena::new(),
            cmp,
            root: None,
            first: None,
            last: None,
            len: 0,
            ver: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) const fn ver(&self) -> u64 {
        self.ver
    }

    pub(crate) fn first_leaf(&self) -> Option<Handle> {
        self.first
    }

    pub(crate) fn last_leaf(&self) -> Option<Handle> {
        self.last
    }

    pub(crate) fn pages(&self) -> &Arena<Page<K, V>> {
        &self.pages
    }

    pub(crate) fn leaf_len(&self, leaf: Handle) -> usize {
        self.pages.get(leaf).as_leaf().len()
    }

    pub(crate) fn leaf_entry(&self, leaf: Handle, index: usize) -> (&K, &V) {
        self.pages.get(leaf).as_leaf().entry(index)
    }

    pub(crate) fn leaf_next(&self, leaf: Handle) -> Option<Handle> {
        self.pages.get(leaf).as_leaf().next()
    }

    pub(crate) fn leaf_prev(&self, leaf: Handle) -> Option<Handle> {
        self.pages.get(leaf).as_leaf().prev()
    }

    pub(crate) fn first_key_value(&self) -> Option<(&K, &V)> {
        let h = self.first?;
        Some(self.pages.get(h).as_leaf().entry(0))
    }

    pub(crate) fn last_key_value(&self) -> Option<(&K, &V)> {
        let h = self.last?;
        let leaf = self.pages.get(h).as_leaf();
        Some(leaf.entry(leaf.len() - 1))
    }

    /// Drops every page and resets to the empty state.
    pub(crate) fn clear(&mut self) {
        if self.root.is_none() {
            return;
        }
        self.pages.clear();
        self.root = None;
        self.first = None;
        self.last = None;
        self.len = 0;
        self.ver += 1;
    }

    /// Plants a single-entry root leaf into an empty tree.
    fn plant_root(&mut self, key: K, value: V) {
        let mut leaf = LeafPage::new();
        leaf.push_back(key, value);
        let h = self.pages.alloc(Page::Leaf(leaf));
        self.root = Some(h);
        self.first = Some(h);
        self.last = Some(h);
        self.len = 1;
        self.ver += 1;
    }
}

impl<K, V, C> RawBPlusTreeMap<K, V, C>
where
    C: Fn(&K, &K) -> Ordering,
{
    /// Routes `key` to its leaf. Returns the leaf (absent only on an empty
    /// tree), the in-leaf position of the key or of the first key greater
    /// than it, and whether the key itself is present.
    pub(crate) fn seek_leaf(&self, key: &K) -> (Option<Handle>, usize, bool) {
        let Some(mut q) = self.root else {
            return (None, 0, false);
        };
        loop {
            match self.pages.get(q) {
                Page::Index(x) => {
                    q = match x.search(key, &self.cmp) {
                        Ok(i) => x.child(i + 1),
                        Err(i) => x.child(i),
                    };
                }
                Page::Leaf(leaf) => {
                    return match leaf.search(key, &self.cmp) {
                        Ok(i) => (Some(q), i, true),
                        Err(i) => (Some(q), i, false),
                    };
                }
            }
        }
    }

    fn lookup(&self, key: &K) -> Option<(Handle, usize)> {
        let (leaf, index, hit) = self.seek_leaf(key);
        if hit { Some((leaf?, index)) } else { None }
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        let (h, i) = self.lookup(key)?;
        Some(self.pages.get(h).as_leaf().value(i))
    }

    pub(crate) fn get_key_value(&self, key: &K) -> Option<(&K, &V)> {
        let (h, i) = self.lookup(key)?;
        Some(self.pages.get(h).as_leaf().entry(i))
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }
}

impl<K, V, C> RawBPlusTreeMap<K, V, C>
where
    K: Clone,
    C: Fn(&K, &K) -> Ordering,
{
    /// Inserts or overwrites, returning the displaced value.
    pub(crate) fn set(&mut self, key: K, value: V) -> Option<V> {
        let Some(mut q) = self.root else {
            self.plant_root(key, value);
            return None;
        };
        let mut parent: Option<(Handle, usize)> = None;

        loop {
            let step = match self.pages.get(q) {
                Page::Index(x) => SetStep::Descend {
                    child_index: match x.search(&key, &self.cmp) {
                        Ok(i) => i + 1,
                        Err(i) => i,
                    },
                    overfull: x.key_count() > 2 * KX,
                },
                Page::Leaf(leaf) => match leaf.search(&key, &self.cmp) {
                    Ok(i) => SetStep::Overwrite(i),
                    Err(i) => SetStep::Insert(i),
                },
            };
            match step {
                SetStep::Descend { mut child_index, overfull } => {
                    if overfull {
                        (q, child_index) = self.split_index(parent, q, child_index);
                    }
                    let child = self.pages.get(q).as_index().child(child_index);
                    parent = Some((q, child_index));
                    q = child;
                }
                SetStep::Overwrite(i) => {
                    self.ver += 1;
                    let slot = self.pages.get_mut(q).as_leaf_mut().value_mut(i);
                    return Some(mem::replace(slot, value));
                }
                SetStep::Insert(i) => {
                    if self.pages.get(q).as_leaf().len() < LEAF_CAP {
                        self.leaf_insert(q, i, key, value);
                    } else {
                        self.overflow(parent, q, i, key, value);
                    }
                    return None;
                }
            }
        }
    }

    /// Combined lookup and update in one descent. `upd` sees the current
    /// value (if any) exactly once; returning `Some` writes, `None` leaves
    /// the tree untouched. Returns the prior value and whether it wrote.
    pub(crate) fn put<F>(&mut self, key: K, upd: F) -> (Option<V>, bool)
    where
        F: FnOnce(Option<&V>) -> Option<V>,
        V: Clone,
    {
        let Some(mut q) = self.root else {
            let Some(value) = upd(None) else {
                return (None, false);
            };
            self.plant_root(key, value);
            return (None, true);
        };
        let mut parent: Option<(Handle, usize)> = None;

        loop {
            let step = match self.pages.get(q) {
                Page::Index(x) => SetStep::Descend {
                    child_index: match x.search(&key, &self.cmp) {
                        Ok(i) => i + 1,
                        Err(i) => i,
                    },
                    overfull: x.key_count() > 2 * KX,
                },
                Page::Leaf(leaf) => match leaf.search(&key, &self.cmp) {
                    Ok(i) => SetStep::Overwrite(i),
                    Err(i) => SetStep::Insert(i),
                },
            };
            match step {
                SetStep::Descend { mut child_index, overfull } => {
                    if overfull {
                        (q, child_index) = self.split_index(parent, q, child_index);
                    }
                    let child = self.pages.get(q).as_index().child(child_index);
                    parent = Some((q, child_index));
                    q = child;
                }
                SetStep::Overwrite(i) => {
                    let new = upd(Some(self.pages.get(q).as_leaf().value(i)));
                    return match new {
                        Some(value) => {
                            self.ver += 1;
                            let slot = self.pages.get_mut(q).as_leaf_mut().value_mut(i);
                            (Some(mem::replace(slot, value)), true)
                        }
                        None => (Some(self.pages.get(q).as_leaf().value(i).clone()), false),
                    };
                }
                SetStep::Insert(i) => {
                    let Some(value) = upd(None) else {
                        return (None, false);
                    };
                    if self.pages.get(q).as_leaf().len() < LEAF_CAP {
                        self.leaf_insert(q, i, key, value);
                    } else {
                        self.overflow(parent, q, i, key, value);
                    }
                    return (None, true);
                }
            }
        }
    }

    /// Removes `key`, returning its value. Underfull index pages met on the
    /// way down are repaired before descending through them.
    pub(crate) fn delete(&mut self, key: &K) -> Option<V> {
        let mut q = self.root?;
        let mut parent: Option<(Handle, usize)> = None;

        loop {
            let step = match self.pages.get(q) {
                Page::Index(x) => {
                    let (index, found) = match x.search(key, &self.cmp) {
                        Ok(i) => (i, true),
                        Err(i) => (i, false),
                    };
                    DeleteStep::Descend {
                        index,
                        found,
                        underfull: x.key_count() < KX,
                    }
                }
                Page::Leaf(leaf) => match leaf.search(key, &self.cmp) {
                    Ok(i) => DeleteStep::Extract(i),
                    Err(_) => DeleteStep::Missing,
                },
            };
            match step {
                DeleteStep::Descend { mut index, found, underfull } => {
                    if underfull && self.root != Some(q) {
                        let (p, pi) = parent.expect("non-root pages have a parent");
                        (q, index) = self.underflow_index(p, pi, q, index);
                    }
                    // A matching separator routes right of itself.
                    let child_index = if found { index + 1 } else { index };
                    let child = self.pages.get(q).as_index().child(child_index);
                    parent = Some((q, child_index));
                    q = child;
                }
                DeleteStep::Missing => return None,
                DeleteStep::Extract(i) => {
                    self.ver += 1;
                    self.len -= 1;
                    let (_, value) = self.pages.get_mut(q).as_leaf_mut().remove(i);
                    if i == 0
                        && let Some((p, pi)) = parent
                        && pi > 0
                        && self.pages.get(q).as_leaf().len() > 0
                    {
                        // The separator guarding this leaf pointed at the
                        // removed entry; refresh it to the new first key.
                        let first = self.pages.get(q).as_leaf().key(0).clone();
                        self.pages.get_mut(p).as_index_mut().set_key(pi - 1, first);
                    }
                    if self.pages.get(q).as_leaf().len() >= KD {
                        return Some(value);
                    }
                    match parent {
                        Some((p, pi)) => self.underflow_leaf(p, pi, q),
                        None => {
                            // The root leaf is allowed to run thin; it only
                            // resets the tree once it is empty.
                            if self.len == 0 {
                                self.clear();
                            }
                        }
                    }
                    return Some(value);
                }
            }
        }
    }

    /// Splits an overfull index page before descending through it. Returns
    /// the half the descent continues in and the child index within it.
    fn split_index(
        &mut self,
        parent: Option<(Handle, usize)>,
        q: Handle,
        child_index: usize,
    ) -> (Handle, usize) {
        self.ver += 1;
        let (middle, right) = self.pages.get_mut(q).as_index_mut().split_off_upper();
        let r = self.pages.alloc(Page::Index(right));
        match parent {
            Some((p, pi)) => self.pages.get_mut(p).as_index_mut().insert_pair(pi, middle, r),
            None => {
                let root = self.pages.alloc(Page::Index(IndexPage::new_root(q, middle, r)));
                self.root = Some(root);
            }
        }
        // A child index beyond the promoted separator belongs to the new
        // right page. Equality with the promoted key has already routed the
        // descent to child `KX + 1`, which is the right page's first child.
        if child_index > KX {
            (r, child_index - (KX + 1))
        } else {
            (q, child_index)
        }
    }

    fn leaf_insert(&mut self, q: Handle, index: usize, key: K, value: V) {
        self.ver += 1;
        self.len += 1;
        self.pages.get_mut(q).as_leaf_mut().insert(index, key, value);
    }

    /// Insertion into a full leaf: shed one entry into a same-parent
    /// sibling with room, keeping the separators in step, otherwise split.
    /// The shedding keeps sequentially filled leaves packed instead of
    /// half-empty.
    fn overflow(&mut self, parent: Option<(Handle, usize)>, q: Handle, index: usize, key: K, value: V) {
        self.ver += 1;
        if let Some((p, pi)) = parent {
            let (l, r) = self.siblings(p, pi);
            if let Some(l) = l
                && self.pages.get(l).as_leaf().len() < LEAF_CAP
                && index != 0
            {
                self.shift_left(l, q);
                self.leaf_insert(q, index - 1, key, value);
                let first = self.pages.get(q).as_leaf().key(0).clone();
                self.pages.get_mut(p).as_index_mut().set_key(pi - 1, first);
                return;
            }
            if let Some(r) = r
                && self.pages.get(r).as_leaf().len() < LEAF_CAP
            {
                if index < LEAF_CAP {
                    self.shift_right(q, r);
                    self.leaf_insert(q, index, key, value);
                    let first = self.pages.get(r).as_leaf().key(0).clone();
                    self.pages.get_mut(p).as_index_mut().set_key(pi, first);
                } else {
                    // The new key is greater than everything in `q`: it
                    // opens the right sibling and is itself the separator.
                    let separator = key.clone();
                    self.leaf_insert(r, 0, key, value);
                    self.pages.get_mut(p).as_index_mut().set_key(pi, separator);
                }
                return;
            }
        }
        self.split_leaf(parent, q, index, key, value);
    }

    /// Splits a full leaf `KD`/`KD` and inserts the pending entry on the
    /// side its comparison with the separator dictates: strictly below the
    /// separator goes left, the separator value itself and above go right.
    fn split_leaf(&mut self, parent: Option<(Handle, usize)>, q: Handle, index: usize, key: K, value: V) {
        self.ver += 1;
        let (right, old_next) = {
            let leaf = self.pages.get_mut(q).as_leaf_mut();
            let mut right = leaf.split_off_upper();
            let old_next = leaf.next();
            right.set_prev(Some(q));
            right.set_next(old_next);
            (right, old_next)
        };
        let r = self.pages.alloc(Page::Leaf(right));
        self.pages.get_mut(q).as_leaf_mut().set_next(Some(r));
        match old_next {
            Some(n) => self.pages.get_mut(n).as_leaf_mut().set_prev(Some(r)),
            None => self.last = Some(r),
        }

        let separator = self.pages.get(r).as_leaf().key(0).clone();
        match parent {
            Some((p, pi)) => self.pages.get_mut(p).as_index_mut().insert_pair(pi, separator, r),
            None => {
                let root = self.pages.alloc(Page::Index(IndexPage::new_root(q, separator, r)));
                self.root = Some(root);
            }
        }

        if index > KD {
            self.leaf_insert(r, index - KD, key, value);
        } else {
            self.leaf_insert(q, index, key, value);
        }
    }

    /// Repairs an index page that has fallen below `KX` separators,
    /// borrowing through the parent separator or merging with a
    /// same-parent sibling. Returns the page the descent continues in and
    /// the search index translated into it.
    fn underflow_index(&mut self, p: Handle, pi: usize, q: Handle, index: usize) -> (Handle, usize) {
        self.ver += 1;
        let (l, r) = self.siblings(p, pi);

        if let Some(l) = l
            && self.pages.get(l).as_index().key_count() > KX
        {
            // The parent separator rotates down in front of `q`; the left
            // sibling's last key rotates up to replace it.
            let (lk, lch) = self.pages.get_mut(l).as_index_mut().pop_pair_back();
            let down = self.pages.get_mut(p).as_index_mut().replace_key(pi - 1, lk);
            self.pages.get_mut(q).as_index_mut().push_pair_front(down, lch);
            return (q, index + 1);
        }
        if let Some(r) = r
            && self.pages.get(r).as_index().key_count() > KX
        {
            let (rk, rch) = self.pages.get_mut(r).as_index_mut().pop_pair_front();
            let down = self.pages.get_mut(p).as_index_mut().replace_key(pi, rk);
            self.pages.get_mut(q).as_index_mut().push_pair_back(down, rch);
            return (q, index);
        }
        if let Some(l) = l {
            let shifted = self.pages.get(l).as_index().key_count() + 1;
            self.merge_index(p, pi - 1, l, q);
            return (l, index + shifted);
        }
        let r = r.expect("a non-root page has at least one sibling");
        self.merge_index(p, pi, q, r);
        (q, index)
    }

    /// Concatenates `right` into `left` around the parent separator at
    /// `sep`, dropping `right`; collapses the root when it gives up its
    /// last separator, shrinking the tree by one level.
    fn merge_index(&mut self, p: Handle, sep: usize, left: Handle, right: Handle) {
        self.ver += 1;
        let Page::Index(right_page) = self.pages.take(right) else {
            panic!("expected index page");
        };
        if self.pages.get(p).as_index().key_count() > 1 {
            let (down, _) = self.pages.get_mut(p).as_index_mut().remove_pair(sep);
            self.pages.get_mut(left).as_index_mut().merge_with_right(down, right_page);
        } else {
            // Only the root may run this thin; the merged page replaces it.
            debug_assert_eq!(self.root, Some(p));
            let Page::Index(root_page) = self.pages.take(p) else {
                panic!("expected index page");
            };
            let down = root_page.into_only_key();
            self.pages.get_mut(left).as_index_mut().merge_with_right(down, right_page);
            self.root = Some(left);
        }
    }

    /// Refills a leaf that has fallen below `KD` entries, borrowing from a
    /// same-parent sibling when the pair can still carry two half-full
    /// pages, merging otherwise.
    fn underflow_leaf(&mut self, p: Handle, pi: usize, q: Handle) {
        self.ver += 1;
        let (l, r) = self.siblings(p, pi);
        let q_len = self.pages.get(q).as_leaf().len();

        if let Some(l) = l
            && self.pages.get(l).as_leaf().len() + q_len >= LEAF_CAP
        {
            self.shift_right(l, q);
            let first = self.pages.get(q).as_leaf().key(0).clone();
            self.pages.get_mut(p).as_index_mut().set_key(pi - 1, first);
            return;
        }
        if let Some(r) = r
            && q_len + self.pages.get(r).as_leaf().len() >= LEAF_CAP
        {
            self.shift_left(q, r);
            let first = self.pages.get(r).as_leaf().key(0).clone();
            self.pages.get_mut(p).as_index_mut().set_key(pi, first);
            return;
        }
        if let Some(l) = l {
            self.merge_leaf(p, pi - 1, l, q);
            return;
        }
        let r = r.expect("a leaf under an index page has at least one sibling");
        self.merge_leaf(p, pi, q, r);
    }

    /// Concatenates leaf `right` into `left`, fixes the sibling chain, and
    /// drops the separator between them; collapses the root when it gives
    /// up its last separator, leaving a leaf root.
    fn merge_leaf(&mut self, p: Handle, sep: usize, left: Handle, right: Handle) {
        self.ver += 1;
        let Page::Leaf(right_page) = self.pages.take(right) else {
            panic!("expected leaf page");
        };
        let new_next = right_page.next();
        self.pages.get_mut(left).as_leaf_mut().merge_with_right(right_page);
        match new_next {
            Some(n) => self.pages.get_mut(n).as_leaf_mut().set_prev(Some(left)),
            None => self.last = Some(left),
        }

        if self.pages.get(p).as_index().key_count() > 1 {
            self.pages.get_mut(p).as_index_mut().remove_pair(sep);
        } else {
            debug_assert_eq!(self.root, Some(p));
            self.pages.free(p);
            self.root = Some(left);
        }
    }

    /// Same-parent neighbours of child `pi` under `p`.
    fn siblings(&self, p: Handle, pi: usize) -> (Option<Handle>, Option<Handle>) {
        let x = self.pages.get(p).as_index();
        let l = if pi > 0 { Some(x.child(pi - 1)) } else { None };
        let r = if pi < x.key_count() { Some(x.child(pi + 1)) } else { None };
        (l, r)
    }

    /// Moves the first entry of `q` to the back of its left sibling `l`.
    fn shift_left(&mut self, l: Handle, q: Handle) {
        let (k, v) = self.pages.get_mut(q).as_leaf_mut().pop_front();
        self.pages.get_mut(l).as_leaf_mut().push_back(k, v);
    }

    /// Moves the last entry of `q` to the front of its right sibling `r`.
    fn shift_right(&mut self, q: Handle, r: Handle) {
        let (k, v) = self.pages.get_mut(q).as_leaf_mut().pop_back();
        self.pages.get_mut(r).as_leaf_mut().push_front(k, v);
    }
}

impl<K: Clone, V: Clone, C: Clone> Clone for RawBPlusTreeMap<K, V, C> {
    fn clone(&self) -> Self {
        // Handles are plain indices, so a slot-for-slot arena copy keeps
        // every link valid.
        Self {
            pages: self.pages.clone(),
            cmp: self.cmp.clone(),
            root: self.root,
            first: self.first,
            last: self.last,
            len: self.len,
            ver: self.ver,
        }
    }
}

#[cfg(test)]
impl<K, V, C> RawBPlusTreeMap<K, V, C>
where
    K: Clone,
    C: Fn(&K, &K) -> Ordering,
{
    /// Checks every structural invariant, panicking with the full list of
    /// violations. Test-only; the cost is a complete traversal.
    pub(crate) fn validate_invariants(&self) {
        use alloc::format;
        use alloc::string::String;
        use alloc::vec::Vec;

        let Some(root) = self.root else {
            assert_eq!(self.len, 0, "empty tree must have len 0");
            assert!(self.first.is_none(), "empty tree must not cache a first leaf");
            assert!(self.last.is_none(), "empty tree must not cache a last leaf");
            return;
        };

        let mut errors: Vec<String> = Vec::new();
        let mut leaves: Vec<Handle> = Vec::new();
        let mut leaf_depth: Option<usize> = None;
        let mut index_pages = 0usize;
        self.validate_page(root, 0, &mut leaf_depth, &mut index_pages, &mut leaves, &mut errors);

        // Every live arena slot must be reachable from the root; anything
        // else is a leaked page.
        if self.pages.len() != leaves.len() + index_pages {
            errors.push(format!(
                "arena holds {} pages but the tree reaches {}",
                self.pages.len(),
                leaves.len() + index_pages
            ));
        }

        if self.first != leaves.first().copied() {
            errors.push(String::from("first-leaf cache does not point at the leftmost leaf"));
        }
        if self.last != leaves.last().copied() {
            errors.push(String::from("last-leaf cache does not point at the rightmost leaf"));
        }
        for (i, &h) in leaves.iter().enumerate() {
            let leaf = self.pages.get(h).as_leaf();
            let want_prev = if i > 0 { Some(leaves[i - 1]) } else { None };
            let want_next = leaves.get(i + 1).copied();
            if leaf.prev() != want_prev {
                errors.push(format!("leaf {i}: prev link does not match tree order"));
            }
            if leaf.next() != want_next {
                errors.push(format!("leaf {i}: next link does not match tree order"));
            }
        }

        for (i, w) in leaves.windows(2).enumerate() {
            let a = self.pages.get(w[0]).as_leaf();
            let b = self.pages.get(w[1]).as_leaf();
            if a.len() > 0
                && b.len() > 0
                && (self.cmp)(a.key(a.len() - 1), b.key(0)) != Ordering::Less
            {
                errors.push(format!("keys do not ascend across leaf boundary {i}"));
            }
        }

        let total: usize = leaves.iter().map(|&h| self.pages.get(h).as_leaf().len()).sum();
        if total != self.len {
            errors.push(format!("len {} != sum of leaf occupancies {total}", self.len));
        }

        assert!(errors.is_empty(), "tree invariant violations:\n{}", errors.join("\n"));
    }

    fn validate_page(
        &self,
        h: Handle,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        index_pages: &mut usize,
        leaves: &mut alloc::vec::Vec<Handle>,
        errors: &mut alloc::vec::Vec<alloc::string::String>,
    ) -> (Option<K>, Option<K>) {
        use alloc::format;

        match self.pages.get(h) {
            Page::Leaf(leaf) => {
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        errors.push(format!("leaf at depth {depth}, expected {expected}"));
                    }
                    Some(_) => {}
                }
                if self.root == Some(h) {
                    if leaf.len() == 0 {
                        errors.push(alloc::string::String::from("an emptied root leaf must reset the tree"));
                    }
                } else if leaf.len() < KD || leaf.len() > LEAF_CAP {
                    errors.push(format!("leaf occupancy {} outside [{KD}, {LEAF_CAP}]", leaf.len()));
                }
                for i in 1..leaf.len() {
                    if (self.cmp)(leaf.key(i - 1), leaf.key(i)) != Ordering::Less {
                        errors.push(format!("leaf keys not strictly ascending at {i}"));
                    }
                }
                leaves.push(h);
                if leaf.len() == 0 {
                    (None, None)
                } else {
                    (Some(leaf.key(0).clone()), Some(leaf.key(leaf.len() - 1).clone()))
                }
            }
            Page::Index(x) => {
                *index_pages += 1;
                let c = x.key_count();
                if self.root == Some(h) {
                    if c < 1 {
                        errors.push(format!("root index page with {c} separators"));
                    }
                } else if c < KX - 1 || c > 2 * KX + 1 {
                    // KX - 1 is the pending-repair state left for the next
                    // delete descent; 2 * KX + 1 the pending-split state
                    // left for the next insert descent.
                    errors.push(format!("index occupancy {c} outside [{}, {}]", KX - 1, 2 * KX + 1));
                }
                for i in 1..c {
                    if (self.cmp)(x.key(i - 1), x.key(i)) != Ordering::Less {
                        errors.push(format!("separators not strictly ascending at {i}"));
                    }
                }
                let mut lo: Option<K> = None;
                let mut hi: Option<K> = None;
                for i in 0..=c {
                    let (cmin, cmax) =
                        self.validate_page(x.child(i), depth + 1, leaf_depth, index_pages, leaves, errors);
                    if i > 0
                        && let Some(cmin) = &cmin
                        && (self.cmp)(cmin, x.key(i - 1)) == Ordering::Less
                    {
                        errors.push(format!("child {i} holds a key below its separator"));
                    }
                    if i < c
                        && let Some(cmax) = &cmax
                        && (self.cmp)(cmax, x.key(i)) != Ordering::Less
                    {
                        errors.push(format!("child {i} holds a key at or above its separator"));
                    }
                    if lo.is_none() {
                        lo = cmin;
                    }
                    if cmax.is_some() {
                        hi = cmax;
                    }
                }
                (lo, hi)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::vec::Vec;
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    fn icmp(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn tree() -> RawBPlusTreeMap<i64, i64, fn(&i64, &i64) -> Ordering> {
        RawBPlusTreeMap::new(icmp)
    }

    #[test]
    fn empty_tree() {
        let t = tree();
        assert_eq!(t.len(), 0);
        assert!(t.is_empty());
        assert_eq!(t.get(&42), None);
        assert_eq!(t.first_key_value(), None);
        assert_eq!(t.last_key_value(), None);
        t.validate_invariants();
    }

    #[test]
    fn set_get_overwrite() {
        let mut t = tree();
        assert_eq!(t.set(42, 314), None);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&42), Some(&314));

        assert_eq!(t.set(42, 278), Some(314));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&42), Some(&278));

        assert_eq!(t.set(420, 5), None);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&42), Some(&278));
        assert_eq!(t.get(&420), Some(&5));
        t.validate_invariants();
    }

    #[test]
    fn sequential_fill_and_drain() {
        const N: i64 = 600;
        let mut t = tree();
        for k in 0..N {
            t.set(k, -k);
            if k % 37 == 0 {
                t.validate_invariants();
            }
        }
        t.validate_invariants();
        assert_eq!(t.len(), N as usize);
        for k in 0..N {
            assert_eq!(t.get(&k), Some(&-k));
        }

        for k in 0..N {
            assert_eq!(t.delete(&k), Some(-k));
            if k % 37 == 0 {
                t.validate_invariants();
            }
        }
        t.validate_invariants();
        assert!(t.is_empty());
        assert!(t.root.is_none());
    }

    #[test]
    fn reverse_drain_shrinks_height() {
        const N: i64 = 600;
        let mut t = tree();
        for k in 0..N {
            t.set(k, k);
        }
        for k in (0..N).rev() {
            assert_eq!(t.delete(&k), Some(k));
            if k % 41 == 0 {
                t.validate_invariants();
            }
        }
        assert!(t.root.is_none());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn delete_missing_leaves_tree_intact() {
        let mut t = tree();
        for k in 0..64 {
            t.set(k * 2, k);
        }
        for k in 0..64 {
            assert_eq!(t.delete(&(k * 2 + 1)), None);
        }
        assert_eq!(t.len(), 64);
        t.validate_invariants();
    }

    #[test]
    fn version_counter_discipline() {
        let mut t = tree();
        assert_eq!(t.ver(), 0);
        t.set(1, 10);
        let after_insert = t.ver();
        assert!(after_insert > 0);

        // Reads leave the counter alone.
        let _ = t.get(&1);
        let _ = t.seek_leaf(&1);
        let _ = t.contains_key(&0);
        assert_eq!(t.ver(), after_insert);

        // Overwrites bump it, cursors depend on that.
        t.set(1, 11);
        assert!(t.ver() > after_insert);
        let after_overwrite = t.ver();

        // A declined put leaves the value and the counter alone.
        let (old, written) = t.put(1, |_| None);
        assert_eq!(old, Some(11));
        assert!(!written);
        assert_eq!(t.ver(), after_overwrite);

        t.delete(&1);
        assert!(t.ver() > after_overwrite);
    }

    #[test]
    fn put_decides_once_with_current_value() {
        let mut t = tree();

        let (old, written) = t.put(1, |cur| {
            assert_eq!(cur, None);
            None
        });
        assert_eq!((old, written), (None, false));
        assert!(t.is_empty());

        let (old, written) = t.put(1, |cur| {
            assert_eq!(cur, None);
            Some(-1)
        });
        assert_eq!((old, written), (None, true));
        assert_eq!(t.get(&1), Some(&-1));

        t.set(1, 10);
        let (old, written) = t.put(1, |cur| {
            assert_eq!(cur, Some(&10));
            Some(-1)
        });
        assert_eq!((old, written), (Some(10), true));
        assert_eq!(t.get(&1), Some(&-1));
        t.validate_invariants();
    }

    #[test]
    fn seek_leaf_positions() {
        let mut t = tree();
        for k in [10, 20, 30] {
            t.set(k, k * 10);
        }
        let (leaf, index, hit) = t.seek_leaf(&20);
        assert!(hit);
        assert_eq!(t.leaf_entry(leaf.unwrap(), index), (&20, &200));

        let (leaf, index, hit) = t.seek_leaf(&15);
        assert!(!hit);
        assert_eq!(t.leaf_entry(leaf.unwrap(), index), (&20, &200));

        // Past the last key of the leaf: the position is one past the end.
        let (leaf, index, hit) = t.seek_leaf(&35);
        assert!(!hit);
        assert_eq!(index, t.leaf_len(leaf.unwrap()));

        let empty = tree();
        assert_eq!(empty.seek_leaf(&1), (None, 0, false));
    }

    /// The index-page split edge: a descent for a key equal to the promoted
    /// separator must continue in the new right page. Exercises the lazy
    /// split both at the root and one level down.
    #[test]
    fn split_index_at_edge() {
        let mut t = tree();

        // Fill one root index page to 2*KX + 1 separators with packed
        // leaves; the next descent through it has to split it.
        for i in 0..=((2 * KX + 1) * 2 * KD) as i64 {
            t.set(2 * i, 2 * i);
        }
        let x0 = t.root.unwrap();
        {
            let x = t.pages.get(x0).as_index();
            assert_eq!(x.key_count(), 2 * KX + 1);
            assert_eq!(*x.key(KX), (2 * (KX + 1) * (2 * KD)) as i64);
        }

        let kedge = (2 * (KX + 1) * (2 * KD)) as i64;
        t.set(kedge, 777);
        assert_eq!(t.get(&kedge), Some(&777));
        t.validate_invariants();

        // The root split grew the tree by one level; the old root is now
        // the leftmost child.
        let xr = t.root.unwrap();
        assert_ne!(xr, x0);
        {
            let x = t.pages.get(xr).as_index();
            assert_eq!(x.key_count(), 1);
            assert_eq!(x.child(0), x0);
        }

        // Refill the old root to the brink again, this time with a parent
        // above it, and hit the same edge.
        for i in 0..=((2 * KX) * KD) as i64 {
            t.set(2 * i + 1, 2 * i + 1);
        }
        {
            let x = t.pages.get(x0).as_index();
            assert_eq!(x.key_count(), 2 * KX + 1);
            assert_eq!(*x.key(KX), ((KX + 1) * (2 * KD)) as i64);
        }
        assert_eq!(t.root, Some(xr));
        assert_eq!(t.pages.get(xr).as_index().child(0), x0);

        let kedge = ((KX + 1) * (2 * KD)) as i64;
        t.set(kedge, 888);
        assert_eq!(t.get(&kedge), Some(&888));
        t.validate_invariants();
    }

    /// Delete at a leaf boundary followed by refilling inserts around the
    /// stale separator region.
    #[test]
    fn rebalance_at_leaf_boundary() {
        let mut t = tree();
        for i in 0..(2 * KD + 1) as i64 {
            t.set(1000 * i, 0);
        }
        t.delete(&(1000 * KD as i64));
        t.validate_invariants();
        for i in 0..KD as i64 {
            t.set(1000 * (KD as i64 + 1) - 1 - i, 0);
        }
        let k = 1000 * (KD as i64 + 1) - 1 - KD as i64;
        t.set(k, 0);
        assert_eq!(t.get(&k), Some(&0));
        t.validate_invariants();
    }

    #[test]
    fn clear_resets_and_is_reusable() {
        let mut t = tree();
        for k in 0..200 {
            t.set(k, k);
        }
        let ver_before = t.ver();
        t.clear();
        assert!(t.is_empty());
        assert!(t.root.is_none());
        assert!(t.ver() > ver_before);
        t.validate_invariants();

        t.set(7, 7);
        assert_eq!(t.get(&7), Some(&7));
        t.validate_invariants();
    }

    #[derive(Clone, Debug)]
    enum Op {
        Set(i64, i64),
        Delete(i64),
        Get(i64),
        PutWrite(i64, i64),
        PutDecline(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        let key = -300i64..300;
        prop_oneof![
            5 => (key.clone(), any::<i64>()).prop_map(|(k, v)| Op::Set(k, v)),
            4 => key.clone().prop_map(Op::Delete),
            2 => key.clone().prop_map(Op::Get),
            1 => (key.clone(), any::<i64>()).prop_map(|(k, v)| Op::PutWrite(k, v)),
            1 => key.prop_map(Op::PutDecline),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Replays random operation tapes against `BTreeMap` and checks
        /// every structural invariant after each mutation. The key range is
        /// narrow on purpose so deletes keep hitting and the tree keeps
        /// growing and shrinking through all the rebalance paths.
        #[test]
        fn matches_model_with_invariants(ops in prop::collection::vec(op(), 1..800)) {
            let mut t = tree();
            let mut model: BTreeMap<i64, i64> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        prop_assert_eq!(t.set(k, v), model.insert(k, v));
                        t.validate_invariants();
                    }
                    Op::Delete(k) => {
                        prop_assert_eq!(t.delete(&k), model.remove(&k));
                        t.validate_invariants();
                    }
                    Op::Get(k) => {
                        prop_assert_eq!(t.get(&k), model.get(&k));
                    }
                    Op::PutWrite(k, v) => {
                        let expected_old = model.get(&k).copied();
                        let mut seen = None;
                        let (old, written) = t.put(k, |cur| {
                            seen = Some(cur.copied());
                            Some(v)
                        });
                        prop_assert_eq!(seen, Some(expected_old));
                        prop_assert_eq!(old, expected_old);
                        prop_assert!(written);
                        model.insert(k, v);
                        t.validate_invariants();
                    }
                    Op::PutDecline(k) => {
                        let expected_old = model.get(&k).copied();
                        let (old, written) = t.put(k, |_| None);
                        prop_assert_eq!(old, expected_old);
                        prop_assert!(!written);
                    }
                }
                prop_assert_eq!(t.len(), model.len());
            }

            // Final sweep: the leaf chain enumerates exactly the model.
            let mut walked: Vec<(i64, i64)> = Vec::new();
            let mut leaf = t.first_leaf();
            while let Some(h) = leaf {
                for i in 0..t.leaf_len(h) {
                    let (k, v) = t.leaf_entry(h, i);
                    walked.push((*k, *v));
                }
                leaf = t.leaf_next(h);
            }
            let expected: Vec<(i64, i64)> = model.iter().map(|(&k, &v)| (k, v)).collect();
            prop_assert_eq!(walked, expected);
        }
    }
}
