mod arena;
mod handle;
mod page;
mod raw_bplus_tree_map;

pub(crate) use arena::Arena;
pub(crate) use handle::Handle;
pub(crate) use page::Page;
pub(crate) use raw_bplus_tree_map::RawBPlusTreeMap;
