//! Per-type slab management, sitting on top of the raw page
//! allocator in `page.rs`.
//!
//! Mirrors this codebase's `SizeClassManager`: one atomic "active" page per
//! type that mutator threads race to bump-allocate from, backed by a
//! lock-free stack of not-yet-full pages recycled by the collector. The
//! `'brand`/`GhostBorrow`/const-generic machinery is dropped — there is one
//! size class per Rust type here, decided at `make_tracked::<T>` time, not
//! a small fixed family of power-of-two classes.
//!
//! "Block" and "Page" are collapsed into a single page-granularity OS
//! allocation: each page is independently allocated from and returned to
//! `PageAlloc`. A multi-page block would be a bulk-allocation optimization
//! orthogonal to correctness; see `DESIGN.md`.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::AllocError;
use crate::page::PageHeader;
use crate::page_alloc::{GlobalPageAlloc, PageAlloc};
use crate::type_info::{TypeId, TypeMetadata};

/// Shared, process-wide allocator state for one Rust type.
pub struct TypeAllocator {
    metadata: &'static TypeMetadata,
    slots_per_page: usize,
    active: AtomicUsize,
    available: AtomicUsize,
}

impl TypeAllocator {
    fn new(metadata: &'static TypeMetadata, page_size: usize) -> Self {
        let data_capacity = page_size - core::mem::size_of::<usize>();
        let slots_per_page = (data_capacity / metadata.object_size).max(1);
        Self {
            metadata,
            slots_per_page,
            active: AtomicUsize::new(0),
            available: AtomicUsize::new(0),
        }
    }

    fn pop_available(&self) -> Option<usize> {
        loop {
            let head = self.available.load(Ordering::Acquire);
            if head == 0 {
                return None;
            }
            let header = unsafe { &*(head as *const PageHeader) };
            let next = header.next_free.load(Ordering::Relaxed);
            if self
                .available
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    fn push_available(&self, addr: usize) {
        let header = unsafe { &*(addr as *const PageHeader) };
        loop {
            let head = self.available.load(Ordering::Relaxed);
            header.next_free.store(head, Ordering::Relaxed);
            if self
                .available
                .compare_exchange(head, addr, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Allocates a slot for this type, minting a fresh page when every
    /// known page is full.
    pub fn alloc(&self, page_alloc: &impl PageAlloc, page_size: usize) -> Result<usize, AllocError> {
        loop {
            let active_addr = self.active.load(Ordering::Acquire);
            if active_addr != 0 {
                let header = unsafe { &*(active_addr as *const PageHeader) };
                if let Some(addr) = header.alloc_slot() {
                    crate::collector::notify_alloc();
                    return Ok(addr);
                }
            }

            let new_active = match self.pop_available() {
                Some(addr) => addr,
                None => {
                    let header = PageHeader::new_slab(
                        page_alloc,
                        self.metadata.id,
                        self.metadata.object_size,
                        self.metadata.align,
                        page_size,
                        self.slots_per_page,
                    )?;
                    let addr = header.as_ptr() as usize;
                    new_page_registry().register(addr);
                    addr
                }
            };

            match self.active.compare_exchange(
                active_addr,
                new_active,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(old) => {
                    if old != 0 {
                        let old_header = unsafe { &*(old as *const PageHeader) };
                        if old_header.has_capacity() {
                            self.push_available(old);
                        }
                    }
                }
                Err(_) => self.push_available(new_active),
            }
        }
    }
}

struct TypeAllocatorTable {
    by_type: Mutex<HashMap<TypeId, &'static TypeAllocator>>,
}

static TABLE: OnceLock<TypeAllocatorTable> = OnceLock::new();

fn table() -> &'static TypeAllocatorTable {
    TABLE.get_or_init(|| TypeAllocatorTable {
        by_type: Mutex::new(HashMap::new()),
    })
}

/// Returns the shared `TypeAllocator` for `metadata`'s type, creating it on
/// first use.
pub fn type_allocator(metadata: &'static TypeMetadata, page_size: usize) -> &'static TypeAllocator {
    let t = table();
    {
        let map = t.by_type.lock().unwrap();
        if let Some(&a) = map.get(&metadata.id) {
            return a;
        }
    }
    let mut map = t.by_type.lock().unwrap();
    map.entry(metadata.id)
        .or_insert_with(|| Box::leak(Box::new(TypeAllocator::new(metadata, page_size))))
}

/// Global queue of freshly minted pages awaiting collector registration
/// (collapses separate "register threads" / "register pages" intrusive-list
/// splices into one registration point; see `DESIGN.md`).
pub struct NewPageRegistry {
    pending: Mutex<Vec<usize>>,
}

impl NewPageRegistry {
    fn register(&self, addr: usize) {
        self.pending.lock().unwrap().push(addr);
    }

    /// Drains every pending page address, handing ownership of the list to
    /// the caller (the collector).
    pub fn drain(&self) -> Vec<usize> {
        std::mem::take(&mut self.pending.lock().unwrap())
    }
}

static NEW_PAGES: OnceLock<NewPageRegistry> = OnceLock::new();

/// The process-wide new-page registry.
pub fn new_page_registry() -> &'static NewPageRegistry {
    NEW_PAGES.get_or_init(|| NewPageRegistry {
        pending: Mutex::new(Vec::new()),
    })
}

/// Allocates a large-object page (always fresh, never pooled) and hands it
/// to the collector registry directly.
pub fn alloc_large(
    type_id: TypeId,
    object_size: usize,
    align: usize,
    page_size: usize,
    is_array: bool,
) -> Result<usize, AllocError> {
    let header = PageHeader::new_large(&GlobalPageAlloc, type_id, object_size, align, page_size, is_array)?;
    let addr = header.as_ptr() as usize;
    new_page_registry().register(addr);
    crate::collector::notify_alloc();
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    #[test]
    fn alloc_mints_and_reuses_pages() {
        let meta = crate::type_info::type_metadata::<Probe>();
        let alloc = type_allocator(meta, 4096);
        let pa = GlobalPageAlloc;
        let mut addrs = Vec::new();
        for _ in 0..4 {
            addrs.push(alloc.alloc(&pa, 4096).unwrap());
        }
        assert_eq!(addrs.iter().collect::<std::collections::HashSet<_>>().len(), 4);
    }
}
