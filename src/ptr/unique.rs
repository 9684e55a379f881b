//! Exclusive-ownership handle returned by `make_tracked`,
//! and its array counterpart.

use core::marker::PhantomData;
use core::sync::atomic::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::page::PageHeader;
use crate::ptr::stack::Stack;
use crate::ptr::tracked::Tracked;
use crate::slot_state;
use crate::type_info::{self, TypeId};

/// Exclusive ownership of a just-constructed object. The collector never
/// reclaims a slot in `UniqueLock` state; dropping an unconsumed `Unique`
/// runs the destructor and retires the slot directly.
pub struct Unique<T> {
    addr: usize,
    consumed: bool,
    _marker: PhantomData<T>,
}

impl<T> Unique<T> {
    /// Wraps a freshly-allocated, `UniqueLock`-state slot.
    ///
    /// # Safety
    /// `addr` must be a slot this process's allocator handed out, currently
    /// in `UniqueLock` state, holding a fully-constructed `T`.
    pub(crate) unsafe fn from_raw(addr: usize) -> Self {
        Self {
            addr,
            consumed: false,
            _marker: PhantomData,
        }
    }

    /// The managed slot address this handle owns.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Consumes this handle into `dst`, applying a *force* write-barrier
    /// (the target is published `Reachable` unconditionally, overriding the
    /// `UniqueLock` the allocator left it in) and releasing the lock.
    pub fn into_tracked(mut self, dst: &Tracked<T>) {
        self.consumed = true;
        dst.store(self.addr, Ordering::Release);
    }

    /// As [`Unique::into_tracked`], but for a stack-resident root.
    pub fn into_stack(mut self, dst: &Stack<T>) {
        self.consumed = true;
        dst.store(self.addr, Ordering::Release);
    }
}

impl<T> Drop for Unique<T> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        let page_size = crate::config::config().page_size;
        unsafe {
            let header = PageHeader::from_addr(self.addr, page_size);
            let header = header.as_ref();
            let idx = header.slot_index(self.addr);
            let meta = type_info::type_metadata_by_id(header.type_id);
            meta.drop_in_place(self.addr as *mut u8);
            header.states[idx].publish(slot_state::DESTROYED);
        }
    }
}

/// Type-erased element glue for one array element type, analogous to
/// [`type_info::TypeMetadata`] but scoped to array elements.
pub struct ArrayMetadata {
    pub element_type: TypeId,
    pub element_size: usize,
    pub element_align: usize,
    drop_fn: unsafe fn(*mut u8),
}

impl ArrayMetadata {
    /// # Safety
    /// `ptr` must point to a live, properly initialized element that has
    /// not already been dropped.
    pub unsafe fn drop_element(&self, ptr: *mut u8) {
        (self.drop_fn)(ptr)
    }
}

unsafe fn drop_in_place_erased<T>(ptr: *mut u8) {
    core::ptr::drop_in_place(ptr as *mut T);
}

/// Precedes element storage in an array's large-object page.
pub struct ArrayHeader {
    pub len: usize,
    pub capacity: usize,
    pub metadata: &'static ArrayMetadata,
}

impl ArrayHeader {
    /// Byte offset of element `index` relative to the start of this
    /// header (i.e. `header_addr + size_of::<ArrayHeader>() + index *
    /// element_size`).
    pub fn element_offset(&self, index: usize) -> usize {
        core::mem::size_of::<ArrayHeader>() + index * self.metadata.element_size
    }
}

struct ArrayRegistry {
    by_type: Mutex<HashMap<TypeId, &'static ArrayMetadata>>,
}

static ARRAY_REGISTRY: OnceLock<ArrayRegistry> = OnceLock::new();

fn registry() -> &'static ArrayRegistry {
    ARRAY_REGISTRY.get_or_init(|| ArrayRegistry {
        by_type: Mutex::new(HashMap::new()),
    })
}

/// Looks up previously-registered array element metadata by the element's
/// dense type id (used by the collector, which only ever sees ids already
/// resolved through a page's `type_id`).
pub fn array_metadata_by_id(id: TypeId) -> &'static ArrayMetadata {
    let reg = registry();
    let map = reg.by_type.lock().unwrap();
    map[&id]
}

/// Returns (creating on first use) the array element metadata for `T`.
pub fn array_metadata<T: 'static>() -> &'static ArrayMetadata {
    let element_meta = type_info::type_metadata::<T>();
    let reg = registry();
    {
        let map = reg.by_type.lock().unwrap();
        if let Some(&m) = map.get(&element_meta.id) {
            return m;
        }
    }
    let mut map = reg.by_type.lock().unwrap();
    map.entry(element_meta.id).or_insert_with(|| {
        Box::leak(Box::new(ArrayMetadata {
            element_type: element_meta.id,
            element_size: element_meta.object_size,
            element_align: element_meta.align,
            drop_fn: drop_in_place_erased::<T>,
        }))
    })
}

/// Exclusive ownership of a just-constructed array, mirroring [`Unique`].
pub struct UniqueArray<T> {
    addr: usize,
    consumed: bool,
    _marker: PhantomData<T>,
}

impl<T> UniqueArray<T> {
    /// # Safety
    /// `addr` must be a large-object slot holding a fully-initialized
    /// `ArrayHeader` followed by `len` live elements of `T`, currently in
    /// `UniqueLock` state.
    pub(crate) unsafe fn from_raw(addr: usize) -> Self {
        Self {
            addr,
            consumed: false,
            _marker: PhantomData,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    fn header(&self) -> &ArrayHeader {
        unsafe { &*(self.addr as *const ArrayHeader) }
    }

    pub fn len(&self) -> usize {
        self.header().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < self.len(), "array index {index} out of bounds");
        (self.addr + self.header().element_offset(index)) as *mut T
    }

    pub fn into_tracked(mut self, dst: &Tracked<T>) {
        self.consumed = true;
        dst.store(self.addr, Ordering::Release);
    }

    pub fn into_stack(mut self, dst: &Stack<T>) {
        self.consumed = true;
        dst.store(self.addr, Ordering::Release);
    }
}

impl<T> Drop for UniqueArray<T> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        let page_size = crate::config::config().page_size;
        unsafe {
            let header = PageHeader::from_addr(self.addr, page_size);
            let header = header.as_ref();
            let idx = header.slot_index(self.addr);
            let array_header = &*(self.addr as *const ArrayHeader);
            for i in 0..array_header.len {
                let elem = (self.addr + array_header.element_offset(i)) as *mut u8;
                array_header.metadata.drop_element(elem);
            }
            header.states[idx].publish(slot_state::DESTROYED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_header_element_offsets_are_packed() {
        let meta = array_metadata::<u32>();
        let header = ArrayHeader {
            len: 3,
            capacity: 3,
            metadata: meta,
        };
        assert_eq!(header.element_offset(0), core::mem::size_of::<ArrayHeader>());
        assert_eq!(
            header.element_offset(1),
            core::mem::size_of::<ArrayHeader>() + meta.element_size
        );
    }
}
