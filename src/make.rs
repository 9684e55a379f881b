//! Entry points for constructing managed objects: `make_tracked` and
//! `make_tracked_array`, and the child-pointer discovery pass they both
//! run.
//!
//! Embedded `Tracked<U>` fields must be left at their `Default` value by
//! the closure passed here; wire them up afterward via `.store()` on the
//! constructed object (which the handle returned here lets you reach
//! mutably before it is shared). This keeps discovery a pure
//! post-construction byte scan — see the note on
//! `crate::ptr::tracked::Tracked`.

use core::mem::{size_of, size_of_val};

use crate::block;
use crate::error::MakeTrackedError;
use crate::page::PageHeader;
use crate::page_alloc::GlobalPageAlloc;
use crate::ptr::unique::{array_metadata, ArrayHeader, ArrayMetadata};
use crate::ptr::{Unique, UniqueArray};
use crate::slot_state;
use crate::type_info::{self, TypeMetadata, CHILD_SENTINEL};

/// Scans `value` for `usize`-aligned words holding the child-pointer
/// discovery sentinel, recording their offsets in `metadata`'s child map on
/// the type's first-ever construction and resetting them to null either
/// way (subsequent constructions skip the scan and zero the already-known
/// offsets directly).
fn discover_or_reset<T>(value: &mut T, metadata: &'static TypeMetadata) {
    let base = value as *mut T as usize;
    let word = size_of::<usize>();
    let len = size_of_val(value);

    if !metadata.child_map.is_final() {
        let mut offset = 0;
        while offset + word <= len {
            let word_ptr = (base + offset) as *const usize;
            // SAFETY: `offset..offset+word` lies within `value`'s own bytes.
            let current = unsafe { word_ptr.read_unaligned() };
            if current == CHILD_SENTINEL {
                metadata.child_map.mark_child(offset / word);
                unsafe { ((base + offset) as *mut usize).write_unaligned(0) };
            }
            offset += word;
        }
        metadata.child_map.finalize();
    } else if let Some(offsets) = metadata.child_map.offsets() {
        for &offset in offsets {
            unsafe { ((base + offset) as *mut usize).write_unaligned(0) };
        }
    }
}

fn mark_bad_alloc(addr: usize, page_size: usize) {
    unsafe {
        let header = PageHeader::from_addr(addr, page_size);
        let header = header.as_ref();
        let idx = header.slot_index(addr);
        header.states[idx].publish(slot_state::BAD_ALLOC);
    }
}

/// Allocates a managed slot for `T`, runs `ctor` to produce the value, and
/// returns exclusive ownership of it.
///
/// Rejects a scalar `T` larger than a page's data capacity in two layers:
/// a `const` assertion below fails the build at monomorphization time
/// against the default page geometry (the common case, and the only one a
/// `compile_fail` doctest can exercise), and a runtime check against the
/// *actual* configured [`Config::page_size`](crate::config::Config) catches
/// the narrower case where `TRACEGC_PAGE_SIZE` was lowered enough at
/// runtime to make an otherwise-fine `T` too large. Bulk/large storage
/// should go through [`make_tracked_array`] instead, which always uses the
/// large-object page variant and never hits either check.
///
/// The slot is reclaimed and marked `BadAlloc` (never destructed) if `ctor`
/// panics; the panic is swallowed into [`MakeTrackedError::ConstructorPanicked`]
/// since a panic escaping across the allocator boundary would leave the
/// slot in an undefined state.
///
/// ```compile_fail
/// use tracegc::make_tracked;
/// make_tracked(|| [0u8; 4089]).unwrap();
/// ```
pub fn make_tracked<T: 'static>(ctor: impl FnOnce() -> T) -> Result<Unique<T>, MakeTrackedError> {
    const {
        assert!(
            size_of::<T>() <= crate::config::DEFAULT_PAGE_SIZE - size_of::<usize>(),
            "make_tracked::<T>: T is too large for a scalar slot under the default page size; \
             use make_tracked_array for bulk/large storage"
        );
    }

    let metadata = type_info::type_metadata::<T>();
    let cfg = crate::config::config();
    let page_size = cfg.page_size;
    let page_data_size = cfg.page_data_size();

    if metadata.object_size > page_data_size {
        return Err(MakeTrackedError::ScalarTooLarge {
            requested: metadata.object_size,
            limit: page_data_size,
        });
    }
    let allocator = block::type_allocator(metadata, page_size);
    let addr = allocator.alloc(&GlobalPageAlloc, page_size)?;

    let span = tracing::trace_span!("make_tracked", type_name = metadata.name, addr);
    let _enter = span.enter();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(ctor));
    let mut value = match outcome {
        Ok(v) => v,
        Err(_) => {
            mark_bad_alloc(addr, page_size);
            tracing::warn!(type_name = metadata.name, "constructor panicked in make_tracked");
            return Err(MakeTrackedError::ConstructorPanicked);
        }
    };

    discover_or_reset(&mut value, metadata);

    unsafe {
        core::ptr::write(addr as *mut T, value);
        let header = PageHeader::from_addr(addr, page_size);
        let header = header.as_ref();
        let idx = header.slot_index(addr);
        header.states[idx].publish(slot_state::UNIQUE_LOCK);
        Ok(Unique::from_raw(addr))
    }
}

/// As [`make_tracked`], but for a `len`-element array. `elem_ctor` is
/// called once per index in order; discovery runs against the first
/// element only.
pub fn make_tracked_array<T: 'static>(
    len: usize,
    mut elem_ctor: impl FnMut(usize) -> T,
) -> Result<UniqueArray<T>, MakeTrackedError> {
    let array_meta: &'static ArrayMetadata = array_metadata::<T>();
    let cfg = crate::config::config();
    let page_size = cfg.page_size;

    let header_size = size_of::<ArrayHeader>();
    let total = header_size
        .checked_add(
            array_meta
                .element_size
                .checked_mul(len)
                .ok_or(MakeTrackedError::TooLarge {
                    requested: usize::MAX,
                    limit: cfg.page_data_size(),
                })?,
        )
        .ok_or(MakeTrackedError::TooLarge {
            requested: usize::MAX,
            limit: cfg.page_data_size(),
        })?;

    let addr = block::alloc_large(
        array_meta.element_type,
        total,
        array_meta.element_align.max(core::mem::align_of::<ArrayHeader>()),
        page_size,
        true,
    )?;

    let span = tracing::trace_span!("make_tracked_array", len, addr);
    let _enter = span.enter();

    unsafe {
        core::ptr::write(
            addr as *mut ArrayHeader,
            ArrayHeader {
                len,
                capacity: len,
                metadata: array_meta,
            },
        );
    }

    let element_type_metadata = type_info::type_metadata_by_id(array_meta.element_type);
    for i in 0..len {
        let elem_addr = addr + header_size + i * array_meta.element_size;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| elem_ctor(i)));
        let mut value = match outcome {
            Ok(v) => v,
            Err(_) => {
                // Destroy whatever elements were already written before
                // failing the whole array; the slot itself becomes BadAlloc.
                for j in 0..i {
                    let addr_j = addr + header_size + j * array_meta.element_size;
                    unsafe { array_meta.drop_element(addr_j as *mut u8) };
                }
                mark_bad_alloc(addr, page_size);
                tracing::warn!("constructor panicked in make_tracked_array at index {i}");
                return Err(MakeTrackedError::ConstructorPanicked);
            }
        };
        discover_or_reset(&mut value, element_type_metadata);
        unsafe { core::ptr::write(elem_addr as *mut T, value) };
    }

    unsafe {
        let header = PageHeader::from_addr(addr, page_size);
        let header = header.as_ref();
        let idx = header.slot_index(addr);
        header.states[idx].publish(slot_state::UNIQUE_LOCK);
        Ok(UniqueArray::from_raw(addr))
    }
}
