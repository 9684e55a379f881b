//! Per-type child-pointer discovery and the global type registry.

use std::any::TypeId as StdTypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::flags::AtomicBitset;

/// The bit pattern [`crate::ptr::tracked::Tracked::default`] leaves in its
/// atomic word. Discovery scans a freshly-constructed value for
/// `usize`-aligned words holding this pattern instead of relying on address
/// identity during construction, since Rust does not guarantee in-place
/// construction for an ordinary by-value constructor closure: a moved or
/// NRVO'd value keeps its bytes either way, so a value-pattern scan survives
/// whichever the compiler chooses where an address-identity scan would not.
#[cfg(target_pointer_width = "64")]
pub const CHILD_SENTINEL: usize = 0xDEAD_BEEF_DEAD_BEEF;
#[cfg(not(target_pointer_width = "64"))]
pub const CHILD_SENTINEL: usize = 0xDEAD_BEEF;

/// A dense, process-wide index assigned to a Rust type the first time it is
/// passed to `make_tracked`. Cheaper to use as a page tag than
/// `std::any::TypeId` (16 bytes, not `Copy`-friendly for atomics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

/// Per-type bitmap of word-offsets holding embedded `Tracked<_>` pointers,
/// built lazily during the type's first construction.
pub struct ChildMap {
    /// One bit per `usize`-word offset within the type.
    bits: AtomicBitset,
    /// Once set, the map never changes again.
    is_final: AtomicBool,
    /// Compact byte-offset vector, computed once after `is_final` flips.
    compact: OnceLock<Vec<usize>>,
}

impl ChildMap {
    /// Creates a child map sized for a type occupying `word_count` words.
    pub fn new(word_count: usize) -> Self {
        Self {
            bits: AtomicBitset::new(word_count.max(1)),
            is_final: AtomicBool::new(false),
            compact: OnceLock::new(),
        }
    }

    /// Records that the word at `word_offset` holds an embedded tracked
    /// pointer. A no-op once the map is final.
    ///
    /// # Panics
    /// Panics in debug builds if called after [`ChildMap::finalize`].
    pub fn mark_child(&self, word_offset: usize) {
        debug_assert!(
            !self.is_final.load(Ordering::Acquire),
            "child-pointer map mutated after being finalized"
        );
        self.bits.test_and_set(word_offset, Ordering::Relaxed);
    }

    /// Marks this map immutable. Idempotent.
    pub fn finalize(&self) {
        self.is_final.store(true, Ordering::Release);
    }

    /// Whether construction of the first instance has completed.
    pub fn is_final(&self) -> bool {
        self.is_final.load(Ordering::Acquire)
    }

    /// The compact byte-offset vector the collector traces against,
    /// computed (and cached) lazily the first time it is needed after
    /// finalization.
    ///
    /// Returns `None` if the map has not been finalized yet — the
    /// collector must not trace with a partially-discovered map.
    pub fn offsets(&self) -> Option<&[usize]> {
        if !self.is_final() {
            return None;
        }
        Some(self.compact.get_or_init(|| {
            let word_bits = core::mem::size_of::<usize>();
            self.bits
                .iter_set(Ordering::Acquire)
                .map(|word_offset| word_offset * word_bits)
                .collect()
        }))
    }
}

/// Everything the collector needs to trace and destroy one registered
/// type's objects.
pub struct TypeMetadata {
    /// This type's dense id.
    pub id: TypeId,
    /// `std::any::type_name::<T>()`, for diagnostics.
    pub name: &'static str,
    /// `size_of::<T>()`.
    pub object_size: usize,
    /// `align_of::<T>()`.
    pub align: usize,
    /// Per-type discovered child-pointer layout.
    pub child_map: ChildMap,
    /// Type-erased destructor, `core::ptr::drop_in_place::<T>` bound at
    /// registration time.
    drop_fn: unsafe fn(*mut u8),
}

impl TypeMetadata {
    /// Runs this type's destructor over `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to a live, properly initialized `T` (the same `T`
    /// this metadata was registered for) that has not already been
    /// dropped.
    pub unsafe fn drop_in_place(&self, ptr: *mut u8) {
        (self.drop_fn)(ptr)
    }
}

unsafe fn drop_in_place_erased<T>(ptr: *mut u8) {
    core::ptr::drop_in_place(ptr as *mut T);
}

struct Registry {
    by_std_type: Mutex<HashMap<StdTypeId, TypeId>>,
    metadata: Mutex<Vec<&'static TypeMetadata>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        by_std_type: Mutex::new(HashMap::new()),
        metadata: Mutex::new(Vec::new()),
    })
}

/// Returns the (possibly newly-created) metadata for `T`, registering it in
/// the global table on first use.
///
/// The metadata is leaked (`Box::leak`) deliberately: types register once
/// per process, the table is process-wide, and `terminate()` tears down the
/// heap, not the type registry (the registry, like the collector singleton
/// itself, is process-wide and outlives any single heap lifetime).
pub fn type_metadata<T: 'static>() -> &'static TypeMetadata {
    let reg = registry();
    let std_id = StdTypeId::of::<T>();

    {
        let map = reg.by_std_type.lock().unwrap();
        if let Some(&id) = map.get(&std_id) {
            let metadata = reg.metadata.lock().unwrap();
            return metadata[id.0 as usize];
        }
    }

    let mut map = reg.by_std_type.lock().unwrap();
    // Re-check: another thread may have registered T while we waited.
    if let Some(&id) = map.get(&std_id) {
        let metadata = reg.metadata.lock().unwrap();
        return metadata[id.0 as usize];
    }

    let mut metadata_vec = reg.metadata.lock().unwrap();
    let max_types = crate::config::config().max_types_number;
    assert!(
        metadata_vec.len() < max_types,
        "tracegc: exceeded configured max_types_number ({max_types})"
    );
    let id = TypeId(metadata_vec.len() as u32);
    let object_size = core::mem::size_of::<T>().max(1);
    let word_count = object_size.div_ceil(core::mem::size_of::<usize>());
    let meta = Box::leak(Box::new(TypeMetadata {
        id,
        name: core::any::type_name::<T>(),
        object_size,
        align: core::mem::align_of::<T>(),
        child_map: ChildMap::new(word_count),
        drop_fn: drop_in_place_erased::<T>,
    }));
    metadata_vec.push(meta);
    map.insert(std_id, id);
    meta
}

/// Looks up previously-registered metadata by dense id. Panics if `id` was
/// never registered — only the collector, which only ever sees ids it
/// already resolved through a page, calls this.
pub fn type_metadata_by_id(id: TypeId) -> &'static TypeMetadata {
    let reg = registry();
    let metadata = reg.metadata.lock().unwrap();
    metadata[id.0 as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Foo {
        _a: u64,
    }
    struct Bar {
        _b: u32,
    }

    #[test]
    fn same_type_returns_same_id() {
        let a = type_metadata::<Foo>();
        let b = type_metadata::<Foo>();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn distinct_types_get_distinct_ids() {
        let a = type_metadata::<Foo>();
        let b = type_metadata::<Bar>();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn child_map_offsets_none_until_final() {
        let map = ChildMap::new(4);
        map.mark_child(1);
        assert!(map.offsets().is_none());
        map.finalize();
        assert_eq!(map.offsets(), Some(&[core::mem::size_of::<usize>()][..]));
    }
}
