//! Error types surfaced to mutators.
//!
//! Follows the manual `Display`-impl style already used for `AllocError`
//! elsewhere in this codebase rather than pulling in a derive-macro error
//! crate: the error surface here is small and closed.

use core::fmt;

/// Allocation failed: the block allocator could not obtain a new page or
/// block from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

impl std::error::Error for AllocError {}

/// Failure surfaced from [`crate::make::make_tracked`] /
/// [`crate::make::make_tracked_array`].
#[derive(Debug)]
pub enum MakeTrackedError {
    /// The block allocator could not supply a slot for this type.
    Alloc(AllocError),
    /// `make_tracked_array`'s requested length/element-size overflows what a
    /// `usize`-addressed allocation can represent.
    TooLarge {
        /// Requested object size in bytes.
        requested: usize,
        /// Maximum object size a page can serve.
        limit: usize,
    },
    /// `make_tracked::<T>` was called for a scalar `T` that exceeds a
    /// page's data capacity under the process's *actual* configured
    /// `page_size`. The common case (an oversized `T` known at compile
    /// time) is rejected earlier, at monomorphization time, by the `const`
    /// assertion in `make_tracked` itself; this variant only fires when a
    /// smaller-than-default `TRACEGC_PAGE_SIZE` makes a `T` that passed the
    /// compile-time check too large for the page geometry actually in
    /// effect. Use `make_tracked_array` for bulk/large storage instead.
    ScalarTooLarge {
        /// Requested object size in bytes.
        requested: usize,
        /// Maximum scalar object size the running configuration can serve.
        limit: usize,
    },
    /// The constructor closure passed to `make_tracked` panicked. The slot
    /// has already been transitioned to `BadAlloc` and will never be
    /// traced or destructed.
    ConstructorPanicked,
}

impl fmt::Display for MakeTrackedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MakeTrackedError::Alloc(e) => write!(f, "make_tracked: {e}"),
            MakeTrackedError::TooLarge { requested, limit } => write!(
                f,
                "make_tracked: object size {requested} exceeds page capacity {limit}"
            ),
            MakeTrackedError::ScalarTooLarge { requested, limit } => write!(
                f,
                "make_tracked: scalar size {requested} exceeds the running configuration's \
                 page capacity {limit}; use make_tracked_array instead"
            ),
            MakeTrackedError::ConstructorPanicked => {
                f.write_str("make_tracked: constructor panicked")
            }
        }
    }
}

impl std::error::Error for MakeTrackedError {}

impl From<AllocError> for MakeTrackedError {
    fn from(e: AllocError) -> Self {
        MakeTrackedError::Alloc(e)
    }
}
