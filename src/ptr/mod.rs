//! The pointer kinds a managed object can be reached through.

pub mod atomic;
pub mod stack;
pub mod tracked;
pub mod unique;

pub use atomic::AtomicTracked;
pub use stack::Stack;
pub use tracked::Tracked;
pub use unique::{ArrayHeader, ArrayMetadata, Unique, UniqueArray};
