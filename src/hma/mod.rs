//! HMA file layout, memory-mapping, and the OS byte-range lock primitive.
//!
//! These two concerns (component A and component B of the design) are
//! deliberately kept free of registry/engine knowledge — they only know
//! how to address and lock bytes in one memory-mapped file.
pub mod layout;
pub mod oslock;
pub mod region;

pub use oslock::{os_lock, LockMode};
pub use region::HmaRegion;
