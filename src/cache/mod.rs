pub mod coalescing;
pub mod disk;
pub mod memory;

pub use coalescing::{InFlight, Listener, Registration};
pub use disk::{DiskCache, DiskLookup, DiskWorker};
pub use memory::MemoryCache;
