pub mod mac;

// Single seam for the lock types used by the device crates, so a platform
// lock can be swapped in without touching every call site.
pub use parking_lot::{Condvar, Mutex, MutexGuard};
