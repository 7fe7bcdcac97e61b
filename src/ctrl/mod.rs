//! Concurrency control.
//!
//! - [`mode`]: The lock modes and their compatibility and conversion tables.
//! - [`LockManager`]: The hierarchical lock manager, see [`hlm`].
//! - [`LockHandle`]/[`LockWaiter`]: A caller's view of a lock request.

pub mod config;
pub mod hlm;
pub mod mode;
pub mod prime;
pub mod request;
pub mod table;

pub use config::LockManagerConfig;
pub use hlm::{LockManager, ManagerState};
pub use mode::{LockCompatibility, LockMode, compatibility, convert_to_max};
pub use prime::PrimeLockGuard;
pub use request::{LockHandle, LockStatus, LockTimeout, LockWaiter, UnlockStatus};
pub use table::{LockEntrySnapshot, LockResourceSnapshot};
