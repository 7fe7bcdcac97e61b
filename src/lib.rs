//! Hierarchical lock manager. Grants, queues, upgrades, times out and releases named locks.
//!
//! ## Modes
//!
//! Locks are taken in one of twelve [`LockMode`]s. Besides the plain shared, update and exclusive
//! modes there are intent modes, which announce finer grained locks further down a resource
//! hierarchy, and schema modes, which protect the definition of a resource rather than its data.
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() -> hlm::HlmResult<()> {
//! use hlm::{LockManager, LockMode, LockTimeout, OwnerId};
//!
//! let manager = LockManager::default();
//! manager.open("replica-1")?;
//!
//! let txn = OwnerId::from("txn-1");
//! let table = manager
//!     .acquire_lock(&txn, "/db/users", LockMode::IntentExclusive, LockTimeout::Infinite)
//!     .await?;
//! let row = manager
//!     .acquire_lock(&txn, "/db/users/42", LockMode::Exclusive, LockTimeout::Infinite)
//!     .await?;
//!
//! manager.release(&row)?;
//! manager.release(&table)?;
//! manager.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Owners are opaque to the lock manager, see [`OwnerId`]. Everything the manager decides is
//! reported through [`LockStatus`] and [`UnlockStatus`]; [`HlmError`] is reserved for misuse.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod base;
pub mod ctrl;

pub use base::{HlmError, HlmResult, OwnerId};
pub use ctrl::{
    LockHandle, LockManager, LockManagerConfig, LockMode, LockStatus, LockTimeout, LockWaiter,
    UnlockStatus,
};
