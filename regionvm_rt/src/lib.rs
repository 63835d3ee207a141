//! # regionvm_rt
//!
//! The thread-coordination kernel for a multithreaded, region-based runtime: a custom monitor
//! abstraction supporting wait-any over several monitors at once, a region ownership model for a
//! garbage-collected heap, blocking channels with deep-copy-free object-graph handoff, and the
//! simpler synchronization primitives (semaphore, barrier, write-once variable) built on top of
//! the monitor. [`thread::ThreadRegistry`] spawns and tracks the real OS threads this kernel
//! coordinates.
//!
//! The garbage collector itself and the object/bag encoding are out of scope here -- this crate
//! only defines the [`region::RegionObject`] seam that collaborator hangs off of. Anything
//! resembling an embedded interpreter (bytecode, a variable table, dynamic dispatch over the
//! operations below) is likewise someone else's concern; this crate exposes each operation as a
//! typed Rust call instead.

#![allow(dead_code)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::unwrap_used)]

pub mod barrier;
pub mod channel;
pub mod config;
pub mod error;
pub mod ids;
pub mod keepalive;
pub mod migration;
pub mod misc;
pub mod monitor;
pub mod region;
pub mod semaphore;
pub mod syncvar;
pub mod thread;

pub use barrier::Barrier;
pub use channel::Channel;
pub use config::Configuration;
pub use error::{Error, Result};
pub use ids::{MonitorId, RegionId, ThreadId};
pub use keepalive::{KeepAliveList, PinId};
pub use migration::{adopt, adopt_norecurse, clone_delimited, clone_reachable, force_make_public, make_protected, make_protected_obj, make_public, make_public_norecurse, make_read_only, make_read_only_obj, migrate, migrate_norecurse, reachable, share, share_norecurse};
pub use misc::{ordered_read, ordered_write};
pub use monitor::{Monitor, WaitSlot};
pub use region::{region_of, HashLockTable, LockMode, LockStack, Region, RegionObject, RegionTable};
pub use semaphore::Semaphore;
pub use syncvar::SyncVar;
pub use thread::{InterruptHandler, ThreadRecord, ThreadRegistry, ThreadState};
