//! Petek: hazard-pointer family memory reclamation for lock-free data structures.
//!
//! Petek provides two safe-memory-reclamation engines sharing one thread
//! registry:
//!
//! - **HP** ([`HpDomain`]): Michael's hazard pointers. A fixed array of
//!   published pointers per thread plus a bounded retired buffer; a scan
//!   pass reclaims every retired pointer no thread has published.
//! - **HRC** ([`HrcDomain`]): Gidenstam's hazard pointers + reference
//!   counts. Every managed node carries a reference count and `trace` /
//!   `deleted` flags, so containers with internal marked links (block
//!   lists, doubly-marked next pointers) can be reclaimed safely.
//!
//! # Key Properties
//!
//! - **Lock-Free Progress**: every operation is a finite sequence of atomic
//!   steps; at least one thread always makes progress
//! - **Exactly-Once Disposal**: a retired pointer's disposer runs exactly
//!   once, and never while any thread still has it published
//! - **Orphan Handoff**: a thread may detach with undrained retired
//!   entries; surviving threads adopt them through help-scan
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::atomic::{AtomicPtr, Ordering};
//! use petek::{HpConfig, HpDomain};
//!
//! let domain = HpDomain::new(HpConfig::default());
//! let local = domain.attach();
//!
//! let link = AtomicPtr::new(Box::into_raw(Box::new(42u32)));
//! let guard = local.guard();
//! let ptr = guard.protect(&link);
//!
//! // `ptr` stays valid until the guard is dropped, even if another
//! // thread unlinks and retires it in the meantime.
//! link.store(std::ptr::null_mut(), Ordering::Release);
//! unsafe { local.retire(ptr) };
//! ```

#![warn(missing_docs)]

mod config;
mod hp;
mod hrc;
mod marked;
mod registry;
mod retired;

pub use config::{HpConfig, HrcConfig, ScanType};
pub use hp::{HpDomain, HpDomainStats, HpGuard, HpLocal};
pub use hrc::{HrcDomain, HrcDomainStats, HrcGuard, HrcHeader, HrcLocal, HrcManaged, HrcOps};
pub use marked::{AtomicMarkedPtr, MarkedPtr};
pub use retired::Disposer;

// Re-export for convenience
pub use core::sync::atomic::Ordering;
