//! A lock-free concurrent bag (Sundell et al., SPAA'11) on top of the
//! petek HRC reclamation engine.
//!
//! ## Shape
//!
//! Every registered thread owns a list of cache-line blocks of word
//! slots. Producers append into their own newest block; consumers drain
//! their own list backwards and, once it is empty, steal from other
//! threads' blocks. Block unlinking runs through 3-bit marked pointers
//! and all physical frees go through the HRC engine.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use petek_bag::SBag;
//!
//! let bag = SBag::new(usize::MAX, 2); // sentinel, registered threads
//!
//! std::thread::scope(|s| {
//!     s.spawn(|| {
//!         let handle = bag.init_thread(0);
//!         for i in 0..1000 {
//!             handle.add(i);
//!         }
//!     });
//!     s.spawn(|| {
//!         let handle = bag.init_thread(1);
//!         let mut out = 0;
//!         while handle.try_remove_any(&mut out) {
//!             // out holds a previously added value
//!         }
//!     });
//! });
//! ```

#![warn(missing_docs)]

mod bag;
mod layout;
mod word;

pub use bag::{BagThread, SBag};
pub use word::Word;
