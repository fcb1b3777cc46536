#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(docsrs, loom)))]
#![cfg_attr(not(any(test, loom, feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
mod util;

pub mod blocking;
pub mod futex;
mod raw;

#[doc(inline)]
pub use self::futex::{DefaultFutex, Futex};
#[cfg(not(loom))]
#[doc(inline)]
pub use self::futex::OsFutex;
#[doc(inline)]
pub use self::raw::{FutexMutex, Spins};
