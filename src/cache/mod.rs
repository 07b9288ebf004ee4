//! Cache module: the normalized entity store.
//!
//! Every field of every entity (and every top-level query root) lives in its own [RootCell].
//! Reference-bearing roots are mirrored by the [BondIndex] so relationship changes and entity
//! removal can find every root that points at an identity without scanning the store.
//!
//! # Module Organization
//!
//! - [`root`]: Root cells and their keys (RootCell, RootKey, RootKind, RootValue)
//! - [`bonds`]: The bond index and inverse-relationship maintenance
//! - [`window`]: Pagination windows over connection roots (ConnectionWindow, identify)
//! - [`store`]: The cache itself (Cache, CacheState)
//!
//! ```rust
//! use normcache::cache::{Cache, RootKey, RootKind};
//! ```

mod bonds;
mod root;
mod store;
mod window;


pub use bonds::BondIndex;
pub use root::{RootCell, RootKey, RootKind, RootValue};
pub use store::{Cache, CacheState};
pub use window::{identify, ConnectionWindow, WindowView};
