//! The content-addressed object store.
//!
//! Three stores collaborate behind one interface: a [`LocalStore`] over the
//! two-level partitioned filesystem tree, a [`RemoteStore`] streaming over
//! HTTP from a CDN mirror, and a [`CachedStore`] that reads local first and
//! ingests remote objects through a verifying sink: nothing becomes
//! visible at its final path until its digest has been checked.

mod cached;
mod error;
mod local;
mod remote;
mod store;

pub use cached::{CachedStore, verify_bytes};
pub use error::{Error, Result};
pub use local::{LocalStore, StoredObject};
pub use remote::RemoteStore;
pub use store::{ObjectKind, ObjectStore};
