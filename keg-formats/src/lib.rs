//! Format codecs for NGDP metadata.
//!
//! Everything in an NGDP repository hangs off a handful of cross-referenced
//! metadata formats: `key = value` configuration documents, archive indices
//! mapping encoded keys to byte ranges, the encoding table bridging content
//! keys and encoded keys, and the tag-filtered install/download manifests.
//! This crate parses (and where the tooling needs it, writes) all of them.
//!
//! Codecs here are pure: no IO beyond the byte slices handed in, and no
//! knowledge of the object store that feeds them.

pub mod archive;
pub mod config;
pub mod download;
pub mod encoding;
pub mod install;
pub mod key;
pub mod tags;

mod error;
mod ioutil;

pub use error::{Error, Result};
pub use key::Key;
