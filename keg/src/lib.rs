//! The NGDP repository engine.
//!
//! A keg repository mirrors one or more remote NGDP endpoints: it logs every
//! stateful patch-server response in a state cache, maintains a local
//! content-addressed object store laid out like the upstream CDN, and
//! reconstructs installable file trees from that store.
//!
//! The [`Keg`] handle ties the pieces together: [`conf::KegConfig`] for
//! `keg.conf`, [`db::KegDb`] + [`statecache::StateCache`] for response
//! history, [`remote`] for the patch-server client, [`fetcher`] for planning
//! a build's transitive object closure, and [`build::BuildManager`] for
//! opening a fetched build.

pub mod build;
pub mod conf;
pub mod db;
pub mod fetcher;
pub mod remote;
pub mod repo;
pub mod statecache;

mod error;

pub use error::{Error, Result};
pub use repo::Keg;
