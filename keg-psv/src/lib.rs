//! Pipe-separated value (PSV) tables.
//!
//! NGDP patch servers respond to the stateful endpoints (`versions`, `cdns`,
//! `bgdl`, `blobs`) with PSV documents: a typed header line followed by
//! pipe-separated rows. This crate parses and writes that format.
//!
//! ```text
//! Region!STRING:0|BuildConfig!HEX:16|BuildId!DEC:4
//! ## seqn = 12345
//! us|f2a57b9f…|61491
//! eu|f2a57b9f…|61491
//! ```

mod document;
mod error;
mod field_type;
mod schema;

pub use document::{PsvDocument, PsvRow};
pub use error::{Error, Result};
pub use field_type::FieldType;
pub use schema::{Field, Schema};
