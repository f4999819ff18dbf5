//! Ciphers and key management for NGDP encrypted content.
//!
//! Two key families exist. BLTE 'E' chunks name a 64-bit key id resolved
//! against a [`KeyTable`] of 16-byte keys, then decrypt with Salsa20 or ARC4.
//! Armadillo keys protect whole CDN objects on encrypted remotes; they carry
//! their own MD5 check digest and decrypt objects with Salsa20, taking the
//! nonce from the object's key.

pub mod arc4;
pub mod armadillo;
pub mod keys;
pub mod salsa20;

mod error;

pub use armadillo::{ArmadilloKey, ObjectCipher};
pub use error::{CryptoError, Result};
pub use keys::KeyTable;
