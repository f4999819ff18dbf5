//! The named-key table for BLTE encrypted chunks.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::Result;
use crate::error::CryptoError;

/// Parse a 16-hex-character key name into its numeric id.
pub fn parse_key_name(name: &str) -> Result<u64> {
    let name = name.trim().trim_start_matches("0x");
    u64::from_str_radix(name, 16)
        .map_err(|_| CryptoError::InvalidKeyFormat(format!("bad key name {name:?}")))
}

/// Parse 32 hex characters of key material.
pub fn parse_key_hex(hex_key: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|_| CryptoError::InvalidKeyFormat(format!("bad key material {hex_key:?}")))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeySize {
            expected: 16,
            actual: hex_key.trim().len() / 2,
        })
}

/// A table of provisioned decryption keys, keyed by 64-bit key name.
///
/// The table is configuration input: keys come from the repository's key
/// file, never from ambient state.
#[derive(Debug, Default, Clone)]
pub struct KeyTable {
    keys: HashMap<u64, [u8; 16]>,
}

impl KeyTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key_name: u64) -> Option<&[u8; 16]> {
        self.keys.get(&key_name)
    }

    pub fn insert(&mut self, key_name: u64, key: [u8; 16]) {
        self.keys.insert(key_name, key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load `keyname keyhex` lines from a text file, one pair per line.
    ///
    /// Blank lines and `#` comments are skipped; malformed lines are logged
    /// and skipped rather than failing the whole file. Returns how many keys
    /// were loaded.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let content = fs::read_to_string(path)?;
        let mut loaded = 0;

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(name), Some(material)) = (parts.next(), parts.next()) else {
                warn!("Skipping malformed key line {}: {line:?}", line_num + 1);
                continue;
            };

            match (parse_key_name(name), parse_key_hex(material)) {
                (Ok(key_name), Ok(key)) => {
                    self.insert(key_name, key);
                    loaded += 1;
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Skipping key line {}: {e}", line_num + 1);
                }
            }
        }

        debug!("Loaded {loaded} decryption keys from {path:?}");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_key_name() {
        assert_eq!(parse_key_name("fa505078126acb3e").unwrap(), 0xFA505078126ACB3E);
        assert_eq!(parse_key_name("0xFA505078126ACB3E").unwrap(), 0xFA505078126ACB3E);
        assert!(parse_key_name("not hex").is_err());
    }

    #[test]
    fn test_parse_key_hex() {
        let key = parse_key_hex("bdc51862abed79b2de48c8e7e66c6200").unwrap();
        assert_eq!(key[0], 0xBD);
        assert_eq!(key[15], 0x00);
        assert!(parse_key_hex("bdc518").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# provisioned keys").unwrap();
        writeln!(file, "fa505078126acb3e bdc51862abed79b2de48c8e7e66c6200").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file, "ff813f7d062ac0bc aa0b5c77f088ccc2d39049bd267f066d").unwrap();
        file.flush().unwrap();

        let mut table = KeyTable::new();
        let loaded = table.load_file(file.path()).unwrap();
        assert_eq!(loaded, 2);
        assert!(table.get(0xFA505078126ACB3E).is_some());
        assert!(table.get(0xDEADBEEF).is_none());
    }
}
