//! Small binary-read helpers shared by the manifest parsers.

use std::io::{BufRead, Read};

use crate::error::{Error, Result};

/// Read a NUL-terminated UTF-8 string.
pub(crate) fn read_cstring<R: BufRead>(reader: &mut R, format: &'static str) -> Result<String> {
    let mut bytes = Vec::new();
    reader.read_until(0, &mut bytes)?;

    if bytes.pop() != Some(0) {
        return Err(Error::Parse {
            format,
            offset: 0,
            reason: "unterminated string".to_string(),
        });
    }

    String::from_utf8(bytes).map_err(|e| Error::Parse {
        format,
        offset: 0,
        reason: format!("string is not UTF-8: {e}"),
    })
}

/// Read exactly `len` bytes.
pub(crate) fn read_bytes<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}
