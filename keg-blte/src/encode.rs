//! BLTE encoding

use flate2::Compression;
use flate2::write::ZlibEncoder;
use md5::{Digest, Md5 as Md5Hasher};
use std::io::Write;

use keg_crypto::KeyTable;
use keg_crypto::salsa20::encrypt_salsa20;

use crate::{Error, Md5, Mode, Result};

/// One chunk of an encode plan: the decoded bytes and how to encode them.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    mode: Mode,
    data: Vec<u8>,
    encryption: Option<EncryptionSpec>,
}

#[derive(Debug, Clone)]
struct EncryptionSpec {
    key_name: u64,
    iv: [u8; 4],
    inner: Mode,
}

impl ChunkPlan {
    /// Store the bytes unmodified (mode 'N').
    pub fn raw(data: Vec<u8>) -> Self {
        Self {
            mode: Mode::Raw,
            data,
            encryption: None,
        }
    }

    /// Deflate the bytes into a zlib stream (mode 'Z').
    pub fn zlib(data: Vec<u8>) -> Self {
        Self {
            mode: Mode::Zlib,
            data,
            encryption: None,
        }
    }

    /// Compress the bytes as an LZ4 block (mode '4').
    pub fn lz4(data: Vec<u8>) -> Self {
        Self {
            mode: Mode::Lz4,
            data,
            encryption: None,
        }
    }

    /// Encrypt the bytes under a named key (mode 'E'), Salsa20, wrapping the
    /// given inner mode.
    pub fn encrypted(key_name: u64, iv: [u8; 4], inner: Mode, data: Vec<u8>) -> Self {
        Self {
            mode: Mode::Encrypted,
            data,
            encryption: Some(EncryptionSpec {
                key_name,
                iv,
                inner,
            }),
        }
    }

    /// Produce the encoded chunk, mode byte included.
    fn encode(&self, chunk_index: usize, keys: Option<&KeyTable>) -> Result<Vec<u8>> {
        match self.mode {
            Mode::Encrypted => {
                let spec = self
                    .encryption
                    .as_ref()
                    .expect("encrypted plan without spec");
                let key = keys
                    .and_then(|t| t.get(spec.key_name))
                    .ok_or(Error::MissingKey(spec.key_name))?;

                let inner = encode_body(spec.inner, &self.data)?;
                let ciphertext = encrypt_salsa20(&inner, key, &spec.iv, chunk_index)?;

                let mut out = Vec::with_capacity(ciphertext.len() + 26);
                out.push(b'E');
                out.extend_from_slice(&8u64.to_le_bytes());
                out.extend_from_slice(&spec.key_name.to_le_bytes());
                out.extend_from_slice(&4u32.to_le_bytes());
                out.extend_from_slice(&spec.iv);
                out.push(b'S');
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
            mode => encode_body(mode, &self.data),
        }
    }

    fn decoded_size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Mode byte plus transformed body for the plain modes.
fn encode_body(mode: Mode, data: &[u8]) -> Result<Vec<u8>> {
    match mode {
        Mode::Raw => {
            let mut out = Vec::with_capacity(data.len() + 1);
            out.push(b'N');
            out.extend_from_slice(data);
            Ok(out)
        }
        Mode::Zlib => {
            let mut encoder = ZlibEncoder::new(vec![b'Z'], Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Mode::Lz4 => {
            let compressed = lz4_flex::compress(data);
            let mut out = Vec::with_capacity(compressed.len() + 9);
            out.push(b'4');
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        Mode::Frame | Mode::Encrypted => Err(Error::DecompressionFailed(format!(
            "mode {mode:?} cannot be encoded as a plain body"
        ))),
    }
}

/// Encode a chunk-table BLTE blob from a sequence of chunk plans.
///
/// Returns the blob and its ekey, the MD5 of the written header region.
pub fn encode(plans: &[ChunkPlan], keys: Option<&KeyTable>) -> Result<(Vec<u8>, Md5)> {
    if plans.is_empty() {
        return Err(Error::InvalidChunkCount(0));
    }

    let mut encoded_chunks = Vec::with_capacity(plans.len());
    for (index, plan) in plans.iter().enumerate() {
        encoded_chunks.push(plan.encode(index, keys)?);
    }

    let header_size = 8 + 4 + plans.len() as u32 * 24;
    let mut blob = Vec::new();
    blob.extend_from_slice(b"BLTE");
    blob.extend_from_slice(&header_size.to_be_bytes());
    blob.push(0x0F);
    blob.extend_from_slice(&(plans.len() as u32).to_be_bytes()[1..]);

    for (plan, chunk) in plans.iter().zip(&encoded_chunks) {
        blob.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        blob.extend_from_slice(&plan.decoded_size().to_be_bytes());
        let digest: Md5 = Md5Hasher::digest(chunk).into();
        blob.extend_from_slice(&digest);
    }

    let ekey: Md5 = Md5Hasher::digest(&blob).into();

    for chunk in &encoded_chunks {
        blob.extend_from_slice(chunk);
    }

    Ok((blob, ekey))
}

/// Encode the headerless single-chunk form (`header_size == 0`).
///
/// The ekey covers the whole blob, prelude and payload alike.
pub fn encode_single(mode: Mode, data: &[u8]) -> Result<(Vec<u8>, Md5)> {
    let mut blob = Vec::new();
    blob.extend_from_slice(b"BLTE");
    blob.extend_from_slice(&0u32.to_be_bytes());
    blob.extend_from_slice(&encode_body(mode, data)?);

    let ekey: Md5 = Md5Hasher::digest(&blob).into();
    Ok((blob, ekey))
}
