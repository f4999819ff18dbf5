//! The delegating store: local first, remote on miss, verify before commit.

use std::path::PathBuf;

use futures::StreamExt as _;
use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use keg_crypto::ArmadilloKey;
use keg_formats::Key;

use crate::error::{Error, Result};
use crate::local::LocalStore;
use crate::remote::RemoteStore;
use crate::store::{ObjectKind, ObjectStore};

/// Reads through the local store, ingesting from the remote on a miss.
///
/// Remote bytes stream through a sink that hashes incrementally; the digest
/// is checked before the temp file is renamed into the store, so a bad
/// object never becomes visible. Armadillo-encrypted remotes are decrypted
/// in the same pass.
pub struct CachedStore {
    local: LocalStore,
    remote: Option<RemoteStore>,
    verify_reads: bool,
    armadillo: Option<ArmadilloKey>,
}

impl CachedStore {
    pub fn new(local: LocalStore, remote: Option<RemoteStore>) -> Self {
        Self {
            local,
            remote,
            verify_reads: true,
            armadillo: None,
        }
    }

    /// Whether reads re-verify local objects. Ingest always verifies.
    pub fn with_verify_reads(mut self, verify: bool) -> Self {
        self.verify_reads = verify;
        self
    }

    /// Decrypt remote objects with this armadillo key on ingest.
    pub fn with_armadillo(mut self, key: Option<ArmadilloKey>) -> Self {
        self.armadillo = key;
        self
    }

    /// Late-bind the armadillo key; the fetch planner only learns it after
    /// the product config has been fetched.
    pub fn set_armadillo(&mut self, key: Option<ArmadilloKey>) {
        self.armadillo = key;
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn remote(&self) -> Option<&RemoteStore> {
        self.remote.as_ref()
    }

    /// Fetch an object from the remote even when a local copy exists; the
    /// verified download replaces it atomically.
    pub async fn refetch(&self, kind: ObjectKind, key: &Key) -> Result<()> {
        self.ingest(kind, key).await
    }

    /// Stream one object from the remote into the local store.
    async fn ingest(&self, kind: ObjectKind, key: &Key) -> Result<()> {
        let remote = self.remote.as_ref().ok_or_else(|| Error::NoRemote {
            kind,
            key: key.to_hex(),
        })?;
        let response = remote.stream(kind, key).await?;
        let url = remote.url_for(kind, key);
        debug!("Ingesting {kind} object {key} from {url}");

        // Product configs are served outside the armadillo envelope.
        let mut cipher = match (&self.armadillo, kind) {
            (Some(armadillo), k) if k != ObjectKind::ProductConfig => {
                Some(armadillo.object_cipher(key.as_bytes()))
            }
            _ => None,
        };

        let temp = self.local.temp_path(key);
        if let Some(parent) = temp.parent() {
            fs::create_dir_all(parent).await?;
        }

        // The sink unlinks its temp file on drop until the commit disarms
        // it, so an error or a cancelled fetch leaves the store unchanged.
        let mut sink = IngestSink::create(temp.clone()).await?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let mut chunk = chunk
                .map_err(|source| Error::Network {
                    url: url.clone(),
                    source,
                })?
                .to_vec();
            if let Some(cipher) = &mut cipher {
                cipher.apply(&mut chunk);
            }
            sink.write(&chunk).await?;
        }

        // Verification happens strictly before the rename; a failed object
        // never reaches its final path.
        sink.finish(kind, key).await?;
        self.local.commit(&temp, kind, key).await?;
        sink.committed();
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for CachedStore {
    fn has(&self, kind: ObjectKind, key: &Key) -> bool {
        self.local.has(kind, key)
    }

    async fn get(&self, kind: ObjectKind, key: &Key) -> Result<Vec<u8>> {
        self.ensure(kind, key).await?;
        let data = self.local.get(kind, key).await?;
        if self.verify_reads {
            verify_bytes(kind, key, &data)?;
        }
        Ok(data)
    }

    async fn get_range(
        &self,
        kind: ObjectKind,
        key: &Key,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        if self.local.has(kind, key) {
            return self.local.get_range(kind, key, offset, size).await;
        }
        let remote = self.remote.as_ref().ok_or_else(|| Error::NoRemote {
            kind,
            key: key.to_hex(),
        })?;
        trace!("Range read {offset}+{size} of {kind} {key} from remote");
        Ok(remote.fetch_range(kind, key, offset, size).await?.to_vec())
    }

    async fn ensure(&self, kind: ObjectKind, key: &Key) -> Result<bool> {
        if self.local.has(kind, key) {
            return Ok(false);
        }
        self.ingest(kind, key).await?;
        Ok(true)
    }
}

/// Check an object's bytes against the digest its key claims.
///
/// Configs and loose patches hash whole; indices hash their 28-byte
/// footer; loose data that parses as BLTE verifies against the header MD5
/// and the chunk digests; data and patch archives, whose key is the MD5 of
/// their index footer rather than of their body, verify by walking every
/// contained blob.
pub fn verify_bytes(kind: ObjectKind, key: &Key, data: &[u8]) -> Result<()> {
    match kind {
        ObjectKind::Archive | ObjectKind::PatchArchive => verify_archive(key, data),
        ObjectKind::DataIndex | ObjectKind::PatchIndex => {
            if data.len() < keg_formats::archive::FOOTER_SIZE {
                return Err(Error::Integrity {
                    what: format!("{kind} {key}"),
                    expected: key.to_hex(),
                    actual: "<truncated index>".to_string(),
                });
            }
            let footer = &data[data.len() - keg_formats::archive::FOOTER_SIZE..];
            check_md5(kind, key, footer)
        }
        ObjectKind::Data | ObjectKind::Patch | ObjectKind::Fragment
            if data.starts_with(&keg_blte::BLTE_MAGIC) =>
        {
            keg_blte::verify(data, key.as_bytes()).map_err(|e| match e {
                keg_blte::Error::ChecksumMismatch {
                    what,
                    expected,
                    actual,
                } => Error::Integrity {
                    what: format!("{what} for {kind} {key}"),
                    expected,
                    actual,
                },
                other => other.into(),
            })
        }
        _ => check_md5(kind, key, data),
    }
}

/// Walk an archive's concatenated blobs, verifying each blob's chunk
/// digests and that nothing trails the last blob.
fn verify_archive(key: &Key, data: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let file = keg_blte::BlteFile::parse(data[offset..].to_vec()).map_err(|e| {
            Error::Integrity {
                what: format!("archive {key} at offset {offset}"),
                expected: "a BLTE blob".to_string(),
                actual: e.to_string(),
            }
        })?;
        for index in 0..file.header().chunk_count() {
            file.encoded_chunk(index).map_err(|e| Error::Integrity {
                what: format!("archive {key} blob at offset {offset}"),
                expected: "matching chunk digests".to_string(),
                actual: e.to_string(),
            })?;
        }
        // A headerless blob declares no length and swallows the remainder.
        let advance = file.declared_len();
        if advance == 0 || file.header().is_single_chunk() {
            break;
        }
        offset += advance;
    }
    Ok(())
}

fn check_md5(kind: ObjectKind, key: &Key, covered: &[u8]) -> Result<()> {
    let actual = Key::from_bytes(Md5::digest(covered).into());
    if &actual != key {
        return Err(Error::Integrity {
            what: format!("{kind} {key}"),
            expected: key.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

/// What the sink retains for verification while it streams.
enum SinkBuffer {
    /// Fewer than 4 bytes seen; the object's shape is still unknown.
    Undecided(Vec<u8>),
    /// A BLTE blob: chunk digests need the whole thing, so keep it.
    Blte(Vec<u8>),
    /// Anything else: the incremental hash and the rolling tail suffice.
    Off,
}

/// Streams one download to a temp file, hashing as bytes arrive.
///
/// The temp file is unlinked when the sink drops, unless the caller marks
/// the object committed after the final rename.
struct IngestSink {
    file: Option<fs::File>,
    temp: PathBuf,
    hasher: Md5,
    tail: Vec<u8>,
    buffer: SinkBuffer,
    armed: bool,
}

impl Drop for IngestSink {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}

impl IngestSink {
    async fn create(temp: PathBuf) -> Result<Self> {
        let file = fs::File::create(&temp).await?;
        Ok(Self {
            file: Some(file),
            temp,
            hasher: Md5::new(),
            tail: Vec::with_capacity(keg_formats::archive::FOOTER_SIZE),
            buffer: SinkBuffer::Undecided(Vec::new()),
            armed: true,
        })
    }

    /// The object reached its final path; stop guarding the temp name.
    fn committed(mut self) {
        self.armed = false;
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);

        self.tail.extend_from_slice(chunk);
        let extra = self
            .tail
            .len()
            .saturating_sub(keg_formats::archive::FOOTER_SIZE);
        if extra > 0 {
            self.tail.drain(..extra);
        }

        self.buffer = match std::mem::replace(&mut self.buffer, SinkBuffer::Off) {
            SinkBuffer::Undecided(mut buffered) => {
                buffered.extend_from_slice(chunk);
                if buffered.len() < 4 {
                    SinkBuffer::Undecided(buffered)
                } else if buffered.starts_with(&keg_blte::BLTE_MAGIC) {
                    SinkBuffer::Blte(buffered)
                } else {
                    SinkBuffer::Off
                }
            }
            SinkBuffer::Blte(mut buffered) => {
                buffered.extend_from_slice(chunk);
                SinkBuffer::Blte(buffered)
            }
            SinkBuffer::Off => SinkBuffer::Off,
        };

        self.file
            .as_mut()
            .expect("write after finish")
            .write_all(chunk)
            .await?;
        Ok(())
    }

    /// Flush, close and verify the streamed object. On failure the drop
    /// guard unlinks the temp file. The handle is closed here so the
    /// caller's rename works everywhere.
    async fn finish(&mut self, kind: ObjectKind, key: &Key) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        self.verify(kind, key)
    }

    fn verify(&mut self, kind: ObjectKind, key: &Key) -> Result<()> {
        match (kind, &self.buffer) {
            (
                ObjectKind::Archive | ObjectKind::PatchArchive,
                SinkBuffer::Blte(buffered) | SinkBuffer::Undecided(buffered),
            ) => verify_archive(key, buffered),
            (ObjectKind::DataIndex | ObjectKind::PatchIndex, _) => {
                if self.tail.len() < keg_formats::archive::FOOTER_SIZE {
                    return Err(Error::Integrity {
                        what: format!("{kind} {key}"),
                        expected: key.to_hex(),
                        actual: "<truncated index>".to_string(),
                    });
                }
                check_md5(kind, key, &self.tail)
            }
            (ObjectKind::Data | ObjectKind::Patch, SinkBuffer::Blte(buffered)) => {
                verify_bytes(kind, key, buffered)
            }
            _ => {
                let actual = Key::from_bytes(std::mem::take(&mut self.hasher).finalize().into());
                if &actual != key {
                    return Err(Error::Integrity {
                        what: format!("{kind} {key}"),
                        expected: key.to_hex(),
                        actual: actual.to_hex(),
                    });
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    fn local(dir: &TempDir) -> LocalStore {
        LocalStore::new(
            dir.path().join("objects"),
            dir.path().join("fragments"),
            dir.path().join("tmp"),
        )
    }

    /// A one-connection-at-a-time HTTP fixture server over canned bodies.
    async fn serve(routes: HashMap<String, Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&chunk[..n]),
                        }
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }

                    let text = String::from_utf8_lossy(&request);
                    let path = text
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    let range = text.lines().find_map(|l| {
                        let spec = l.strip_prefix("range: bytes=")
                            .or_else(|| l.strip_prefix("Range: bytes="))?;
                        let (start, end) = spec.trim().split_once('-')?;
                        Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
                    });

                    let response = match routes.get(&path) {
                        Some(body) => {
                            let (status, body) = match range {
                                Some((start, end)) if end < body.len() => {
                                    ("206 Partial Content", body[start..=end].to_vec())
                                }
                                _ => ("200 OK", body.clone()),
                            };
                            let mut response = format!(
                                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            response.extend_from_slice(&body);
                            response
                        }
                        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_vec(),
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{addr}")
    }

    #[test]
    fn test_verify_bytes_rules() {
        // Config: raw MD5.
        let body = b"config body".to_vec();
        let key = Key::of(&body);
        verify_bytes(ObjectKind::Config, &key, &body).unwrap();
        assert!(verify_bytes(ObjectKind::Config, &Key::from_bytes([1; 16]), &body).is_err());

        // Index: MD5 of the footer.
        let mut builder = keg_formats::archive::ArchiveIndexBuilder::new();
        builder.add_entry(Key::from_bytes([5; 16]), 10, 0);
        let (index, index_key) = builder.build().unwrap();
        verify_bytes(ObjectKind::DataIndex, &index_key, &index).unwrap();
        assert!(verify_bytes(ObjectKind::DataIndex, &index_key, &index[..10]).is_err());

        // BLTE data: header MD5 plus chunk digests.
        let (blob, ekey) =
            keg_blte::encode(&[keg_blte::ChunkPlan::raw(b"payload".to_vec())], None).unwrap();
        let ekey = Key::from_bytes(ekey);
        verify_bytes(ObjectKind::Data, &ekey, &blob).unwrap();
        let mut tampered = blob.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        assert!(verify_bytes(ObjectKind::Data, &ekey, &tampered).is_err());

        // Non-BLTE loose data: raw MD5.
        let loose = b"not a blte blob".to_vec();
        verify_bytes(ObjectKind::Data, &Key::of(&loose), &loose).unwrap();
    }

    #[test]
    fn test_verify_archive_walks_blobs() {
        let (blob_a, _) =
            keg_blte::encode(&[keg_blte::ChunkPlan::raw(b"first".to_vec())], None).unwrap();
        let (blob_b, _) =
            keg_blte::encode(&[keg_blte::ChunkPlan::zlib(b"second".to_vec())], None).unwrap();
        let mut archive = blob_a.clone();
        archive.extend_from_slice(&blob_b);

        // The archive key is unrelated to the body; the walk is what
        // verifies it. Patch archives share the rule.
        let key = Key::from_bytes([0x42; 16]);
        verify_bytes(ObjectKind::Archive, &key, &archive).unwrap();
        verify_bytes(ObjectKind::PatchArchive, &key, &archive).unwrap();

        // A flipped payload byte in the second blob is caught.
        let mut tampered = archive.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        assert!(matches!(
            verify_bytes(ObjectKind::Archive, &key, &tampered),
            Err(Error::Integrity { .. })
        ));
        assert!(matches!(
            verify_bytes(ObjectKind::PatchArchive, &key, &tampered),
            Err(Error::Integrity { .. })
        ));

        // Plain garbage where a blob header should be is also caught.
        archive.extend_from_slice(b"trailing garbage");
        assert!(verify_bytes(ObjectKind::Archive, &key, &archive).is_err());
    }

    #[tokio::test]
    async fn test_patch_archive_ingest_walks_blobs() {
        // A patch archive's key is its index-footer MD5; a whole-body hash
        // could never match, so the ingest must walk the blobs instead.
        let (blob, _) =
            keg_blte::encode(&[keg_blte::ChunkPlan::zlib(b"patch blob".to_vec())], None).unwrap();
        let key = Key::from_bytes([0x99; 16]);

        let mut routes = HashMap::new();
        routes.insert(
            format!("/tpr/test/{}", ObjectKind::PatchArchive.object_path(&key)),
            blob.clone(),
        );
        let server = serve(routes).await;

        let dir = TempDir::new().unwrap();
        let remote = RemoteStore::new(server, "tpr/test", "tpr/configs").unwrap();
        let store = CachedStore::new(local(&dir), Some(remote));

        assert!(store.ensure(ObjectKind::PatchArchive, &key).await.unwrap());
        assert!(store.has(ObjectKind::Patch, &key));
        assert_eq!(
            store.get(ObjectKind::PatchArchive, &key).await.unwrap(),
            blob
        );
    }

    #[tokio::test]
    async fn test_ingest_verifies_and_commits() {
        let body = b"a config document\n".to_vec();
        let key = Key::of(&body);

        let mut routes = HashMap::new();
        routes.insert(
            format!("/tpr/test/{}", ObjectKind::Config.object_path(&key)),
            body.clone(),
        );
        let server = serve(routes).await;

        let dir = TempDir::new().unwrap();
        let remote = RemoteStore::new(server, "tpr/test", "tpr/configs").unwrap();
        let store = CachedStore::new(local(&dir), Some(remote));

        // First get ingests, second is served locally.
        assert!(!store.has(ObjectKind::Config, &key));
        assert_eq!(store.get(ObjectKind::Config, &key).await.unwrap(), body);
        assert!(store.has(ObjectKind::Config, &key));
        assert!(!store.ensure(ObjectKind::Config, &key).await.unwrap());
        assert_eq!(store.get(ObjectKind::Config, &key).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_ingest_aborts_on_mismatch() {
        let body = b"tampered in transit".to_vec();
        let claimed = Key::of(b"what the body should have been");

        let mut routes = HashMap::new();
        routes.insert(
            format!("/tpr/test/{}", ObjectKind::Config.object_path(&claimed)),
            body,
        );
        let server = serve(routes).await;

        let dir = TempDir::new().unwrap();
        let remote = RemoteStore::new(server, "tpr/test", "tpr/configs").unwrap();
        let store = CachedStore::new(local(&dir), Some(remote));

        let err = store.get(ObjectKind::Config, &claimed).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }), "got {err:?}");

        // Nothing committed, no temp leftovers.
        assert!(!store.has(ObjectKind::Config, &claimed));
        let tmp = dir.path().join("tmp");
        let leftovers = std::fs::read_dir(&tmp)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_missing_remote_object() {
        let server = serve(HashMap::new()).await;
        let dir = TempDir::new().unwrap();
        let remote = RemoteStore::new(server, "tpr/test", "tpr/configs").unwrap();
        let store = CachedStore::new(local(&dir), Some(remote));

        let key = Key::from_bytes([7; 16]);
        assert!(matches!(
            store.get(ObjectKind::Data, &key).await,
            Err(Error::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_remote_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = CachedStore::new(local(&dir), None);
        let key = Key::from_bytes([7; 16]);
        assert!(matches!(
            store.get(ObjectKind::Data, &key).await,
            Err(Error::NoRemote { .. })
        ));
    }

    #[tokio::test]
    async fn test_range_read_prefers_local() {
        let dir = TempDir::new().unwrap();
        let store = CachedStore::new(local(&dir), None);
        let key = Key::from_bytes([3; 16]);

        store
            .local()
            .write(ObjectKind::Data, &key, b"0123456789")
            .await
            .unwrap();
        assert_eq!(
            store
                .get_range(ObjectKind::Data, &key, 4, 3)
                .await
                .unwrap(),
            b"456"
        );
    }

    #[tokio::test]
    async fn test_remote_range_read() {
        let key = Key::from_bytes([9; 16]);
        let mut routes = HashMap::new();
        routes.insert(
            format!("/tpr/test/{}", ObjectKind::Data.object_path(&key)),
            b"0123456789".to_vec(),
        );
        let server = serve(routes).await;

        let dir = TempDir::new().unwrap();
        let remote = RemoteStore::new(server, "tpr/test", "tpr/configs").unwrap();
        let store = CachedStore::new(local(&dir), Some(remote));

        assert_eq!(
            store.get_range(ObjectKind::Data, &key, 2, 4).await.unwrap(),
            b"2345"
        );
        // Range reads do not populate the local store.
        assert!(!store.has(ObjectKind::Data, &key));
    }

    #[tokio::test]
    async fn test_armadillo_decrypt_on_ingest() {
        use md5::{Digest, Md5};

        let plaintext = b"an encrypted config".to_vec();
        let key = Key::of(&plaintext);

        // Build an armadillo key blob and encrypt the body the way an
        // armadillo-protected remote would serve it.
        let material = [0x55u8; 16];
        let digest = Md5::digest(material);
        let mut blob = material.to_vec();
        blob.extend_from_slice(&digest[..4]);
        let armadillo = ArmadilloKey::from_bytes(&blob).unwrap();

        let ciphertext = armadillo.decrypt_object(key.as_bytes(), &plaintext).unwrap();

        let mut routes = HashMap::new();
        routes.insert(
            format!("/tpr/test/{}", ObjectKind::Config.object_path(&key)),
            ciphertext,
        );
        let server = serve(routes).await;

        let dir = TempDir::new().unwrap();
        let remote = RemoteStore::new(server, "tpr/test", "tpr/configs").unwrap();
        let store = CachedStore::new(local(&dir), Some(remote)).with_armadillo(Some(armadillo));

        assert_eq!(store.get(ObjectKind::Config, &key).await.unwrap(), plaintext);
    }
}
