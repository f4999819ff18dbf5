//! The local filesystem store.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use keg_formats::Key;

use crate::error::{Error, Result};
use crate::store::{ObjectKind, ObjectStore};

/// The filesystem-backed store: `objects/{config,data,patch}` plus the
/// parallel `fragments/` tree, every object immutable once renamed into
/// place.
#[derive(Debug, Clone)]
pub struct LocalStore {
    objects_dir: PathBuf,
    fragments_dir: PathBuf,
    tmp_dir: PathBuf,
}

/// One object found on a store walk.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub kind: ObjectKind,
    pub key: Key,
    pub path: PathBuf,
}

impl LocalStore {
    pub fn new(
        objects_dir: impl Into<PathBuf>,
        fragments_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            fragments_dir: fragments_dir.into(),
            tmp_dir: tmp_dir.into(),
        }
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Absolute path an object lives at.
    pub fn path_for(&self, kind: ObjectKind, key: &Key) -> PathBuf {
        let root = match kind {
            ObjectKind::Fragment => &self.fragments_dir,
            _ => &self.objects_dir,
        };
        root.join(kind.object_path(key))
    }

    /// A scratch path for one write: unique per process and attempt, so
    /// concurrent writers of the same key cannot collide.
    pub fn temp_path(&self, key: &Key) -> PathBuf {
        self.tmp_dir.join(format!(
            "{key}.{}-{:08x}.keg_temp",
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    /// Move a fully-written, verified temp file into its final place.
    pub async fn commit(&self, temp: &Path, kind: ObjectKind, key: &Key) -> Result<PathBuf> {
        let path = self.path_for(kind, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(temp, &path).await?;
        debug!("Committed {kind} object {key}");
        Ok(path)
    }

    /// Write an object through a temp file and rename.
    pub async fn write(&self, kind: ObjectKind, key: &Key, data: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.tmp_dir).await?;
        let temp = self.temp_path(key);

        let mut file = File::create(&temp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        self.commit(&temp, kind, key).await
    }

    pub async fn delete(&self, kind: ObjectKind, key: &Key) -> Result<()> {
        fs::remove_file(self.path_for(kind, key)).await?;
        Ok(())
    }

    /// Walk every object under `objects/`, in no particular order.
    pub fn list_objects(&self) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        for (subtree, kind, index_kind) in [
            ("config", ObjectKind::Config, None),
            ("data", ObjectKind::Data, Some(ObjectKind::DataIndex)),
            ("patch", ObjectKind::Patch, Some(ObjectKind::PatchIndex)),
        ] {
            walk_partitioned(&self.objects_dir.join(subtree), kind, index_kind, &mut objects)?;
        }
        Ok(objects)
    }

    /// Walk every fragment.
    pub fn list_fragments(&self) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        walk_partitioned(&self.fragments_dir, ObjectKind::Fragment, None, &mut objects)?;
        Ok(objects)
    }
}

/// Walk one `xx/yy/key` tree, classifying `.index` files when the subtree
/// has an index kind. A data or patch file whose sibling `{key}.index`
/// exists is an archive, not a loose blob.
fn walk_partitioned(
    root: &Path,
    kind: ObjectKind,
    index_kind: Option<ObjectKind>,
    out: &mut Vec<StoredObject>,
) -> Result<()> {
    if !root.is_dir() {
        return Ok(());
    }

    for first in std::fs::read_dir(root)? {
        let first = first?.path();
        if !first.is_dir() {
            continue;
        }
        for second in std::fs::read_dir(&first)? {
            let second = second?.path();
            if !second.is_dir() {
                continue;
            }

            let names: Vec<String> = std::fs::read_dir(&second)?
                .filter_map(|e| e.ok()?.file_name().into_string().ok())
                .collect();

            for name in &names {
                if name.ends_with(".keg_temp") {
                    continue;
                }

                let (key_text, object_kind) = match name.strip_suffix(".index") {
                    Some(stem) => match index_kind {
                        Some(index_kind) => (stem, index_kind),
                        None => (name.as_str(), kind),
                    },
                    None => {
                        let indexed = names.iter().any(|n| {
                            n.strip_suffix(".index").is_some_and(|s| s == name.as_str())
                        });
                        let object_kind = match kind {
                            ObjectKind::Data if indexed => ObjectKind::Archive,
                            ObjectKind::Patch if indexed => ObjectKind::PatchArchive,
                            _ => kind,
                        };
                        (name.as_str(), object_kind)
                    }
                };

                match Key::from_hex(key_text) {
                    Ok(key) => out.push(StoredObject {
                        kind: object_kind,
                        key,
                        path: second.join(name),
                    }),
                    Err(_) => {
                        warn!("Skipping stray file in object store: {:?}", second.join(name));
                    }
                }
            }
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    fn has(&self, kind: ObjectKind, key: &Key) -> bool {
        self.path_for(kind, key).is_file()
    }

    async fn get(&self, kind: ObjectKind, key: &Key) -> Result<Vec<u8>> {
        match fs::read(self.path_for(kind, key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Missing {
                kind,
                key: key.to_hex(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_range(
        &self,
        kind: ObjectKind,
        key: &Key,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        let path = self.path_for(kind, key);
        let mut file = match OpenOptions::new().read(true).open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Missing {
                    kind,
                    key: key.to_hex(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if offset + size > len {
            return Err(Error::BadRange {
                key: key.to_hex(),
                offset,
                size,
                len,
            });
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn ensure(&self, kind: ObjectKind, key: &Key) -> Result<bool> {
        if self.has(kind, key) {
            Ok(false)
        } else {
            Err(Error::Missing {
                kind,
                key: key.to_hex(),
            })
        }
    }
}
