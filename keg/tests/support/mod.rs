//! Test support: an in-process HTTP fixture server and a canned build.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use keg_cdn::ObjectKind;
use keg_formats::Key;
use keg_formats::archive::ArchiveBuilder;
use keg_formats::download::DownloadBuilder;
use keg_formats::encoding::EncodingBuilder;
use keg_formats::install::InstallBuilder;

/// Shared route table: URL path → body.
pub type Routes = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Serve `routes` over loopback HTTP. Returns the base URL.
pub async fn serve(routes: Routes) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let routes = Arc::clone(&routes);
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
                    let spec = l
                        .strip_prefix("range: bytes=")
                        .or_else(|| l.strip_prefix("Range: bytes="))?;
                    let (start, end) = spec.trim().split_once('-')?;
                    Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
                });

                let body = routes.lock().unwrap().get(&path).cloned();
                let response = match body {
                    Some(body) => {
                        let (status, body) = match range {
                            Some((start, end)) if end < body.len() => {
                                ("206 Partial Content", body[start..=end].to_vec())
                            }
                            _ => ("200 OK", body),
                        };
                        let mut response = format!(
                            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        response.extend_from_slice(&body);
                        response
                    }
                    None => {
                        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_vec()
                    }
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}

pub const CDN_PATH: &str = "tpr/test";
pub const CDN_CONFIG_PATH: &str = "tpr/configs";

/// One installable file of the canned build.
pub struct FixtureFile {
    pub path: &'static str,
    pub content: &'static [u8],
    pub tags: &'static [&'static str],
    pub ckey: Key,
    pub ekey: Key,
}

/// The canned build: three tagged files (two archived, one loose), an
/// encoding file, install and download manifests, and the PSV endpoints
/// for two regions that share one config triple.
pub struct Fixture {
    pub build_config_key: Key,
    pub cdn_config_key: Key,
    pub product_config_key: Key,
    pub archive_key: Key,
    pub patch_archive_key: Key,
    pub files: Vec<FixtureFile>,
}

impl Fixture {
    /// Populate `routes` and return the fixture description.
    pub fn install(routes: &Routes) -> Self {
        let mut files = vec![
            FixtureFile {
                path: "game.exe",
                content: b"the windows binary",
                tags: &["Windows", "enUS"],
                ckey: Key::ZERO,
                ekey: Key::ZERO,
            },
            FixtureFile {
                path: "game.app",
                content: b"the mac binary",
                tags: &["OSX", "enUS"],
                ckey: Key::ZERO,
                ekey: Key::ZERO,
            },
            FixtureFile {
                path: "data_fr.bin",
                content: b"donnees francaises",
                tags: &["Windows", "frFR"],
                ckey: Key::ZERO,
                ekey: Key::ZERO,
            },
        ];

        // Encode every file as a chunk-table BLTE blob.
        let mut blobs = Vec::new();
        for file in &mut files {
            let (blob, ekey) =
                keg_blte::encode(&[keg_blte::ChunkPlan::zlib(file.content.to_vec())], None)
                    .unwrap();
            file.ckey = Key::of(file.content);
            file.ekey = Key::from_bytes(ekey);
            blobs.push(blob);
        }

        // Files 0 and 2 live in the archive; file 1 is loose.
        let mut archive = ArchiveBuilder::new();
        archive.add_blob(files[0].ekey, &blobs[0]);
        archive.add_blob(files[2].ekey, &blobs[2]);
        let archive = archive.finish().unwrap();

        // One patch blob inside a patch archive.
        let (patch_blob, patch_blob_ekey) =
            keg_blte::encode(&[keg_blte::ChunkPlan::zlib(b"a patch body".to_vec())], None)
                .unwrap();
        let mut patch_archive = ArchiveBuilder::new();
        patch_archive.add_blob(Key::from_bytes(patch_blob_ekey), &patch_blob);
        let patch_archive = patch_archive.finish().unwrap();

        // The encoding file covers the three game files.
        let mut encoding = EncodingBuilder::new();
        let espec = encoding.add_espec("z");
        for file in &files {
            encoding.add_entry(file.ckey, &[file.ekey], file.content.len() as u64, espec);
        }
        let encoding_bytes = encoding.build().unwrap();
        let encoding_ckey = Key::of(&encoding_bytes);
        let (encoding_blob, encoding_ekey) =
            keg_blte::encode(&[keg_blte::ChunkPlan::zlib(encoding_bytes)], None).unwrap();
        let encoding_ekey = Key::from_bytes(encoding_ekey);

        // Install manifest.
        let mut install = InstallBuilder::new();
        install.add_tag("Windows", 1);
        install.add_tag("OSX", 1);
        install.add_tag("enUS", 2);
        install.add_tag("frFR", 2);
        for file in &files {
            install.add_entry(file.path, file.ckey, file.content.len() as u32, file.tags);
        }
        let install_bytes = install.build().unwrap();
        let install_ckey = Key::of(&install_bytes);
        let (install_blob, install_ekey) =
            keg_blte::encode(&[keg_blte::ChunkPlan::zlib(install_bytes)], None).unwrap();
        let install_ekey = Key::from_bytes(install_ekey);

        // Download manifest.
        let mut download = DownloadBuilder::new();
        download.add_tag("Windows", 1);
        download.add_tag("OSX", 1);
        for file in &files {
            let tags: Vec<&str> = file
                .tags
                .iter()
                .copied()
                .filter(|t| *t == "Windows" || *t == "OSX")
                .collect();
            download.add_entry(file.ekey, file.content.len() as u32, 0, &tags);
        }
        let download_bytes = download.build().unwrap();
        let download_ckey = Key::of(&download_bytes);
        let (download_blob, download_ekey) =
            keg_blte::encode(&[keg_blte::ChunkPlan::zlib(download_bytes)], None).unwrap();
        let download_ekey = Key::from_bytes(download_ekey);

        // Config documents.
        let build_config = format!(
            "# Build configuration\n\
             encoding = {encoding_ckey} {encoding_ekey}\n\
             install = {install_ckey} {install_ekey}\n\
             download = {download_ckey} {download_ekey}\n\
             build-name = TEST-1.0.0.1\n\
             build-uid = test\n"
        );
        let build_config_key = Key::of(build_config.as_bytes());

        let cdn_config = format!(
            "archives = {}\npatch-archives = {}\n",
            archive.key, patch_archive.key
        );
        let cdn_config_key = Key::of(cdn_config.as_bytes());

        let product_config = br#"{"all": {"config": {}}}"#.to_vec();
        let product_config_key = Key::of(&product_config);

        // PSV endpoints: two regions, one config triple.
        let versions = format!(
            "Region!STRING:0|BuildConfig!HEX:16|CDNConfig!HEX:16|KeyRing!HEX:16|BuildId!DEC:4|VersionsName!String:0|ProductConfig!HEX:16\n\
             us|{build_config_key}|{cdn_config_key}||1|1.0.0.1|{product_config_key}\n\
             eu|{build_config_key}|{cdn_config_key}||1|1.0.0.1|{product_config_key}\n"
        );

        let mut r = routes.lock().unwrap();

        r.insert("/product/versions".to_string(), versions.into_bytes());
        // The cdns row is patched in by `set_cdn_server` once the server
        // address is known.

        let object =
            |kind: ObjectKind, key: &Key| format!("/{CDN_PATH}/{}", kind.object_path(key));
        r.insert(
            object(ObjectKind::Config, &build_config_key),
            build_config.into_bytes(),
        );
        r.insert(
            object(ObjectKind::Config, &cdn_config_key),
            cdn_config.into_bytes(),
        );
        r.insert(
            format!("/{CDN_CONFIG_PATH}/{}", product_config_key.partition()),
            product_config,
        );
        r.insert(object(ObjectKind::Data, &archive.key), archive.data.clone());
        r.insert(
            object(ObjectKind::DataIndex, &archive.key),
            archive.index.clone(),
        );
        r.insert(
            object(ObjectKind::PatchArchive, &patch_archive.key),
            patch_archive.data.clone(),
        );
        r.insert(
            object(ObjectKind::PatchIndex, &patch_archive.key),
            patch_archive.index.clone(),
        );
        r.insert(object(ObjectKind::Data, &files[1].ekey), blobs[1].clone());
        r.insert(object(ObjectKind::Data, &encoding_ekey), encoding_blob);
        r.insert(object(ObjectKind::Data, &install_ekey), install_blob);
        r.insert(object(ObjectKind::Data, &download_ekey), download_blob);

        Self {
            build_config_key,
            cdn_config_key,
            product_config_key,
            archive_key: archive.key,
            patch_archive_key: patch_archive.key,
            files,
        }
    }

    /// Point the `cdns` endpoint at the fixture server itself.
    pub fn set_cdn_server(routes: &Routes, server: &str) {
        let cdns = format!(
            "Name!STRING:0|Path!STRING:0|Hosts!STRING:0|Servers!STRING:0|ConfigPath!STRING:0\n\
             us|{CDN_PATH}||{server}|{CDN_CONFIG_PATH}\n"
        );
        routes
            .lock()
            .unwrap()
            .insert("/product/cdns".to_string(), cdns.into_bytes());
    }
}
