//! End-to-end repository tests: fetch a remote into a scratch repository,
//! then open and install the build from the local store alone.

mod support;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use keg::Keg;
use keg::build::BuildManager;
use keg_cdn::{ObjectKind, ObjectStore};
use keg_formats::Key;

use support::{Fixture, Routes, serve};

/// Initialize a repository and fetch the canned build into it.
async fn fetched_repository() -> (TempDir, Keg, Fixture, String) {
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    let fixture = Fixture::install(&routes);
    let server = serve(Arc::clone(&routes)).await;
    Fixture::set_cdn_server(&routes, &server);

    let dir = TempDir::new().unwrap();
    let (keg, _) = Keg::init(dir.path().join("repo")).unwrap();

    let remote = format!("{server}/product");
    let summary = keg.fetch_remote(&remote, false).await.unwrap();

    // Two regions, one config triple: exactly one metadata pass.
    assert_eq!(summary.versions.len(), 1);
    let version = &summary.versions[0];
    assert!(version.error.is_none(), "fetch failed: {:?}", version.error);
    for outcome in &version.outcomes {
        assert!(
            outcome.failures.is_empty(),
            "{} had failures: {:?}",
            outcome.name,
            outcome.failures
        );
    }

    (dir, keg, fixture, remote)
}

#[tokio::test]
async fn test_fetch_mirrors_the_build() {
    let (_dir, keg, fixture, _remote) = fetched_repository().await;
    let local = keg.local_store();

    assert!(local.has(ObjectKind::Config, &fixture.build_config_key));
    assert!(local.has(ObjectKind::Config, &fixture.cdn_config_key));
    assert!(local.has(ObjectKind::ProductConfig, &fixture.product_config_key));
    assert!(local.has(ObjectKind::DataIndex, &fixture.archive_key));
    assert!(local.has(ObjectKind::Data, &fixture.archive_key));
    assert!(local.has(ObjectKind::PatchIndex, &fixture.patch_archive_key));
    assert!(local.has(ObjectKind::PatchArchive, &fixture.patch_archive_key));

    // The loose file came down loose; the archived ones are reachable
    // through the archive and were not duplicated as loose objects.
    assert!(local.has(ObjectKind::Data, &fixture.files[1].ekey));
    assert!(!local.has(ObjectKind::Data, &fixture.files[0].ekey));
    assert!(!local.has(ObjectKind::Data, &fixture.files[2].ekey));

    // Everything that landed verifies.
    let report = keg.fsck(false).await.unwrap();
    assert!(report.is_clean(), "fsck found {:?}", report.failures);
    assert!(report.checked > 0);
}

#[tokio::test]
async fn test_second_fetch_is_a_no_op() {
    let (_dir, keg, _fixture, remote) = fetched_repository().await;

    let summary = keg.fetch_remote(&remote, false).await.unwrap();
    assert_eq!(summary.versions.len(), 1);
    let version = &summary.versions[0];
    assert!(version.error.is_none());

    let mut total_present = 0;
    for outcome in &version.outcomes {
        assert_eq!(outcome.fetched, 0, "{} refetched objects", outcome.name);
        assert!(outcome.failures.is_empty());
        total_present += outcome.present;
    }
    assert!(total_present > 0);
}

#[tokio::test]
async fn test_state_cache_records_and_replays() {
    let (_dir, keg, _fixture, remote) = fetched_repository().await;

    // The fetch logged the versions response; replay it by digest.
    let digest = keg
        .db
        .latest_digest(&remote, "versions")
        .unwrap()
        .expect("versions response logged");
    let document = keg.state_cache.read_psv("versions", &digest).unwrap();
    assert_eq!(document.rows().len(), 2);

    // The denormalized view can find the build by name.
    let rows = keg.db.lookup_versions(&remote, "1.0.0.1").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].build_config, rows[1].build_config);

    // Cached reads answer from the log without a live request.
    let client = keg.get_remote(&remote).unwrap();
    let versions = client.get_cached_versions().await.unwrap();
    assert_eq!(versions.len(), 2);
}

#[tokio::test]
async fn test_install_from_local_store() {
    let (dir, keg, fixture, _remote) = fetched_repository().await;

    let store = Arc::new(keg.cached_store(None));
    let mut manager =
        BuildManager::new(store, fixture.build_config_key, fixture.cdn_config_key);

    // The archive group resolves the archived file to a range.
    let location = manager
        .archive_group()
        .await
        .unwrap()
        .lookup(&fixture.files[2].ekey)
        .unwrap();
    assert_eq!(location.archive_key, fixture.archive_key);

    // Reading by content key decodes out of the archive range.
    let content = manager.get_file(&fixture.files[2].ckey).await.unwrap();
    assert_eq!(content, fixture.files[2].content);

    // Tag filtering: Windows AND enUS selects exactly game.exe.
    let output = dir.path().join("install");
    let report = manager
        .install_to(&output, &["Windows", "enUS"], false)
        .await
        .unwrap();
    assert_eq!(report.installed.len(), 1);
    assert_eq!(report.installed[0].0, "game.exe");
    assert!(report.skipped.is_empty());

    assert_eq!(
        std::fs::read(output.join("game.exe")).unwrap(),
        fixture.files[0].content
    );
    assert!(!output.join("game.app").exists());
    assert!(!output.join("data_fr.bin").exists());
}

#[tokio::test]
async fn test_install_dry_run_writes_nothing() {
    let (dir, keg, fixture, _remote) = fetched_repository().await;

    let store = Arc::new(keg.cached_store(None));
    let mut manager =
        BuildManager::new(store, fixture.build_config_key, fixture.cdn_config_key);

    let output = dir.path().join("dry");
    let report = manager.install_to(&output, &[], true).await.unwrap();
    assert_eq!(report.installed.len(), 3);
    assert!(!output.exists());
}

#[tokio::test]
async fn test_download_manifest_priorities() {
    let (_dir, keg, fixture, _remote) = fetched_repository().await;

    let store = Arc::new(keg.cached_store(None));
    let mut manager =
        BuildManager::new(store, fixture.build_config_key, fixture.cdn_config_key);

    let manifest = manager.download_manifest().await.unwrap();
    let entries = manifest.filter_entries(&["Windows"]).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.ekey == fixture.files[0].ekey));
}

#[tokio::test]
async fn test_get_file_not_found() {
    let (_dir, keg, fixture, _remote) = fetched_repository().await;

    let store = Arc::new(keg.cached_store(None));
    let mut manager =
        BuildManager::new(store, fixture.build_config_key, fixture.cdn_config_key);

    let unknown = Key::from_bytes([0xEE; 16]);
    let err = manager.get_file(&unknown).await.unwrap_err();
    assert!(
        matches!(err, keg::Error::Format(keg_formats::Error::NotFound { .. })),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_fragment_resolution() {
    let (_dir, keg, fixture, _remote) = fetched_repository().await;

    // Move the loose blob into the fragments tree: the build manager must
    // still find it there.
    let local = keg.local_store();
    let ekey = fixture.files[1].ekey;
    let blob = local.get(ObjectKind::Data, &ekey).await.unwrap();
    local.write(ObjectKind::Fragment, &ekey, &blob).await.unwrap();
    local.delete(ObjectKind::Data, &ekey).await.unwrap();

    let store = Arc::new(keg.cached_store(None));
    let mut manager =
        BuildManager::new(store, fixture.build_config_key, fixture.cdn_config_key);

    let content = manager.get_file(&fixture.files[1].ckey).await.unwrap();
    assert_eq!(content, fixture.files[1].content);
}

#[tokio::test]
async fn test_metadata_only_fetch_skips_data() {
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    let fixture = Fixture::install(&routes);
    let server = serve(Arc::clone(&routes)).await;
    Fixture::set_cdn_server(&routes, &server);

    let dir = TempDir::new().unwrap();
    let (keg, _) = Keg::init(dir.path().join("repo")).unwrap();

    let summary = keg
        .fetch_remote(&format!("{server}/product"), true)
        .await
        .unwrap();
    let version = &summary.versions[0];
    assert!(version.error.is_none());

    let local = keg.local_store();
    // Metadata landed; the archive bodies did not.
    assert!(local.has(ObjectKind::Config, &fixture.build_config_key));
    assert!(local.has(ObjectKind::DataIndex, &fixture.archive_key));
    assert!(local.has(ObjectKind::PatchIndex, &fixture.patch_archive_key));
    assert!(!local.has(ObjectKind::Data, &fixture.archive_key));
    assert!(!local.has(ObjectKind::Data, &fixture.files[1].ekey));
    assert!(!local.has(ObjectKind::PatchArchive, &fixture.patch_archive_key));
}
